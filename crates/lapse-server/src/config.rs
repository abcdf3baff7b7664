use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::mime::DEFAULT_ALLOWED_TYPES;

const MIB: u64 = 1 << 20;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    /// Storage root; objects go under `<base>/files/`.
    pub base_path: PathBuf,
    pub database_path: PathBuf,
    /// Backend tag, see [`crate::storage::UploadMethod`].
    pub file_location: String,
    pub hmac_secret: Option<String>,
    /// How often the expiry scheduler re-checks an empty queue.
    pub idle_interval: Duration,
    pub policy: UploadPolicy,
}

/// Who may upload what, and for how long guest files live.
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    pub allow_guest_uploads: bool,
    /// Lifetime of guest uploads; `None` keeps them forever.
    pub guest_file_lifetime: Option<Duration>,
    /// Max size for registered users, in bytes. `None` is unlimited.
    pub max_file_size: Option<u64>,
    /// Max size for guests, in bytes. `None` falls back to `max_file_size`.
    pub max_guest_file_size: Option<u64>,
    pub allowed_types: Vec<String>,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            allow_guest_uploads: true,
            guest_file_lifetime: Some(Duration::from_secs(12 * 3600)),
            max_file_size: Some(50 * MIB),
            max_guest_file_size: Some(15 * MIB),
            allowed_types: DEFAULT_ALLOWED_TYPES.iter().map(|t| t.to_string()).collect(),
        }
    }
}

impl UploadPolicy {
    /// Build a policy from size limits in MiB, where 0 means "not set".
    pub fn from_mib(max_file_size: u64, max_guest_file_size: u64) -> Self {
        let non_zero = |mib: u64| (mib > 0).then(|| mib.saturating_mul(MIB));
        Self {
            max_file_size: non_zero(max_file_size),
            max_guest_file_size: non_zero(max_guest_file_size),
            ..Self::default()
        }
    }

    /// Upload size limit in bytes for a guest or a registered user.
    pub fn size_limit(&self, guest: bool) -> Option<u64> {
        if guest {
            self.max_guest_file_size.or(self.max_file_size)
        } else {
            self.max_file_size
        }
    }

    /// Expiry timestamp for a guest upload made at `now` (Unix seconds), or 0.
    pub fn guest_expires_at(&self, now: i64) -> i64 {
        match self.guest_file_lifetime {
            Some(lifetime) => now.saturating_add(lifetime.as_secs() as i64),
            None => 0,
        }
    }

    pub fn is_allowed(&self, mime_type: &str) -> bool {
        self.allowed_types.iter().any(|t| t == mime_type)
    }
}
