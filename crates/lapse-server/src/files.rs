//! File manager: places uploads on storage, records them, and hands
//! ephemeral ones to the expiry scheduler.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use jiff::Timestamp;
use rand::Rng;
use tempfile::TempPath;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::db::{DbError, FileRecord, MetadataStore, NewFileRecord};
use crate::expiry::{ExpiryScheduler, PendingExpiry, ReclaimError, Reclaimer};
use crate::storage::{ByteReader, Namespace, Storage, StorageError, UploadMethod, open_backend};

/// Length of generated guest filenames and request IDs.
pub const RANDOM_NAME_LEN: usize = 10;

const NAME_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("User doesn't exist: {0}")]
    UserNotFound(String),

    #[error("Invalid file manager mode: {0}")]
    InvalidBackendMode(String),

    #[error("Insufficient permissions to create directory {path}")]
    DirectoryCreatePermissionDenied { path: String },

    #[error("Invalid directory path {path}")]
    DirectoryCreateInvalidPath { path: String },

    #[error("Failed to create directory: {0}")]
    DirectoryCreate(StorageError),

    #[error("Failed to open upload source: {0}")]
    SourceOpenFailed(io::Error),

    #[error("Failed to create file: {0}")]
    DestinationCreateFailed(StorageError),

    #[error("Failed to copy file contents: {0}")]
    CopyFailed(StorageError),

    #[error("Failed to query metadata: {0}")]
    Lookup(DbError),

    #[error("Failed to commit file record: {0}")]
    MetadataCommitFailed(DbError),
}

fn directory_error(err: StorageError) -> SaveError {
    match err {
        StorageError::PermissionDenied { path } => SaveError::DirectoryCreatePermissionDenied { path },
        StorageError::InvalidPath { path } => SaveError::DirectoryCreateInvalidPath { path },
        other => SaveError::DirectoryCreate(other),
    }
}

fn write_error(err: StorageError) -> SaveError {
    match err {
        StorageError::CopyFailed { .. } => SaveError::CopyFailed(err),
        other => SaveError::DestinationCreateFailed(other),
    }
}

/// Content of an upload, not yet opened.
pub enum UploadSource {
    /// Content spooled to a temporary file, removed once the save is done.
    Spooled(TempPath),
    /// Content read straight from a stream.
    Reader(ByteReader),
}

impl UploadSource {
    async fn open(self) -> io::Result<(ByteReader, Option<TempPath>)> {
        match self {
            UploadSource::Spooled(path) => {
                let file = tokio::fs::File::open(&path).await?;
                Ok((Box::new(file), Some(path)))
            }
            UploadSource::Reader(reader) => Ok((reader, None)),
        }
    }
}

/// Placement options for a new file.
#[derive(Debug, Clone, Default)]
pub struct NewFile {
    /// Empty for anonymous uploads.
    pub owner_id: String,
    /// Name the uploader asked for. Ignored for anonymous uploads except for its extension.
    pub filename: String,
    pub mime_type: String,
    /// Unix seconds; 0 means the file never expires.
    pub expires_at: i64,
    pub private: bool,
}

/// Random name of `len` symbols from `[A-Za-z0-9_-]`.
pub fn random_name(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| NAME_ALPHABET[rng.random_range(0..NAME_ALPHABET.len())] as char)
        .collect()
}

/// Strip any directory parts from an uploader-supplied name.
fn sanitize_filename(hint: &str) -> String {
    let name = hint.rsplit(['/', '\\']).next().unwrap_or("").trim();
    if name.is_empty() || name == "." || name == ".." {
        random_name(RANDOM_NAME_LEN)
    } else {
        name.to_string()
    }
}

/// Fresh random name for an anonymous upload, keeping the original extension.
///
/// The extension is everything from the last dot, so a dotfile such as
/// `.bashrc` keeps its whole name as the extension.
fn guest_filename(hint: &str) -> String {
    let name = random_name(RANDOM_NAME_LEN);
    let hint = sanitize_filename(hint);
    match hint.rfind('.') {
        Some(dot) => format!("{name}{}", &hint[dot..]),
        None => name,
    }
}

/// First of `desired`, `desired_(1)`, `desired_(2)`, ... that is not taken.
fn resolve_filename(desired: &str, is_taken: impl Fn(&str) -> bool) -> String {
    if !is_taken(desired) {
        return desired.to_string();
    }

    let mut n: u64 = 1;
    loop {
        let candidate = format!("{desired}_({n})");
        if !is_taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Filenames held by in-flight saves and reclamations, per owner.
///
/// A held name counts as taken even though it may have no committed record:
/// either its record is not committed yet, or its object is still being
/// deleted.
#[derive(Default)]
struct NameReservations {
    held: Mutex<HashMap<String, HashMap<String, usize>>>,
}

impl NameReservations {
    /// Pick and hold the first free name derived from `desired`.
    ///
    /// `committed` is queried under the reservations lock, so a name released
    /// by a save that just committed is always seen as committed.
    fn reserve(
        self: &Arc<Self>,
        owner_id: &str,
        desired: &str,
        skip: &HashSet<String>,
        committed: impl FnOnce() -> Result<HashSet<String>, DbError>,
    ) -> Result<Reservation, DbError> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        let committed = committed()?;
        let in_flight = held.entry(owner_id.to_string()).or_default();

        let filename = resolve_filename(desired, |name| {
            committed.contains(name) || skip.contains(name) || in_flight.contains_key(name)
        });
        *in_flight.entry(filename.clone()).or_default() += 1;

        Ok(Reservation {
            owner_id: owner_id.to_string(),
            filename,
            reservations: Arc::clone(self),
        })
    }

    /// Hold an exact name, whether or not it is already held.
    fn hold(self: &Arc<Self>, owner_id: &str, filename: &str) -> Reservation {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        *held
            .entry(owner_id.to_string())
            .or_default()
            .entry(filename.to_string())
            .or_default() += 1;

        Reservation {
            owner_id: owner_id.to_string(),
            filename: filename.to_string(),
            reservations: Arc::clone(self),
        }
    }
}

/// Keeps a filename taken until dropped.
struct Reservation {
    owner_id: String,
    filename: String,
    reservations: Arc<NameReservations>,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let mut held = self
            .reservations
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(names) = held.get_mut(&self.owner_id) else {
            return;
        };
        if let Some(count) = names.get_mut(&self.filename) {
            *count -= 1;
            if *count == 0 {
                names.remove(&self.filename);
            }
        }
        if names.is_empty() {
            held.remove(&self.owner_id);
        }
    }
}

/// Deletes an expired file's record, then its object.
///
/// The name stays held until the object is gone, so no save can place a new
/// object at the same location in between.
struct StorageReclaimer {
    storage: Arc<dyn Storage>,
    db: Arc<dyn MetadataStore>,
    reservations: Arc<NameReservations>,
}

#[async_trait]
impl Reclaimer for StorageReclaimer {
    async fn reclaim(&self, entry: &PendingExpiry) -> Result<(), ReclaimError> {
        let location = entry.location.as_str();
        let Some(record) = self.db.find_record_by_location(location)? else {
            debug!(location, "No record left for expired file");
            return Ok(());
        };
        if record.expires_at != entry.expires_at {
            debug!(
                location,
                expires_at = record.expires_at,
                "Location now holds a newer upload, leaving it alone"
            );
            return Ok(());
        }

        let _hold = self.reservations.hold(&record.owner_id, &record.filename);
        self.db.delete_record(record.id)?;
        self.storage.delete_object(location).await?;
        Ok(())
    }
}

/// Stores uploads and keeps ephemeral ones on the expiry schedule.
pub struct FileManager {
    storage: Arc<dyn Storage>,
    db: Arc<dyn MetadataStore>,
    scheduler: Arc<ExpiryScheduler>,
    reservations: Arc<NameReservations>,
}

impl FileManager {
    /// Build a manager over `storage` with its own expiry scheduler.
    ///
    /// The scheduler is not started.
    pub fn new(
        storage: Arc<dyn Storage>,
        db: Arc<dyn MetadataStore>,
        idle_interval: Duration,
    ) -> Self {
        let reservations = Arc::new(NameReservations::default());
        let reclaimer = Arc::new(StorageReclaimer {
            storage: Arc::clone(&storage),
            db: Arc::clone(&db),
            reservations: Arc::clone(&reservations),
        });
        let scheduler = Arc::new(ExpiryScheduler::with_idle_interval(
            reclaimer,
            idle_interval,
        ));

        Self {
            storage,
            db,
            scheduler,
            reservations,
        }
    }

    /// Build a manager for the backend named by `mode`.
    pub fn for_mode(
        mode: &str,
        base_path: &Path,
        db: Arc<dyn MetadataStore>,
        idle_interval: Duration,
    ) -> Result<Self, SaveError> {
        let storage = mode
            .parse::<UploadMethod>()
            .ok()
            .and_then(|method| open_backend(method, base_path))
            .ok_or_else(|| SaveError::InvalidBackendMode(mode.to_string()))?;

        Ok(Self::new(storage, db, idle_interval))
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn scheduler(&self) -> &Arc<ExpiryScheduler> {
        &self.scheduler
    }

    /// Store `source` and commit its record.
    ///
    /// The record is committed only once the object is fully written, and the
    /// file is enrolled for expiry only once the record exists. Failing to
    /// enroll is logged and does not fail the save.
    pub async fn save(&self, file: NewFile, source: UploadSource) -> Result<FileRecord, SaveError> {
        let (namespace, desired) = if file.owner_id.is_empty() {
            (Namespace::Guest, guest_filename(&file.filename))
        } else {
            let user = self
                .db
                .find_user(&file.owner_id)
                .map_err(SaveError::Lookup)?
                .ok_or_else(|| SaveError::UserNotFound(file.owner_id.clone()))?;
            (
                Namespace::Owner(user.storage_id),
                sanitize_filename(&file.filename),
            )
        };

        self.storage
            .prepare_namespace(&namespace)
            .await
            .map_err(directory_error)?;

        // names occupied on storage without a record are skipped too
        let mut occupied = HashSet::new();
        let (reservation, location) = loop {
            let reservation = self
                .reservations
                .reserve(&file.owner_id, &desired, &occupied, || {
                    self.db.find_filenames(&file.owner_id)
                })
                .map_err(SaveError::Lookup)?;
            let location = self.storage.location(&namespace, &reservation.filename);

            match self.storage.object_meta(&location).await {
                Err(StorageError::NotFound) => break (reservation, location),
                Ok(_) => {
                    warn!(location = %location, "Skipping name taken by an unrecorded object");
                    occupied.insert(reservation.filename.clone());
                }
                Err(err) => return Err(SaveError::DestinationCreateFailed(err)),
            }
        };

        let (reader, _spool) = source.open().await.map_err(SaveError::SourceOpenFailed)?;
        let size = self
            .storage
            .put_object(&location, reader)
            .await
            .map_err(write_error)?;

        let new = NewFileRecord {
            created_at: Timestamp::now().as_second(),
            owner_id: file.owner_id,
            expires_at: file.expires_at,
            mime_type: file.mime_type,
            location,
            filename: reservation.filename.clone(),
            upload_method: self.storage.method(),
            private: file.private,
        };

        let id = match self.db.create_record(&new) {
            Ok(id) => id,
            Err(err) => {
                // put_object never replaces an existing object, so this one is ours
                if let Err(cleanup) = self.storage.delete_object(&new.location).await {
                    warn!(location = %new.location, error = %cleanup, "Failed to remove uncommitted file");
                }
                return Err(SaveError::MetadataCommitFailed(err));
            }
        };
        drop(reservation);
        let record = new.into_record(id);

        info!(
            id = record.id,
            owner_id = %record.owner_id,
            filename = %record.filename,
            size,
            expires_at = record.expires_at,
            "Saved file"
        );

        if record.expires_at > 0
            && let Err(err) = self
                .scheduler
                .enroll(record.location.clone(), record.expires_at)
        {
            warn!(
                location = %record.location,
                error = %err,
                "Failed to schedule file expiry; it will not be deleted automatically"
            );
        }

        Ok(record)
    }

    /// Re-enroll every expiring record from the metadata store.
    ///
    /// Meant for startup, since the schedule itself lives only in memory.
    /// Records already past due are reclaimed on the scheduler's next pass.
    pub fn rehydrate(&self) -> Result<usize, DbError> {
        let mut enrolled = 0;
        for record in self.db.expiring_records()? {
            if record.upload_method != self.storage.method() {
                warn!(
                    location = %record.location,
                    upload_method = %record.upload_method,
                    "Skipping expiring file written by another backend"
                );
                continue;
            }

            match self.scheduler.enroll(record.location.clone(), record.expires_at) {
                Ok(()) => enrolled += 1,
                Err(err) => warn!(location = %record.location, error = %err, "Failed to re-enroll file"),
            }
        }

        info!(enrolled, "Rehydrated expiry schedule");
        Ok(enrolled)
    }
}
