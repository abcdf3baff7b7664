use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tokio::io::AsyncRead;

mod fs;
mod types;

pub use fs::FsStorage;
pub use types::{ObjectMeta, StorageError, UnknownUploadMethod, UploadMethod};

/// A boxed stream of byte chunks for streaming reads
pub type ByteStream = Box<dyn Stream<Item = Result<Bytes, StorageError>> + Send + Unpin>;

/// A boxed async reader for streaming writes
pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Directory name shared by every anonymous upload.
pub const GUEST_NAMESPACE: &str = "guest_uploads";

/// Filename-uniqueness scope of an upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Shared area for anonymous uploads.
    Guest,
    /// An owner's area, keyed by the owner's stable storage identifier.
    Owner(String),
}

impl Namespace {
    pub fn dir_name(&self) -> &str {
        match self {
            Namespace::Guest => GUEST_NAMESPACE,
            Namespace::Owner(storage_id) => storage_id,
        }
    }
}

/// A place uploaded objects can be written to, read from and deleted from.
///
/// Objects are addressed by their `location`, the string stored on the file
/// record. What a location looks like is up to the backend.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Tag recorded on file records written through this backend.
    fn method(&self) -> UploadMethod;

    /// Resolve the location `filename` would have inside `namespace`.
    fn location(&self, namespace: &Namespace, filename: &str) -> String;

    /// Make sure the namespace exists. Already existing is not an error.
    async fn prepare_namespace(&self, namespace: &Namespace) -> Result<(), StorageError>;

    /// Stream `data` into a new object at `location`.
    /// Returns the number of bytes written. The object only becomes visible
    /// at `location` once fully written.
    async fn put_object(&self, location: &str, data: ByteReader) -> Result<u64, StorageError>;

    /// Get object data as a stream.
    async fn get_object(&self, location: &str) -> Result<ByteStream, StorageError>;

    /// Get object metadata without fetching data.
    async fn object_meta(&self, location: &str) -> Result<ObjectMeta, StorageError>;

    /// Delete the object at `location`.
    async fn delete_object(&self, location: &str) -> Result<(), StorageError>;
}

/// Build the backend for `method`, or `None` when it has no implementation.
pub fn open_backend(method: UploadMethod, base_path: &Path) -> Option<Arc<dyn Storage>> {
    match method {
        UploadMethod::OnDisk => Some(Arc::new(FsStorage::new(base_path))),
        UploadMethod::Aws | UploadMethod::WebDav | UploadMethod::Remote => None,
    }
}
