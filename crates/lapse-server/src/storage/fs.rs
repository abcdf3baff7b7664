use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio_util::io::ReaderStream;
use tracing::debug;

use super::{ByteReader, ByteStream, Namespace, ObjectMeta, Storage, StorageError, UploadMethod};

/// Size of the intermediate buffer used when streaming uploads to disk.
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// On-disk backend. Objects live at `<base>/files/<namespace>/<filename>`.
pub struct FsStorage {
    base_path: PathBuf,
}

impl FsStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn files_root(&self) -> PathBuf {
        self.base_path.join("files")
    }

    /// Turn a location back into a path, refusing anything outside the files root.
    fn object_path(&self, location: &str) -> Result<PathBuf, StorageError> {
        let path = PathBuf::from(location);
        let inside = path.starts_with(self.files_root())
            && !path
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir));
        if !inside {
            return Err(StorageError::InvalidPath {
                path: location.to_string(),
            });
        }
        Ok(path)
    }
}

fn not_found_or_io(e: std::io::Error) -> StorageError {
    if e.kind() == ErrorKind::NotFound {
        StorageError::NotFound
    } else {
        StorageError::Io(e)
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[async_trait]
impl Storage for FsStorage {
    fn method(&self) -> UploadMethod {
        UploadMethod::OnDisk
    }

    fn location(&self, namespace: &Namespace, filename: &str) -> String {
        path_string(&self.files_root().join(namespace.dir_name()).join(filename))
    }

    async fn prepare_namespace(&self, namespace: &Namespace) -> Result<(), StorageError> {
        let dir = self.files_root().join(namespace.dir_name());
        match fs::create_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) => match e.kind() {
                ErrorKind::PermissionDenied => Err(StorageError::PermissionDenied {
                    path: path_string(&dir),
                }),
                // create_dir_all reports AlreadyExists when a non-directory is in the way
                ErrorKind::InvalidInput | ErrorKind::NotADirectory | ErrorKind::AlreadyExists => {
                    Err(StorageError::InvalidPath {
                        path: path_string(&dir),
                    })
                }
                _ => Err(StorageError::Io(e)),
            },
        }
    }

    async fn put_object(&self, location: &str, mut data: ByteReader) -> Result<u64, StorageError> {
        let path = self.object_path(location)?;
        let parent = path.parent().ok_or_else(|| StorageError::InvalidPath {
            path: location.to_string(),
        })?;

        let create_failed = |source| StorageError::CreateFailed {
            path: location.to_string(),
            source,
        };
        let copy_failed = |source| StorageError::CopyFailed {
            path: location.to_string(),
            source,
        };

        // Write to a tempfile next to the destination, then rename into place.
        // Dropping `temp` on any error path removes the partial file.
        let temp = tempfile::Builder::new()
            .prefix(".upload-")
            .tempfile_in(parent)
            .map_err(create_failed)?;
        let mut file = File::create(temp.path()).await.map_err(create_failed)?;

        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut written: u64 = 0;
        loop {
            let n = data.read(&mut buf).await.map_err(copy_failed)?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await.map_err(copy_failed)?;
            written += n as u64;
        }

        file.flush().await.map_err(copy_failed)?;
        file.sync_all().await.map_err(copy_failed)?;
        drop(file);

        // never replace an existing object
        temp.persist_noclobber(&path).map_err(|e| {
            if e.error.kind() == ErrorKind::AlreadyExists {
                StorageError::AlreadyExists {
                    path: location.to_string(),
                }
            } else {
                create_failed(e.error)
            }
        })?;
        debug!(location, bytes = written, "Stored object");
        Ok(written)
    }

    async fn get_object(&self, location: &str) -> Result<ByteStream, StorageError> {
        let path = self.object_path(location)?;
        let file = File::open(&path).await.map_err(not_found_or_io)?;

        let reader = BufReader::with_capacity(COPY_BUFFER_SIZE, file);
        let stream = ReaderStream::new(reader).map(|result| result.map_err(StorageError::Io));

        Ok(Box::new(stream))
    }

    async fn object_meta(&self, location: &str) -> Result<ObjectMeta, StorageError> {
        let path = self.object_path(location)?;
        let metadata = fs::metadata(&path).await.map_err(not_found_or_io)?;

        Ok(ObjectMeta {
            size: metadata.len(),
        })
    }

    async fn delete_object(&self, location: &str) -> Result<(), StorageError> {
        let path = self.object_path(location)?;
        fs::remove_file(&path).await.map_err(not_found_or_io)
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tempfile::TempDir;
    use tokio::io::{AsyncRead, ReadBuf};

    use super::*;

    /// Yields some bytes, then fails.
    struct BrokenReader {
        sent: bool,
    }

    impl AsyncRead for BrokenReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.sent {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "gone")))
            } else {
                self.sent = true;
                buf.put_slice(b"partial");
                Poll::Ready(Ok(()))
            }
        }
    }

    async fn setup() -> (TempDir, FsStorage) {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("files")).unwrap();
        let storage = FsStorage::new(dir.path());
        (dir, storage)
    }

    async fn collect(storage: &FsStorage, location: &str) -> Vec<u8> {
        let mut stream = storage.get_object(location).await.unwrap();
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_location_layout() {
        let (dir, storage) = setup().await;
        let loc = storage.location(&Namespace::Guest, "a.png");
        assert_eq!(
            PathBuf::from(loc),
            dir.path().join("files").join("guest_uploads").join("a.png")
        );

        let loc = storage.location(&Namespace::Owner("abc".into()), "a.png");
        assert_eq!(
            PathBuf::from(loc),
            dir.path().join("files").join("abc").join("a.png")
        );
    }

    #[tokio::test]
    async fn test_put_and_get_object() {
        let (_dir, storage) = setup().await;
        let ns = Namespace::Owner("owner".into());
        storage.prepare_namespace(&ns).await.unwrap();

        // larger than one copy buffer
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let loc = storage.location(&ns, "blob.bin");
        let written = storage
            .put_object(&loc, Box::new(io::Cursor::new(data.clone())))
            .await
            .unwrap();

        assert_eq!(written, data.len() as u64);
        assert_eq!(collect(&storage, &loc).await, data);
        assert_eq!(storage.object_meta(&loc).await.unwrap().size, data.len() as u64);
    }

    #[tokio::test]
    async fn test_prepare_namespace_is_idempotent() {
        let (_dir, storage) = setup().await;
        storage.prepare_namespace(&Namespace::Guest).await.unwrap();
        storage.prepare_namespace(&Namespace::Guest).await.unwrap();
    }

    #[tokio::test]
    async fn test_prepare_namespace_blocked_by_file() {
        let (dir, storage) = setup().await;
        std::fs::write(dir.path().join("files").join("guest_uploads"), b"x").unwrap();

        let err = storage.prepare_namespace(&Namespace::Guest).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidPath { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_failed_copy_leaves_nothing_behind() {
        let (dir, storage) = setup().await;
        storage.prepare_namespace(&Namespace::Guest).await.unwrap();
        let loc = storage.location(&Namespace::Guest, "broken.bin");

        let err = storage
            .put_object(&loc, Box::new(BrokenReader { sent: false }))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::CopyFailed { .. }), "{err:?}");

        let leftovers = std::fs::read_dir(dir.path().join("files").join("guest_uploads"))
            .unwrap()
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_put_never_replaces_existing_object() {
        let (_dir, storage) = setup().await;
        storage.prepare_namespace(&Namespace::Guest).await.unwrap();
        let loc = storage.location(&Namespace::Guest, "taken.bin");
        storage
            .put_object(&loc, Box::new(io::Cursor::new(b"first".to_vec())))
            .await
            .unwrap();

        let err = storage
            .put_object(&loc, Box::new(io::Cursor::new(b"second".to_vec())))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists { .. }), "{err:?}");
        assert_eq!(collect(&storage, &loc).await, b"first");
    }

    #[tokio::test]
    async fn test_create_in_missing_namespace_fails() {
        let (_dir, storage) = setup().await;
        let loc = storage.location(&Namespace::Owner("nobody".into()), "a.txt");

        let err = storage
            .put_object(&loc, Box::new(io::Cursor::new(b"hi".to_vec())))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::CreateFailed { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_delete_object() {
        let (_dir, storage) = setup().await;
        storage.prepare_namespace(&Namespace::Guest).await.unwrap();
        let loc = storage.location(&Namespace::Guest, "gone.txt");
        storage
            .put_object(&loc, Box::new(io::Cursor::new(b"bye".to_vec())))
            .await
            .unwrap();

        storage.delete_object(&loc).await.unwrap();
        assert!(matches!(
            storage.object_meta(&loc).await,
            Err(StorageError::NotFound)
        ));
        assert!(matches!(
            storage.delete_object(&loc).await,
            Err(StorageError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_rejects_locations_outside_root() {
        let (dir, storage) = setup().await;
        let outside = dir.path().join("database.db");
        std::fs::write(&outside, b"keep me").unwrap();

        let err = storage
            .delete_object(&outside.to_string_lossy())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidPath { .. }));

        let sneaky = format!("{}/files/../database.db", dir.path().display());
        assert!(storage.delete_object(&sneaky).await.is_err());
        assert!(outside.exists());
    }
}
