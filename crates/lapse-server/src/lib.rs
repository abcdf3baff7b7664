//! Lapse server - ephemeral file upload service.
//!
//! Uploads are written to a storage backend and recorded in SQLite. Files
//! with an expiry are handed to a background scheduler which deletes them
//! once they are due.

pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod expiry;
pub mod files;
pub mod mime;
pub mod storage;

pub use api::{AppState, router};
pub use config::{Config, UploadPolicy};
pub use db::{FileRecord, MetadataDb, MetadataStore};
pub use expiry::ExpiryScheduler;
pub use files::{FileManager, NewFile, SaveError, UploadSource};
pub use storage::{ByteReader, ByteStream, FsStorage, ObjectMeta, Storage, StorageError};
