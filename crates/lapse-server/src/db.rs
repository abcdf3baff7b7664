//! Metadata store for uploaded files.
//!
//! Uses SQLite to record where every stored object lives, who owns it and
//! when it expires, plus the users that own namespaces.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::storage::UploadMethod;

/// Database error type.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Database connection lock poisoned")]
    Poisoned,
}

/// Persisted metadata for one stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    pub id: i64,
    pub created_at: i64,
    /// Empty for anonymous uploads.
    pub owner_id: String,
    /// Unix seconds after which the file is purged; 0 means never.
    pub expires_at: i64,
    pub mime_type: String,
    #[serde(skip_serializing)]
    pub location: String,
    pub filename: String,
    pub upload_method: UploadMethod,
    pub private: bool,
}

/// A file record that has not been committed yet.
#[derive(Debug, Clone)]
pub struct NewFileRecord {
    pub created_at: i64,
    pub owner_id: String,
    pub expires_at: i64,
    pub mime_type: String,
    pub location: String,
    pub filename: String,
    pub upload_method: UploadMethod,
    pub private: bool,
}

impl NewFileRecord {
    pub fn into_record(self, id: i64) -> FileRecord {
        FileRecord {
            id,
            created_at: self.created_at,
            owner_id: self.owner_id,
            expires_at: self.expires_at,
            mime_type: self.mime_type,
            location: self.location,
            filename: self.filename,
            upload_method: self.upload_method,
            private: self.private,
        }
    }
}

/// A user that owns a storage namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub user_id: String,
    /// Stable directory name of the user's namespace.
    pub storage_id: String,
    pub created_at: i64,
}

/// Record-level API the file manager and HTTP layer need from a metadata store.
///
/// Each call is atomic on its own; callers never span a transaction across calls.
pub trait MetadataStore: Send + Sync + 'static {
    /// Look up a user by ID.
    fn find_user(&self, user_id: &str) -> Result<Option<UserRecord>, DbError>;

    /// Commit a new file record, returning its ID.
    fn create_record(&self, record: &NewFileRecord) -> Result<i64, DbError>;

    /// All filenames taken in an owner's namespace.
    fn find_filenames(&self, owner_id: &str) -> Result<HashSet<String>, DbError>;

    /// Look up a record inside an owner's namespace.
    fn find_record_by_filename(
        &self,
        owner_id: &str,
        filename: &str,
    ) -> Result<Option<FileRecord>, DbError>;

    /// Look up a non-private record by filename, across all owners.
    fn find_public_record(&self, filename: &str) -> Result<Option<FileRecord>, DbError>;

    /// All records with a nonzero expiry, soonest first.
    fn expiring_records(&self) -> Result<Vec<FileRecord>, DbError>;

    /// Look up the record whose object lives at `location`.
    fn find_record_by_location(&self, location: &str) -> Result<Option<FileRecord>, DbError>;

    /// Delete a record by ID. Returns false if there was none.
    fn delete_record(&self, id: i64) -> Result<bool, DbError>;
}

const RECORD_COLUMNS: &str =
    "id, created_at, owner_id, expires_at, mime_type, location, filename, upload_method, private";

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    let method: String = row.get(7)?;
    let upload_method = method.parse().map_err(|_| {
        rusqlite::Error::InvalidColumnType(7, "upload_method".into(), rusqlite::types::Type::Text)
    })?;

    Ok(FileRecord {
        id: row.get(0)?,
        created_at: row.get(1)?,
        owner_id: row.get(2)?,
        expires_at: row.get(3)?,
        mime_type: row.get(4)?,
        location: row.get(5)?,
        filename: row.get(6)?,
        upload_method,
        private: row.get(8)?,
    })
}

/// SQLite-backed metadata store.
pub struct MetadataDb {
    conn: Mutex<Connection>,
}

impl MetadataDb {
    /// Open or create the metadata database.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    /// Initialize the database schema.
    fn init_schema(&self) -> Result<(), DbError> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                storage_id TEXT NOT NULL UNIQUE,
                created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
            );

            CREATE TABLE IF NOT EXISTS file_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at INTEGER NOT NULL,
                owner_id TEXT NOT NULL DEFAULT '',
                expires_at INTEGER NOT NULL DEFAULT 0,
                mime_type TEXT NOT NULL,
                location TEXT NOT NULL,
                filename TEXT NOT NULL,
                upload_method TEXT NOT NULL,
                private INTEGER NOT NULL DEFAULT 0
            );

            -- Filenames are unique per owner; '' is the anonymous namespace
            CREATE UNIQUE INDEX IF NOT EXISTS idx_file_records_owner_filename
                ON file_records(owner_id, filename);
            CREATE INDEX IF NOT EXISTS idx_file_records_expires_at
                ON file_records(expires_at) WHERE expires_at > 0;
            CREATE INDEX IF NOT EXISTS idx_file_records_location ON file_records(location);
            "#,
        )?;
        Ok(())
    }

    /// Register a user, giving them a fresh namespace directory.
    pub fn create_user(&self, user_id: &str) -> Result<UserRecord, DbError> {
        let storage_id = Uuid::new_v4().simple().to_string();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (user_id, storage_id) VALUES (?1, ?2)",
            params![user_id, storage_id],
        )?;
        let created_at = conn.query_row(
            "SELECT created_at FROM users WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;

        Ok(UserRecord {
            user_id: user_id.to_string(),
            storage_id,
            created_at,
        })
    }
}

impl MetadataStore for MetadataDb {
    fn find_user(&self, user_id: &str) -> Result<Option<UserRecord>, DbError> {
        let user = self
            .conn()?
            .query_row(
                "SELECT user_id, storage_id, created_at FROM users WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok(UserRecord {
                        user_id: row.get(0)?,
                        storage_id: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    fn create_record(&self, record: &NewFileRecord) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO file_records
                (created_at, owner_id, expires_at, mime_type, location, filename, upload_method, private)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.created_at,
                record.owner_id,
                record.expires_at,
                record.mime_type,
                record.location,
                record.filename,
                record.upload_method.as_str(),
                record.private,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn find_filenames(&self, owner_id: &str) -> Result<HashSet<String>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT filename FROM file_records WHERE owner_id = ?1")?;
        let rows = stmt.query_map(params![owner_id], |row| row.get::<_, String>(0))?;

        let mut names = HashSet::new();
        for row in rows {
            names.insert(row?);
        }
        Ok(names)
    }

    fn find_record_by_filename(
        &self,
        owner_id: &str,
        filename: &str,
    ) -> Result<Option<FileRecord>, DbError> {
        let record = self
            .conn()?
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM file_records WHERE owner_id = ?1 AND filename = ?2"
                ),
                params![owner_id, filename],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn find_public_record(&self, filename: &str) -> Result<Option<FileRecord>, DbError> {
        let record = self
            .conn()?
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM file_records
                     WHERE filename = ?1 AND private = 0 ORDER BY id LIMIT 1"
                ),
                params![filename],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn expiring_records(&self) -> Result<Vec<FileRecord>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM file_records WHERE expires_at > 0 ORDER BY expires_at"
        ))?;
        let rows = stmt.query_map([], record_from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn find_record_by_location(&self, location: &str) -> Result<Option<FileRecord>, DbError> {
        let record = self
            .conn()?
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM file_records WHERE location = ?1"),
                params![location],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn delete_record(&self, id: i64) -> Result<bool, DbError> {
        let rows = self
            .conn()?
            .execute("DELETE FROM file_records WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }
}
