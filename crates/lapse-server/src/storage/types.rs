use std::fmt;
use std::io;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Object not found")]
    NotFound,

    #[error("Permission denied creating {path}")]
    PermissionDenied { path: String },

    #[error("Invalid path: {path}")]
    InvalidPath { path: String },

    #[error("An object already exists at {path}")]
    AlreadyExists { path: String },

    #[error("Failed to create object at {path}: {source}")]
    CreateFailed { path: String, source: io::Error },

    #[error("Failed to copy content into {path}: {source}")]
    CopyFailed { path: String, source: io::Error },
}

/// Metadata about a stored object
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub size: u64,
}

/// Tag naming the backend that wrote an object.
///
/// Stored on every file record so cleanup can be dispatched to the right
/// backend. Only [`UploadMethod::OnDisk`] has an implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadMethod {
    #[serde(rename = "on-disk")]
    OnDisk,
    #[serde(rename = "aws")]
    Aws,
    #[serde(rename = "web-dav")]
    WebDav,
    #[serde(rename = "remote")]
    Remote,
}

impl UploadMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadMethod::OnDisk => "on-disk",
            UploadMethod::Aws => "aws",
            UploadMethod::WebDav => "web-dav",
            UploadMethod::Remote => "remote",
        }
    }
}

impl fmt::Display for UploadMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("Unknown upload method: {0}")]
pub struct UnknownUploadMethod(pub String);

impl FromStr for UploadMethod {
    type Err = UnknownUploadMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on-disk" => Ok(UploadMethod::OnDisk),
            "aws" => Ok(UploadMethod::Aws),
            "web-dav" => Ok(UploadMethod::WebDav),
            "remote" => Ok(UploadMethod::Remote),
            other => Err(UnknownUploadMethod(other.to_string())),
        }
    }
}
