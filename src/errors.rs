//! Error types shared by every GridFS operation.

use crate::models::file::FileId;
use std::io;
use thiserror::Error;

/// Structural problems found while validating or reading a stored file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("chunk {n} is missing")]
    MissingChunk { n: u32 },
    #[error("chunk {n} holds {actual} bytes, expected {expected}")]
    WrongSizeChunk { n: u32, actual: usize, expected: usize },
    #[error("unexpected chunk {n} outside the recorded length")]
    ExtraChunk { n: i64 },
    #[error("md5 differs: recorded {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

#[derive(Debug, Error)]
pub enum GridFsError {
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("chunk size must be between 1 and {max} bytes, got {size}")]
    InvalidChunkSize { size: u32, max: u32 },
    #[error("file `{0}` not found")]
    FileNotFound(FileId),
    #[error("file `{0}` has already been saved")]
    AlreadySaved(FileId),
    #[error("source of file `{0}` was consumed by a failed save")]
    SourceConsumed(FileId),
    #[error("file `{id}` failed validation: {kind}")]
    Validation { id: FileId, kind: ValidationError },
    #[error("{0} is not supported")]
    Unsupported(String),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("file record `{id}` is corrupt: {reason}")]
    CorruptRecord { id: String, reason: String },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl GridFsError {
    pub(crate) fn validation(id: &FileId, kind: ValidationError) -> Self {
        Self::Validation {
            id: id.clone(),
            kind,
        }
    }

    /// True when the error describes a structurally inconsistent file rather
    /// than a transport failure.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }
}

pub type GridFsResult<T> = Result<T, GridFsError>;
