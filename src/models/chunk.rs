//! Represents one binary segment of a stored file.

use sqlx::FromRow;

/// A chunk row: the `n`th segment of the file identified by `files_id`.
#[derive(Debug, Clone, FromRow)]
pub struct Chunk {
    pub files_id: String,

    /// Zero-based position within the file.
    pub n: i64,

    pub data: Vec<u8>,
}
