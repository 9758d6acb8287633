//! Represents the metadata record of a stored file.

use crate::{
    errors::{GridFsError, GridFsResult},
    models::metadata::{self, DecodeOptions, Document},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Identifier of a stored file, unique within a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for FileId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for FileId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<&FileId> for FileId {
    fn from(value: &FileId) -> Self {
        value.clone()
    }
}

/// Metadata describing one stored file.
///
/// The record does not hold content; content lives in the bucket's chunks
/// table, `chunk_size` bytes per chunk with a shorter final chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    #[serde(rename = "_id")]
    pub id: FileId,

    /// Name of the stored file; need not be unique.
    pub filename: Option<String>,

    /// MIME type, for application use only.
    pub content_type: Option<String>,

    /// Total content length in bytes.
    pub length: u64,

    /// Size of every chunk except possibly the last.
    pub chunk_size: u32,

    /// When the upload completed.
    pub upload_date: DateTime<Utc>,

    pub aliases: Vec<String>,

    /// Free-form application data.
    pub metadata: Option<Document>,

    /// Hex md5 of the content.
    pub md5: Option<String>,
}

impl FileRecord {
    pub(crate) fn new(id: FileId, chunk_size: u32) -> Self {
        Self {
            id,
            filename: None,
            content_type: None,
            length: 0,
            chunk_size,
            upload_date: Utc::now(),
            aliases: Vec::new(),
            metadata: None,
            md5: None,
        }
    }

    /// Number of chunks the recorded length implies.
    pub fn chunk_count(&self) -> u32 {
        if self.length == 0 || self.chunk_size == 0 {
            return 0;
        }
        self.length.div_ceil(self.chunk_size as u64) as u32
    }

    /// Byte length chunk `n` must have for this record to be consistent.
    pub fn expected_chunk_len(&self, n: u32) -> usize {
        let count = self.chunk_count();
        if n >= count {
            return 0;
        }
        if n + 1 < count {
            return self.chunk_size as usize;
        }
        (self.length - (count as u64 - 1) * self.chunk_size as u64) as usize
    }
}

/// Raw row of a bucket's files table.
#[derive(Debug, Clone, FromRow)]
pub(crate) struct FileRow {
    pub seq: i64,
    pub id: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub length: i64,
    pub chunk_size: i64,
    pub upload_date: i64,
    pub aliases: String,
    pub metadata: Option<String>,
    pub md5: Option<String>,
}

impl FileRow {
    /// Decode the stored columns into a record, applying `decode` to the
    /// metadata document.
    pub(crate) fn into_record(self, decode: &DecodeOptions) -> GridFsResult<FileRecord> {
        let corrupt = |reason: String| GridFsError::CorruptRecord {
            id: self.id.clone(),
            reason,
        };

        let length = u64::try_from(self.length)
            .map_err(|_| corrupt(format!("negative length {}", self.length)))?;
        let chunk_size = u32::try_from(self.chunk_size)
            .ok()
            .filter(|size| *size > 0)
            .ok_or_else(|| corrupt(format!("invalid chunk size {}", self.chunk_size)))?;
        let upload_date = DateTime::from_timestamp_millis(self.upload_date)
            .ok_or_else(|| corrupt(format!("upload date {} out of range", self.upload_date)))?;
        let aliases: Vec<String> = serde_json::from_str(&self.aliases)
            .map_err(|err| corrupt(format!("aliases: {}", err)))?;
        let metadata = match self.metadata.as_deref() {
            Some(raw) => {
                let doc: Document = serde_json::from_str(raw)
                    .map_err(|err| corrupt(format!("metadata: {}", err)))?;
                Some(metadata::decode_document(doc, decode))
            }
            None => None,
        };

        Ok(FileRecord {
            id: FileId(self.id),
            filename: self.filename,
            content_type: self.content_type,
            length,
            chunk_size,
            upload_date,
            aliases,
            metadata,
            md5: self.md5,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(length: u64, chunk_size: u32) -> FileRecord {
        let mut record = FileRecord::new(FileId::from("f"), chunk_size);
        record.length = length;
        record
    }

    #[test]
    fn chunk_math_handles_partial_last_chunk() {
        let rec = record(10, 4);
        assert_eq!(rec.chunk_count(), 3);
        assert_eq!(rec.expected_chunk_len(0), 4);
        assert_eq!(rec.expected_chunk_len(1), 4);
        assert_eq!(rec.expected_chunk_len(2), 2);
        assert_eq!(rec.expected_chunk_len(3), 0);
    }

    #[test]
    fn chunk_math_exact_multiple_and_empty() {
        assert_eq!(record(8, 4).chunk_count(), 2);
        assert_eq!(record(8, 4).expected_chunk_len(1), 4);
        assert_eq!(record(0, 4).chunk_count(), 0);
    }

    #[test]
    fn row_with_bad_aliases_is_corrupt() {
        let row = FileRow {
            seq: 1,
            id: "abc".into(),
            filename: None,
            content_type: None,
            length: 0,
            chunk_size: 4,
            upload_date: 0,
            aliases: "not json".into(),
            metadata: None,
            md5: None,
        };
        let err = row.into_record(&DecodeOptions::default()).unwrap_err();
        assert!(matches!(err, GridFsError::CorruptRecord { ref id, .. } if id == "abc"));
    }
}
