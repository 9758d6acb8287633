//! src/services/gridfs.rs
//!
//! GridFs, the bucket facade. File content is split into fixed-size chunks
//! stored in `"<bucket>.chunks"`; one metadata row per file lives in
//! `"<bucket>.files"`. Every statement goes through the shared SQLite pool.

use crate::{
    errors::{GridFsError, GridFsResult, ValidationError},
    models::{
        chunk::Chunk,
        file::{FileId, FileRecord, FileRow},
        metadata::DecodeOptions,
    },
    services::{
        cursor::FileCursor,
        files::{FileSource, ReadableFile, StoredFile, WritableFile},
        query::{FileQuery, FindOptions, Sort, SortKey},
    },
};
use bytes::Bytes;
use futures::TryStreamExt;
use md5::Context;
use sqlx::{Executor, QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Bucket used when none is configured.
pub const DEFAULT_BUCKET: &str = "fs";
/// 255 KiB, so a chunk plus row overhead stays under 256 KiB.
pub const DEFAULT_CHUNK_SIZE: u32 = 255 * 1024;
pub const MAX_CHUNK_SIZE: u32 = 16 * 1024 * 1024;

const BUCKET_NAME_MAX_LEN: usize = 64;

pub(crate) const FILE_COLUMNS: &str =
    "seq, id, filename, content_type, length, chunk_size, upload_date, aliases, metadata, md5";

/// Options for [`GridFs::open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketOptions {
    pub bucket_name: String,
    /// Chunk size for new files; individual files may override it.
    pub chunk_size: u32,
}

impl Default for BucketOptions {
    fn default() -> Self {
        Self {
            bucket_name: DEFAULT_BUCKET.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl BucketOptions {
    pub fn named(bucket_name: impl Into<String>) -> Self {
        Self {
            bucket_name: bucket_name.into(),
            ..Self::default()
        }
    }
}

/// GridFs exposes file creation, lookup and deletion against one named
/// bucket:
/// - create a file from bytes, a local path or an async reader
/// - find files by query, id or filename (lazily, through a cursor)
/// - remove files together with their chunks
/// - validate a file's chunks against its record
///
/// Cloning is cheap; clones share the pool.
#[derive(Clone, Debug)]
pub struct GridFs {
    /// Shared SQLite connection pool.
    db: Arc<SqlitePool>,
    bucket: String,
    chunk_size: u32,
    files_table: String,
    chunks_table: String,
}

impl GridFs {
    /// Open the bucket, creating its tables and indexes if missing.
    pub async fn open(db: Arc<SqlitePool>, options: BucketOptions) -> GridFsResult<Self> {
        ensure_bucket_name_safe(&options.bucket_name)?;
        ensure_chunk_size_valid(options.chunk_size)?;

        let gridfs = Self {
            db,
            files_table: format!("\"{}.files\"", options.bucket_name),
            chunks_table: format!("\"{}.chunks\"", options.bucket_name),
            bucket: options.bucket_name,
            chunk_size: options.chunk_size,
        };
        gridfs.ensure_schema().await?;
        Ok(gridfs)
    }

    pub fn bucket_name(&self) -> &str {
        &self.bucket
    }

    /// Default chunk size for files created through this handle.
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.db
    }

    pub(crate) fn files_table(&self) -> &str {
        &self.files_table
    }

    pub(crate) fn chunks_table(&self) -> &str {
        &self.chunks_table
    }

    async fn ensure_schema(&self) -> GridFsResult<()> {
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL UNIQUE,
                    filename TEXT,
                    content_type TEXT,
                    length INTEGER NOT NULL,
                    chunk_size INTEGER NOT NULL,
                    upload_date INTEGER NOT NULL,
                    aliases TEXT NOT NULL DEFAULT '[]',
                    metadata TEXT,
                    md5 TEXT
                )",
                self.files_table
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS \"{}.files_filename_upload_date\"
                 ON {} (filename, upload_date)",
                self.bucket, self.files_table
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    files_id TEXT NOT NULL,
                    n INTEGER NOT NULL,
                    data BLOB NOT NULL,
                    PRIMARY KEY (files_id, n)
                )",
                self.chunks_table
            ),
        ];

        for stmt in &statements {
            debug!("Executing schema SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        info!(bucket = %self.bucket, "bucket ready");
        Ok(())
    }

    /// Round-trip a trivial statement to check the database is reachable.
    pub async fn ping(&self) -> GridFsResult<()> {
        let value = sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        debug!(value, "ping");
        Ok(())
    }

    /// Create a writable file from `source`. Nothing is written until the
    /// file is saved.
    ///
    /// A path source must name a regular file; its file name becomes the
    /// default filename.
    pub async fn create_file(&self, source: impl Into<FileSource>) -> GridFsResult<WritableFile> {
        let source = source.into();
        let filename = match &source {
            FileSource::Path(path) => {
                let meta = tokio::fs::metadata(path).await?;
                if !meta.is_file() {
                    return Err(GridFsError::Unsupported(format!(
                        "creating a file from `{}`, which is not a regular file",
                        path.display()
                    )));
                }
                path.file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            }
            _ => None,
        };
        Ok(WritableFile::new(self.clone(), source, filename))
    }

    /// Like [`GridFs::create_file`] with an explicit filename.
    pub async fn create_file_named(
        &self,
        source: impl Into<FileSource>,
        filename: impl Into<String>,
    ) -> GridFsResult<WritableFile> {
        let mut file = self.create_file(source).await?;
        file.set_filename(filename);
        Ok(file)
    }

    /// Create a file, hand it to `logic`, then save and validate it.
    ///
    /// Returns the new id only once both save and validate succeed. When
    /// `logic` fails its error is returned and nothing stays stored; when
    /// validation fails the saved file is removed again.
    pub async fn with_new_file<F, E>(
        &self,
        source: impl Into<FileSource>,
        logic: F,
    ) -> Result<FileId, E>
    where
        F: AsyncFnOnce(&mut WritableFile) -> Result<(), E>,
        E: From<GridFsError>,
    {
        let mut file = self.create_file(source).await?;

        if let Err(err) = logic(&mut file).await {
            if file.is_saved() {
                self.remove_by_id(file.id().clone()).await?;
            }
            return Err(err);
        }

        file.save().await?;
        if let Err(err) = file.validate().await {
            warn!(id = %file.id(), "discarding file that failed validation: {}", err);
            self.remove_by_id(file.id().clone()).await?;
            return Err(err.into());
        }
        Ok(file.id().clone())
    }

    /// Lazily iterate the files matching `query` in insertion order.
    pub async fn find(&self, query: FileQuery) -> GridFsResult<FileCursor<ReadableFile>> {
        self.find_with(query, FindOptions::default()).await
    }

    pub async fn find_with(
        &self,
        query: FileQuery,
        options: FindOptions,
    ) -> GridFsResult<FileCursor<ReadableFile>> {
        FileCursor::open(self.clone(), query, options).await
    }

    pub async fn find_by_filename(
        &self,
        filename: impl Into<String>,
    ) -> GridFsResult<FileCursor<ReadableFile>> {
        self.find(FileQuery::filename(filename)).await
    }

    /// Metadata records matching `query`, ordered by filename.
    pub async fn file_list(&self, query: FileQuery) -> GridFsResult<FileCursor<FileRecord>> {
        let options = FindOptions {
            sort: Sort::ascending(SortKey::Filename),
            ..FindOptions::default()
        };
        FileCursor::open(self.clone(), query, options).await
    }

    /// First file matching `query`, or `None`.
    pub async fn find_one(&self, query: FileQuery) -> GridFsResult<Option<ReadableFile>> {
        self.find_one_with(query, &DecodeOptions::default()).await
    }

    pub async fn find_one_with(
        &self,
        query: FileQuery,
        decode: &DecodeOptions,
    ) -> GridFsResult<Option<ReadableFile>> {
        let options = FindOptions {
            limit: Some(1),
            batch_size: 1,
            decode: *decode,
            ..FindOptions::default()
        };
        self.find_with(query, options).await?.next().await
    }

    pub async fn find_one_by_id(&self, id: impl Into<FileId>) -> GridFsResult<Option<ReadableFile>> {
        self.find_one(FileQuery::Id(id.into())).await
    }

    /// Most recent file stored under `filename`.
    pub async fn find_one_by_filename(&self, filename: &str) -> GridFsResult<Option<ReadableFile>> {
        self.find_revision(filename, -1).await
    }

    /// Select one revision among files sharing `filename`, by upload date:
    /// `0` is the oldest, `1` the next, `-1` the newest, `-2` the one
    /// before it.
    pub async fn find_revision(
        &self,
        filename: &str,
        revision: i64,
    ) -> GridFsResult<Option<ReadableFile>> {
        let (sort, skip) = if revision >= 0 {
            (Sort::ascending(SortKey::UploadDate), revision as u64)
        } else {
            (
                Sort::descending(SortKey::UploadDate),
                revision.unsigned_abs() - 1,
            )
        };
        let options = FindOptions {
            sort,
            skip,
            limit: Some(1),
            batch_size: 1,
            ..FindOptions::default()
        };
        self.find_with(FileQuery::filename(filename), options)
            .await?
            .next()
            .await
    }

    /// Delete every file matching `query` along with its chunks. Matching
    /// nothing is not an error.
    pub async fn remove(&self, query: FileQuery) -> GridFsResult<()> {
        let mut tx = self.db.begin().await?;

        let mut chunks = QueryBuilder::<Sqlite>::new(format!(
            "DELETE FROM {} WHERE files_id IN (SELECT id FROM {} WHERE ",
            self.chunks_table, self.files_table
        ));
        query.push_sql(&mut chunks);
        chunks.push(")");
        let chunk_result = chunks.build().execute(&mut *tx).await?;

        let mut files = QueryBuilder::<Sqlite>::new(format!("DELETE FROM {} WHERE ", self.files_table));
        query.push_sql(&mut files);
        let file_result = files.build().execute(&mut *tx).await?;

        tx.commit().await?;
        debug!(
            bucket = %self.bucket,
            files = file_result.rows_affected(),
            chunks = chunk_result.rows_affected(),
            "removed files"
        );
        Ok(())
    }

    pub async fn remove_by_id(&self, id: impl Into<FileId>) -> GridFsResult<()> {
        self.remove(FileQuery::Id(id.into())).await
    }

    pub async fn remove_by_filename(&self, filename: impl Into<String>) -> GridFsResult<()> {
        self.remove(FileQuery::filename(filename)).await
    }

    /// Change the filename of a stored file.
    pub async fn rename(&self, id: &FileId, new_filename: &str) -> GridFsResult<()> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET filename = ? WHERE id = ?",
            self.files_table
        ))
        .bind(new_filename)
        .bind(id.as_str())
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(GridFsError::FileNotFound(id.clone()));
        }
        Ok(())
    }

    /// Delete every file and chunk in the bucket. The tables stay.
    pub async fn drop_all(&self) -> GridFsResult<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query(&format!("DELETE FROM {}", self.chunks_table))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("DELETE FROM {}", self.files_table))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(bucket = %self.bucket, "bucket emptied");
        Ok(())
    }

    /// Check the stored chunks of `id` against its record: chunk numbers
    /// contiguous from zero, every chunk sized as the record implies, no
    /// chunk past the recorded length, and a matching md5.
    pub async fn validate(&self, id: &FileId) -> GridFsResult<()> {
        let record = self
            .fetch_record(id, &DecodeOptions::default())
            .await?
            .ok_or_else(|| GridFsError::FileNotFound(id.clone()))?;
        let count = record.chunk_count();

        let sql = format!(
            "SELECT files_id, n, data FROM {} WHERE files_id = ? ORDER BY n",
            self.chunks_table
        );
        let mut rows = sqlx::query_as::<_, Chunk>(&sql)
            .bind(id.as_str())
            .fetch(&*self.db);

        let mut digest = Context::new();
        let mut expected_n: u32 = 0;
        while let Some(chunk) = rows.try_next().await? {
            if chunk.n >= i64::from(count) || chunk.n < 0 {
                return Err(GridFsError::validation(
                    id,
                    ValidationError::ExtraChunk { n: chunk.n },
                ));
            }
            if chunk.n != i64::from(expected_n) {
                return Err(GridFsError::validation(
                    id,
                    ValidationError::MissingChunk { n: expected_n },
                ));
            }
            let expected = record.expected_chunk_len(expected_n);
            if chunk.data.len() != expected {
                return Err(GridFsError::validation(
                    id,
                    ValidationError::WrongSizeChunk {
                        n: expected_n,
                        actual: chunk.data.len(),
                        expected,
                    },
                ));
            }
            digest.consume(&chunk.data);
            expected_n += 1;
        }

        if expected_n < count {
            return Err(GridFsError::validation(
                id,
                ValidationError::MissingChunk { n: expected_n },
            ));
        }

        check_md5(&record, digest)?;

        debug!(%id, chunks = count, "file validated");
        Ok(())
    }

    /// Checks run once every chunk of `record` has been read in order:
    /// no chunk may lie outside the recorded length, and `digest` must
    /// match the recorded md5.
    pub(crate) async fn finish_read(&self, record: &FileRecord, digest: Context) -> GridFsResult<()> {
        let extra: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT n FROM {} WHERE files_id = ? AND (n < 0 OR n >= ?) ORDER BY n LIMIT 1",
            self.chunks_table
        ))
        .bind(record.id.as_str())
        .bind(i64::from(record.chunk_count()))
        .fetch_optional(&*self.db)
        .await?;
        if let Some(n) = extra {
            return Err(GridFsError::validation(&record.id, ValidationError::ExtraChunk { n }));
        }
        check_md5(record, digest)
    }

    pub(crate) async fn fetch_record(
        &self,
        id: &FileId,
        decode: &DecodeOptions,
    ) -> GridFsResult<Option<FileRecord>> {
        let sql = format!("SELECT {} FROM {} WHERE id = ?", FILE_COLUMNS, self.files_table);
        let row: Option<FileRow> = sqlx::query_as(&sql)
            .bind(id.as_str())
            .fetch_optional(&*self.db)
            .await?;
        row.map(|row| row.into_record(decode)).transpose()
    }

    /// Load chunk `n` of `record`, checking it exists with the length the
    /// record implies.
    pub(crate) async fn read_chunk(&self, record: &FileRecord, n: u32) -> GridFsResult<Bytes> {
        let sql = format!(
            "SELECT files_id, n, data FROM {} WHERE files_id = ? AND n = ?",
            self.chunks_table
        );
        let chunk: Chunk = sqlx::query_as(&sql)
            .bind(record.id.as_str())
            .bind(i64::from(n))
            .fetch_optional(&*self.db)
            .await?
            .ok_or_else(|| GridFsError::validation(&record.id, ValidationError::MissingChunk { n }))?;

        let expected = record.expected_chunk_len(n);
        if chunk.data.len() != expected {
            return Err(GridFsError::validation(
                &record.id,
                ValidationError::WrongSizeChunk {
                    n,
                    actual: chunk.data.len(),
                    expected,
                },
            ));
        }
        Ok(Bytes::from(chunk.data))
    }

    /// Write the editable fields of an already stored record: filename,
    /// content type, aliases and metadata. Length, checksum and upload date
    /// belong to the stored chunks and are left alone.
    pub(crate) async fn update_record(&self, record: &FileRecord) -> GridFsResult<()> {
        let aliases = serde_json::to_string(&record.aliases)?;
        let metadata = record
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(&format!(
            "UPDATE {} SET filename = ?, content_type = ?, aliases = ?, metadata = ? WHERE id = ?",
            self.files_table
        ))
        .bind(record.filename.as_deref())
        .bind(record.content_type.as_deref())
        .bind(aliases)
        .bind(metadata)
        .bind(record.id.as_str())
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(GridFsError::FileNotFound(record.id.clone()));
        }
        Ok(())
    }

    /// Insert `record`, or replace the stored record with the same id.
    pub(crate) async fn upsert_record<'e, E>(
        &self,
        executor: E,
        record: &FileRecord,
    ) -> GridFsResult<()>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let length = i64::try_from(record.length)
            .map_err(|_| GridFsError::Unsupported(format!("a length of {} bytes", record.length)))?;
        let aliases = serde_json::to_string(&record.aliases)?;
        let metadata = record
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let sql = format!(
            r#"
            INSERT INTO {} (
                id, filename, content_type, length, chunk_size,
                upload_date, aliases, metadata, md5
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                filename = excluded.filename,
                content_type = excluded.content_type,
                length = excluded.length,
                chunk_size = excluded.chunk_size,
                upload_date = excluded.upload_date,
                aliases = excluded.aliases,
                metadata = excluded.metadata,
                md5 = excluded.md5
            "#,
            self.files_table
        );
        sqlx::query(&sql)
            .bind(record.id.as_str())
            .bind(record.filename.as_deref())
            .bind(record.content_type.as_deref())
            .bind(length)
            .bind(i64::from(record.chunk_size))
            .bind(record.upload_date.timestamp_millis())
            .bind(aliases)
            .bind(metadata)
            .bind(record.md5.as_deref())
            .execute(executor)
            .await?;
        Ok(())
    }
}

fn check_md5(record: &FileRecord, digest: Context) -> GridFsResult<()> {
    let Some(recorded) = &record.md5 else {
        return Ok(());
    };
    let actual = format!("{:x}", digest.compute());
    if !recorded.eq_ignore_ascii_case(&actual) {
        return Err(GridFsError::validation(
            &record.id,
            ValidationError::ChecksumMismatch {
                expected: recorded.clone(),
                actual,
            },
        ));
    }
    Ok(())
}

/// Validate a bucket name.
///
/// Names become part of quoted table names, so they are restricted to
/// 1–64 ASCII letters, digits, `_`, `-` and `.`, with dots neither leading,
/// trailing nor doubled.
fn ensure_bucket_name_safe(name: &str) -> GridFsResult<()> {
    let invalid = |reason: &str| GridFsError::InvalidBucketName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() || name.len() > BUCKET_NAME_MAX_LEN {
        return Err(invalid("must be between 1 and 64 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(invalid(
            "allowed characters are ASCII letters, digits, underscores, hyphens, and dots",
        ));
    }
    if name.starts_with('.') || name.ends_with('.') || name.contains("..") {
        return Err(invalid("dots cannot lead, trail, or repeat"));
    }
    Ok(())
}

pub(crate) fn ensure_chunk_size_valid(size: u32) -> GridFsResult<()> {
    if size == 0 || size > MAX_CHUNK_SIZE {
        return Err(GridFsError::InvalidChunkSize {
            size,
            max: MAX_CHUNK_SIZE,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_names() {
        assert!(ensure_bucket_name_safe("fs").is_ok());
        assert!(ensure_bucket_name_safe("photos.v2").is_ok());
        assert!(ensure_bucket_name_safe("user_uploads-1").is_ok());
        assert!(ensure_bucket_name_safe("").is_err());
        assert!(ensure_bucket_name_safe(".hidden").is_err());
        assert!(ensure_bucket_name_safe("a..b").is_err());
        assert!(ensure_bucket_name_safe("bad\"name").is_err());
        assert!(ensure_bucket_name_safe(&"x".repeat(65)).is_err());
    }

    #[test]
    fn chunk_sizes() {
        assert!(ensure_chunk_size_valid(1).is_ok());
        assert!(ensure_chunk_size_valid(DEFAULT_CHUNK_SIZE).is_ok());
        assert!(ensure_chunk_size_valid(0).is_err());
        assert!(ensure_chunk_size_valid(MAX_CHUNK_SIZE + 1).is_err());
    }
}
