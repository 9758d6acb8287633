//! Readable and writable handles over stored files.
//!
//! Both share the [`StoredFile`] capability set. A [`WritableFile`] turns a
//! source into chunks on its first save; a [`ReadableFile`] streams chunks
//! back out in order.

use crate::{
    errors::{GridFsError, GridFsResult},
    models::{
        file::{FileId, FileRecord},
        metadata::{DateDecoding, DecodeOptions, Document},
    },
    services::{
        cursor::FromRecord,
        gridfs::{GridFs, ensure_chunk_size_valid},
    },
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, SubsecRound, Utc};
use futures::{StreamExt, TryStreamExt, stream::{self, BoxStream}};
use md5::Context;
use std::{
    fmt, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};
use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
};
use tokio_util::io::StreamReader;
use tracing::debug;
use uuid::Uuid;

/// Capabilities shared by every file handle.
#[async_trait]
pub trait StoredFile: Send + Sync {
    fn record(&self) -> &FileRecord;

    fn id(&self) -> &FileId {
        &self.record().id
    }

    fn filename(&self) -> Option<&str> {
        self.record().filename.as_deref()
    }

    fn content_type(&self) -> Option<&str> {
        self.record().content_type.as_deref()
    }

    fn length(&self) -> u64 {
        self.record().length
    }

    fn chunk_size(&self) -> u32 {
        self.record().chunk_size
    }

    fn upload_date(&self) -> DateTime<Utc> {
        self.record().upload_date
    }

    fn aliases(&self) -> &[String] {
        &self.record().aliases
    }

    fn metadata(&self) -> Option<&Document> {
        self.record().metadata.as_ref()
    }

    fn md5(&self) -> Option<&str> {
        self.record().md5.as_deref()
    }

    /// Persist the handle's record.
    async fn save(&mut self) -> GridFsResult<()>;

    /// Check the stored chunks against the stored record.
    async fn validate(&self) -> GridFsResult<()>;
}

/// Where the content of a new file comes from.
pub enum FileSource {
    Bytes(Bytes),
    Path(PathBuf),
    Reader(Box<dyn AsyncRead + Send + Unpin>),
}

impl FileSource {
    pub fn reader(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        FileSource::Reader(Box::new(reader))
    }

    /// A fresh copy of the source when it can be read again.
    fn replayable(&self) -> Option<FileSource> {
        match self {
            FileSource::Bytes(bytes) => Some(FileSource::Bytes(bytes.clone())),
            FileSource::Path(path) => Some(FileSource::Path(path.clone())),
            FileSource::Reader(_) => None,
        }
    }

    async fn into_reader(self) -> GridFsResult<Box<dyn AsyncRead + Send + Unpin>> {
        let reader: Box<dyn AsyncRead + Send + Unpin> = match self {
            FileSource::Bytes(bytes) => Box::new(io::Cursor::new(bytes)),
            FileSource::Path(path) => Box::new(File::open(&path).await?),
            FileSource::Reader(reader) => reader,
        };
        Ok(reader)
    }
}

impl fmt::Debug for FileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileSource::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            FileSource::Path(path) => f.debug_tuple("Path").field(path).finish(),
            FileSource::Reader(_) => f.write_str("Reader(..)"),
        }
    }
}

impl From<Bytes> for FileSource {
    fn from(value: Bytes) -> Self {
        FileSource::Bytes(value)
    }
}

impl From<Vec<u8>> for FileSource {
    fn from(value: Vec<u8>) -> Self {
        FileSource::Bytes(Bytes::from(value))
    }
}

impl From<&'static [u8]> for FileSource {
    fn from(value: &'static [u8]) -> Self {
        FileSource::Bytes(Bytes::from_static(value))
    }
}

impl From<PathBuf> for FileSource {
    fn from(value: PathBuf) -> Self {
        FileSource::Path(value)
    }
}

impl From<&Path> for FileSource {
    fn from(value: &Path) -> Self {
        FileSource::Path(value.to_path_buf())
    }
}

/// A file being created. Setters apply until the first save; after it,
/// only the record (filename, content type, aliases, metadata) can change.
pub struct WritableFile {
    bucket: GridFs,
    record: FileRecord,
    // Mutex keeps the handle Sync for readers that are only Send.
    source: Mutex<Option<FileSource>>,
    saved: bool,
}

impl WritableFile {
    pub(crate) fn new(bucket: GridFs, source: FileSource, filename: Option<String>) -> Self {
        let mut record = FileRecord::new(FileId::new(), bucket.chunk_size());
        record.filename = filename;
        Self {
            bucket,
            record,
            source: Mutex::new(Some(source)),
            saved: false,
        }
    }

    pub fn set_filename(&mut self, filename: impl Into<String>) -> &mut Self {
        self.record.filename = Some(filename.into());
        self
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) -> &mut Self {
        self.record.content_type = Some(content_type.into());
        self
    }

    /// Use a caller-chosen id. Saving over an existing id replaces that file.
    pub fn set_id(&mut self, id: impl Into<FileId>) -> GridFsResult<&mut Self> {
        self.ensure_unsaved()?;
        self.record.id = id.into();
        Ok(self)
    }

    pub fn set_chunk_size(&mut self, chunk_size: u32) -> GridFsResult<&mut Self> {
        self.ensure_unsaved()?;
        ensure_chunk_size_valid(chunk_size)?;
        self.record.chunk_size = chunk_size;
        Ok(self)
    }

    pub fn add_alias(&mut self, alias: impl Into<String>) -> &mut Self {
        self.record.aliases.push(alias.into());
        self
    }

    /// Metadata document, created empty on first access.
    pub fn metadata_mut(&mut self) -> &mut Document {
        self.record.metadata.get_or_insert_with(Document::new)
    }

    /// Whether chunks and record have been written.
    pub fn is_saved(&self) -> bool {
        self.saved
    }

    fn ensure_unsaved(&self) -> GridFsResult<()> {
        if self.saved {
            return Err(GridFsError::AlreadySaved(self.record.id.clone()));
        }
        Ok(())
    }

    /// Store the content. Byte and path sources are kept for a retry when
    /// the save fails; a reader source is spent by the first attempt.
    async fn save_chunks(&mut self) -> GridFsResult<()> {
        let slot = self.source.get_mut().unwrap_or_else(PoisonError::into_inner);
        let source = slot
            .take()
            .ok_or_else(|| GridFsError::SourceConsumed(self.record.id.clone()))?;
        let retry = source.replayable();

        let result = self.write_chunks(source).await;
        if result.is_err() {
            *self.source.get_mut().unwrap_or_else(PoisonError::into_inner) = retry;
        }
        result
    }

    /// Read the source to its end, writing one chunk per `chunk_size` bytes,
    /// then the record, all in one transaction.
    async fn write_chunks(&mut self, source: FileSource) -> GridFsResult<()> {
        let mut reader = source.into_reader().await?;

        let chunk_size = self.record.chunk_size as usize;
        let mut buf = vec![0u8; chunk_size];
        let mut digest = Context::new();
        let mut length: u64 = 0;
        let mut n: u32 = 0;

        let insert_sql = format!(
            "INSERT INTO {} (files_id, n, data) VALUES (?, ?, ?)",
            self.bucket.chunks_table()
        );
        let mut tx = self.bucket.pool().begin().await?;

        // A caller-chosen id may already have chunks; they are replaced.
        sqlx::query(&format!(
            "DELETE FROM {} WHERE files_id = ?",
            self.bucket.chunks_table()
        ))
        .bind(self.record.id.as_str())
        .execute(&mut *tx)
        .await?;

        loop {
            let read = read_exact_or_to_end(&mut buf, &mut reader).await?;
            if read == 0 {
                break;
            }
            digest.consume(&buf[..read]);
            sqlx::query(&insert_sql)
                .bind(self.record.id.as_str())
                .bind(i64::from(n))
                .bind(&buf[..read])
                .execute(&mut *tx)
                .await?;
            length += read as u64;
            n += 1;
            if read < chunk_size {
                break;
            }
        }

        self.record.length = length;
        self.record.md5 = Some(format!("{:x}", digest.compute()));
        self.record.upload_date = Utc::now().trunc_subsecs(3);
        self.bucket.upsert_record(&mut *tx, &self.record).await?;
        tx.commit().await?;

        debug!(
            id = %self.record.id,
            bucket = self.bucket.bucket_name(),
            length,
            chunks = n,
            "stored file"
        );
        Ok(())
    }
}

impl fmt::Debug for WritableFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritableFile")
            .field("record", &self.record)
            .field("saved", &self.saved)
            .finish()
    }
}

#[async_trait]
impl StoredFile for WritableFile {
    fn record(&self) -> &FileRecord {
        &self.record
    }

    /// The first save stores the content; later saves update the record,
    /// failing with `FileNotFound` once the file has been removed.
    async fn save(&mut self) -> GridFsResult<()> {
        if self.saved {
            return self.bucket.update_record(&self.record).await;
        }
        self.save_chunks().await?;
        self.saved = true;
        Ok(())
    }

    async fn validate(&self) -> GridFsResult<()> {
        self.bucket.validate(&self.record.id).await
    }
}

/// A stored file, read back from its bucket.
#[derive(Clone)]
pub struct ReadableFile {
    bucket: GridFs,
    record: FileRecord,
    /// How the metadata of `record` was decoded.
    decode: DecodeOptions,
}

impl ReadableFile {
    pub fn chunk_count(&self) -> u32 {
        self.record.chunk_count()
    }

    /// Content as a stream of chunks, in order.
    ///
    /// A missing or mis-sized chunk ends the stream with a validation error
    /// as soon as it is reached. Stray chunks past the recorded length and
    /// an md5 mismatch are reported after the last chunk, so a consumer that
    /// drains the stream sees every validation kind.
    pub fn stream(&self) -> BoxStream<'static, GridFsResult<Bytes>> {
        let bucket = self.bucket.clone();
        let record = Arc::new(self.record.clone());
        let count = record.chunk_count();
        stream::try_unfold((0u32, Context::new()), move |(n, mut digest)| {
            let bucket = bucket.clone();
            let record = Arc::clone(&record);
            async move {
                if n >= count {
                    bucket.finish_read(&record, digest).await?;
                    return Ok::<_, GridFsError>(None);
                }
                let data = bucket.read_chunk(&record, n).await?;
                digest.consume(&data);
                Ok(Some((data, (n + 1, digest))))
            }
        })
        .boxed()
    }

    /// Content as an [`AsyncRead`].
    pub fn reader(&self) -> StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes> {
        StreamReader::new(self.stream().map_err(io::Error::other).boxed())
    }

    /// Buffer the whole content in memory.
    pub async fn read_to_bytes(&self) -> GridFsResult<Bytes> {
        let mut out = BytesMut::with_capacity(self.record.length as usize);
        let mut chunks = self.stream();
        while let Some(chunk) = chunks.try_next().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// Copy the content into `writer`, returning the bytes written.
    pub async fn write_to<W>(&self, writer: &mut W) -> GridFsResult<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut written: u64 = 0;
        let mut chunks = self.stream();
        while let Some(chunk) = chunks.try_next().await? {
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        writer.flush().await?;
        Ok(written)
    }

    /// Write the content to `path`.
    ///
    /// Streams into a temporary file beside the target and renames it into
    /// place once complete, so a failed download leaves no partial file.
    pub async fn write_to_path(&self, path: impl AsRef<Path>) -> GridFsResult<u64> {
        let path = path.as_ref();
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let written = match self.write_to(&mut file).await {
            Ok(written) => written,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        };
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(GridFsError::Io(err));
        }
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(GridFsError::Io(err));
        }
        debug!(id = %self.record.id, path = %path.display(), written, "wrote file");
        Ok(written)
    }

    /// Metadata document, created empty on first access. Persist with
    /// [`StoredFile::save`].
    pub fn metadata_mut(&mut self) -> &mut Document {
        self.record.metadata.get_or_insert_with(Document::new)
    }

    pub fn aliases_mut(&mut self) -> &mut Vec<String> {
        &mut self.record.aliases
    }

    pub fn into_record(self) -> FileRecord {
        self.record
    }
}

impl fmt::Debug for ReadableFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadableFile")
            .field("bucket", &self.bucket.bucket_name())
            .field("record", &self.record)
            .finish()
    }
}

impl FromRecord for ReadableFile {
    fn from_record(record: FileRecord, bucket: &GridFs, decode: &DecodeOptions) -> Self {
        Self {
            bucket: bucket.clone(),
            record,
            decode: *decode,
        }
    }
}

#[async_trait]
impl StoredFile for ReadableFile {
    fn record(&self) -> &FileRecord {
        &self.record
    }

    /// Persist edits to filename, content type, aliases and metadata.
    ///
    /// Only handles read with extended date decoding can be saved; with
    /// RFC 3339 decoding the stored dates would come back as strings.
    async fn save(&mut self) -> GridFsResult<()> {
        if self.decode.dates != DateDecoding::Extended {
            return Err(GridFsError::Unsupported(format!(
                "saving file `{}` read with {:?} date decoding",
                self.record.id, self.decode.dates
            )));
        }
        self.bucket.update_record(&self.record).await
    }

    async fn validate(&self) -> GridFsResult<()> {
        self.bucket.validate(&self.record.id).await
    }
}

/// Fill `buf` from `source`, stopping early only at end of input.
async fn read_exact_or_to_end<R>(buf: &mut [u8], source: &mut R) -> io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut total = 0;
    while total < buf.len() {
        match source.read(&mut buf[total..]).await? {
            0 => break,
            n => total += n,
        }
    }
    Ok(total)
}
