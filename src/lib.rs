//! GridFS-convention file storage on SQLite.
//!
//! A file is stored as one metadata record in `"<bucket>.files"` plus an
//! ordered run of fixed-size chunks in `"<bucket>.chunks"`.
//!
//! ```no_run
//! use gridfs_store::{BucketOptions, GridFs, StoredFile, db};
//! use std::sync::Arc;
//!
//! # async fn example() -> gridfs_store::GridFsResult<()> {
//! let pool = Arc::new(db::connect("sqlite://./data/gridfs.db").await?);
//! let bucket = GridFs::open(pool, BucketOptions::default()).await?;
//!
//! let mut file = bucket.create_file_named(b"hello".to_vec(), "hello.txt").await?;
//! file.save().await?;
//!
//! if let Some(found) = bucket.find_one_by_id(file.id().clone()).await? {
//!     assert_eq!(&found.read_to_bytes().await?[..], b"hello");
//! }
//! # Ok(())
//! # }
//! ```

pub mod db;
pub mod errors;
pub mod models;
pub mod services;

pub use errors::{GridFsError, GridFsResult, ValidationError};
pub use models::{
    file::{FileId, FileRecord},
    metadata::{DateDecoding, DecodeOptions, Document},
};
pub use services::{
    cursor::{FileCursor, FromRecord},
    files::{FileSource, ReadableFile, StoredFile, WritableFile},
    gridfs::{BucketOptions, DEFAULT_BUCKET, DEFAULT_CHUNK_SIZE, GridFs},
    query::{Direction, FileQuery, FindOptions, Scalar, Sort, SortKey},
};
