//! Bucket operations layered over the SQLite pool.

pub mod cursor;
pub mod files;
pub mod gridfs;
pub mod query;
