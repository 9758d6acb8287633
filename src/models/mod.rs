//! Core data models for the GridFS store.
//!
//! A stored file is one [`file::FileRecord`] in the bucket's files table plus
//! an ordered run of [`chunk::Chunk`] rows in its chunks table.

pub mod chunk;
pub mod file;
pub mod metadata;
