//! Error types for the keyspace and its compression codecs.
//!
//! RDB-specific failures live in [`crate::rdb::RdbError`] at a finer
//! granularity (matching the distinct failure kinds named by the snapshot
//! format); this enum covers the keyspace and codec layer underneath it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("key not found")]
    NotFound,

    #[error("{codec} compression failed: {reason}")]
    CompressionFailed { codec: &'static str, reason: String },

    #[error("{codec} decompression failed: {reason}")]
    DecompressionFailed { codec: &'static str, reason: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
