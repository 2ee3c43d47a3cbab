//! Error types for the changelog engine
//!
//! Provides a unified error type for all operations.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using ChangelogError
pub type Result<T> = std::result::Result<T, ChangelogError>;

/// Unified error type for changelog operations
#[derive(Debug, Error)]
pub enum ChangelogError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Format Errors
    // -------------------------------------------------------------------------
    #[error("Corrupt header in {path}: {reason}")]
    CorruptHeader { path: PathBuf, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Contract Violations
    // -------------------------------------------------------------------------
    #[error("Changelog {id} is not open for writing")]
    LogClosed { id: i32 },

    #[error("Changelog {id} is not finalized")]
    NotFinalized { id: i32 },

    #[error("Out of order append to changelog {id}: expected record {expected}, got {actual}")]
    OutOfOrder { id: i32, expected: u32, actual: u32 },

    #[error("Invalid record {record_id} for changelog {id}: {reason}")]
    InvalidRecord {
        id: i32,
        record_id: u32,
        reason: String,
    },

    #[error("Cannot truncate changelog {id} to {requested} records: it has {record_count}")]
    InvalidTruncate {
        id: i32,
        requested: u32,
        record_count: u32,
    },

    // -------------------------------------------------------------------------
    // Failure Propagation
    // -------------------------------------------------------------------------
    #[error("Changelog {id} is unusable after an earlier I/O failure")]
    Unusable { id: i32 },

    #[error("Flush of changelog {id} failed: {reason}")]
    FlushFailed { id: i32, reason: String },

    // -------------------------------------------------------------------------
    // Store Errors
    // -------------------------------------------------------------------------
    #[error("No such changelog {0}")]
    NoSuchChangelog(i32),

    #[error("Changelog {0} already exists")]
    AlreadyExists(i32),

    #[error("Changelog dispatcher is shut down")]
    DispatcherShutdown,

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for ChangelogError {
    fn from(err: bincode::Error) -> Self {
        ChangelogError::Serialization(err.to_string())
    }
}
