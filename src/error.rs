//! Error types for the Strand distributed file system.
//!
//! This module provides a unified error type [`StrandError`] for all Strand
//! operations, along with a convenient [`Result`] type alias.
//!
//! Errors are organized by effect rather than by origin:
//!
//! - **Not-found / already-exists**: reported to the caller, no state change
//! - **Transient network / timeout**: retried by the client with backoff
//! - **Stale lease / stale version**: the caller invalidates cached locations
//!   and restarts the operation from a metadata lookup
//! - **Checksum mismatch**: the read fails on that replica and the client
//!   tries another one
//! - **WAL failure**: fatal for the master
//!
//! # Example
//!
//! ```rust
//! use strand::error::{Result, StrandError};
//!
//! fn check_path(path: &str) -> Result<()> {
//!     if !path.starts_with('/') {
//!         return Err(StrandError::InvalidPath(path.to_string()));
//!     }
//!     Ok(())
//! }
//! ```

use std::io;
use thiserror::Error;

/// Main error type for Strand operations.
#[derive(Error, Debug)]
pub enum StrandError {
    // Namespace errors
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("File already exists: {0}")]
    FileExists(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Chunk and data errors
    #[error("Chunk not found: {0}")]
    ChunkNotFound(String),

    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Stale version: stored {stored}, requested {requested}")]
    StaleVersion { stored: u64, requested: u64 },

    #[error("Chunk is full")]
    ChunkFull,

    #[error("Record of {size} bytes exceeds append limit of {limit} bytes")]
    RecordTooLarge { size: u64, limit: u64 },

    #[error("Write buffer has no data for fingerprint {0}")]
    DataNotStaged(String),

    #[error("Commit failed on {failed} of {total} replicas")]
    PartialCommit { failed: usize, total: usize },

    // Cluster errors
    #[error("No live replicas for chunk: {0}")]
    NoLiveReplicas(String),

    #[error("Chunkserver not registered: {0}")]
    ServerNotFound(String),

    #[error("Placement failed: {0}")]
    PlacementFailed(String),

    #[error("Lease expired for chunk: {0}")]
    LeaseExpired(String),

    // Persistence errors
    #[error("Write-ahead log corrupt at sequence {sequence}: {detail}")]
    WalCorrupt { sequence: u64, detail: String },

    #[error("Write-ahead log failure: {0}")]
    Wal(String),

    // Configuration errors
    #[error("Configuration error: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Remote error: {0}")]
    Remote(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // External errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StrandError {
    /// Check if the operation that produced this error is safe to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StrandError::Network(_)
                | StrandError::Timeout(_)
                | StrandError::NoLiveReplicas(_)
                | StrandError::PartialCommit { .. }
                | StrandError::LeaseExpired(_)
        )
    }

    /// Check if this error should make the caller drop cached chunk
    /// locations before retrying.
    pub fn invalidates_locations(&self) -> bool {
        matches!(
            self,
            StrandError::StaleVersion { .. }
                | StrandError::LeaseExpired(_)
                | StrandError::NoLiveReplicas(_)
                | StrandError::ServerNotFound(_)
        )
    }

    /// A WAL append failure is fatal for the master: it must stop accepting
    /// mutations so the operator can intervene with the log intact.
    pub fn is_wal_fatal(&self) -> bool {
        matches!(self, StrandError::Wal(_))
    }
}

impl From<serde_json::Error> for StrandError {
    fn from(e: serde_json::Error) -> Self {
        StrandError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for StrandError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            StrandError::Timeout(e.to_string())
        } else {
            StrandError::Network(e.to_string())
        }
    }
}

/// Result type alias for Strand operations.
pub type Result<T> = std::result::Result<T, StrandError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(StrandError::Network("connection refused".into()).is_retryable());
        assert!(StrandError::PartialCommit { failed: 1, total: 3 }.is_retryable());
        assert!(!StrandError::FileExists("/a".into()).is_retryable());
        assert!(!StrandError::ChecksumMismatch { expected: 1, actual: 2 }.is_retryable());
    }

    #[test]
    fn test_location_invalidation() {
        assert!(StrandError::StaleVersion { stored: 3, requested: 2 }.invalidates_locations());
        assert!(StrandError::LeaseExpired("x".into()).invalidates_locations());
        assert!(!StrandError::FileNotFound("/a".into()).invalidates_locations());
    }

    #[test]
    fn test_wal_fatal() {
        assert!(StrandError::Wal("fsync failed".into()).is_wal_fatal());
        assert!(!StrandError::Network("x".into()).is_wal_fatal());
    }
}
