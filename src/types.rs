//! Core type definitions for the Strand distributed file system.
//!
//! This module contains the fundamental data types shared between the
//! master, the chunkservers, and the client:
//!
//! - [`ChunkHandle`]: opaque globally-unique identifier for a chunk
//! - [`FileMeta`]: a file's namespace entry (ordered chunk handles)
//! - [`ChunkMeta`]: the master's view of a chunk (version, replicas, lease)
//! - [`ChunkServerInfo`]: the master's record of a registered chunkserver
//! - [`LeaseInfo`]: a time-bounded primary designation for a chunk
//!
//! # Examples
//!
//! ```rust
//! use strand::types::ChunkHandle;
//!
//! let handle = ChunkHandle::new();
//! let parsed: ChunkHandle = handle.to_string().parse().unwrap();
//! assert_eq!(handle, parsed);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a chunkserver.
pub type ServerId = String;

/// Default maximum bytes per chunk (64 MiB, as in GFS).
pub const DEFAULT_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Block size covered by one checksum entry in the sidecar.
pub const CHECKSUM_BLOCK_SIZE: usize = 64 * 1024;

/// Opaque 128-bit identifier for a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkHandle(pub Uuid);

impl ChunkHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChunkHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChunkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ChunkHandle {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A file's namespace entry.
///
/// The byte content lives on chunkservers; the master only tracks the
/// ordered sequence of chunk handles. A deleted file stays in the namespace
/// as a tombstone until the garbage retention window elapses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMeta {
    pub path: String,
    pub chunk_handles: Vec<ChunkHandle>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl FileMeta {
    pub fn new(path: String) -> Self {
        let now = Utc::now();
        Self {
            path,
            chunk_handles: Vec::new(),
            created_at: now,
            modified_at: now,
            deleted: false,
            deleted_at: None,
        }
    }

    pub fn touch(&mut self) {
        self.modified_at = Utc::now();
    }
}

/// The master's metadata for a single chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub handle: ChunkHandle,
    /// Monotonic version, bumped on every lease grant. A chunk starts at 0
    /// and reaches 1 with its first lease; replicas reporting a strictly
    /// lower version are stale.
    pub version: u64,
    /// Current size in bytes, as last reported by a primary or heartbeat.
    pub size: u64,
    /// Chunkservers holding a current replica.
    pub replicas: Vec<ServerId>,
    /// Holder of the current lease, if any.
    pub primary: Option<ServerId>,
    /// Number of files referencing this chunk (> 1 after a file snapshot).
    pub ref_count: u32,
    /// Set when the reference count reaches zero; physical deletion happens
    /// after the garbage retention window.
    #[serde(default)]
    pub garbage_since: Option<DateTime<Utc>>,
}

impl ChunkMeta {
    pub fn new(handle: ChunkHandle, replicas: Vec<ServerId>) -> Self {
        Self {
            handle,
            version: 0,
            size: 0,
            replicas,
            primary: None,
            ref_count: 1,
            garbage_since: None,
        }
    }
}

/// A lease designating one replica as the primary for mutations on a chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub handle: ChunkHandle,
    pub primary: ServerId,
    pub expires: DateTime<Utc>,
}

impl LeaseInfo {
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.expires > now
    }
}

/// The master's record of a registered chunkserver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkServerInfo {
    pub id: ServerId,
    /// Base URL, e.g. `http://10.0.0.5:7101`.
    pub address: String,
    /// Failure-correlation unit for replica placement.
    pub rack_id: String,
    pub alive: bool,
    pub last_heartbeat: DateTime<Utc>,
    /// Chunks this server reported holding in its last report.
    pub chunks: HashSet<ChunkHandle>,
}

impl ChunkServerInfo {
    pub fn new(id: ServerId, address: String, rack_id: String) -> Self {
        Self {
            id,
            address,
            rack_id,
            alive: true,
            last_heartbeat: Utc::now(),
            chunks: HashSet::new(),
        }
    }
}

/// One chunk as reported by a chunkserver in register/heartbeat messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkReport {
    pub handle: ChunkHandle,
    pub version: u64,
    pub size: u64,
}
