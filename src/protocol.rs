//! Wire protocol types shared by the master, the chunkservers, and the client.
//!
//! All RPCs are JSON request/reply bodies over HTTP POST. Chunk payload
//! bytes travel as base64 strings inside JSON fields. Every reply carries a
//! `success` flag plus an optional `error` message so callers can surface
//! remote failures without parsing HTTP status codes.

use crate::types::{ChunkHandle, ChunkReport, ServerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A replica location as handed to clients: id plus dialable address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaAddr {
    pub id: ServerId,
    pub address: String,
}

/// Generic acknowledgement reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl AckResponse {
    pub fn ok() -> Self {
        Self { success: true, error: None }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self { success: false, error: Some(msg.into()) }
    }
}

// ---------------------------------------------------------------------------
// Master endpoints
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterChunkServerRequest {
    pub chunkserver_id: ServerId,
    pub address: String,
    pub rack_id: String,
    pub chunks: Vec<ChunkReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterChunkServerResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub chunks_to_delete: Vec<ChunkHandle>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub chunkserver_id: ServerId,
    pub chunks: Vec<ChunkReport>,
    pub timestamp: DateTime<Utc>,
}

/// Instruction for a chunkserver to pull a chunk from a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneCommand {
    pub handle: ChunkHandle,
    pub source_address: String,
    /// Handle to read on the source; differs from `handle` when breaking a
    /// copy-on-write share.
    pub source_handle: ChunkHandle,
    pub expected_version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    /// Chunks this server holds that the master no longer expects.
    #[serde(default)]
    pub delete: Vec<ChunkHandle>,
    /// Pending clone commands assigned to this server.
    #[serde(default)]
    pub clone: Vec<CloneCommand>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateFileRequest {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetFileInfoRequest {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetFileInfoResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub chunk_handles: Vec<ChunkHandle>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateChunkRequest {
    pub path: String,
    pub chunk_index: usize,
}

/// Reply to `allocate_chunk`, `get_chunk_locations` and
/// `clone_shared_chunk`: everything a client needs to mutate or read a chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkLocationsResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub handle: Option<ChunkHandle>,
    #[serde(default)]
    pub replicas: Vec<ReplicaAddr>,
    #[serde(default)]
    pub primary: Option<ServerId>,
    #[serde(default)]
    pub lease_expiry: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub size: u64,
    #[serde(default = "default_ref_count")]
    pub ref_count: u32,
}

fn default_ref_count() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetChunkLocationsRequest {
    pub handle: ChunkHandle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFileRequest {
    pub src: String,
    pub dst: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneSharedChunkRequest {
    pub path: String,
    pub chunk_index: usize,
    pub old_handle: ChunkHandle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameFileRequest {
    pub old: String,
    pub new: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteFileRequest {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListDirectoryRequest {
    pub prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListDirectoryResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateChunkSizeRequest {
    pub handle: ChunkHandle,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportBadReplicaRequest {
    pub handle: ChunkHandle,
    pub chunkserver_id: ServerId,
}

/// Read-only dump of the master's view, served on GET `/system_state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStateResponse {
    pub success: bool,
    pub files: usize,
    pub chunks: usize,
    pub chunkservers_alive: usize,
    pub chunkservers_dead: usize,
    pub under_replicated: usize,
    pub replication_factor: usize,
    pub chunk_size: u64,
}

// ---------------------------------------------------------------------------
// ChunkServer endpoints
// ---------------------------------------------------------------------------

/// Pipeline entry point: stage bytes under a fingerprint and forward to the
/// rest of the chain. Nothing touches disk until a commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteChunkRequest {
    pub handle: ChunkHandle,
    /// Client-supplied nonce identifying this data push.
    pub fingerprint: String,
    /// Base64-encoded payload.
    pub data: String,
    /// Downstream replica addresses still to receive the data.
    #[serde(default)]
    pub chain: Vec<String>,
}

/// Commit staged data to disk.
///
/// From a client the `serial` field is absent: the receiver is the primary,
/// assigns the serial order, applies locally, and relays to `secondaries`.
/// From a primary the `serial` is set and `secondaries` is empty: the
/// receiver is a secondary and applies directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitWriteRequest {
    pub handle: ChunkHandle,
    pub fingerprint: String,
    pub offset: u64,
    pub length: u64,
    pub version: u64,
    #[serde(default)]
    pub serial: Option<u64>,
    #[serde(default)]
    pub secondaries: Vec<String>,
    /// Zero-fill the region instead of consuming staged data. Used to pad
    /// chunks during record append.
    #[serde(default)]
    pub pad: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitWriteResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub chunk_size: u64,
    /// Set when the rejection was a version check, so the client knows to
    /// refresh its lease rather than retry blindly.
    #[serde(default)]
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendRecordRequest {
    pub handle: ChunkHandle,
    pub fingerprint: String,
    pub length: u64,
    pub version: u64,
    #[serde(default)]
    pub secondaries: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendRecordResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    /// Offset within the chunk where the record landed.
    #[serde(default)]
    pub offset: Option<u64>,
    /// The record did not fit; the chunk is now padded to its maximum size
    /// and the client should retry on the next chunk.
    #[serde(default)]
    pub chunk_full: bool,
    #[serde(default)]
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadChunkRequest {
    pub handle: ChunkHandle,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadChunkResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    /// Base64-encoded payload.
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub bytes_read: u64,
    /// The replica detected local corruption while serving this read.
    #[serde(default)]
    pub corrupt: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneChunkRequest {
    pub handle: ChunkHandle,
    pub source_address: String,
    pub source_handle: ChunkHandle,
    pub expected_version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteChunkRequest {
    pub handle: ChunkHandle,
}

/// Reply to GET `/status` on a chunkserver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkServerStatusResponse {
    pub server_id: ServerId,
    pub chunks: usize,
    pub bytes_used: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_request_defaults() {
        let json = r#"{"handle":"6f2c1e0a-9f1b-4c3d-8e4f-0a1b2c3d4e5f",
                       "fingerprint":"fp","offset":0,"length":4,"version":1}"#;
        let req: CommitWriteRequest = serde_json::from_str(json).unwrap();
        assert!(req.serial.is_none());
        assert!(req.secondaries.is_empty());
        assert!(!req.pad);
    }

    #[test]
    fn test_ack_envelope() {
        let ok = AckResponse::ok();
        assert!(ok.success);
        let err = AckResponse::err("nope");
        assert!(!err.success);
        assert_eq!(err.error.as_deref(), Some("nope"));
    }
}
