//! Client library: the three-party coordination between caller, master, and
//! chunkservers.
//!
//! The client is stateless between operations apart from a chunk-location
//! cache bounded by lease expiry. Writes push data down the replica
//! pipeline and then ask the primary to commit; reads pick any live replica
//! and fail over on errors, reporting corrupt replicas to the master.

use crate::config::StrandConfig;
use crate::error::{Result, StrandError};
use crate::protocol::*;
use crate::types::{ChunkHandle, ServerId};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

const LOCATION_CACHE_ENTRIES: usize = 1024;

/// How close to lease expiry a cached location is still trusted.
const LEASE_SLACK_SECONDS: i64 = 2;

/// Chunk locations as cached client-side.
#[derive(Debug, Clone)]
struct CachedLocations {
    handle: ChunkHandle,
    replicas: Vec<ReplicaAddr>,
    /// Absent for snapshot-shared chunks, which take no lease.
    primary: Option<ServerId>,
    lease_expiry: Option<DateTime<Utc>>,
    version: u64,
    ref_count: u32,
}

impl CachedLocations {
    fn from_response(resp: ChunkLocationsResponse) -> Result<Self> {
        let handle = resp
            .handle
            .ok_or_else(|| StrandError::Internal("locations reply without handle".into()))?;
        Ok(Self {
            handle,
            replicas: resp.replicas,
            primary: resp.primary,
            lease_expiry: resp.lease_expiry,
            version: resp.version,
            ref_count: resp.ref_count,
        })
    }

    fn fresh(&self) -> bool {
        self.lease_expiry
            .map(|expiry| expiry - Utc::now() > ChronoDuration::seconds(LEASE_SLACK_SECONDS))
            .unwrap_or(false)
    }

    fn primary_address(&self) -> Result<&str> {
        let primary = self
            .primary
            .as_ref()
            .ok_or_else(|| StrandError::LeaseExpired(self.handle.to_string()))?;
        self.replicas
            .iter()
            .find(|r| &r.id == primary)
            .map(|r| r.address.as_str())
            .ok_or_else(|| StrandError::NoLiveReplicas(self.handle.to_string()))
    }

    fn secondary_addresses(&self) -> Vec<String> {
        self.replicas
            .iter()
            .filter(|r| Some(&r.id) != self.primary.as_ref())
            .map(|r| r.address.clone())
            .collect()
    }
}

/// File metadata as seen by callers.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: String,
    pub chunk_handles: Vec<ChunkHandle>,
    pub size: u64,
}

/// Client handle for one Strand cluster.
#[derive(Clone)]
pub struct StrandClient {
    master: String,
    http: reqwest::Client,
    chunk_size: u64,
    retry_budget: usize,
    retry_backoff: Duration,
    locations: Arc<Mutex<LruCache<ChunkHandle, CachedLocations>>>,
}

impl StrandClient {
    pub fn new(master_addr: &str, config: &StrandConfig) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(config.network.connect_timeout)
            .timeout(config.network.request_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        let entries = NonZeroUsize::new(LOCATION_CACHE_ENTRIES).expect("cache size is non-zero");

        Self {
            master: master_addr.trim_end_matches('/').to_string(),
            http,
            chunk_size: config.master.chunk_size,
            retry_budget: config.network.retry_budget,
            retry_backoff: config.network.retry_backoff,
            locations: Arc::new(Mutex::new(LruCache::new(entries))),
        }
    }

    // -----------------------------------------------------------------------
    // Namespace operations
    // -----------------------------------------------------------------------

    pub async fn create_file(&self, path: &str) -> Result<()> {
        let reply: AckResponse = self
            .post_master("create_file", &CreateFileRequest { path: path.to_string() })
            .await?;
        ack_to_result(reply)
    }

    pub async fn delete_file(&self, path: &str) -> Result<()> {
        let reply: AckResponse = self
            .post_master("delete_file", &DeleteFileRequest { path: path.to_string() })
            .await?;
        ack_to_result(reply)
    }

    pub async fn rename_file(&self, old: &str, new: &str) -> Result<()> {
        let reply: AckResponse = self
            .post_master(
                "rename_file",
                &RenameFileRequest { old: old.to_string(), new: new.to_string() },
            )
            .await?;
        ack_to_result(reply)
    }

    pub async fn snapshot_file(&self, src: &str, dst: &str) -> Result<()> {
        let reply: AckResponse = self
            .post_master(
                "snapshot_file",
                &SnapshotFileRequest { src: src.to_string(), dst: dst.to_string() },
            )
            .await?;
        ack_to_result(reply)
    }

    pub async fn list_directory(&self, prefix: &str) -> Result<Vec<String>> {
        // Idempotent lookup: retried transparently on transient failures.
        self.with_retries(|| async move {
            let reply: ListDirectoryResponse = self
                .post_master(
                    "list_directory",
                    &ListDirectoryRequest { prefix: prefix.to_string() },
                )
                .await?;
            if reply.success {
                Ok(reply.paths)
            } else {
                Err(classify_remote(reply.error))
            }
        })
        .await
    }

    pub async fn get_file_info(&self, path: &str) -> Result<FileInfo> {
        // Idempotent lookup: retried transparently on transient failures.
        self.with_retries(|| async move {
            let reply: GetFileInfoResponse = self
                .post_master("get_file_info", &GetFileInfoRequest { path: path.to_string() })
                .await?;
            if reply.success {
                Ok(FileInfo {
                    path: reply.path,
                    chunk_handles: reply.chunk_handles,
                    size: reply.size,
                })
            } else {
                Err(classify_remote(reply.error))
            }
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Data path
    // -----------------------------------------------------------------------

    /// Write `data` at `(path, offset)`, splitting at chunk boundaries.
    pub async fn write(&self, path: &str, offset: u64, data: &[u8]) -> Result<()> {
        for span in chunk_spans(offset, data.len() as u64, self.chunk_size) {
            let piece = &data[span.start as usize..span.end as usize];
            self.with_retries(|| self.write_span(path, span.index, span.offset_in_chunk, piece))
                .await?;
        }
        Ok(())
    }

    /// Read `length` bytes at `(path, offset)`. Reads past end of file are
    /// clamped.
    pub async fn read(&self, path: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let info = self.get_file_info(path).await?;
        let end = (offset + length).min(info.size);
        if offset >= end {
            return Ok(Vec::new());
        }

        let mut out = Vec::with_capacity((end - offset) as usize);
        for span in chunk_spans(offset, end - offset, self.chunk_size) {
            let handle = *info.chunk_handles.get(span.index).ok_or_else(|| {
                StrandError::Internal(format!("file {} missing chunk {}", path, span.index))
            })?;
            let piece = self
                .with_retries(|| self.read_span(handle, span.offset_in_chunk, span.len()))
                .await?;
            out.extend_from_slice(&piece);
        }
        Ok(out)
    }

    /// Atomically append a record; returns the file offset where it landed.
    /// At-least-once: a retried append may leave an earlier copy behind.
    pub async fn append(&self, path: &str, record: &[u8]) -> Result<u64> {
        let limit = self.chunk_size / 4;
        if record.len() as u64 > limit {
            return Err(StrandError::RecordTooLarge { size: record.len() as u64, limit });
        }

        self.with_retries(|| self.append_once(path, record)).await
    }

    /// Best-effort fault report for a replica that served corrupt data.
    pub async fn report_bad_replica(&self, handle: ChunkHandle, server: &ServerId) {
        let request = ReportBadReplicaRequest { handle, chunkserver_id: server.clone() };
        if let Err(e) = self.post_master::<_, AckResponse>("report_bad_replica", &request).await {
            debug!(%handle, %server, error = %e, "Bad-replica report not delivered");
        }
    }

    // -----------------------------------------------------------------------
    // Per-chunk operations
    // -----------------------------------------------------------------------

    async fn write_span(
        &self,
        path: &str,
        index: usize,
        offset_in_chunk: u64,
        piece: &[u8],
    ) -> Result<()> {
        let grant = self.writable_grant(path, index).await?;

        let fingerprint = self.push_pipeline(&grant, piece).await?;

        let commit = CommitWriteRequest {
            handle: grant.handle,
            fingerprint,
            offset: offset_in_chunk,
            length: piece.len() as u64,
            version: grant.version,
            serial: None,
            secondaries: grant.secondary_addresses(),
            pad: false,
        };

        let reply: CommitWriteResponse = self
            .post(grant.primary_address()?, "commit_write", &commit)
            .await
            .map_err(|e| self.invalidated(grant.handle, e))?;

        if reply.success {
            Ok(())
        } else {
            self.invalidate(grant.handle);
            if reply.stale {
                Err(StrandError::LeaseExpired(grant.handle.to_string()))
            } else {
                Err(StrandError::Network(
                    reply.error.unwrap_or_else(|| "commit refused".to_string()),
                ))
            }
        }
    }

    async fn append_once(&self, path: &str, record: &[u8]) -> Result<u64> {
        let info = self.get_file_info(path).await?;
        let mut index = info.chunk_handles.len().saturating_sub(1);

        // Follow at most a few chunk_full redirects before surfacing.
        for _ in 0..4 {
            let grant = self.writable_grant(path, index).await?;
            let fingerprint = self.push_pipeline(&grant, record).await?;

            let request = AppendRecordRequest {
                handle: grant.handle,
                fingerprint,
                length: record.len() as u64,
                version: grant.version,
                secondaries: grant.secondary_addresses(),
            };

            let reply: AppendRecordResponse = self
                .post(grant.primary_address()?, "append_record", &request)
                .await
                .map_err(|e| self.invalidated(grant.handle, e))?;

            if reply.success {
                let offset = reply
                    .offset
                    .ok_or_else(|| StrandError::Internal("append reply without offset".into()))?;
                return Ok(index as u64 * self.chunk_size + offset);
            }
            if reply.chunk_full {
                self.invalidate(grant.handle);
                index += 1;
                continue;
            }

            self.invalidate(grant.handle);
            if reply.stale {
                return Err(StrandError::LeaseExpired(grant.handle.to_string()));
            }
            return Err(StrandError::Network(
                reply.error.unwrap_or_else(|| "append refused".to_string()),
            ));
        }

        Err(StrandError::Internal(format!("append to {} kept hitting full chunks", path)))
    }

    async fn read_span(&self, handle: ChunkHandle, offset: u64, length: u64) -> Result<Vec<u8>> {
        let grant = self.locations(handle).await?;
        let request = ReadChunkRequest { handle, offset, length };

        let mut best: Option<Vec<u8>> = None;
        for replica in &grant.replicas {
            let reply: std::result::Result<ReadChunkResponse, StrandError> =
                self.post(&replica.address, "read_chunk", &request).await;

            match reply {
                Ok(reply) if reply.success => {
                    let data = BASE64
                        .decode(reply.data.unwrap_or_default().as_bytes())
                        .map_err(|e| StrandError::Serialization(e.to_string()))?;
                    if data.len() as u64 == length {
                        return Ok(data);
                    }
                    // A lagging replica may be short; remember the longest.
                    if best.as_ref().map(|b| b.len() < data.len()).unwrap_or(true) {
                        best = Some(data);
                    }
                }
                Ok(reply) if reply.corrupt => {
                    warn!(%handle, replica = %replica.id, "Replica served corrupt data");
                    self.report_bad_replica(handle, &replica.id).await;
                }
                Ok(reply) => {
                    debug!(%handle, replica = %replica.id, error = ?reply.error, "Read refused");
                }
                Err(e) => {
                    debug!(%handle, replica = %replica.id, error = %e, "Read failed");
                }
            }
        }

        match best {
            Some(data) => Ok(data),
            None => {
                self.invalidate(handle);
                Err(StrandError::NoLiveReplicas(handle.to_string()))
            }
        }
    }

    /// A grant suitable for mutation: allocated on demand and, when the
    /// chunk is snapshot-shared, re-pointed at a private copy first.
    async fn writable_grant(&self, path: &str, index: usize) -> Result<CachedLocations> {
        let reply: ChunkLocationsResponse = self
            .post_master(
                "allocate_chunk",
                &AllocateChunkRequest { path: path.to_string(), chunk_index: index },
            )
            .await?;
        if !reply.success {
            return Err(classify_remote(reply.error));
        }
        let grant = CachedLocations::from_response(reply)?;

        let grant = if grant.ref_count > 1 {
            let reply: ChunkLocationsResponse = self
                .post_master(
                    "clone_shared_chunk",
                    &CloneSharedChunkRequest {
                        path: path.to_string(),
                        chunk_index: index,
                        old_handle: grant.handle,
                    },
                )
                .await?;
            if !reply.success {
                return Err(classify_remote(reply.error));
            }
            self.invalidate(grant.handle);
            CachedLocations::from_response(reply)?
        } else {
            grant
        };

        if grant.replicas.is_empty() {
            return Err(StrandError::NoLiveReplicas(grant.handle.to_string()));
        }

        self.cache_put(grant.clone());
        Ok(grant)
    }

    /// Push bytes through the replica pipeline; returns the fingerprint the
    /// commit must name.
    async fn push_pipeline(&self, grant: &CachedLocations, data: &[u8]) -> Result<String> {
        let fingerprint = Uuid::new_v4().to_string();
        let first = &grant.replicas[0];
        let chain: Vec<String> =
            grant.replicas[1..].iter().map(|r| r.address.clone()).collect();

        let request = WriteChunkRequest {
            handle: grant.handle,
            fingerprint: fingerprint.clone(),
            data: BASE64.encode(data),
            chain,
        };

        let reply: AckResponse = self
            .post(&first.address, "write_chunk", &request)
            .await
            .map_err(|e| self.invalidated(grant.handle, e))?;

        if reply.success {
            Ok(fingerprint)
        } else {
            self.invalidate(grant.handle);
            Err(StrandError::Network(
                reply.error.unwrap_or_else(|| "data push refused".to_string()),
            ))
        }
    }

    // -----------------------------------------------------------------------
    // Location cache
    // -----------------------------------------------------------------------

    async fn locations(&self, handle: ChunkHandle) -> Result<CachedLocations> {
        {
            let mut cache = self.locations.lock();
            if let Some(cached) = cache.get(&handle) {
                if cached.fresh() {
                    return Ok(cached.clone());
                }
            }
        }

        let reply: ChunkLocationsResponse = self
            .post_master("get_chunk_locations", &GetChunkLocationsRequest { handle })
            .await?;
        if !reply.success {
            return Err(classify_remote(reply.error));
        }

        let grant = CachedLocations::from_response(reply)?;
        self.cache_put(grant.clone());
        Ok(grant)
    }

    fn cache_put(&self, grant: CachedLocations) {
        self.locations.lock().put(grant.handle, grant);
    }

    fn invalidate(&self, handle: ChunkHandle) {
        self.locations.lock().pop(&handle);
    }

    fn invalidated(&self, handle: ChunkHandle, e: StrandError) -> StrandError {
        self.invalidate(handle);
        e
    }

    // -----------------------------------------------------------------------
    // Transport
    // -----------------------------------------------------------------------

    async fn post_master<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        endpoint: &str,
        request: &Req,
    ) -> Result<Resp> {
        self.post(&self.master, endpoint, request).await
    }

    async fn post<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        base: &str,
        endpoint: &str,
        request: &Req,
    ) -> Result<Resp> {
        let url = format!("{}/{}", base.trim_end_matches('/'), endpoint);
        let response = self.http.post(&url).json(request).send().await?;
        Ok(response.json().await?)
    }

    /// Retry a retryable operation with exponential backoff.
    async fn with_retries<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut backoff = self.retry_backoff;
        let mut last = None;

        for attempt in 0..=self.retry_budget {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if (e.is_retryable() || e.invalidates_locations())
                    && attempt < self.retry_budget =>
                {
                    debug!(attempt, error = %e, "Retrying after backoff");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(5));
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last.unwrap_or_else(|| StrandError::Internal("retry budget exhausted".into())))
    }
}

fn ack_to_result(reply: AckResponse) -> Result<()> {
    if reply.success {
        Ok(())
    } else {
        Err(classify_remote(reply.error))
    }
}

/// Turn a remote error message back into a typed error where the type
/// matters to callers.
fn classify_remote(error: Option<String>) -> StrandError {
    let message = error.unwrap_or_else(|| "remote error".to_string());
    if message.contains("not found") {
        StrandError::FileNotFound(message)
    } else if message.contains("already exists") {
        StrandError::FileExists(message)
    } else if message.contains("No live replicas") {
        StrandError::NoLiveReplicas(message)
    } else {
        StrandError::Remote(message)
    }
}

/// One chunk-aligned slice of a byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChunkSpan {
    index: usize,
    offset_in_chunk: u64,
    /// Range within the caller's buffer.
    start: u64,
    end: u64,
}

impl ChunkSpan {
    fn len(&self) -> u64 {
        self.end - self.start
    }
}

/// Split `[file_offset, file_offset + len)` at chunk boundaries.
fn chunk_spans(file_offset: u64, len: u64, chunk_size: u64) -> Vec<ChunkSpan> {
    let mut spans = Vec::new();
    let mut pos = 0u64;

    while pos < len {
        let absolute = file_offset + pos;
        let index = (absolute / chunk_size) as usize;
        let offset_in_chunk = absolute % chunk_size;
        let take = (chunk_size - offset_in_chunk).min(len - pos);
        spans.push(ChunkSpan { index, offset_in_chunk, start: pos, end: pos + take });
        pos += take;
    }

    spans
}
