//! HTTP service for the chunkserver: pipelined data pushes, primary-ordered
//! commits, atomic record append, reads, clones, and deletes.

use crate::chunkserver::ChunkServerNode;
use crate::error::{Result, StrandError};
use crate::protocol::*;
use axum::{
    extract::{DefaultBodyLimit, State},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::sync::Arc;
use tracing::{debug, warn};

/// Build the chunkserver's router.
pub fn router(node: Arc<ChunkServerNode>) -> Router {
    // A full-chunk push arrives base64-encoded inside a JSON body; the
    // default body limit would reject it.
    let body_limit = (node.chunk_size() as usize / 2).saturating_mul(3) + 1024 * 1024;

    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(handle_status))
        .route("/write_chunk", post(handle_write_chunk))
        .route("/write_chunk_pipeline", post(handle_write_chunk))
        .route("/commit_write", post(handle_commit_write))
        .route("/append_record", post(handle_append_record))
        .route("/read_chunk", post(handle_read_chunk))
        .route("/clone_chunk", post(handle_clone_chunk))
        .route("/delete_chunk", post(handle_delete_chunk))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(node)
}

async fn health_check() -> &'static str {
    "OK"
}

async fn handle_status(State(node): State<Arc<ChunkServerNode>>) -> Json<ChunkServerStatusResponse> {
    Json(ChunkServerStatusResponse {
        server_id: node.id.clone(),
        chunks: node.store.list().len(),
        bytes_used: node.store.usage(),
    })
}

/// Pipeline entry point, shared by the client-facing and peer-facing routes:
/// stage the bytes, then forward to the next replica in the chain. The ack
/// only goes upstream once the downstream ack arrived.
async fn handle_write_chunk(
    State(node): State<Arc<ChunkServerNode>>,
    Json(req): Json<WriteChunkRequest>,
) -> Json<AckResponse> {
    let data = match BASE64.decode(req.data.as_bytes()) {
        Ok(data) => data,
        Err(e) => return Json(AckResponse::err(format!("invalid base64 payload: {}", e))),
    };

    node.buffer.put(&req.fingerprint, data);

    if let Some((next, rest)) = req.chain.split_first() {
        let forward = WriteChunkRequest {
            handle: req.handle,
            fingerprint: req.fingerprint.clone(),
            data: req.data.clone(),
            chain: rest.to_vec(),
        };

        match forward_push(&node, next, &forward).await {
            Ok(()) => {}
            Err(e) => {
                warn!(%next, handle = %req.handle, error = %e, "Pipeline forward failed");
                return Json(AckResponse::err(format!("pipeline forward to {}: {}", next, e)));
            }
        }
    }

    Json(AckResponse::ok())
}

async fn forward_push(
    node: &Arc<ChunkServerNode>,
    next: &str,
    request: &WriteChunkRequest,
) -> Result<()> {
    let reply: AckResponse = node
        .http
        .post(format!("{}/write_chunk_pipeline", next))
        .json(request)
        .send()
        .await?
        .json()
        .await?;

    if reply.success {
        Ok(())
    } else {
        Err(StrandError::Remote(
            reply.error.unwrap_or_else(|| "push refused".to_string()),
        ))
    }
}

async fn handle_commit_write(
    State(node): State<Arc<ChunkServerNode>>,
    Json(req): Json<CommitWriteRequest>,
) -> Json<CommitWriteResponse> {
    match apply_commit(&node, &req).await {
        Ok(chunk_size) => Json(CommitWriteResponse {
            success: true,
            error: None,
            chunk_size,
            stale: false,
        }),
        Err(e) => Json(CommitWriteResponse {
            success: false,
            stale: matches!(e, StrandError::StaleVersion { .. }),
            error: Some(e.to_string()),
            chunk_size: node.store.size(req.handle),
        }),
    }
}

/// Apply a commit. Without a serial the receiver is the primary: it assigns
/// the serial order, applies locally, then relays to each secondary in that
/// order and acks only when every secondary acked.
async fn apply_commit(node: &Arc<ChunkServerNode>, req: &CommitWriteRequest) -> Result<u64> {
    if req.offset + req.length > node.chunk_size() {
        return Err(StrandError::InvalidArgument(format!(
            "write [{}, {}) exceeds chunk size {}",
            req.offset,
            req.offset + req.length,
            node.chunk_size()
        )));
    }

    let stored = node.store.version(req.handle);
    if req.version < stored {
        return Err(StrandError::StaleVersion { stored, requested: req.version });
    }

    let data = if req.pad {
        vec![0u8; req.length as usize]
    } else {
        let data = node
            .buffer
            .take(&req.fingerprint)
            .ok_or_else(|| StrandError::DataNotStaged(req.fingerprint.clone()))?;
        if data.len() as u64 != req.length {
            return Err(StrandError::InvalidArgument(format!(
                "staged {} bytes but commit names {}",
                data.len(),
                req.length
            )));
        }
        data
    };

    let lock = node.store.mutation_lock(req.handle);
    let _guard = lock.lock().await;

    node.store.write_at(req.handle, req.offset, &data)?;
    node.store.set_version(req.handle, req.version)?;

    if req.serial.is_none() {
        let serial = node.next_serial(req.handle);
        debug!(handle = %req.handle, serial, offset = req.offset, len = req.length,
            "Primary applying commit");

        let mut failed = 0usize;
        for secondary in &req.secondaries {
            let relay = CommitWriteRequest {
                serial: Some(serial),
                secondaries: Vec::new(),
                ..req.clone()
            };
            if let Err(e) = relay_commit(node, secondary, &relay).await {
                warn!(%secondary, handle = %req.handle, error = %e, "Secondary commit failed");
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(StrandError::PartialCommit { failed, total: req.secondaries.len() });
        }

        node.report_size(req.handle).await;
    }

    Ok(node.store.size(req.handle))
}

async fn relay_commit(
    node: &Arc<ChunkServerNode>,
    secondary: &str,
    request: &CommitWriteRequest,
) -> Result<()> {
    let reply: CommitWriteResponse = node
        .http
        .post(format!("{}/commit_write", secondary))
        .json(request)
        .send()
        .await?
        .json()
        .await?;

    if reply.success {
        Ok(())
    } else {
        Err(StrandError::Remote(
            reply.error.unwrap_or_else(|| "commit refused".to_string()),
        ))
    }
}

enum AppendOutcome {
    /// The record landed at this offset within the chunk.
    At(u64),
    /// The record did not fit; the chunk is sealed with padding.
    Full,
}

async fn handle_append_record(
    State(node): State<Arc<ChunkServerNode>>,
    Json(req): Json<AppendRecordRequest>,
) -> Json<AppendRecordResponse> {
    match apply_append(&node, &req).await {
        Ok(AppendOutcome::At(offset)) => Json(AppendRecordResponse {
            success: true,
            error: None,
            offset: Some(offset),
            chunk_full: false,
            stale: false,
        }),
        Ok(AppendOutcome::Full) => Json(AppendRecordResponse {
            success: false,
            error: Some("chunk full".to_string()),
            offset: None,
            chunk_full: true,
            stale: false,
        }),
        Err(e) => Json(AppendRecordResponse {
            success: false,
            stale: matches!(e, StrandError::StaleVersion { .. }),
            error: Some(e.to_string()),
            offset: None,
            chunk_full: false,
        }),
    }
}

/// Primary-only atomic record append.
///
/// The record goes at the current end of chunk on every replica. If it does
/// not fit, the chunk is padded to its maximum size everywhere and the
/// client is told to move to the next chunk. On partial secondary failure
/// the region becomes padding on the replicas that applied it, so the retry
/// lands at a fresh offset with byte-identical copies.
async fn apply_append(node: &Arc<ChunkServerNode>, req: &AppendRecordRequest) -> Result<AppendOutcome> {
    let chunk_size = node.chunk_size();
    let limit = chunk_size / 4;
    if req.length > limit {
        return Err(StrandError::RecordTooLarge { size: req.length, limit });
    }

    let stored = node.store.version(req.handle);
    if req.version < stored {
        return Err(StrandError::StaleVersion { stored, requested: req.version });
    }

    let lock = node.store.mutation_lock(req.handle);
    let _guard = lock.lock().await;

    let offset = node.store.size(req.handle);
    if offset + req.length > chunk_size {
        // Seal the chunk: pad every replica to full size.
        node.buffer.take(&req.fingerprint);
        node.store.pad_to(req.handle, chunk_size)?;
        node.store.set_version(req.handle, req.version)?;

        let serial = node.next_serial(req.handle);
        let pad = CommitWriteRequest {
            handle: req.handle,
            fingerprint: String::new(),
            offset,
            length: chunk_size - offset,
            version: req.version,
            serial: Some(serial),
            secondaries: Vec::new(),
            pad: true,
        };
        for secondary in &req.secondaries {
            if let Err(e) = relay_commit(node, secondary, &pad).await {
                // The replica stays short; heartbeat reconciliation levels
                // the size and the sealed chunk never takes another append.
                warn!(%secondary, handle = %req.handle, error = %e, "Seal padding failed");
            }
        }

        node.report_size(req.handle).await;
        return Ok(AppendOutcome::Full);
    }

    let data = node
        .buffer
        .take(&req.fingerprint)
        .ok_or_else(|| StrandError::DataNotStaged(req.fingerprint.clone()))?;
    if data.len() as u64 != req.length {
        return Err(StrandError::InvalidArgument(format!(
            "staged {} bytes but append names {}",
            data.len(),
            req.length
        )));
    }

    node.store.write_at(req.handle, offset, &data)?;
    node.store.set_version(req.handle, req.version)?;

    let serial = node.next_serial(req.handle);
    let mut succeeded: Vec<&String> = Vec::new();
    let mut failed = 0usize;
    for secondary in &req.secondaries {
        let relay = CommitWriteRequest {
            handle: req.handle,
            fingerprint: req.fingerprint.clone(),
            offset,
            length: req.length,
            version: req.version,
            serial: Some(serial),
            secondaries: Vec::new(),
            pad: false,
        };
        match relay_commit(node, secondary, &relay).await {
            Ok(()) => succeeded.push(secondary),
            Err(e) => {
                warn!(%secondary, handle = %req.handle, error = %e, "Secondary append failed");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        // Convert the region to padding wherever the record landed, so the
        // retry appends at a fresh offset on all replicas.
        node.store.write_at(req.handle, offset, &vec![0u8; req.length as usize])?;
        let pad_serial = node.next_serial(req.handle);
        let pad = CommitWriteRequest {
            handle: req.handle,
            fingerprint: String::new(),
            offset,
            length: req.length,
            version: req.version,
            serial: Some(pad_serial),
            secondaries: Vec::new(),
            pad: true,
        };
        for secondary in succeeded {
            if let Err(e) = relay_commit(node, secondary, &pad).await {
                warn!(%secondary, handle = %req.handle, error = %e, "Padding rollback failed");
            }
        }
        return Err(StrandError::PartialCommit { failed, total: req.secondaries.len() });
    }

    node.report_size(req.handle).await;
    debug!(handle = %req.handle, offset, len = req.length, "Record appended");
    Ok(AppendOutcome::At(offset))
}

async fn handle_read_chunk(
    State(node): State<Arc<ChunkServerNode>>,
    Json(req): Json<ReadChunkRequest>,
) -> Json<ReadChunkResponse> {
    match node.store.read_at(req.handle, req.offset, req.length) {
        Ok(data) => Json(ReadChunkResponse {
            success: true,
            error: None,
            bytes_read: data.len() as u64,
            data: Some(BASE64.encode(&data)),
            corrupt: false,
        }),
        Err(e) => Json(ReadChunkResponse {
            success: false,
            corrupt: matches!(e, StrandError::ChecksumMismatch { .. }),
            error: Some(e.to_string()),
            data: None,
            bytes_read: 0,
        }),
    }
}

async fn handle_clone_chunk(
    State(node): State<Arc<ChunkServerNode>>,
    Json(req): Json<CloneChunkRequest>,
) -> Json<AckResponse> {
    let command = CloneCommand {
        handle: req.handle,
        source_address: req.source_address,
        source_handle: req.source_handle,
        expected_version: req.expected_version,
    };

    match node.execute_clone(&command).await {
        Ok(()) => Json(AckResponse::ok()),
        Err(e) => Json(AckResponse::err(e.to_string())),
    }
}

async fn handle_delete_chunk(
    State(node): State<Arc<ChunkServerNode>>,
    Json(req): Json<DeleteChunkRequest>,
) -> Json<AckResponse> {
    match node.store.delete(req.handle) {
        Ok(()) => Json(AckResponse::ok()),
        Err(e) => Json(AckResponse::err(e.to_string())),
    }
}
