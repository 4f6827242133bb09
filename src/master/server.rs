//! HTTP service for the master: every client- and chunkserver-facing
//! endpoint, JSON over POST.

use crate::error::{Result, StrandError};
use crate::master::MasterNode;
use crate::protocol::*;
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tracing::warn;

/// Build the master's router.
pub fn router(node: Arc<MasterNode>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/system_state", get(handle_system_state))
        // Chunkserver-facing
        .route("/register_chunkserver", post(handle_register))
        .route("/heartbeat", post(handle_heartbeat))
        // Client-facing
        .route("/create_file", post(handle_create_file))
        .route("/get_file_info", post(handle_get_file_info))
        .route("/allocate_chunk", post(handle_allocate_chunk))
        .route("/get_chunk_locations", post(handle_get_chunk_locations))
        .route("/snapshot_file", post(handle_snapshot_file))
        .route("/clone_shared_chunk", post(handle_clone_shared_chunk))
        .route("/rename_file", post(handle_rename_file))
        .route("/delete_file", post(handle_delete_file))
        .route("/list_directory", post(handle_list_directory))
        .route("/update_chunk_size", post(handle_update_chunk_size))
        .route("/report_bad_replica", post(handle_report_bad_replica))
        .with_state(node)
}

async fn health_check() -> &'static str {
    "OK"
}

fn ack(result: Result<()>) -> Json<AckResponse> {
    Json(match result {
        Ok(()) => AckResponse::ok(),
        Err(e) => AckResponse::err(e.to_string()),
    })
}

fn locations_reply(result: Result<crate::master::state::ChunkGrant>) -> Json<ChunkLocationsResponse> {
    Json(match result {
        Ok(grant) => ChunkLocationsResponse {
            success: true,
            error: None,
            handle: Some(grant.handle),
            replicas: grant.replicas,
            primary: grant.primary,
            lease_expiry: grant.lease_expiry,
            version: grant.version,
            size: grant.size,
            ref_count: grant.ref_count,
        },
        Err(e) => ChunkLocationsResponse {
            success: false,
            error: Some(e.to_string()),
            handle: None,
            replicas: Vec::new(),
            primary: None,
            lease_expiry: None,
            version: 0,
            size: 0,
            ref_count: 1,
        },
    })
}

async fn handle_register(
    State(node): State<Arc<MasterNode>>,
    Json(req): Json<RegisterChunkServerRequest>,
) -> Json<RegisterChunkServerResponse> {
    let result = node.with_state(|s| {
        s.register_chunkserver(&req.chunkserver_id, &req.address, &req.rack_id, &req.chunks)
    });

    Json(match result {
        Ok(chunks_to_delete) => RegisterChunkServerResponse {
            success: true,
            error: None,
            chunks_to_delete,
        },
        Err(e) => RegisterChunkServerResponse {
            success: false,
            error: Some(e.to_string()),
            chunks_to_delete: Vec::new(),
        },
    })
}

async fn handle_heartbeat(
    State(node): State<Arc<MasterNode>>,
    Json(req): Json<HeartbeatRequest>,
) -> Json<HeartbeatResponse> {
    let result = node.with_state(|s| s.heartbeat(&req.chunkserver_id, &req.chunks));

    Json(match result {
        Ok((delete, clone)) => HeartbeatResponse { success: true, error: None, delete, clone },
        Err(e) => HeartbeatResponse {
            success: false,
            error: Some(e.to_string()),
            delete: Vec::new(),
            clone: Vec::new(),
        },
    })
}

async fn handle_create_file(
    State(node): State<Arc<MasterNode>>,
    Json(req): Json<CreateFileRequest>,
) -> Json<AckResponse> {
    ack(node.with_state(|s| s.create_file(&req.path)))
}

async fn handle_get_file_info(
    State(node): State<Arc<MasterNode>>,
    Json(req): Json<GetFileInfoRequest>,
) -> Json<GetFileInfoResponse> {
    let result = node.with_state(|s| s.get_file_info(&req.path));

    Json(match result {
        Ok((file, size)) => GetFileInfoResponse {
            success: true,
            error: None,
            path: file.path,
            chunk_handles: file.chunk_handles,
            size,
            created_at: Some(file.created_at),
            modified_at: Some(file.modified_at),
        },
        Err(e) => GetFileInfoResponse {
            success: false,
            error: Some(e.to_string()),
            path: req.path,
            chunk_handles: Vec::new(),
            size: 0,
            created_at: None,
            modified_at: None,
        },
    })
}

async fn handle_allocate_chunk(
    State(node): State<Arc<MasterNode>>,
    Json(req): Json<AllocateChunkRequest>,
) -> Json<ChunkLocationsResponse> {
    locations_reply(node.with_state(|s| s.allocate_chunk(&req.path, req.chunk_index)))
}

async fn handle_get_chunk_locations(
    State(node): State<Arc<MasterNode>>,
    Json(req): Json<GetChunkLocationsRequest>,
) -> Json<ChunkLocationsResponse> {
    locations_reply(node.with_state(|s| s.chunk_locations(req.handle)))
}

async fn handle_snapshot_file(
    State(node): State<Arc<MasterNode>>,
    Json(req): Json<SnapshotFileRequest>,
) -> Json<AckResponse> {
    ack(node.with_state(|s| s.snapshot_file(&req.src, &req.dst)))
}

/// Break a copy-on-write share and drive the replica-side byte copies
/// before handing the new chunk to the client.
async fn handle_clone_shared_chunk(
    State(node): State<Arc<MasterNode>>,
    Json(req): Json<CloneSharedChunkRequest>,
) -> Json<ChunkLocationsResponse> {
    let cow = node.with_state(|s| s.clone_shared_chunk(&req.path, req.chunk_index, req.old_handle));

    let cow = match cow {
        Ok(cow) => cow,
        Err(e) => return locations_reply(Err(e)),
    };

    let mut cloned = 0usize;
    for (address, command) in &cow.clones {
        match node.send_clone(address, command).await {
            Ok(()) => cloned += 1,
            Err(e) => {
                // The replica will be healed by reconciliation once it
                // reports without the new handle.
                warn!(%address, handle = %command.handle, error = %e, "COW clone push failed");
            }
        }
    }

    if !cow.clones.is_empty() && cloned == 0 {
        return locations_reply(Err(StrandError::NoLiveReplicas(
            cow.grant.handle.to_string(),
        )));
    }

    locations_reply(Ok(cow.grant))
}

async fn handle_rename_file(
    State(node): State<Arc<MasterNode>>,
    Json(req): Json<RenameFileRequest>,
) -> Json<AckResponse> {
    ack(node.with_state(|s| s.rename_file(&req.old, &req.new)))
}

async fn handle_delete_file(
    State(node): State<Arc<MasterNode>>,
    Json(req): Json<DeleteFileRequest>,
) -> Json<AckResponse> {
    ack(node.with_state(|s| s.delete_file(&req.path)))
}

async fn handle_list_directory(
    State(node): State<Arc<MasterNode>>,
    Json(req): Json<ListDirectoryRequest>,
) -> Json<ListDirectoryResponse> {
    let result = node.with_state(|s| s.list_directory(&req.prefix));

    Json(match result {
        Ok(paths) => ListDirectoryResponse { success: true, error: None, paths },
        Err(e) => ListDirectoryResponse {
            success: false,
            error: Some(e.to_string()),
            paths: Vec::new(),
        },
    })
}

async fn handle_update_chunk_size(
    State(node): State<Arc<MasterNode>>,
    Json(req): Json<UpdateChunkSizeRequest>,
) -> Json<AckResponse> {
    ack(node.with_state(|s| s.update_chunk_size(req.handle, req.size)))
}

async fn handle_report_bad_replica(
    State(node): State<Arc<MasterNode>>,
    Json(req): Json<ReportBadReplicaRequest>,
) -> Json<AckResponse> {
    ack(node.with_state(|s| s.report_bad_replica(req.handle, &req.chunkserver_id)))
}

async fn handle_system_state(State(node): State<Arc<MasterNode>>) -> Json<SystemStateResponse> {
    let reply = node.with_state(|s| {
        let alive = s.chunkservers().values().filter(|c| c.alive).count();
        Ok(SystemStateResponse {
            success: true,
            files: s.files().values().filter(|f| !f.deleted).count(),
            chunks: s.chunks().len(),
            chunkservers_alive: alive,
            chunkservers_dead: s.chunkservers().len() - alive,
            under_replicated: s.under_replicated_count(),
            replication_factor: s.config().replication_factor,
            chunk_size: s.config().chunk_size,
        })
    });

    Json(reply.unwrap_or(SystemStateResponse {
        success: false,
        files: 0,
        chunks: 0,
        chunkservers_alive: 0,
        chunkservers_dead: 0,
        under_replicated: 0,
        replication_factor: 0,
        chunk_size: 0,
    }))
}
