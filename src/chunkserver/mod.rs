//! The Strand chunkserver: the single source of truth for data bytes.
//!
//! A chunkserver stores one file per chunk with a checksum sidecar, applies
//! primary-ordered mutations, forwards pipelined data pushes, and keeps the
//! master informed through registration and periodic heartbeats.

pub mod buffer;
pub mod server;
pub mod storage;

use crate::config::StrandConfig;
use crate::error::{Result, StrandError};
use crate::protocol::{
    CloneCommand, HeartbeatRequest, HeartbeatResponse, ReadChunkRequest, ReadChunkResponse,
    RegisterChunkServerRequest, RegisterChunkServerResponse, UpdateChunkSizeRequest,
};
use crate::types::{ChunkHandle, ServerId};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use buffer::DataBuffer;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use storage::ChunkStore;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// A running chunkserver.
pub struct ChunkServerNode {
    pub id: ServerId,
    /// Address peers and clients dial.
    pub address: String,
    master_addr: String,
    chunk_size: u64,
    heartbeat_interval: Duration,
    pub store: ChunkStore,
    pub buffer: DataBuffer,
    /// Per-chunk mutation serial counters, assigned by the primary.
    serials: Mutex<HashMap<ChunkHandle, u64>>,
    pub(crate) http: reqwest::Client,
}

impl ChunkServerNode {
    pub fn new(config: &StrandConfig) -> Result<Arc<Self>> {
        let id = if config.node.id.is_empty() {
            uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
        } else {
            config.node.id.clone()
        };

        let store = ChunkStore::open(&config.chunkserver.data_dir)?;

        let http = reqwest::Client::builder()
            .connect_timeout(config.network.connect_timeout)
            .timeout(config.network.request_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Ok(Arc::new(Self {
            id,
            address: config.chunkserver.advertised(),
            master_addr: config.chunkserver.master_addr.clone(),
            chunk_size: config.master.chunk_size,
            heartbeat_interval: config.chunkserver.heartbeat_interval,
            store,
            buffer: DataBuffer::default(),
            serials: Mutex::new(HashMap::new()),
            http,
        }))
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Next mutation serial for a chunk. Only the primary assigns these.
    pub fn next_serial(&self, handle: ChunkHandle) -> u64 {
        let mut serials = self.serials.lock();
        let serial = serials.entry(handle).or_insert(0);
        *serial += 1;
        *serial
    }

    /// Register with the master, reporting current holdings. Executes any
    /// deletions the master replies with.
    pub async fn register(&self, rack_id: &str) -> Result<()> {
        let request = RegisterChunkServerRequest {
            chunkserver_id: self.id.clone(),
            address: self.address.clone(),
            rack_id: rack_id.to_string(),
            chunks: self.store.list(),
        };

        let reply: RegisterChunkServerResponse = self
            .http
            .post(format!("{}/register_chunkserver", self.master_addr))
            .json(&request)
            .send()
            .await?
            .json()
            .await?;

        if !reply.success {
            return Err(StrandError::Remote(
                reply.error.unwrap_or_else(|| "registration refused".to_string()),
            ));
        }

        for handle in reply.chunks_to_delete {
            if let Err(e) = self.store.delete(handle) {
                warn!(%handle, error = %e, "Failed to delete chunk on master's request");
            }
        }

        info!(id = %self.id, master = %self.master_addr, "Registered with master");
        Ok(())
    }

    /// One heartbeat round trip, executing delete and clone commands from
    /// the reply.
    pub async fn heartbeat_once(&self) -> Result<()> {
        let request = HeartbeatRequest {
            chunkserver_id: self.id.clone(),
            chunks: self.store.list(),
            timestamp: Utc::now(),
        };

        let reply: HeartbeatResponse = self
            .http
            .post(format!("{}/heartbeat", self.master_addr))
            .json(&request)
            .send()
            .await?
            .json()
            .await?;

        if !reply.success {
            return Err(StrandError::Remote(
                reply.error.unwrap_or_else(|| "heartbeat refused".to_string()),
            ));
        }

        for handle in reply.delete {
            if let Err(e) = self.store.delete(handle) {
                warn!(%handle, error = %e, "Failed to delete chunk on master's request");
            }
        }

        for command in reply.clone {
            if let Err(e) = self.execute_clone(&command).await {
                warn!(handle = %command.handle, error = %e, "Heartbeat clone command failed");
            }
        }

        Ok(())
    }

    /// Pull a chunk from a peer and install it locally.
    pub async fn execute_clone(&self, command: &CloneCommand) -> Result<()> {
        let request = ReadChunkRequest {
            handle: command.source_handle,
            offset: 0,
            length: self.chunk_size,
        };

        let reply: ReadChunkResponse = self
            .http
            .post(format!("{}/read_chunk", command.source_address))
            .json(&request)
            .send()
            .await?
            .json()
            .await?;

        let data = if reply.success {
            let encoded = reply.data.unwrap_or_default();
            BASE64
                .decode(encoded.as_bytes())
                .map_err(|e| StrandError::Serialization(format!("clone payload: {}", e)))?
        } else {
            let message = reply.error.unwrap_or_else(|| "read refused".to_string());
            if message.contains("not found") {
                // The source allocated the chunk but never wrote it.
                Vec::new()
            } else {
                return Err(StrandError::Remote(message));
            }
        };

        self.store.install(command.handle, &data, command.expected_version)?;
        Ok(())
    }

    /// Tell the master a chunk grew. Best-effort: a miss is healed by the
    /// size carried in the next heartbeat report.
    pub async fn report_size(&self, handle: ChunkHandle) {
        let size = self.store.size(handle);
        let result = self
            .http
            .post(format!("{}/update_chunk_size", self.master_addr))
            .json(&UpdateChunkSizeRequest { handle, size })
            .send()
            .await;
        if let Err(e) = result {
            warn!(%handle, error = %e, "Size report failed");
        }
    }
}

/// Register with the master (retrying), then heartbeat until shutdown.
pub async fn heartbeat_loop(
    node: Arc<ChunkServerNode>,
    rack_id: String,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = node.register(&rack_id) => match result {
                Ok(()) => break,
                Err(e) => {
                    warn!(error = %e, "Registration failed; retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            },
            _ = shutdown.recv() => return,
        }
    }

    let mut interval = tokio::time::interval(node.heartbeat_interval);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match node.heartbeat_once().await {
                    Ok(()) => {}
                    Err(e) => {
                        warn!(error = %e, "Heartbeat failed");
                        // A restarted master forgets nothing durable, but a
                        // refused heartbeat means it wants a registration.
                        if matches!(e, StrandError::Remote(_)) {
                            let _ = node.register(&rack_id).await;
                        }
                    }
                }
            }
            _ = shutdown.recv() => {
                info!("Heartbeat loop shutting down");
                break;
            }
        }
    }
}

/// Run the chunkserver service until the process is terminated.
pub async fn run_chunk_server(config: StrandConfig) -> Result<()> {
    let bind_addr = config.chunkserver.bind_addr;
    let rack_id = config.node.rack_id.clone();
    let node = ChunkServerNode::new(&config)?;

    let (shutdown_tx, _) = broadcast::channel(1);
    tokio::spawn(heartbeat_loop(node.clone(), rack_id, shutdown_tx.subscribe()));

    let app = server::router(node.clone());
    let listener = TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, id = %node.id, "Chunkserver listening");

    axum::serve(listener, app)
        .await
        .map_err(|e| StrandError::Network(e.to_string()))?;

    let _ = shutdown_tx.send(());
    Ok(())
}
