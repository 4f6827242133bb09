//! The Strand master: single source of truth for metadata.
//!
//! The master owns the namespace, the chunk map, lease coordination,
//! failure detection, re-replication, garbage collection, and WAL-based
//! recovery. Data bytes never pass through it.

pub mod background;
pub mod placement;
pub mod server;
pub mod snapshot;
pub mod state;
pub mod wal;

use crate::config::{MasterConfig, StrandConfig};
use crate::error::{Result, StrandError};
use crate::protocol::{AckResponse, CloneCommand};
use crate::master::state::MasterState;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info};

/// A running master: recovered state behind one mutex, plus the HTTP client
/// used to command chunkservers.
pub struct MasterNode {
    state: Mutex<MasterState>,
    http: reqwest::Client,
    config: StrandConfig,
}

impl MasterNode {
    /// Recover state from disk and wrap it for serving.
    pub fn new(config: StrandConfig) -> Result<Arc<Self>> {
        let state = MasterState::recover(config.master.clone())?;

        let http = reqwest::Client::builder()
            .connect_timeout(config.network.connect_timeout)
            .timeout(config.network.request_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Ok(Arc::new(Self { state: Mutex::new(state), http, config }))
    }

    pub fn master_config(&self) -> &MasterConfig {
        &self.config.master
    }

    /// Run a closure under the master lock.
    ///
    /// A WAL append failure inside the closure is fatal: the master logs the
    /// failure and exits so the operator can intervene with the log intact.
    pub fn with_state<T>(&self, f: impl FnOnce(&mut MasterState) -> Result<T>) -> Result<T> {
        let result = {
            let mut state = self.state.lock();
            f(&mut state)
        };

        if let Err(e) = &result {
            if e.is_wal_fatal() {
                error!(error = %e, "Write-ahead log failure; refusing further mutations");
                std::process::exit(1);
            }
        }
        result
    }

    /// Command a chunkserver to pull a chunk from a peer.
    pub async fn send_clone(&self, dest_address: &str, command: &CloneCommand) -> Result<()> {
        let url = format!("{}/clone_chunk", dest_address);
        let reply: AckResponse = self
            .http
            .post(&url)
            .json(&crate::protocol::CloneChunkRequest {
                handle: command.handle,
                source_address: command.source_address.clone(),
                source_handle: command.source_handle,
                expected_version: command.expected_version,
            })
            .send()
            .await?
            .json()
            .await?;

        if reply.success {
            Ok(())
        } else {
            Err(StrandError::Remote(
                reply.error.unwrap_or_else(|| "clone refused".to_string()),
            ))
        }
    }
}

/// Run the master service until the process is terminated.
pub async fn run_master_server(config: StrandConfig) -> Result<()> {
    let bind_addr = config.master.bind_addr;
    let node = MasterNode::new(config)?;

    let (shutdown_tx, _) = broadcast::channel(1);
    background::spawn_all(node.clone(), &shutdown_tx);

    let app = server::router(node);
    let listener = TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, "Master listening");

    axum::serve(listener, app)
        .await
        .map_err(|e| StrandError::Network(e.to_string()))?;

    let _ = shutdown_tx.send(());
    Ok(())
}
