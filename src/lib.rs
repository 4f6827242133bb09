//! Strand - a GFS-style distributed file system.
//!
//! Strand stores large files as sequences of fixed-size chunks replicated
//! across storage nodes, coordinated by a single metadata master. Clients
//! perform whole-file creation, random-offset writes, atomic record append,
//! and ranged reads; the system tolerates storage-node failure and silent
//! data corruption.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                         Strand                           │
//! ├──────────────────────────────────────────────────────────┤
//! │  Client: metadata lookup | data push | commit | reads    │
//! ├──────────────────────────────────────────────────────────┤
//! │  Master: namespace | chunk map | leases | WAL + snapshot │
//! │          failure detection | re-replication | GC         │
//! ├──────────────────────────────────────────────────────────┤
//! │  ChunkServers: chunk files | block checksums |           │
//! │          pipelined writes | atomic record append         │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The master is the single source of truth for metadata; chunkservers are
//! the single source of truth for data; the client joins the two. All RPCs
//! are JSON over HTTP with chunk payloads carried as base64.
//!
//! # Quick start
//!
//! ```no_run
//! use strand::config::StrandConfig;
//!
//! #[tokio::main]
//! async fn main() -> strand::Result<()> {
//!     let config = StrandConfig::development();
//!     strand::master::run_master_server(config).await
//! }
//! ```

pub mod chunkserver;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod master;
pub mod observability;
pub mod protocol;
pub mod types;

// Re-exports
pub use error::{Result, StrandError};
pub use types::*;
