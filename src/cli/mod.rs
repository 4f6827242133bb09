//! Command-line interface definitions.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "strand", version, about = "A GFS-style distributed file system")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log level filter (overridden by RUST_LOG).
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the metadata master.
    Master {
        /// Configuration file (JSON); flags below override it.
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Directory for the WAL and metadata snapshots.
        #[arg(long)]
        metadata_dir: Option<PathBuf>,

        #[arg(long)]
        replication_factor: Option<usize>,

        /// Maximum bytes per chunk.
        #[arg(long)]
        chunk_size: Option<u64>,
    },

    /// Run a chunkserver.
    Chunkserver {
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Master base URL, e.g. http://10.0.0.1:7100.
        #[arg(long)]
        master: Option<String>,

        /// Directory for chunk files.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Rack identifier used for replica placement.
        #[arg(long)]
        rack: Option<String>,

        /// Address advertised to peers; defaults to http://<bind>.
        #[arg(long)]
        advertise: Option<String>,

        /// Stable server id; generated when omitted.
        #[arg(long)]
        id: Option<String>,
    },

    /// File operations against a running cluster.
    Fs {
        /// Master base URL.
        #[arg(long, default_value = "http://127.0.0.1:7100")]
        master: String,

        #[command(subcommand)]
        command: FsCommands,
    },

    /// Show cluster status.
    Status {
        #[arg(long, default_value = "http://127.0.0.1:7100")]
        master: String,
    },
}

#[derive(Subcommand)]
pub enum FsCommands {
    /// Create an empty file.
    Create { path: String },

    /// Write bytes at an offset.
    Write {
        path: String,

        #[arg(long, default_value_t = 0)]
        offset: u64,

        /// Literal bytes to write.
        #[arg(long, conflicts_with = "input")]
        data: Option<String>,

        /// Read the payload from a local file.
        #[arg(long)]
        input: Option<PathBuf>,
    },

    /// Read a byte range.
    Read {
        path: String,

        #[arg(long, default_value_t = 0)]
        offset: u64,

        #[arg(long)]
        length: u64,

        /// Write the bytes to a local file instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Atomically append a record.
    Append {
        path: String,

        #[arg(long)]
        data: String,
    },

    /// Delete a file.
    Rm { path: String },

    /// Rename a file.
    Mv { old: String, new: String },

    /// Copy-on-write snapshot of a file.
    Snapshot { src: String, dst: String },

    /// List files under a prefix.
    Ls {
        #[arg(default_value = "/")]
        prefix: String,
    },

    /// Show file metadata.
    Stat { path: String },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
