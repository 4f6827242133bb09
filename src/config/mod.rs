//! Configuration module for Strand.

use crate::error::{Result, StrandError};
use crate::types::DEFAULT_CHUNK_SIZE;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for a Strand node.
///
/// One file drives every role: a master reads the `master` section, a
/// chunkserver reads `chunkserver` plus the master's `chunk_size`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrandConfig {
    /// Node identity.
    pub node: NodeConfig,
    /// Master service configuration.
    pub master: MasterConfig,
    /// Chunkserver service configuration.
    pub chunkserver: ChunkServerConfig,
    /// Network client configuration.
    pub network: NetworkConfig,
    /// Observability configuration.
    pub observability: ObservabilityConfig,
}

impl StrandConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| StrandError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| StrandError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.master.replication_factor == 0 {
            return Err(StrandError::InvalidConfig {
                field: "master.replication_factor".to_string(),
                reason: "Replication factor must be at least 1".to_string(),
            });
        }

        if self.master.chunk_size == 0 {
            return Err(StrandError::InvalidConfig {
                field: "master.chunk_size".to_string(),
                reason: "Chunk size must be non-zero".to_string(),
            });
        }

        if self.master.heartbeat_timeout < self.chunkserver.heartbeat_interval {
            return Err(StrandError::InvalidConfig {
                field: "master.heartbeat_timeout".to_string(),
                reason: "Heartbeat timeout must exceed the heartbeat interval".to_string(),
            });
        }

        Ok(())
    }

    /// Create a minimal single-machine development configuration.
    pub fn development() -> Self {
        Self {
            node: NodeConfig {
                id: String::new(),
                rack_id: "default".to_string(),
            },
            master: MasterConfig {
                bind_addr: "127.0.0.1:7100".parse().expect("valid socket address"),
                metadata_dir: PathBuf::from("/tmp/strand/master"),
                ..MasterConfig::default()
            },
            chunkserver: ChunkServerConfig {
                bind_addr: "127.0.0.1:7101".parse().expect("valid socket address"),
                master_addr: "http://127.0.0.1:7100".to_string(),
                data_dir: PathBuf::from("/tmp/strand/chunks"),
                ..ChunkServerConfig::default()
            },
            network: NetworkConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Node identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identifier; generated at startup when empty.
    pub id: String,
    /// Rack this node sits in, used as the failure-correlation unit for
    /// replica placement.
    pub rack_id: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            rack_id: "default".to_string(),
        }
    }
}

/// Master service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Address to bind the master service.
    pub bind_addr: SocketAddr,
    /// Directory for the WAL and metadata snapshots.
    pub metadata_dir: PathBuf,
    /// WAL file name inside `metadata_dir`.
    pub wal_file: String,
    /// Snapshot file name inside `metadata_dir`.
    pub snapshot_file: String,
    /// Maximum bytes per chunk.
    pub chunk_size: u64,
    /// Target replica count per chunk.
    pub replication_factor: usize,
    /// A chunkserver silent for longer than this is marked dead.
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,
    /// Lease lifetime.
    #[serde(with = "humantime_serde")]
    pub lease_duration: Duration,
    /// Metadata snapshot cadence.
    #[serde(with = "humantime_serde")]
    pub snapshot_interval: Duration,
    /// Garbage collection cadence.
    #[serde(with = "humantime_serde")]
    pub gc_interval: Duration,
    /// Liveness scan cadence.
    #[serde(with = "humantime_serde")]
    pub failure_scan_interval: Duration,
    /// Delay before physically deleting garbage and stale replicas.
    #[serde(with = "humantime_serde")]
    pub garbage_retention: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7100".parse().expect("valid socket address"),
            metadata_dir: PathBuf::from("/var/lib/strand/master"),
            wal_file: "wal.log".to_string(),
            snapshot_file: "metadata_snapshot.json".to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            replication_factor: 3,
            heartbeat_timeout: Duration::from_secs(30),
            lease_duration: Duration::from_secs(60),
            snapshot_interval: Duration::from_secs(60),
            gc_interval: Duration::from_secs(60),
            failure_scan_interval: Duration::from_secs(5),
            garbage_retention: Duration::from_secs(3 * 24 * 3600),
        }
    }
}

impl MasterConfig {
    pub fn wal_path(&self) -> PathBuf {
        self.metadata_dir.join(&self.wal_file)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.metadata_dir.join(&self.snapshot_file)
    }
}

/// Chunkserver service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkServerConfig {
    /// Address to bind the chunkserver service.
    pub bind_addr: SocketAddr,
    /// Address advertised to the master and to clients; defaults to
    /// `http://<bind_addr>` when unset.
    #[serde(default)]
    pub advertise_addr: Option<String>,
    /// Base URL of the master.
    pub master_addr: String,
    /// Directory for chunk files and checksum sidecars.
    pub data_dir: PathBuf,
    /// Heartbeat cadence.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
}

impl Default for ChunkServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7101".parse().expect("valid socket address"),
            advertise_addr: None,
            master_addr: "http://127.0.0.1:7100".to_string(),
            data_dir: PathBuf::from("/var/lib/strand/chunks"),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

impl ChunkServerConfig {
    /// The address other nodes should dial.
    pub fn advertised(&self) -> String {
        self.advertise_addr
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.bind_addr))
    }
}

/// Network client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Connection timeout.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Request timeout.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Retries for client operations before the error surfaces.
    pub retry_budget: usize,
    /// Initial retry backoff; doubles per attempt.
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            retry_budget: 3,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level filter.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(d) = s.strip_suffix('d') {
            d.parse::<u64>()
                .map(|v| Duration::from_secs(v * 24 * 3600))
                .map_err(|e| e.to_string())
        } else if let Some(h) = s.strip_suffix('h') {
            h.parse::<u64>()
                .map(|v| Duration::from_secs(v * 3600))
                .map_err(|e| e.to_string())
        } else if let Some(m) = s.strip_suffix('m') {
            m.parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else if let Some(s_val) = s.strip_suffix('s') {
            s_val
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }

}
