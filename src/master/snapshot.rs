//! Metadata snapshots for the master.
//!
//! A snapshot is an atomic serialization of the entire in-memory metadata,
//! written temp-then-rename so a crash mid-write leaves the previous
//! snapshot intact. Paired with the WAL it bounds recovery time: load the
//! snapshot, then replay only the log suffix.

use crate::error::{Result, StrandError};
use crate::types::{ChunkHandle, ChunkMeta, ChunkServerInfo, FileMeta, ServerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Full serialized master state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaSnapshot {
    /// WAL sequence covered by this snapshot; replay resumes after it.
    pub last_applied: u64,
    pub taken_at: DateTime<Utc>,
    pub files: HashMap<String, FileMeta>,
    pub chunks: HashMap<ChunkHandle, ChunkMeta>,
    pub chunkservers: HashMap<ServerId, ChunkServerInfo>,
}

/// Write a snapshot atomically.
pub fn save(path: &Path, snapshot: &MetaSnapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("json.tmp");
    {
        let mut tmp = File::create(&tmp_path)?;
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        tmp.write_all(&bytes)?;
        tmp.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;

    Ok(())
}

/// Load the most recent snapshot, if one exists.
pub fn load(path: &Path) -> Result<Option<MetaSnapshot>> {
    if !path.exists() {
        return Ok(None);
    }

    let bytes = std::fs::read(path)?;
    let snapshot: MetaSnapshot = serde_json::from_slice(&bytes).map_err(|e| {
        StrandError::Storage(format!("snapshot {} unreadable: {}", path.display(), e))
    })?;

    Ok(Some(snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_snapshot() -> MetaSnapshot {
        let handle = ChunkHandle::new();
        let mut files = HashMap::new();
        let mut file = FileMeta::new("/a".to_string());
        file.chunk_handles.push(handle);
        files.insert("/a".to_string(), file);

        let mut chunks = HashMap::new();
        let mut meta = ChunkMeta::new(handle, vec!["cs-1".into(), "cs-2".into()]);
        meta.version = 3;
        meta.size = 1024;
        chunks.insert(handle, meta);

        let mut chunkservers = HashMap::new();
        chunkservers.insert(
            "cs-1".to_string(),
            ChunkServerInfo::new("cs-1".into(), "http://127.0.0.1:7101".into(), "r1".into()),
        );

        MetaSnapshot {
            last_applied: 42,
            taken_at: Utc::now(),
            files,
            chunks,
            chunkservers,
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metadata_snapshot.json");

        let snapshot = sample_snapshot();
        save(&path, &snapshot).unwrap();

        let loaded = load(&path).unwrap().expect("snapshot present");
        assert_eq!(loaded.last_applied, 42);
        assert_eq!(loaded.files.len(), 1);
        assert_eq!(loaded.chunks.len(), 1);
        let chunk = loaded.chunks.values().next().unwrap();
        assert_eq!(chunk.version, 3);
        assert_eq!(chunk.size, 1024);
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nope.json");
        assert!(load(&path).unwrap().is_none());
    }

    #[test]
    fn test_save_replaces_atomically() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metadata_snapshot.json");

        let mut snapshot = sample_snapshot();
        save(&path, &snapshot).unwrap();

        snapshot.last_applied = 100;
        save(&path, &snapshot).unwrap();

        let loaded = load(&path).unwrap().unwrap();
        assert_eq!(loaded.last_applied, 100);
        // No leftover temp file.
        assert!(!path.with_extension("json.tmp").exists());
    }
}
