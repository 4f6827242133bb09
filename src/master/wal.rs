//! Write-ahead log for the master.
//!
//! Every metadata mutation is appended here, fsync'd, **before** it is
//! applied in memory and before any reply leaves the master. The log is
//! newline-delimited JSON; each entry carries a monotonically increasing
//! sequence number, a timestamp, an `op_kind` discriminator and a payload.
//!
//! On startup the master loads the most recent snapshot and replays every
//! entry with a greater sequence. A corrupt entry aborts startup with a
//! diagnostic naming the offending sequence; recovery never silently skips
//! log records.

use crate::error::{Result, StrandError};
use crate::types::{ChunkHandle, ServerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// One logged metadata mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub op: WalOp,
}

/// The mutation payload, tagged by operation kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op_kind", content = "payload")]
pub enum WalOp {
    CreateFile {
        path: String,
    },
    AllocateChunk {
        path: String,
        chunk_index: usize,
        handle: ChunkHandle,
        replicas: Vec<ServerId>,
    },
    BumpVersion {
        handle: ChunkHandle,
        version: u64,
    },
    GrantLease {
        handle: ChunkHandle,
        primary: ServerId,
        expires: DateTime<Utc>,
    },
    UpdateChunkSize {
        handle: ChunkHandle,
        size: u64,
    },
    UpdateReplicas {
        handle: ChunkHandle,
        replicas: Vec<ServerId>,
    },
    SnapshotFile {
        src: String,
        dst: String,
    },
    CowClone {
        path: String,
        chunk_index: usize,
        old_handle: ChunkHandle,
        new_handle: ChunkHandle,
        replicas: Vec<ServerId>,
    },
    RenameFile {
        old: String,
        new: String,
    },
    DeleteFile {
        path: String,
        deleted_at: DateTime<Utc>,
    },
    PurgeFile {
        path: String,
    },
    MarkGarbage {
        handle: ChunkHandle,
        since: DateTime<Utc>,
    },
    DeleteChunk {
        handle: ChunkHandle,
    },
    RegisterChunkServer {
        id: ServerId,
        address: String,
        rack_id: String,
    },
}

/// Append-only WAL writer.
pub struct Wal {
    path: PathBuf,
    file: File,
    sequence: u64,
}

impl Wal {
    /// Open the log for appending, continuing after `last_sequence`.
    pub fn open(path: &Path, last_sequence: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StrandError::Wal(format!("create log dir: {}", e)))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| StrandError::Wal(format!("open {}: {}", path.display(), e)))?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            sequence: last_sequence,
        })
    }

    /// Append one entry and fsync it. Returns the assigned sequence number.
    ///
    /// The caller supplies the timestamp so that the in-memory application
    /// of the operation and its replay after a restart see the same clock.
    pub fn append(&mut self, timestamp: DateTime<Utc>, op: WalOp) -> Result<u64> {
        self.sequence += 1;
        let entry = WalEntry {
            sequence: self.sequence,
            timestamp,
            op,
        };

        let mut line = serde_json::to_vec(&entry)
            .map_err(|e| StrandError::Wal(format!("encode entry {}: {}", self.sequence, e)))?;
        line.push(b'\n');

        self.file
            .write_all(&line)
            .and_then(|_| self.file.sync_data())
            .map_err(|e| StrandError::Wal(format!("append entry {}: {}", self.sequence, e)))?;

        Ok(self.sequence)
    }

    pub fn last_sequence(&self) -> u64 {
        self.sequence
    }

    /// Drop every entry with `sequence <= through`, keeping the rest.
    ///
    /// Called after a metadata snapshot lands on disk. Rewrites the retained
    /// suffix to a temporary file and renames it into place.
    pub fn truncate_through(&mut self, through: u64) -> Result<()> {
        let retained: Vec<WalEntry> = replay(&self.path, through)?;

        let tmp_path = self.path.with_extension("log.tmp");
        {
            let mut tmp = File::create(&tmp_path)
                .map_err(|e| StrandError::Wal(format!("create {}: {}", tmp_path.display(), e)))?;
            for entry in &retained {
                let mut line = serde_json::to_vec(entry)
                    .map_err(|e| StrandError::Wal(format!("encode entry: {}", e)))?;
                line.push(b'\n');
                tmp.write_all(&line)
                    .map_err(|e| StrandError::Wal(format!("rewrite log: {}", e)))?;
            }
            tmp.sync_data()
                .map_err(|e| StrandError::Wal(format!("sync rewritten log: {}", e)))?;
        }

        std::fs::rename(&tmp_path, &self.path)
            .map_err(|e| StrandError::Wal(format!("swap rewritten log: {}", e)))?;

        // Reopen the append handle on the new inode.
        self.file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| StrandError::Wal(format!("reopen log: {}", e)))?;

        Ok(())
    }
}

/// Read every entry with `sequence > after` from the log at `path`.
///
/// Sequence numbers must be strictly increasing; a gap, a regression, or an
/// undecodable line is reported as [`StrandError::WalCorrupt`] with the
/// sequence at which recovery stopped.
pub fn replay(path: &Path, after: u64) -> Result<Vec<WalEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path)?;
    let reader = BufReader::new(file);

    let mut entries = Vec::new();
    let mut last_seen = 0u64;

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let entry: WalEntry = serde_json::from_str(&line).map_err(|e| StrandError::WalCorrupt {
            sequence: last_seen + 1,
            detail: format!("line {}: {}", line_no + 1, e),
        })?;

        if last_seen != 0 && entry.sequence <= last_seen {
            return Err(StrandError::WalCorrupt {
                sequence: entry.sequence,
                detail: format!(
                    "line {}: sequence went backwards after {}",
                    line_no + 1,
                    last_seen
                ),
            });
        }
        last_seen = entry.sequence;

        if entry.sequence > after {
            entries.push(entry);
        }
    }

    Ok(entries)
}

/// Last sequence present in the log, 0 when the log is empty or absent.
pub fn last_sequence_in(path: &Path) -> Result<u64> {
    Ok(replay(path, 0)?.last().map(|e| e.sequence).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_op(i: usize) -> WalOp {
        WalOp::CreateFile { path: format!("/f{}", i) }
    }

    #[test]
    fn test_append_and_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");

        let mut wal = Wal::open(&path, 0).unwrap();
        for i in 0..5 {
            let seq = wal.append(Utc::now(), sample_op(i)).unwrap();
            assert_eq!(seq, i as u64 + 1);
        }

        let entries = replay(&path, 0).unwrap();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0].sequence, 1);
        assert_eq!(entries[4].sequence, 5);
    }

    #[test]
    fn test_replay_after_cursor() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");

        let mut wal = Wal::open(&path, 0).unwrap();
        for i in 0..10 {
            wal.append(Utc::now(), sample_op(i)).unwrap();
        }

        let entries = replay(&path, 7).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].sequence, 8);
    }

    #[test]
    fn test_reopen_continues_sequence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");

        {
            let mut wal = Wal::open(&path, 0).unwrap();
            wal.append(Utc::now(), sample_op(0)).unwrap();
            wal.append(Utc::now(), sample_op(1)).unwrap();
        }

        let last = last_sequence_in(&path).unwrap();
        assert_eq!(last, 2);

        let mut wal = Wal::open(&path, last).unwrap();
        assert_eq!(wal.append(Utc::now(), sample_op(2)).unwrap(), 3);
    }

    #[test]
    fn test_corrupt_line_aborts_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");

        let mut wal = Wal::open(&path, 0).unwrap();
        wal.append(Utc::now(), sample_op(0)).unwrap();
        drop(wal);

        let mut raw = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        raw.write_all(b"{\"sequence\": 2, garbage\n").unwrap();

        let err = replay(&path, 0).unwrap_err();
        match err {
            StrandError::WalCorrupt { sequence, .. } => assert_eq!(sequence, 2),
            other => panic!("expected WalCorrupt, got {:?}", other),
        }
    }

    #[test]
    fn test_sequence_regression_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");

        let entry = |seq: u64| {
            let e = WalEntry {
                sequence: seq,
                timestamp: Utc::now(),
                op: sample_op(seq as usize),
            };
            let mut v = serde_json::to_vec(&e).unwrap();
            v.push(b'\n');
            v
        };

        let mut raw = File::create(&path).unwrap();
        raw.write_all(&entry(1)).unwrap();
        raw.write_all(&entry(3)).unwrap();
        raw.write_all(&entry(2)).unwrap();
        drop(raw);

        assert!(matches!(
            replay(&path, 0),
            Err(StrandError::WalCorrupt { sequence: 2, .. })
        ));
    }

    #[test]
    fn test_truncate_through() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");

        let mut wal = Wal::open(&path, 0).unwrap();
        for i in 0..6 {
            wal.append(Utc::now(), sample_op(i)).unwrap();
        }

        wal.truncate_through(4).unwrap();

        let entries = replay(&path, 0).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].sequence, 5);

        // Appends keep working on the rewritten file.
        assert_eq!(wal.append(Utc::now(), sample_op(6)).unwrap(), 7);
        let entries = replay(&path, 0).unwrap();
        assert_eq!(entries.last().unwrap().sequence, 7);
    }
}
