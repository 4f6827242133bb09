//! On-disk chunk storage with block-level checksums.
//!
//! Each chunk is three files in the data directory:
//!
//! - `<handle>.chunk`: the raw bytes
//! - `<handle>.cksum`: a dense array of little-endian CRC32 values, one per
//!   64 KiB block, no header (the chunk length determines the block count)
//! - `<handle>.meta`: a small JSON record carrying the chunk version, so
//!   stale-replica detection survives a restart
//!
//! Every read verifies the checksums of the blocks it touches; a mismatch
//! marks the replica corrupt, which drops it from subsequent chunk reports
//! and lets the master re-replicate from a healthy copy.

use crate::error::{Result, StrandError};
use crate::types::{ChunkHandle, ChunkReport, CHECKSUM_BLOCK_SIZE};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Serialize, Deserialize)]
struct ChunkVersionMeta {
    version: u64,
}

/// Local chunk store for one chunkserver.
pub struct ChunkStore {
    data_dir: PathBuf,
    /// Per-chunk mutation locks; commit order is serialized per chunk while
    /// different chunks proceed concurrently.
    locks: Mutex<HashMap<ChunkHandle, Arc<tokio::sync::Mutex<()>>>>,
    versions: RwLock<HashMap<ChunkHandle, u64>>,
    corrupt: Mutex<HashSet<ChunkHandle>>,
}

impl ChunkStore {
    /// Open the store, scanning existing chunk files and their versions.
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;

        let mut versions = HashMap::new();
        for entry in fs::read_dir(&data_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(stem) = name.strip_suffix(".chunk") else { continue };
            let Ok(handle) = stem.parse::<ChunkHandle>() else {
                warn!(file = %name, "Ignoring unparseable chunk file");
                continue;
            };

            let version = match fs::read(data_dir.join(format!("{}.meta", handle))) {
                Ok(bytes) => serde_json::from_slice::<ChunkVersionMeta>(&bytes)
                    .map(|m| m.version)
                    .unwrap_or(0),
                Err(_) => 0,
            };
            versions.insert(handle, version);
        }

        info!(dir = %data_dir.display(), chunks = versions.len(), "Chunk store opened");

        Ok(Self {
            data_dir,
            locks: Mutex::new(HashMap::new()),
            versions: RwLock::new(versions),
            corrupt: Mutex::new(HashSet::new()),
        })
    }

    /// The mutation lock for one chunk.
    pub fn mutation_lock(&self, handle: ChunkHandle) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(handle)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub fn exists(&self, handle: ChunkHandle) -> bool {
        self.chunk_path(handle).exists()
    }

    /// Current chunk size in bytes, 0 when absent.
    pub fn size(&self, handle: ChunkHandle) -> u64 {
        fs::metadata(self.chunk_path(handle)).map(|m| m.len()).unwrap_or(0)
    }

    pub fn version(&self, handle: ChunkHandle) -> u64 {
        self.versions.read().get(&handle).copied().unwrap_or(0)
    }

    /// Record a version, keeping the maximum seen.
    pub fn set_version(&self, handle: ChunkHandle, version: u64) -> Result<()> {
        let current = self.version(handle);
        if version <= current && current != 0 {
            return Ok(());
        }

        let meta = ChunkVersionMeta { version: version.max(current) };
        let path = self.meta_path(handle);
        let tmp = path.with_extension("meta.tmp");
        fs::write(&tmp, serde_json::to_vec(&meta)?)?;
        fs::rename(&tmp, &path)?;

        self.versions.write().insert(handle, meta.version);
        Ok(())
    }

    /// Write `data` at `offset`, extending the chunk with zeros if the
    /// offset lies past the current end. Returns the new chunk size.
    pub fn write_at(&self, handle: ChunkHandle, offset: u64, data: &[u8]) -> Result<u64> {
        let path = self.chunk_path(handle);
        let mut file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;

        let old_size = file.metadata()?.len();
        let new_size = old_size.max(offset + data.len() as u64);
        if new_size > old_size {
            file.set_len(new_size)?;
        }

        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.sync_data()?;

        // Everything from the first changed byte (including any zero gap
        // opened by set_len) needs fresh block checksums.
        let dirty_from = offset.min(old_size);
        self.refresh_checksums(handle, &mut file, dirty_from, new_size)?;
        self.versions.write().entry(handle).or_insert(0);

        debug!(%handle, offset, len = data.len(), new_size, "Wrote chunk region");
        Ok(new_size)
    }

    /// Zero-fill the chunk out to `target` bytes. Record-append padding is
    /// zero-filled so padded regions stay readable.
    pub fn pad_to(&self, handle: ChunkHandle, target: u64) -> Result<u64> {
        let path = self.chunk_path(handle);
        let mut file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;

        let old_size = file.metadata()?.len();
        if target <= old_size {
            return Ok(old_size);
        }

        file.set_len(target)?;
        file.sync_data()?;
        self.refresh_checksums(handle, &mut file, old_size, target)?;
        self.versions.write().entry(handle).or_insert(0);

        debug!(%handle, from = old_size, to = target, "Padded chunk");
        Ok(target)
    }

    /// Read `length` bytes at `offset`, verifying the checksums of every
    /// touched block. Reads past the end are clamped.
    pub fn read_at(&self, handle: ChunkHandle, offset: u64, length: u64) -> Result<Vec<u8>> {
        let path = self.chunk_path(handle);
        if !path.exists() {
            return Err(StrandError::ChunkNotFound(handle.to_string()));
        }

        let mut file = File::open(&path)?;
        let size = file.metadata()?.len();

        let length = length.min(size.saturating_sub(offset));
        if length == 0 {
            return Ok(Vec::new());
        }

        let block = CHECKSUM_BLOCK_SIZE as u64;
        let first_block = offset / block;
        let aligned_start = first_block * block;
        let aligned_end = (offset + length + block - 1) / block * block;
        let aligned_end = aligned_end.min(size);

        let mut region = vec![0u8; (aligned_end - aligned_start) as usize];
        file.seek(SeekFrom::Start(aligned_start))?;
        file.read_exact(&mut region)?;

        let sums = self.read_sidecar(handle)?;
        for (i, piece) in region.chunks(CHECKSUM_BLOCK_SIZE).enumerate() {
            let index = first_block as usize + i;
            let actual = crc32fast::hash(piece);
            let expected = sums.get(index).copied().unwrap_or(0);
            if actual != expected {
                error!(%handle, block = index, "Checksum mismatch on read");
                self.mark_corrupt(handle);
                return Err(StrandError::ChecksumMismatch { expected, actual });
            }
        }

        let start = (offset - aligned_start) as usize;
        Ok(region[start..start + length as usize].to_vec())
    }

    /// Install a complete chunk image, rebuilding checksums from scratch.
    /// Used when cloning from a peer; clears any corruption mark.
    pub fn install(&self, handle: ChunkHandle, data: &[u8], version: u64) -> Result<()> {
        let path = self.chunk_path(handle);
        let tmp = path.with_extension("chunk.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        let sums: Vec<u32> = data.chunks(CHECKSUM_BLOCK_SIZE).map(crc32fast::hash).collect();
        self.write_sidecar(handle, &sums)?;
        self.set_version(handle, version)?;
        self.corrupt.lock().remove(&handle);

        info!(%handle, bytes = data.len(), version, "Installed chunk");
        Ok(())
    }

    /// Remove a chunk and its sidecars.
    pub fn delete(&self, handle: ChunkHandle) -> Result<()> {
        for path in [self.chunk_path(handle), self.sidecar_path(handle), self.meta_path(handle)] {
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        self.versions.write().remove(&handle);
        self.corrupt.lock().remove(&handle);
        self.locks.lock().remove(&handle);
        debug!(%handle, "Deleted chunk");
        Ok(())
    }

    /// Report every healthy chunk with its version and size. Corrupt
    /// replicas are omitted so the master schedules their replacement.
    pub fn list(&self) -> Vec<ChunkReport> {
        let corrupt = self.corrupt.lock().clone();
        let versions = self.versions.read();
        versions
            .iter()
            .filter(|(handle, _)| !corrupt.contains(*handle) && self.exists(**handle))
            .map(|(handle, version)| ChunkReport {
                handle: *handle,
                version: *version,
                size: self.size(*handle),
            })
            .collect()
    }

    pub fn mark_corrupt(&self, handle: ChunkHandle) {
        self.corrupt.lock().insert(handle);
    }

    pub fn is_corrupt(&self, handle: ChunkHandle) -> bool {
        self.corrupt.lock().contains(&handle)
    }

    /// Total bytes of chunk data on disk.
    pub fn usage(&self) -> u64 {
        self.versions.read().keys().map(|h| self.size(*h)).sum()
    }

    // Path helpers

    fn chunk_path(&self, handle: ChunkHandle) -> PathBuf {
        self.data_dir.join(format!("{}.chunk", handle))
    }

    fn sidecar_path(&self, handle: ChunkHandle) -> PathBuf {
        self.data_dir.join(format!("{}.cksum", handle))
    }

    fn meta_path(&self, handle: ChunkHandle) -> PathBuf {
        self.data_dir.join(format!("{}.meta", handle))
    }

    // Checksum sidecar

    fn read_sidecar(&self, handle: ChunkHandle) -> Result<Vec<u32>> {
        let path = self.sidecar_path(handle);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let bytes = fs::read(&path)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }

    fn write_sidecar(&self, handle: ChunkHandle, sums: &[u32]) -> Result<()> {
        let mut bytes = Vec::with_capacity(sums.len() * 4);
        for sum in sums {
            bytes.extend_from_slice(&sum.to_le_bytes());
        }
        fs::write(self.sidecar_path(handle), &bytes)?;
        Ok(())
    }

    /// Recompute block checksums for the region `[dirty_from, new_size)`.
    fn refresh_checksums(
        &self,
        handle: ChunkHandle,
        file: &mut File,
        dirty_from: u64,
        new_size: u64,
    ) -> Result<()> {
        let block = CHECKSUM_BLOCK_SIZE as u64;
        let first_block = (dirty_from / block) as usize;
        let block_count = ((new_size + block - 1) / block) as usize;

        let mut sums = self.read_sidecar(handle)?;
        sums.resize(block_count, 0);

        let read_from = first_block as u64 * block;
        let mut region = vec![0u8; (new_size - read_from) as usize];
        file.seek(SeekFrom::Start(read_from))?;
        file.read_exact(&mut region)?;

        for (i, piece) in region.chunks(CHECKSUM_BLOCK_SIZE).enumerate() {
            sums[first_block + i] = crc32fast::hash(piece);
        }

        self.write_sidecar(handle, &sums)
    }
}
