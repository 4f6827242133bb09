//! The master's in-memory metadata state machine.
//!
//! All of the master's knowledge lives here: the file namespace, the chunk
//! map, the chunkserver table, and the lease table. Every mutation is
//! expressed as a [`WalOp`], appended to the write-ahead log, and then
//! applied through [`MasterState::apply`], the same function that replays
//! the log on startup, so a recovered master is byte-for-byte the state the
//! log describes.
//!
//! Concurrency model: the node wraps this struct in a single
//! `parking_lot::Mutex`. Public entry points are called with the lock held;
//! nothing here re-acquires it.

use crate::config::MasterConfig;
use crate::error::{Result, StrandError};
use crate::master::placement;
use crate::master::snapshot::{self, MetaSnapshot};
use crate::master::wal::{self, Wal, WalOp};
use crate::protocol::{CloneCommand, ReplicaAddr};
use crate::types::{ChunkHandle, ChunkMeta, ChunkReport, ChunkServerInfo, FileMeta, LeaseInfo, ServerId};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, error, info, warn};

/// Re-replication gives up on a chunk after this many failed clone attempts.
pub const MAX_REPLICATION_ATTEMPTS: u32 = 5;

/// Everything a client needs to talk to a chunk's replicas.
///
/// A snapshot-shared chunk (`ref_count > 1`) carries no lease: mutating it
/// requires breaking the share first, and reads need no primary.
#[derive(Debug, Clone)]
pub struct ChunkGrant {
    pub handle: ChunkHandle,
    pub replicas: Vec<ReplicaAddr>,
    pub primary: Option<ServerId>,
    pub lease_expiry: Option<DateTime<Utc>>,
    pub version: u64,
    pub size: u64,
    pub ref_count: u32,
}

/// A queued re-replication attempt.
#[derive(Debug, Clone)]
pub struct ReplicationTask {
    pub handle: ChunkHandle,
    pub attempts: u32,
    pub not_before: DateTime<Utc>,
}

/// A planned clone: destination plus the command it must execute.
#[derive(Debug, Clone)]
pub struct ReplicationPlan {
    pub task: ReplicationTask,
    pub dest: ServerId,
    pub dest_address: String,
    pub command: CloneCommand,
}

/// The instructions produced when a copy-on-write share is broken.
#[derive(Debug, Clone)]
pub struct CowBreak {
    pub grant: ChunkGrant,
    /// Clone commands to deliver to each replica of the new chunk.
    pub clones: Vec<(String, CloneCommand)>,
}

pub struct MasterState {
    config: MasterConfig,
    files: HashMap<String, FileMeta>,
    chunks: HashMap<ChunkHandle, ChunkMeta>,
    chunkservers: HashMap<ServerId, ChunkServerInfo>,
    leases: HashMap<ChunkHandle, LeaseInfo>,
    /// Replicas detected stale, with the time of detection; physically
    /// deleted after the retention window.
    stale_replicas: HashMap<ChunkHandle, HashMap<ServerId, DateTime<Utc>>>,
    /// Latest per-server chunk versions from register/heartbeat reports.
    reported_versions: HashMap<ServerId, HashMap<ChunkHandle, u64>>,
    /// Physical deletions to deliver in each server's next heartbeat reply.
    pending_deletes: HashMap<ServerId, HashSet<ChunkHandle>>,
    /// Clone commands mirrored into heartbeat replies as a fallback channel.
    pending_clones: HashMap<ServerId, Vec<CloneCommand>>,
    repl_queue: VecDeque<ReplicationTask>,
    repl_queued: HashSet<ChunkHandle>,
    /// Chunks whose re-replication exhausted its attempts.
    dead_letters: Vec<ChunkHandle>,
    wal: Wal,
}

impl MasterState {
    /// Recover state from the snapshot and WAL under `config.metadata_dir`.
    pub fn recover(config: MasterConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.metadata_dir)?;

        let snapshot_path = config.snapshot_path();
        let wal_path = config.wal_path();

        let loaded = snapshot::load(&snapshot_path)?;
        let (files, chunks, mut chunkservers, last_applied) = match loaded {
            Some(snap) => {
                info!(
                    last_applied = snap.last_applied,
                    files = snap.files.len(),
                    chunks = snap.chunks.len(),
                    "Loaded metadata snapshot"
                );
                (snap.files, snap.chunks, snap.chunkservers, snap.last_applied)
            }
            None => (HashMap::new(), HashMap::new(), HashMap::new(), 0),
        };

        // Liveness is never trusted across a restart; servers must prove
        // themselves with a fresh heartbeat.
        for server in chunkservers.values_mut() {
            server.alive = false;
        }

        let entries = wal::replay(&wal_path, last_applied)?;
        let replayed = entries.len();
        let file_last = wal::last_sequence_in(&wal_path)?;
        let last_sequence = file_last.max(last_applied);

        let wal = Wal::open(&wal_path, last_sequence)?;

        let mut state = Self {
            config,
            files,
            chunks,
            chunkservers,
            leases: HashMap::new(),
            stale_replicas: HashMap::new(),
            reported_versions: HashMap::new(),
            pending_deletes: HashMap::new(),
            pending_clones: HashMap::new(),
            repl_queue: VecDeque::new(),
            repl_queued: HashSet::new(),
            dead_letters: Vec::new(),
            wal,
        };

        for entry in entries {
            state.apply(entry.timestamp, &entry.op);
        }
        if replayed > 0 {
            info!(replayed, "Replayed WAL entries");
        }

        Ok(state)
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Namespace operations
    // -----------------------------------------------------------------------

    pub fn create_file(&mut self, path: &str) -> Result<()> {
        validate_path(path)?;
        let now = Utc::now();

        match self.files.get(path) {
            Some(f) if !f.deleted => return Err(StrandError::FileExists(path.to_string())),
            Some(_) => self.purge_file(path, now)?,
            None => {}
        }

        self.log_apply(now, WalOp::CreateFile { path: path.to_string() })?;
        info!(path, "Created file");
        Ok(())
    }

    pub fn get_file_info(&self, path: &str) -> Result<(FileMeta, u64)> {
        let file = self.live_file(path)?;
        let size = self.file_size(file);
        Ok((file.clone(), size))
    }

    /// File size derived from its chunks: full chunks plus the last one.
    pub fn file_size(&self, file: &FileMeta) -> u64 {
        match file.chunk_handles.last() {
            None => 0,
            Some(last) => {
                let last_size = self.chunks.get(last).map(|c| c.size).unwrap_or(0);
                (file.chunk_handles.len() as u64 - 1) * self.config.chunk_size + last_size
            }
        }
    }

    pub fn rename_file(&mut self, old: &str, new: &str) -> Result<()> {
        validate_path(new)?;
        self.live_file(old)?;
        let now = Utc::now();

        match self.files.get(new) {
            Some(f) if !f.deleted => return Err(StrandError::FileExists(new.to_string())),
            Some(_) => self.purge_file(new, now)?,
            None => {}
        }

        self.log_apply(now, WalOp::RenameFile { old: old.to_string(), new: new.to_string() })?;
        info!(old, new, "Renamed file");
        Ok(())
    }

    /// Tombstone a file. The path disappears from lookups immediately;
    /// chunks are reclaimed by GC after the retention window.
    pub fn delete_file(&mut self, path: &str) -> Result<()> {
        self.live_file(path)?;
        let now = Utc::now();
        self.log_apply(now, WalOp::DeleteFile { path: path.to_string(), deleted_at: now })?;
        info!(path, "Deleted file (tombstoned)");
        Ok(())
    }

    pub fn list_directory(&self, prefix: &str) -> Result<Vec<String>> {
        let mut prefix = prefix.to_string();
        if !prefix.starts_with('/') {
            return Err(StrandError::InvalidPath(prefix));
        }
        if !prefix.ends_with('/') {
            prefix.push('/');
        }

        let mut paths: Vec<String> = self
            .files
            .values()
            .filter(|f| !f.deleted && f.path.starts_with(&prefix))
            .map(|f| f.path.clone())
            .collect();
        paths.sort();
        Ok(paths)
    }

    /// Copy-on-write snapshot: the destination shares every chunk of the
    /// source; reference counts go up and existing leases are revoked so the
    /// next mutation breaks the share.
    pub fn snapshot_file(&mut self, src: &str, dst: &str) -> Result<()> {
        validate_path(dst)?;
        self.live_file(src)?;
        let now = Utc::now();

        match self.files.get(dst) {
            Some(f) if !f.deleted => return Err(StrandError::FileExists(dst.to_string())),
            Some(_) => self.purge_file(dst, now)?,
            None => {}
        }

        self.log_apply(now, WalOp::SnapshotFile { src: src.to_string(), dst: dst.to_string() })?;
        info!(src, dst, "Snapshotted file");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Chunk operations
    // -----------------------------------------------------------------------

    /// Allocate the chunk at `chunk_index`, or hand back the existing one.
    pub fn allocate_chunk(&mut self, path: &str, chunk_index: usize) -> Result<ChunkGrant> {
        let now = Utc::now();
        let file = self.live_file(path)?;

        if chunk_index < file.chunk_handles.len() {
            let handle = file.chunk_handles[chunk_index];
            return self.chunk_grant(handle, now);
        }
        if chunk_index != file.chunk_handles.len() {
            return Err(StrandError::InvalidArgument(format!(
                "chunk_index {} skips past end of file ({} chunks)",
                chunk_index,
                file.chunk_handles.len()
            )));
        }

        let replicas = placement::choose_replicas(
            &self.chunkservers,
            self.config.replication_factor,
            &HashSet::new(),
        );
        if replicas.is_empty() {
            return Err(StrandError::NoLiveReplicas(path.to_string()));
        }

        let handle = ChunkHandle::new();
        self.log_apply(
            now,
            WalOp::AllocateChunk {
                path: path.to_string(),
                chunk_index,
                handle,
                replicas: replicas.clone(),
            },
        )?;

        if replicas.len() < self.config.replication_factor {
            warn!(
                %handle,
                got = replicas.len(),
                want = self.config.replication_factor,
                "Allocated chunk short of replication factor"
            );
            self.enqueue_replication(handle);
        }

        debug!(%handle, path, chunk_index, "Allocated chunk");
        self.chunk_grant(handle, now)
    }

    /// Locations plus lease for a chunk, granting a fresh lease when needed.
    pub fn chunk_locations(&mut self, handle: ChunkHandle) -> Result<ChunkGrant> {
        let now = Utc::now();
        let grant = self.chunk_grant(handle, now)?;

        let live = self.live_replicas(handle).len();
        if live < self.config.replication_factor {
            self.enqueue_replication(handle);
        }
        Ok(grant)
    }

    fn chunk_grant(&mut self, handle: ChunkHandle, now: DateTime<Utc>) -> Result<ChunkGrant> {
        let ref_count = self
            .chunks
            .get(&handle)
            .ok_or_else(|| StrandError::ChunkNotFound(handle.to_string()))?
            .ref_count;

        // A shared chunk takes no lease and no version bump: replicas learn
        // versions from mutations, and the next mutation must break the
        // share rather than touch these bytes.
        let lease = if ref_count > 1 { None } else { Some(self.ensure_lease(handle, now)?) };

        let chunk = self
            .chunks
            .get(&handle)
            .ok_or_else(|| StrandError::ChunkNotFound(handle.to_string()))?;

        let replicas = chunk
            .replicas
            .iter()
            .filter_map(|id| {
                let s = self.chunkservers.get(id)?;
                s.alive.then(|| ReplicaAddr { id: id.clone(), address: s.address.clone() })
            })
            .collect();

        Ok(ChunkGrant {
            handle,
            replicas,
            primary: lease.as_ref().map(|l| l.primary.clone()),
            lease_expiry: lease.as_ref().map(|l| l.expires),
            version: chunk.version,
            size: chunk.size,
            ref_count: chunk.ref_count,
        })
    }

    /// Grant or renew the lease for a chunk, bumping the version on a fresh
    /// grant. The previous holder keeps the primary role when still eligible.
    fn ensure_lease(&mut self, handle: ChunkHandle, now: DateTime<Utc>) -> Result<LeaseInfo> {
        let chunk = self
            .chunks
            .get(&handle)
            .ok_or_else(|| StrandError::ChunkNotFound(handle.to_string()))?;

        let live: Vec<ServerId> = chunk
            .replicas
            .iter()
            .filter(|id| self.chunkservers.get(*id).map(|s| s.alive).unwrap_or(false))
            .cloned()
            .collect();
        if live.is_empty() {
            return Err(StrandError::NoLiveReplicas(handle.to_string()));
        }

        if let Some(lease) = self.leases.get(&handle) {
            if lease.is_valid(now) && live.contains(&lease.primary) {
                return Ok(lease.clone());
            }
        }

        let previous = self.leases.get(&handle).map(|l| l.primary.clone());
        let primary = previous
            .filter(|p| live.contains(p))
            .unwrap_or_else(|| live[0].clone());

        let version = self.chunks[&handle].version + 1;
        let expires = now
            + ChronoDuration::from_std(self.config.lease_duration)
                .unwrap_or_else(|_| ChronoDuration::seconds(60));

        self.log_apply(now, WalOp::BumpVersion { handle, version })?;
        self.log_apply(now, WalOp::GrantLease { handle, primary: primary.clone(), expires })?;

        debug!(%handle, %primary, version, "Granted lease");
        Ok(LeaseInfo { handle, primary, expires })
    }

    /// Break a copy-on-write share: give `path` its own copy of the chunk at
    /// `chunk_index`, cloned replica-by-replica from the shared one.
    pub fn clone_shared_chunk(
        &mut self,
        path: &str,
        chunk_index: usize,
        old_handle: ChunkHandle,
    ) -> Result<CowBreak> {
        let now = Utc::now();
        let file = self.live_file(path)?;

        if file.chunk_handles.get(chunk_index) != Some(&old_handle) {
            return Err(StrandError::InvalidArgument(format!(
                "chunk_index {} does not hold {}",
                chunk_index, old_handle
            )));
        }

        let old = self
            .chunks
            .get(&old_handle)
            .ok_or_else(|| StrandError::ChunkNotFound(old_handle.to_string()))?;
        if old.ref_count <= 1 {
            // Not shared; the caller can keep writing to the original.
            let grant = self.chunk_grant(old_handle, now)?;
            return Ok(CowBreak { grant, clones: Vec::new() });
        }

        let live: Vec<ServerId> = old
            .replicas
            .iter()
            .filter(|id| self.chunkservers.get(*id).map(|s| s.alive).unwrap_or(false))
            .cloned()
            .collect();
        if live.is_empty() {
            return Err(StrandError::NoLiveReplicas(old_handle.to_string()));
        }
        let source_address = self.chunkservers[&live[0]].address.clone();
        let expected_version = old.version;

        let new_handle = ChunkHandle::new();
        self.log_apply(
            now,
            WalOp::CowClone {
                path: path.to_string(),
                chunk_index,
                old_handle,
                new_handle,
                replicas: live.clone(),
            },
        )?;

        let clones = live
            .iter()
            .map(|id| {
                (
                    self.chunkservers[id].address.clone(),
                    CloneCommand {
                        handle: new_handle,
                        source_address: source_address.clone(),
                        source_handle: old_handle,
                        expected_version,
                    },
                )
            })
            .collect();

        info!(%old_handle, %new_handle, path, chunk_index, "Broke copy-on-write share");
        let grant = self.chunk_grant(new_handle, now)?;
        Ok(CowBreak { grant, clones })
    }

    pub fn update_chunk_size(&mut self, handle: ChunkHandle, size: u64) -> Result<()> {
        let chunk = self
            .chunks
            .get(&handle)
            .ok_or_else(|| StrandError::ChunkNotFound(handle.to_string()))?;
        if size > chunk.size {
            self.log_apply(Utc::now(), WalOp::UpdateChunkSize { handle, size })?;
        }
        Ok(())
    }

    /// A client saw a checksum failure on this replica. Drop it from the
    /// serving set and schedule a replacement.
    pub fn report_bad_replica(&mut self, handle: ChunkHandle, server: &ServerId) -> Result<()> {
        let chunk = self
            .chunks
            .get(&handle)
            .ok_or_else(|| StrandError::ChunkNotFound(handle.to_string()))?;
        if !chunk.replicas.contains(server) {
            return Ok(());
        }

        warn!(%handle, %server, "Client reported bad replica");
        let replicas: Vec<ServerId> =
            chunk.replicas.iter().filter(|r| *r != server).cloned().collect();
        self.log_apply(Utc::now(), WalOp::UpdateReplicas { handle, replicas })?;

        self.pending_deletes.entry(server.clone()).or_default().insert(handle);
        self.enqueue_replication(handle);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Chunkserver operations
    // -----------------------------------------------------------------------

    /// Install or refresh a chunkserver record and reconcile its report.
    /// Returns the chunks the server should delete.
    pub fn register_chunkserver(
        &mut self,
        id: &ServerId,
        address: &str,
        rack_id: &str,
        reports: &[ChunkReport],
    ) -> Result<Vec<ChunkHandle>> {
        let now = Utc::now();
        self.log_apply(
            now,
            WalOp::RegisterChunkServer {
                id: id.clone(),
                address: address.to_string(),
                rack_id: rack_id.to_string(),
            },
        )?;

        let server = self.chunkservers.get_mut(id).expect("registered above");
        server.alive = true;
        server.last_heartbeat = now;

        let deletes = self.reconcile_report(id, reports, now)?;
        info!(%id, address, rack_id, chunks = reports.len(), "Chunkserver registered");
        Ok(deletes)
    }

    /// Process a periodic heartbeat. Returns (deletes, clone commands).
    pub fn heartbeat(
        &mut self,
        id: &ServerId,
        reports: &[ChunkReport],
    ) -> Result<(Vec<ChunkHandle>, Vec<CloneCommand>)> {
        let now = Utc::now();
        let server = self
            .chunkservers
            .get_mut(id)
            .ok_or_else(|| StrandError::ServerNotFound(id.clone()))?;
        server.alive = true;
        server.last_heartbeat = now;

        let deletes = self.reconcile_report(id, reports, now)?;
        let clones = self.pending_clones.remove(id).unwrap_or_default();
        Ok((deletes, clones))
    }

    /// Compare a chunk report against master state: detect stale replicas,
    /// adopt restored ones, pick up size growth, and flag garbage.
    fn reconcile_report(
        &mut self,
        id: &ServerId,
        reports: &[ChunkReport],
        now: DateTime<Utc>,
    ) -> Result<Vec<ChunkHandle>> {
        let mut deletes: Vec<ChunkHandle> = Vec::new();
        let reported: HashSet<ChunkHandle> = reports.iter().map(|r| r.handle).collect();
        let previously: HashSet<ChunkHandle> = self
            .chunkservers
            .get(id)
            .map(|s| s.chunks.clone())
            .unwrap_or_default();

        for report in reports {
            let Some(chunk) = self.chunks.get(&report.handle) else {
                // Nothing in the chunk map wants these bytes.
                deletes.push(report.handle);
                continue;
            };
            if chunk.garbage_since.is_some() {
                continue; // GC owns the schedule for garbage chunks.
            }

            let handle = report.handle;
            if report.version < chunk.version {
                // A replica may legitimately lag while a lease is active: it
                // learns the bumped version from the first mutation message.
                // Only call it stale once the lease is gone AND some peer is
                // known to hold the current version, so a version bump with
                // no mutation behind it can never strand the whole chunk.
                let lease_active = self
                    .leases
                    .get(&handle)
                    .map(|l| l.is_valid(now))
                    .unwrap_or(false);
                let current_exists = self.reported_versions.iter().any(|(other, versions)| {
                    other != id && versions.get(&handle) == Some(&chunk.version)
                });

                if !lease_active && current_exists && chunk.replicas.contains(id) {
                    warn!(%handle, %id, reported = report.version, current = chunk.version,
                        "Stale replica detected");
                    let replicas: Vec<ServerId> =
                        chunk.replicas.iter().filter(|r| *r != id).cloned().collect();
                    self.log_apply(now, WalOp::UpdateReplicas { handle, replicas })?;
                    self.stale_replicas.entry(handle).or_default().insert(id.clone(), now);
                    self.revoke_lease_if_held_by(handle, id);
                    self.enqueue_replication(handle);
                }
                continue;
            }

            if report.version > chunk.version {
                // Reconcile toward the replica set's reality.
                self.log_apply(now, WalOp::BumpVersion { handle, version: report.version })?;
            }

            let chunk = &self.chunks[&handle];
            if !chunk.replicas.contains(id) {
                let mut replicas = chunk.replicas.clone();
                replicas.push(id.clone());
                self.log_apply(now, WalOp::UpdateReplicas { handle, replicas })?;
                self.stale_replicas.get_mut(&handle).map(|m| m.remove(id));
                debug!(%handle, %id, "Replica installed from report");
            }

            if report.size > self.chunks[&handle].size {
                self.log_apply(now, WalOp::UpdateChunkSize { handle, size: report.size })?;
            }
        }

        // Chunks this server reported before but dropped since.
        for handle in previously.difference(&reported) {
            let Some(chunk) = self.chunks.get(handle) else { continue };
            if chunk.replicas.contains(id) {
                warn!(%handle, %id, "Replica vanished from report");
                let replicas: Vec<ServerId> =
                    chunk.replicas.iter().filter(|r| *r != id).cloned().collect();
                let handle = *handle;
                self.log_apply(now, WalOp::UpdateReplicas { handle, replicas })?;
                self.revoke_lease_if_held_by(handle, id);
                self.enqueue_replication(handle);
            }
        }

        if let Some(server) = self.chunkservers.get_mut(id) {
            server.chunks = reported;
        }
        self.reported_versions
            .insert(id.clone(), reports.iter().map(|r| (r.handle, r.version)).collect());

        if let Some(pending) = self.pending_deletes.remove(id) {
            deletes.extend(pending);
        }

        Ok(deletes)
    }

    fn revoke_lease_if_held_by(&mut self, handle: ChunkHandle, id: &ServerId) {
        if self.leases.get(&handle).map(|l| &l.primary == id).unwrap_or(false) {
            self.leases.remove(&handle);
            if let Some(chunk) = self.chunks.get_mut(&handle) {
                chunk.primary = None;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Background maintenance
    // -----------------------------------------------------------------------

    /// Mark servers dead whose heartbeat went silent; queue their chunks.
    pub fn detect_dead(&mut self) -> Vec<ServerId> {
        let now = Utc::now();
        let timeout = ChronoDuration::from_std(self.config.heartbeat_timeout)
            .unwrap_or_else(|_| ChronoDuration::seconds(30));

        let mut died = Vec::new();
        for server in self.chunkservers.values_mut() {
            if server.alive && now - server.last_heartbeat > timeout {
                server.alive = false;
                died.push(server.id.clone());
            }
        }

        for id in &died {
            warn!(%id, "Chunkserver marked dead");
            let held: Vec<ChunkHandle> = self
                .chunks
                .values()
                .filter(|c| c.replicas.contains(id) && c.garbage_since.is_none())
                .map(|c| c.handle)
                .collect();
            for handle in held {
                self.revoke_lease_if_held_by(handle, id);
                if self.live_replicas(handle).len() < self.config.replication_factor {
                    self.enqueue_replication(handle);
                }
            }
        }

        died
    }

    /// Periodic sweep for anything under-replicated, independent of events.
    pub fn scan_under_replicated(&mut self) {
        let under: Vec<ChunkHandle> = self
            .chunks
            .values()
            .filter(|c| c.garbage_since.is_none())
            .map(|c| c.handle)
            .filter(|h| self.live_replicas(*h).len() < self.config.replication_factor)
            .collect();
        for handle in under {
            self.enqueue_replication(handle);
        }
    }

    fn live_replicas(&self, handle: ChunkHandle) -> Vec<ServerId> {
        self.chunks
            .get(&handle)
            .map(|c| {
                c.replicas
                    .iter()
                    .filter(|id| self.chunkservers.get(*id).map(|s| s.alive).unwrap_or(false))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn enqueue_replication(&mut self, handle: ChunkHandle) {
        if self.repl_queued.insert(handle) {
            self.repl_queue.push_back(ReplicationTask {
                handle,
                attempts: 0,
                not_before: Utc::now(),
            });
        }
    }

    /// Pop the next actionable task and turn it into a clone plan.
    pub fn next_replication_plan(&mut self) -> Option<ReplicationPlan> {
        let now = Utc::now();

        for _ in 0..self.repl_queue.len() {
            let task = self.repl_queue.pop_front()?;
            if task.not_before > now {
                self.repl_queue.push_back(task);
                continue;
            }

            let handle = task.handle;
            let Some(chunk) = self.chunks.get(&handle) else {
                self.repl_queued.remove(&handle);
                continue;
            };
            if chunk.garbage_since.is_some()
                || self.live_replicas(handle).len() >= self.config.replication_factor
            {
                self.repl_queued.remove(&handle);
                continue;
            }

            let live = self.live_replicas(handle);
            let Some(source) = live.first() else {
                // No live source yet; retry later without burning an attempt.
                let mut task = task;
                task.not_before = now + ChronoDuration::seconds(2);
                self.repl_queue.push_back(task);
                continue;
            };
            let source_address = self.chunkservers[source].address.clone();

            // Never clone onto a server that still holds a doomed copy of
            // this chunk: a queued delete would wipe the fresh replica.
            let mut exclude = chunk.replicas.clone();
            exclude.extend(
                self.pending_deletes
                    .iter()
                    .filter(|(_, doomed)| doomed.contains(&handle))
                    .map(|(id, _)| id.clone()),
            );
            if let Some(stale) = self.stale_replicas.get(&handle) {
                exclude.extend(stale.keys().cloned());
            }

            let Some(dest) = placement::choose_recovery_target(&self.chunkservers, &exclude)
            else {
                let mut task = task;
                task.not_before = now + ChronoDuration::seconds(2);
                self.repl_queue.push_back(task);
                continue;
            };

            let command = CloneCommand {
                handle,
                source_address,
                source_handle: handle,
                expected_version: chunk.version,
            };
            let dest_address = self.chunkservers[&dest].address.clone();
            self.pending_clones.entry(dest.clone()).or_default().push(command.clone());

            return Some(ReplicationPlan { task, dest, dest_address, command });
        }

        None
    }

    pub fn complete_replication(&mut self, plan: &ReplicationPlan) -> Result<()> {
        let handle = plan.command.handle;
        self.repl_queued.remove(&handle);
        if let Some(cmds) = self.pending_clones.get_mut(&plan.dest) {
            cmds.retain(|c| c.handle != handle);
        }

        if let Some(chunk) = self.chunks.get(&handle) {
            if !chunk.replicas.contains(&plan.dest) {
                let mut replicas = chunk.replicas.clone();
                replicas.push(plan.dest.clone());
                self.log_apply(Utc::now(), WalOp::UpdateReplicas { handle, replicas })?;
            }
            info!(%handle, dest = %plan.dest, "Re-replication complete");
            if self.live_replicas(handle).len() < self.config.replication_factor {
                self.enqueue_replication(handle);
            }
        }
        Ok(())
    }

    pub fn fail_replication(&mut self, plan: ReplicationPlan) {
        let mut task = plan.task;
        task.attempts += 1;
        let handle = task.handle;

        if task.attempts >= MAX_REPLICATION_ATTEMPTS {
            error!(%handle, attempts = task.attempts,
                "Re-replication abandoned after repeated failures; operator attention required");
            self.repl_queued.remove(&handle);
            self.dead_letters.push(handle);
            return;
        }

        // Exponential backoff: 2s, 4s, 8s... capped at 60s.
        let delay = (2u64 << (task.attempts.saturating_sub(1))).min(60);
        task.not_before = Utc::now() + ChronoDuration::seconds(delay as i64);
        warn!(%handle, attempts = task.attempts, delay_s = delay, "Re-replication attempt failed");
        self.repl_queue.push_back(task);
    }

    pub fn dead_letters(&self) -> &[ChunkHandle] {
        &self.dead_letters
    }

    /// One garbage-collection pass: finalize expired tombstones, delete
    /// expired garbage chunks, flush expired stale replicas, and sweep for
    /// orphans.
    pub fn gc_tick(&mut self) -> Result<()> {
        let now = Utc::now();
        let retention = ChronoDuration::from_std(self.config.garbage_retention)
            .unwrap_or_else(|_| ChronoDuration::days(3));

        // Tombstoned files past retention.
        let expired: Vec<String> = self
            .files
            .values()
            .filter(|f| f.deleted && f.deleted_at.map(|t| now - t > retention).unwrap_or(true))
            .map(|f| f.path.clone())
            .collect();
        for path in expired {
            debug!(path, "Finalizing tombstoned file");
            self.purge_file(&path, now)?;
        }

        // Orphan sweep: any chunk no file references should be garbage.
        let referenced: HashSet<ChunkHandle> = self
            .files
            .values()
            .flat_map(|f| f.chunk_handles.iter().copied())
            .collect();
        let orphans: Vec<ChunkHandle> = self
            .chunks
            .values()
            .filter(|c| c.garbage_since.is_none() && !referenced.contains(&c.handle))
            .map(|c| c.handle)
            .collect();
        for handle in orphans {
            self.log_apply(now, WalOp::MarkGarbage { handle, since: now })?;
        }

        // Garbage chunks past retention: out of the map, off the disks.
        let reclaimable: Vec<ChunkHandle> = self
            .chunks
            .values()
            .filter(|c| c.garbage_since.map(|t| now - t > retention).unwrap_or(false))
            .map(|c| c.handle)
            .collect();
        for handle in reclaimable {
            let holders: Vec<ServerId> = self
                .chunkservers
                .values()
                .filter(|s| s.chunks.contains(&handle))
                .map(|s| s.id.clone())
                .chain(self.chunks.get(&handle).map(|c| c.replicas.clone()).unwrap_or_default())
                .collect();
            for id in holders {
                self.pending_deletes.entry(id).or_default().insert(handle);
            }
            self.log_apply(now, WalOp::DeleteChunk { handle })?;
            debug!(%handle, "Chunk reclaimed");
        }

        // Stale replicas past retention.
        let mut flush: Vec<(ChunkHandle, ServerId)> = Vec::new();
        for (handle, servers) in &self.stale_replicas {
            for (id, marked) in servers {
                if now - *marked > retention {
                    flush.push((*handle, id.clone()));
                }
            }
        }
        for (handle, id) in flush {
            self.pending_deletes.entry(id.clone()).or_default().insert(handle);
            if let Some(m) = self.stale_replicas.get_mut(&handle) {
                m.remove(&id);
                if m.is_empty() {
                    self.stale_replicas.remove(&handle);
                }
            }
        }

        Ok(())
    }

    /// Remove a file entry and drop its references, marking chunks that hit
    /// zero as garbage.
    fn purge_file(&mut self, path: &str, now: DateTime<Utc>) -> Result<()> {
        let Some(file) = self.files.get(path) else { return Ok(()) };
        let handles = file.chunk_handles.clone();

        self.log_apply(now, WalOp::PurgeFile { path: path.to_string() })?;

        for handle in handles {
            let zero = self
                .chunks
                .get(&handle)
                .map(|c| c.ref_count == 0 && c.garbage_since.is_none())
                .unwrap_or(false);
            if zero {
                self.log_apply(now, WalOp::MarkGarbage { handle, since: now })?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Serialize the full state to disk and truncate the covered WAL prefix.
    pub fn take_snapshot(&mut self) -> Result<()> {
        let last_applied = self.wal.last_sequence();
        let snapshot = MetaSnapshot {
            last_applied,
            taken_at: Utc::now(),
            files: self.files.clone(),
            chunks: self.chunks.clone(),
            chunkservers: self.chunkservers.clone(),
        };

        snapshot::save(&self.config.snapshot_path(), &snapshot)?;
        self.wal.truncate_through(last_applied)?;
        debug!(last_applied, "Metadata snapshot written");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn files(&self) -> &HashMap<String, FileMeta> {
        &self.files
    }

    pub fn chunks(&self) -> &HashMap<ChunkHandle, ChunkMeta> {
        &self.chunks
    }

    pub fn chunkservers(&self) -> &HashMap<ServerId, ChunkServerInfo> {
        &self.chunkservers
    }

    pub fn under_replicated_count(&self) -> usize {
        self.chunks
            .values()
            .filter(|c| c.garbage_since.is_none())
            .filter(|c| self.live_replicas(c.handle).len() < self.config.replication_factor)
            .count()
    }

    // -----------------------------------------------------------------------
    // WAL plumbing
    // -----------------------------------------------------------------------

    fn log_apply(&mut self, now: DateTime<Utc>, op: WalOp) -> Result<()> {
        self.wal.append(now, op.clone())?;
        self.apply(now, &op);
        Ok(())
    }

    /// Apply one operation to in-memory state. Must stay deterministic in
    /// (timestamp, op): startup replay runs every logged mutation back
    /// through here.
    fn apply(&mut self, ts: DateTime<Utc>, op: &WalOp) {
        match op {
            WalOp::CreateFile { path } => {
                self.files.insert(
                    path.clone(),
                    FileMeta {
                        path: path.clone(),
                        chunk_handles: Vec::new(),
                        created_at: ts,
                        modified_at: ts,
                        deleted: false,
                        deleted_at: None,
                    },
                );
            }
            WalOp::AllocateChunk { path, chunk_index, handle, replicas } => {
                self.chunks.insert(*handle, ChunkMeta::new(*handle, replicas.clone()));
                if let Some(file) = self.files.get_mut(path) {
                    if *chunk_index == file.chunk_handles.len() {
                        file.chunk_handles.push(*handle);
                        file.modified_at = ts;
                    }
                }
            }
            WalOp::BumpVersion { handle, version } => {
                if let Some(chunk) = self.chunks.get_mut(handle) {
                    chunk.version = *version;
                }
            }
            WalOp::GrantLease { handle, primary, expires } => {
                if let Some(chunk) = self.chunks.get_mut(handle) {
                    chunk.primary = Some(primary.clone());
                }
                self.leases.insert(
                    *handle,
                    LeaseInfo { handle: *handle, primary: primary.clone(), expires: *expires },
                );
            }
            WalOp::UpdateChunkSize { handle, size } => {
                if let Some(chunk) = self.chunks.get_mut(handle) {
                    chunk.size = (*size).max(chunk.size);
                }
            }
            WalOp::UpdateReplicas { handle, replicas } => {
                if let Some(chunk) = self.chunks.get_mut(handle) {
                    chunk.replicas = replicas.clone();
                }
            }
            WalOp::SnapshotFile { src, dst } => {
                if let Some(source) = self.files.get(src).cloned() {
                    let handles = source.chunk_handles.clone();
                    self.files.insert(
                        dst.clone(),
                        FileMeta {
                            path: dst.clone(),
                            chunk_handles: handles.clone(),
                            created_at: ts,
                            modified_at: ts,
                            deleted: false,
                            deleted_at: None,
                        },
                    );
                    for handle in handles {
                        if let Some(chunk) = self.chunks.get_mut(&handle) {
                            chunk.ref_count += 1;
                            chunk.primary = None;
                        }
                        self.leases.remove(&handle);
                    }
                }
            }
            WalOp::CowClone { path, chunk_index, old_handle, new_handle, replicas } => {
                if let Some(old) = self.chunks.get_mut(old_handle) {
                    let version = old.version;
                    let size = old.size;
                    old.ref_count = old.ref_count.saturating_sub(1);
                    old.primary = None;

                    self.chunks.insert(
                        *new_handle,
                        ChunkMeta {
                            handle: *new_handle,
                            version,
                            size,
                            replicas: replicas.clone(),
                            primary: None,
                            ref_count: 1,
                            garbage_since: None,
                        },
                    );
                }
                self.leases.remove(old_handle);
                if let Some(file) = self.files.get_mut(path) {
                    if file.chunk_handles.get(*chunk_index) == Some(old_handle) {
                        file.chunk_handles[*chunk_index] = *new_handle;
                        file.modified_at = ts;
                    }
                }
            }
            WalOp::RenameFile { old, new } => {
                if let Some(mut file) = self.files.remove(old) {
                    file.path = new.clone();
                    file.modified_at = ts;
                    self.files.insert(new.clone(), file);
                }
            }
            WalOp::DeleteFile { path, deleted_at } => {
                if let Some(file) = self.files.get_mut(path) {
                    file.deleted = true;
                    file.deleted_at = Some(*deleted_at);
                }
            }
            WalOp::PurgeFile { path } => {
                if let Some(file) = self.files.remove(path) {
                    for handle in file.chunk_handles {
                        if let Some(chunk) = self.chunks.get_mut(&handle) {
                            chunk.ref_count = chunk.ref_count.saturating_sub(1);
                        }
                    }
                }
            }
            WalOp::MarkGarbage { handle, since } => {
                if let Some(chunk) = self.chunks.get_mut(handle) {
                    chunk.garbage_since = Some(*since);
                }
            }
            WalOp::DeleteChunk { handle } => {
                self.chunks.remove(handle);
                self.leases.remove(handle);
            }
            WalOp::RegisterChunkServer { id, address, rack_id } => {
                match self.chunkservers.get_mut(id) {
                    Some(server) => {
                        server.address = address.clone();
                        server.rack_id = rack_id.clone();
                    }
                    None => {
                        let mut info =
                            ChunkServerInfo::new(id.clone(), address.clone(), rack_id.clone());
                        info.alive = false;
                        info.last_heartbeat = ts;
                        self.chunkservers.insert(id.clone(), info);
                    }
                }
            }
        }
    }

    fn live_file(&self, path: &str) -> Result<&FileMeta> {
        self.files
            .get(path)
            .filter(|f| !f.deleted)
            .ok_or_else(|| StrandError::FileNotFound(path.to_string()))
    }
}

/// Paths are absolute, forward-slash-delimited, with non-empty segments.
fn validate_path(path: &str) -> Result<()> {
    let ok = path.len() > 1
        && path.starts_with('/')
        && !path.ends_with('/')
        && !path.contains("//")
        && !path.contains('\0');
    if ok {
        Ok(())
    } else {
        Err(StrandError::InvalidPath(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> MasterConfig {
        MasterConfig {
            metadata_dir: dir.path().to_path_buf(),
            chunk_size: 1024,
            replication_factor: 3,
            garbage_retention: Duration::from_millis(0),
            ..MasterConfig::default()
        }
    }

    fn state_with_servers(dir: &TempDir, n: usize) -> MasterState {
        let mut state = MasterState::recover(test_config(dir)).unwrap();
        for i in 1..=n {
            let id = format!("cs-{}", i);
            state
                .register_chunkserver(&id, &format!("http://127.0.0.1:{}", 7100 + i), &format!("r{}", i), &[])
                .unwrap();
        }
        state
    }

    #[test]
    fn test_create_and_duplicate() {
        let dir = TempDir::new().unwrap();
        let mut state = state_with_servers(&dir, 0);

        state.create_file("/a").unwrap();
        assert!(matches!(state.create_file("/a"), Err(StrandError::FileExists(_))));
        assert!(matches!(state.create_file("no-slash"), Err(StrandError::InvalidPath(_))));
        assert!(matches!(state.create_file("/a//b"), Err(StrandError::InvalidPath(_))));
    }

    #[test]
    fn test_allocate_grants_lease_and_versions() {
        let dir = TempDir::new().unwrap();
        let mut state = state_with_servers(&dir, 3);
        state.create_file("/a").unwrap();

        let grant = state.allocate_chunk("/a", 0).unwrap();
        assert_eq!(grant.replicas.len(), 3);
        assert_eq!(grant.version, 1);
        let primary = grant.primary.clone().expect("fresh chunk carries a lease");
        assert!(grant.replicas.iter().any(|r| r.id == primary));

        // Same index hands back the same chunk and the same unexpired lease.
        let again = state.allocate_chunk("/a", 0).unwrap();
        assert_eq!(again.handle, grant.handle);
        assert_eq!(again.version, 1);

        // Skipping an index is rejected.
        assert!(state.allocate_chunk("/a", 5).is_err());
    }

    #[test]
    fn test_placement_spreads_racks() {
        let dir = TempDir::new().unwrap();
        let mut state = state_with_servers(&dir, 3);
        state.create_file("/a").unwrap();

        let grant = state.allocate_chunk("/a", 0).unwrap();
        let racks: HashSet<String> = grant
            .replicas
            .iter()
            .map(|r| state.chunkservers()[&r.id].rack_id.clone())
            .collect();
        assert_eq!(racks.len(), 3);
    }

    #[test]
    fn test_file_size_derivation() {
        let dir = TempDir::new().unwrap();
        let mut state = state_with_servers(&dir, 3);
        state.create_file("/a").unwrap();

        let g0 = state.allocate_chunk("/a", 0).unwrap();
        let g1 = state.allocate_chunk("/a", 1).unwrap();
        state.update_chunk_size(g0.handle, 1024).unwrap();
        state.update_chunk_size(g1.handle, 100).unwrap();

        let (_, size) = state.get_file_info("/a").unwrap();
        assert_eq!(size, 1024 + 100);
    }

    #[test]
    fn test_stale_replica_removed_on_heartbeat() {
        let dir = TempDir::new().unwrap();
        // Leases expire immediately so staleness is judged outside a lease.
        let mut config = test_config(&dir);
        config.lease_duration = Duration::from_millis(0);
        let mut state = MasterState::recover(config).unwrap();
        for i in 1..=3 {
            let id = format!("cs-{}", i);
            state
                .register_chunkserver(&id, &format!("http://h{}:1", i), &format!("r{}", i), &[])
                .unwrap();
        }
        state.create_file("/a").unwrap();
        let grant = state.allocate_chunk("/a", 0).unwrap();
        let handle = grant.handle;
        let current = grant.version;

        // A peer proves the current version exists before cs-1 lags behind.
        state
            .heartbeat(&"cs-2".to_string(), &[ChunkReport { handle, version: current, size: 0 }])
            .unwrap();
        state
            .heartbeat(&"cs-1".to_string(), &[ChunkReport { handle, version: 0, size: 0 }])
            .unwrap();

        let chunk = &state.chunks()[&handle];
        assert!(!chunk.replicas.contains(&"cs-1".to_string()));

        // A current report brings it back.
        let fresh = ChunkReport { handle, version: chunk.version, size: 0 };
        state.heartbeat(&"cs-1".to_string(), &[fresh]).unwrap();
        assert!(state.chunks()[&handle].replicas.contains(&"cs-1".to_string()));
    }

    #[test]
    fn test_lagging_replica_spared_without_current_peer() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.lease_duration = Duration::from_millis(0);
        let mut state = MasterState::recover(config).unwrap();
        for i in 1..=3 {
            let id = format!("cs-{}", i);
            state
                .register_chunkserver(&id, &format!("http://h{}:1", i), "r1", &[])
                .unwrap();
        }
        state.create_file("/a").unwrap();
        let grant = state.allocate_chunk("/a", 0).unwrap();
        let handle = grant.handle;

        // Every replica lags (a lease was granted but no mutation landed).
        // Nobody may be declared stale or the chunk would be stranded.
        state
            .heartbeat(&"cs-1".to_string(), &[ChunkReport { handle, version: 0, size: 0 }])
            .unwrap();
        state
            .heartbeat(&"cs-2".to_string(), &[ChunkReport { handle, version: 0, size: 0 }])
            .unwrap();

        let chunk = &state.chunks()[&handle];
        assert!(chunk.replicas.contains(&"cs-1".to_string()));
        assert!(chunk.replicas.contains(&"cs-2".to_string()));
    }

    #[test]
    fn test_unknown_chunk_report_is_deleted() {
        let dir = TempDir::new().unwrap();
        let mut state = state_with_servers(&dir, 1);

        let ghost = ChunkHandle::new();
        let (deletes, _) = state
            .heartbeat(&"cs-1".to_string(), &[ChunkReport { handle: ghost, version: 1, size: 0 }])
            .unwrap();
        assert_eq!(deletes, vec![ghost]);
    }

    #[test]
    fn test_dead_detection_enqueues_replication() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.heartbeat_timeout = Duration::from_millis(0);
        let mut state = MasterState::recover(config).unwrap();
        for i in 1..=3 {
            let id = format!("cs-{}", i);
            state
                .register_chunkserver(&id, &format!("http://h{}:1", i), "r1", &[])
                .unwrap();
        }
        state.create_file("/a").unwrap();
        let grant = state.allocate_chunk("/a", 0).unwrap();

        // Every heartbeat is now "too old".
        let died = state.detect_dead();
        assert_eq!(died.len(), 3);

        // Revive two of them so a plan can form.
        state.heartbeat(&"cs-1".to_string(), &[]).unwrap();
        state.heartbeat(&"cs-2".to_string(), &[]).unwrap();
        assert!(state.under_replicated_count() >= 1);
        let _ = grant;
    }

    #[test]
    fn test_replication_plan_and_backoff() {
        let dir = TempDir::new().unwrap();
        let mut state = state_with_servers(&dir, 4);
        state.create_file("/a").unwrap();
        let grant = state.allocate_chunk("/a", 0).unwrap();
        let handle = grant.handle;

        // Drop one replica so the chunk is under-replicated.
        let victim = grant.replicas[0].id.clone();
        state.report_bad_replica(handle, &victim).unwrap();

        let plan = state.next_replication_plan().expect("plan");
        assert_eq!(plan.command.handle, handle);
        assert_ne!(plan.dest, victim.clone());
        assert!(!state.chunks()[&handle].replicas.contains(&plan.dest));

        // Failure path: the task backs off instead of spinning.
        state.fail_replication(plan);
        assert!(state.next_replication_plan().is_none());
    }

    #[test]
    fn test_replication_dead_letter_after_max_attempts() {
        let dir = TempDir::new().unwrap();
        let mut state = state_with_servers(&dir, 4);
        state.create_file("/a").unwrap();
        let grant = state.allocate_chunk("/a", 0).unwrap();
        let victim = grant.replicas[0].id.clone();
        state.report_bad_replica(grant.handle, &victim).unwrap();

        let mut failures = 0;
        for _ in 0..MAX_REPLICATION_ATTEMPTS {
            // Force the task due.
            if let Some(front) = state.repl_queue.front_mut() {
                front.not_before = Utc::now() - ChronoDuration::seconds(1);
            }
            let plan = state.next_replication_plan().expect("plan");
            state.fail_replication(plan);
            failures += 1;
        }
        assert_eq!(failures, MAX_REPLICATION_ATTEMPTS);
        assert_eq!(state.dead_letters(), &[grant.handle]);
    }

    #[test]
    fn test_complete_replication_installs_replica() {
        let dir = TempDir::new().unwrap();
        let mut state = state_with_servers(&dir, 4);
        state.create_file("/a").unwrap();
        let grant = state.allocate_chunk("/a", 0).unwrap();
        let victim = grant.replicas[0].id.clone();
        state.report_bad_replica(grant.handle, &victim).unwrap();

        let plan = state.next_replication_plan().expect("plan");
        let dest = plan.dest.clone();
        state.complete_replication(&plan).unwrap();
        assert!(state.chunks()[&grant.handle].replicas.contains(&dest));
    }

    #[test]
    fn test_snapshot_cow_refcounts_and_lease_revocation() {
        let dir = TempDir::new().unwrap();
        let mut state = state_with_servers(&dir, 3);
        state.create_file("/orig").unwrap();
        let grant = state.allocate_chunk("/orig", 0).unwrap();

        state.snapshot_file("/orig", "/snap").unwrap();
        let chunk = &state.chunks()[&grant.handle];
        assert_eq!(chunk.ref_count, 2);
        assert!(chunk.primary.is_none());

        // Breaking the share gives /orig a fresh chunk and drops the count.
        let cow = state.clone_shared_chunk("/orig", 0, grant.handle).unwrap();
        assert_ne!(cow.grant.handle, grant.handle);
        assert_eq!(cow.clones.len(), 3);
        assert_eq!(state.chunks()[&grant.handle].ref_count, 1);
        assert_eq!(state.chunks()[&cow.grant.handle].ref_count, 1);

        let (orig, _) = state.get_file_info("/orig").unwrap();
        assert_eq!(orig.chunk_handles[0], cow.grant.handle);
        let (snap, _) = state.get_file_info("/snap").unwrap();
        assert_eq!(snap.chunk_handles[0], grant.handle);
    }

    #[test]
    fn test_clone_shared_on_unshared_chunk_is_noop() {
        let dir = TempDir::new().unwrap();
        let mut state = state_with_servers(&dir, 3);
        state.create_file("/a").unwrap();
        let grant = state.allocate_chunk("/a", 0).unwrap();

        let cow = state.clone_shared_chunk("/a", 0, grant.handle).unwrap();
        assert_eq!(cow.grant.handle, grant.handle);
        assert!(cow.clones.is_empty());
    }

    #[test]
    fn test_delete_tombstone_then_gc() {
        let dir = TempDir::new().unwrap();
        let mut state = state_with_servers(&dir, 3);
        state.create_file("/a").unwrap();
        let grant = state.allocate_chunk("/a", 0).unwrap();

        state.delete_file("/a").unwrap();
        assert!(matches!(state.get_file_info("/a"), Err(StrandError::FileNotFound(_))));
        assert!(state.list_directory("/").unwrap().is_empty());

        // Retention is zero in the test config: the first pass finalizes the
        // tombstone and marks the chunk garbage, the second reclaims it.
        state.gc_tick().unwrap();
        assert!(state.files().is_empty());
        assert!(state.chunks()[&grant.handle].garbage_since.is_some());

        std::thread::sleep(Duration::from_millis(5));
        state.gc_tick().unwrap();
        assert!(!state.chunks().contains_key(&grant.handle));

        // Physical deletion is delivered via heartbeat.
        let replica = grant.replicas[0].id.clone();
        let (deletes, _) = state.heartbeat(&replica, &[]).unwrap();
        assert!(deletes.contains(&grant.handle));
    }

    #[test]
    fn test_delete_spares_snapshot_shared_chunks() {
        let dir = TempDir::new().unwrap();
        let mut state = state_with_servers(&dir, 3);
        state.create_file("/orig").unwrap();
        let grant = state.allocate_chunk("/orig", 0).unwrap();
        state.snapshot_file("/orig", "/snap").unwrap();

        state.delete_file("/orig").unwrap();
        state.gc_tick().unwrap();

        // Still referenced by /snap: one reference left, no garbage mark.
        let chunk = &state.chunks()[&grant.handle];
        assert_eq!(chunk.ref_count, 1);
        assert!(chunk.garbage_since.is_none());
    }

    #[test]
    fn test_rename_moves_entry() {
        let dir = TempDir::new().unwrap();
        let mut state = state_with_servers(&dir, 3);
        state.create_file("/a").unwrap();
        state.rename_file("/a", "/b").unwrap();

        assert!(state.get_file_info("/a").is_err());
        assert!(state.get_file_info("/b").is_ok());
        assert!(matches!(state.rename_file("/missing", "/c"), Err(StrandError::FileNotFound(_))));
    }

    #[test]
    fn test_list_directory_prefix() {
        let dir = TempDir::new().unwrap();
        let mut state = state_with_servers(&dir, 0);
        state.create_file("/logs/a").unwrap();
        state.create_file("/logs/b").unwrap();
        state.create_file("/data/c").unwrap();

        assert_eq!(state.list_directory("/logs").unwrap(), vec!["/logs/a", "/logs/b"]);
        assert_eq!(state.list_directory("/").unwrap().len(), 3);
    }

    #[test]
    fn test_recovery_equals_original_state() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let (files, chunks) = {
            let mut state = MasterState::recover(config.clone()).unwrap();
            for i in 1..=3 {
                let id = format!("cs-{}", i);
                state
                    .register_chunkserver(&id, &format!("http://h{}:1", i), &format!("r{}", i), &[])
                    .unwrap();
            }
            state.create_file("/a").unwrap();
            let g = state.allocate_chunk("/a", 0).unwrap();
            state.update_chunk_size(g.handle, 77).unwrap();
            state.create_file("/b").unwrap();
            state.rename_file("/b", "/c").unwrap();
            state.snapshot_file("/a", "/a.snap").unwrap();
            (state.files().clone(), state.chunks().clone())
        };

        let recovered = MasterState::recover(config).unwrap();
        assert_eq!(recovered.files().len(), files.len());
        for (path, file) in &files {
            let r = &recovered.files()[path];
            assert_eq!(r.chunk_handles, file.chunk_handles);
            assert_eq!(r.deleted, file.deleted);
        }
        assert_eq!(recovered.chunks().len(), chunks.len());
        for (handle, chunk) in &chunks {
            let r = &recovered.chunks()[handle];
            assert_eq!(r.version, chunk.version);
            assert_eq!(r.size, chunk.size);
            assert_eq!(r.replicas, chunk.replicas);
            assert_eq!(r.ref_count, chunk.ref_count);
        }
    }

    #[test]
    fn test_recovery_after_snapshot_and_more_ops() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let expected = {
            let mut state = MasterState::recover(config.clone()).unwrap();
            for i in 1..=3 {
                let id = format!("cs-{}", i);
                state
                    .register_chunkserver(&id, &format!("http://h{}:1", i), "r1", &[])
                    .unwrap();
            }
            state.create_file("/a").unwrap();
            state.take_snapshot().unwrap();
            // Ops after the snapshot live only in the WAL suffix.
            state.create_file("/b").unwrap();
            state.allocate_chunk("/b", 0).unwrap();
            state.files().clone()
        };

        let recovered = MasterState::recover(config).unwrap();
        assert_eq!(recovered.files().len(), expected.len());
        assert!(recovered.files().contains_key("/a"));
        assert!(recovered.files().contains_key("/b"));
        assert_eq!(recovered.files()["/b"].chunk_handles.len(), 1);
    }

    #[test]
    fn test_chunkservers_not_trusted_alive_after_recovery() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        {
            let mut state = MasterState::recover(config.clone()).unwrap();
            state
                .register_chunkserver(&"cs-1".to_string(), "http://h:1", "r1", &[])
                .unwrap();
            state.take_snapshot().unwrap();
        }

        let recovered = MasterState::recover(config).unwrap();
        assert!(!recovered.chunkservers()["cs-1"].alive);
    }
}
