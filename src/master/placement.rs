//! Replica placement for chunk allocation and re-replication.
//!
//! The same rule applies in both situations: choose distinct alive servers,
//! never two on one rack while unused racks remain, prefer the servers
//! holding the fewest chunks, and break ties by server id so a given cluster
//! state always produces the same placement.

use crate::types::{ChunkServerInfo, ServerId};
use std::collections::{HashMap, HashSet};

/// Choose up to `count` replica targets.
///
/// Returns fewer than `count` ids when the cluster cannot satisfy the
/// request; the caller decides whether a short set is acceptable.
pub fn choose_replicas(
    servers: &HashMap<ServerId, ChunkServerInfo>,
    count: usize,
    exclude: &HashSet<ServerId>,
) -> Vec<ServerId> {
    let mut candidates: Vec<&ChunkServerInfo> = servers
        .values()
        .filter(|s| s.alive && !exclude.contains(&s.id))
        .collect();

    // Fewest chunks first, then id for determinism.
    candidates.sort_by(|a, b| {
        (a.chunks.len(), &a.id).cmp(&(b.chunks.len(), &b.id))
    });

    let mut chosen: Vec<ServerId> = Vec::with_capacity(count);
    let mut used_racks: HashSet<&str> = exclude
        .iter()
        .filter_map(|id| servers.get(id))
        .map(|s| s.rack_id.as_str())
        .collect();
    let mut taken: HashSet<&str> = HashSet::new();

    // First pass: one replica per rack.
    for server in &candidates {
        if chosen.len() >= count {
            break;
        }
        if !used_racks.contains(server.rack_id.as_str()) {
            chosen.push(server.id.clone());
            used_racks.insert(server.rack_id.as_str());
            taken.insert(server.id.as_str());
        }
    }

    // Second pass: racks exhausted, fill with the remaining best candidates.
    for server in &candidates {
        if chosen.len() >= count {
            break;
        }
        if !taken.contains(server.id.as_str()) {
            chosen.push(server.id.clone());
            taken.insert(server.id.as_str());
        }
    }

    chosen
}

/// Choose one destination for re-replication, excluding existing replicas.
pub fn choose_recovery_target(
    servers: &HashMap<ServerId, ChunkServerInfo>,
    existing: &[ServerId],
) -> Option<ServerId> {
    let exclude: HashSet<ServerId> = existing.iter().cloned().collect();
    choose_replicas(servers, 1, &exclude).into_iter().next()
}
