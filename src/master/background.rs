//! The master's background workers: failure detection, re-replication,
//! garbage collection, and periodic metadata snapshots.
//!
//! Each worker is one task looping on a `tokio::time::interval`, taking the
//! master lock per tick and doing its network I/O outside it.

use crate::master::MasterNode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Clone RPCs issued per replication tick.
const CLONES_PER_TICK: usize = 4;

/// Spawn every background worker. They stop when `shutdown` fires.
pub fn spawn_all(node: Arc<MasterNode>, shutdown: &broadcast::Sender<()>) {
    tokio::spawn(failure_detector(node.clone(), shutdown.subscribe()));
    tokio::spawn(re_replicator(node.clone(), shutdown.subscribe()));
    tokio::spawn(garbage_collector(node.clone(), shutdown.subscribe()));
    tokio::spawn(snapshotter(node, shutdown.subscribe()));
}

/// Scan for chunkservers whose heartbeat went silent.
async fn failure_detector(node: Arc<MasterNode>, mut shutdown: broadcast::Receiver<()>) {
    let period = node.master_config().failure_scan_interval;
    let mut interval = tokio::time::interval(period);
    info!(period_s = period.as_secs_f64(), "Failure detector starting");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let result = node.with_state(|s| {
                    let died = s.detect_dead();
                    s.scan_under_replicated();
                    Ok(died)
                });
                if let Ok(died) = result {
                    for id in died {
                        warn!(%id, "Chunkserver timed out");
                    }
                }
            }
            _ = shutdown.recv() => {
                info!("Failure detector shutting down");
                break;
            }
        }
    }
}

/// Drain the re-replication queue by driving clone RPCs to destinations.
async fn re_replicator(node: Arc<MasterNode>, mut shutdown: broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                for _ in 0..CLONES_PER_TICK {
                    let plan = match node.with_state(|s| Ok(s.next_replication_plan())) {
                        Ok(Some(plan)) => plan,
                        _ => break,
                    };

                    let handle = plan.command.handle;
                    debug!(%handle, dest = %plan.dest, "Issuing clone for re-replication");

                    match node.send_clone(&plan.dest_address, &plan.command).await {
                        Ok(()) => {
                            let _ = node.with_state(|s| s.complete_replication(&plan));
                        }
                        Err(e) => {
                            warn!(%handle, dest = %plan.dest, error = %e, "Clone RPC failed");
                            let _ = node.with_state(|s| {
                                s.fail_replication(plan);
                                Ok(())
                            });
                            break;
                        }
                    }
                }
            }
            _ = shutdown.recv() => {
                info!("Re-replicator shutting down");
                break;
            }
        }
    }
}

/// Reclaim tombstoned files, expired garbage chunks, and stale replicas.
async fn garbage_collector(node: Arc<MasterNode>, mut shutdown: broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(node.master_config().gc_interval);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = node.with_state(|s| s.gc_tick()) {
                    warn!(error = %e, "Garbage collection pass failed");
                }
            }
            _ = shutdown.recv() => {
                info!("Garbage collector shutting down");
                break;
            }
        }
    }
}

/// Periodically serialize the metadata and truncate the covered WAL prefix.
async fn snapshotter(node: Arc<MasterNode>, mut shutdown: broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(node.master_config().snapshot_interval);
    // The immediate first tick would snapshot an empty master.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = node.with_state(|s| s.take_snapshot()) {
                    warn!(error = %e, "Metadata snapshot failed");
                }
            }
            _ = shutdown.recv() => {
                info!("Snapshotter shutting down; taking final snapshot");
                let _ = node.with_state(|s| s.take_snapshot());
                break;
            }
        }
    }
}
