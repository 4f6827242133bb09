//! Master crash-recovery: the state after a restart must equal the state
//! just before the crash, from the WAL alone or from snapshot plus WAL
//! suffix, and a corrupt log must abort startup with a diagnostic.

use std::io::Write;
use std::time::Duration;
use strand::config::MasterConfig;
use strand::master::state::MasterState;
use strand::types::ChunkReport;
use strand::StrandError;
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> MasterConfig {
    MasterConfig {
        metadata_dir: dir.path().to_path_buf(),
        chunk_size: 1024,
        replication_factor: 3,
        garbage_retention: Duration::from_secs(3600),
        ..MasterConfig::default()
    }
}

fn populate(state: &mut MasterState) {
    for i in 1..=3 {
        let id = format!("cs-{}", i);
        state
            .register_chunkserver(&id, &format!("http://127.0.0.1:{}", 9000 + i), &format!("r{}", i), &[])
            .unwrap();
    }

    state.create_file("/docs/report").unwrap();
    let g0 = state.allocate_chunk("/docs/report", 0).unwrap();
    state.update_chunk_size(g0.handle, 512).unwrap();
    let g1 = state.allocate_chunk("/docs/report", 1).unwrap();
    state.update_chunk_size(g1.handle, 40).unwrap();

    state.create_file("/docs/scratch").unwrap();
    state.rename_file("/docs/scratch", "/docs/notes").unwrap();

    state.snapshot_file("/docs/report", "/docs/report.snap").unwrap();

    state.create_file("/tmp/junk").unwrap();
    state.delete_file("/tmp/junk").unwrap();

    // A heartbeat that installs replica state and grows a chunk.
    state
        .heartbeat(
            &"cs-1".to_string(),
            &[ChunkReport { handle: g0.handle, version: 1, size: 600 }],
        )
        .unwrap();
}

fn assert_states_equal(a: &MasterState, b: &MasterState) {
    assert_eq!(a.files().len(), b.files().len(), "file count differs");
    for (path, file) in a.files() {
        let other = b.files().get(path).unwrap_or_else(|| panic!("missing file {}", path));
        assert_eq!(other.chunk_handles, file.chunk_handles, "chunks differ for {}", path);
        assert_eq!(other.deleted, file.deleted, "tombstone differs for {}", path);
    }

    assert_eq!(a.chunks().len(), b.chunks().len(), "chunk count differs");
    for (handle, chunk) in a.chunks() {
        let other = b.chunks().get(handle).unwrap_or_else(|| panic!("missing chunk {}", handle));
        assert_eq!(other.version, chunk.version, "version differs for {}", handle);
        assert_eq!(other.size, chunk.size, "size differs for {}", handle);
        assert_eq!(other.replicas, chunk.replicas, "replicas differ for {}", handle);
        assert_eq!(other.ref_count, chunk.ref_count, "ref_count differs for {}", handle);
    }

    assert_eq!(a.chunkservers().len(), b.chunkservers().len());
}

#[test]
fn recovery_from_wal_alone() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    let original = {
        let mut state = MasterState::recover(config.clone()).unwrap();
        populate(&mut state);
        state
    };

    // The snapshot file was never written; this restart replays the full
    // log, exactly the "snapshot deleted" scenario.
    assert!(!config.snapshot_path().exists());
    let recovered = MasterState::recover(config).unwrap();

    assert_states_equal(&original, &recovered);
}

#[test]
fn recovery_from_snapshot_plus_wal_suffix() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    let original = {
        let mut state = MasterState::recover(config.clone()).unwrap();
        populate(&mut state);
        state.take_snapshot().unwrap();

        // Mutations after the snapshot live only in the WAL suffix.
        state.create_file("/after/snapshot").unwrap();
        state.allocate_chunk("/after/snapshot", 0).unwrap();
        state
    };

    assert!(config.snapshot_path().exists());
    let recovered = MasterState::recover(config).unwrap();

    assert_states_equal(&original, &recovered);
    assert!(recovered.files().contains_key("/after/snapshot"));
}

#[test]
fn repeated_restarts_are_stable() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    {
        let mut state = MasterState::recover(config.clone()).unwrap();
        populate(&mut state);
    }

    let first = MasterState::recover(config.clone()).unwrap();
    drop(first);
    let second = MasterState::recover(config.clone()).unwrap();
    let third = MasterState::recover(config).unwrap();

    assert_states_equal(&second, &third);
}

#[test]
fn corrupt_wal_aborts_startup() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    {
        let mut state = MasterState::recover(config.clone()).unwrap();
        state.create_file("/a").unwrap();
        state.create_file("/b").unwrap();
    }

    // Truncate the last line mid-entry.
    let wal_path = config.wal_path();
    let contents = std::fs::read_to_string(&wal_path).unwrap();
    let cut = contents.len() - 10;
    let mut file = std::fs::File::create(&wal_path).unwrap();
    file.write_all(contents[..cut].as_bytes()).unwrap();

    match MasterState::recover(config) {
        Err(StrandError::WalCorrupt { sequence, .. }) => {
            assert_eq!(sequence, 2, "diagnostic should name the bad entry");
        }
        other => panic!("expected WalCorrupt, got {:?}", other.map(|_| ())),
    }
}
