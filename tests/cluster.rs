//! End-to-end scenarios: a master and several chunkservers on loopback
//! listeners, driven through the real client over HTTP.

use std::sync::Arc;
use std::time::Duration;
use strand::chunkserver::{self, ChunkServerNode};
use strand::client::StrandClient;
use strand::config::StrandConfig;
use strand::master::{self, MasterNode};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

struct TestChunkServer {
    id: String,
    node: Arc<ChunkServerNode>,
    server_task: JoinHandle<()>,
    heartbeat_task: JoinHandle<()>,
}

impl TestChunkServer {
    fn kill(&self) {
        self.server_task.abort();
        self.heartbeat_task.abort();
    }
}

struct TestCluster {
    config: StrandConfig,
    master_addr: String,
    master: Arc<MasterNode>,
    chunkservers: Vec<TestChunkServer>,
    _shutdown: broadcast::Sender<()>,
    _dirs: Vec<TempDir>,
}

impl TestCluster {
    fn client(&self) -> StrandClient {
        StrandClient::new(&self.master_addr, &self.config)
    }

    fn live_replica_count(&self, handle: strand::ChunkHandle) -> usize {
        self.master
            .with_state(|s| {
                let Some(chunk) = s.chunks().get(&handle) else { return Ok(0) };
                Ok(chunk
                    .replicas
                    .iter()
                    .filter(|id| s.chunkservers().get(*id).map(|c| c.alive).unwrap_or(false))
                    .count())
            })
            .unwrap_or(0)
    }
}

fn base_config(chunk_size: u64) -> StrandConfig {
    let mut config = StrandConfig::development();
    config.master.chunk_size = chunk_size;
    config.master.replication_factor = 3;
    config.master.heartbeat_timeout = Duration::from_millis(1500);
    config.master.failure_scan_interval = Duration::from_millis(250);
    config.master.gc_interval = Duration::from_millis(500);
    config.master.snapshot_interval = Duration::from_secs(300);
    config.master.garbage_retention = Duration::from_secs(3600);
    config.chunkserver.heartbeat_interval = Duration::from_millis(250);
    config.network.retry_budget = 4;
    config.network.retry_backoff = Duration::from_millis(100);
    config
}

async fn start_cluster(chunkservers: usize, chunk_size: u64) -> TestCluster {
    let mut dirs = Vec::new();
    let (shutdown_tx, _) = broadcast::channel(1);

    // Master on an ephemeral port.
    let master_dir = TempDir::new().unwrap();
    let mut config = base_config(chunk_size);
    config.master.metadata_dir = master_dir.path().to_path_buf();
    dirs.push(master_dir);

    let master_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let master_sockaddr = master_listener.local_addr().unwrap();
    let master_addr = format!("http://{}", master_sockaddr);
    config.master.bind_addr = master_sockaddr;
    config.chunkserver.master_addr = master_addr.clone();

    let master = MasterNode::new(config.clone()).unwrap();
    master::background::spawn_all(master.clone(), &shutdown_tx);
    {
        let app = master::server::router(master.clone());
        tokio::spawn(async move {
            axum::serve(master_listener, app).await.unwrap();
        });
    }

    // Chunkservers, each in its own rack.
    let mut nodes = Vec::new();
    for i in 1..=chunkservers {
        let data_dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let sockaddr = listener.local_addr().unwrap();

        let mut cs_config = config.clone();
        cs_config.node.id = format!("cs-{}", i);
        cs_config.node.rack_id = format!("rack-{}", i);
        cs_config.chunkserver.bind_addr = sockaddr;
        cs_config.chunkserver.advertise_addr = Some(format!("http://{}", sockaddr));
        cs_config.chunkserver.data_dir = data_dir.path().to_path_buf();
        dirs.push(data_dir);

        let node = ChunkServerNode::new(&cs_config).unwrap();

        let app = chunkserver::server::router(node.clone());
        let server_task = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let heartbeat_task = tokio::spawn(chunkserver::heartbeat_loop(
            node.clone(),
            cs_config.node.rack_id.clone(),
            shutdown_tx.subscribe(),
        ));

        nodes.push(TestChunkServer {
            id: cs_config.node.id.clone(),
            node,
            server_task,
            heartbeat_task,
        });
    }

    let cluster = TestCluster {
        config,
        master_addr,
        master,
        chunkservers: nodes,
        _shutdown: shutdown_tx,
        _dirs: dirs,
    };

    // Wait until every chunkserver registered and is considered alive.
    wait_until(Duration::from_secs(10), || {
        cluster
            .master
            .with_state(|s| Ok(s.chunkservers().values().filter(|c| c.alive).count()))
            .unwrap_or(0)
            == chunkservers
    })
    .await;

    cluster
}

async fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) {
    let start = std::time::Instant::now();
    while !condition() {
        if start.elapsed() > deadline {
            panic!("condition not met within {:?}", deadline);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn wait_for_size(client: &StrandClient, path: &str, expected: u64) {
    let start = std::time::Instant::now();
    loop {
        if let Ok(info) = client.get_file_info(path).await {
            if info.size == expected {
                return;
            }
        }
        if start.elapsed() > Duration::from_secs(10) {
            panic!("{} never reached size {}", path, expected);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn create_write_read_roundtrip() {
    let cluster = start_cluster(3, 1 << 20).await;
    let client = cluster.client();

    client.create_file("/a").await.unwrap();
    client.write("/a", 0, b"Hola, GFS!").await.unwrap();

    let read = client.read("/a", 0, 10).await.unwrap();
    assert_eq!(&read, b"Hola, GFS!");

    // Creating the same path again is refused.
    assert!(client.create_file("/a").await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_spanning_chunk_boundary() {
    let chunk_size = 1u64 << 20;
    let cluster = start_cluster(3, chunk_size).await;
    let client = cluster.client();

    let mut payload = vec![b'A'; chunk_size as usize];
    payload.extend(vec![b'B'; (chunk_size / 2) as usize]);

    client.create_file("/big").await.unwrap();
    client.write("/big", 0, &payload).await.unwrap();

    wait_for_size(&client, "/big", chunk_size + chunk_size / 2).await;
    let info = client.get_file_info("/big").await.unwrap();
    assert_eq!(info.chunk_handles.len(), 2, "boundary write must produce two chunks");

    let first = client.read("/big", 0, chunk_size).await.unwrap();
    assert_eq!(first.len(), chunk_size as usize);
    assert!(first.iter().all(|b| *b == b'A'));

    let second = client.read("/big", chunk_size, chunk_size / 2).await.unwrap();
    assert_eq!(second.len(), (chunk_size / 2) as usize);
    assert!(second.iter().all(|b| *b == b'B'));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_appends_are_atomic() {
    let cluster = start_cluster(3, 1 << 20).await;
    let client = cluster.client();

    client.create_file("/log").await.unwrap();

    let mut tasks = Vec::new();
    for i in 1..=20 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let record = format!("R{}\n", i);
            client.append("/log", record.as_bytes()).await
        }));
    }

    for task in tasks {
        task.await.unwrap().expect("append should succeed");
    }

    let info = client.get_file_info("/log").await.unwrap();
    let contents = client.read("/log", 0, info.size).await.unwrap();
    let text = String::from_utf8_lossy(&contents);

    for i in 1..=20 {
        let record = format!("R{}\n", i);
        assert!(
            text.contains(&record),
            "record {:?} missing from appended log",
            record
        );
    }

    // Anything that is not part of a record must be zero padding.
    assert!(
        contents.iter().all(|b| *b == 0 || b"R0123456789\n".contains(b)),
        "log contains bytes that are neither records nor zero padding"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn record_too_large_is_rejected() {
    let cluster = start_cluster(3, 1 << 20).await;
    let client = cluster.client();

    client.create_file("/log").await.unwrap();
    let oversized = vec![0u8; (1usize << 20) / 4 + 1];
    assert!(client.append("/log", &oversized).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn chunkserver_loss_heals_replication() {
    // Four servers, replication factor three: room to heal.
    let cluster = start_cluster(4, 1 << 20).await;
    let client = cluster.client();

    client.create_file("/x").await.unwrap();
    client.write("/x", 0, b"resilient bytes").await.unwrap();

    let info = client.get_file_info("/x").await.unwrap();
    let handle = info.chunk_handles[0];
    assert_eq!(cluster.live_replica_count(handle), 3);

    // Kill one of the replica holders.
    let replicas = cluster
        .master
        .with_state(|s| Ok(s.chunks()[&handle].replicas.clone()))
        .unwrap();
    let victim = cluster
        .chunkservers
        .iter()
        .find(|cs| replicas.contains(&cs.id))
        .expect("a replica holder is running");
    victim.kill();

    // Reads keep working throughout.
    let read = client.read("/x", 0, 15).await.unwrap();
    assert_eq!(&read, b"resilient bytes");

    // Within heartbeat timeout + detection + clone time the replica count
    // returns to the replication factor.
    let deadline = Duration::from_secs(30);
    let start = std::time::Instant::now();
    loop {
        if cluster.live_replica_count(handle) >= 3 {
            break;
        }
        if start.elapsed() > deadline {
            panic!("replication never healed");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let read = client.read("/x", 0, 15).await.unwrap();
    assert_eq!(&read, b"resilient bytes");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn snapshot_is_copy_on_write() {
    let cluster = start_cluster(3, 1 << 20).await;
    let client = cluster.client();

    client.create_file("/orig").await.unwrap();
    client.write("/orig", 0, b"v1").await.unwrap();

    client.snapshot_file("/orig", "/snap").await.unwrap();

    // Writing the original breaks the share; the snapshot keeps v1.
    client.write("/orig", 0, b"v2").await.unwrap();

    let orig = client.read("/orig", 0, 2).await.unwrap();
    assert_eq!(&orig, b"v2");
    let snap = client.read("/snap", 0, 2).await.unwrap();
    assert_eq!(&snap, b"v1");

    // The two files now reference different chunks.
    let orig_info = client.get_file_info("/orig").await.unwrap();
    let snap_info = client.get_file_info("/snap").await.unwrap();
    assert_ne!(orig_info.chunk_handles[0], snap_info.chunk_handles[0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rename_and_delete_flow() {
    let cluster = start_cluster(3, 1 << 20).await;
    let client = cluster.client();

    client.create_file("/one").await.unwrap();
    client.write("/one", 0, b"payload").await.unwrap();

    client.rename_file("/one", "/two").await.unwrap();
    assert!(client.get_file_info("/one").await.is_err());
    let read = client.read("/two", 0, 7).await.unwrap();
    assert_eq!(&read, b"payload");

    client.delete_file("/two").await.unwrap();
    assert!(client.get_file_info("/two").await.is_err());
    assert!(client.list_directory("/").await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn listing_reflects_namespace() {
    let cluster = start_cluster(3, 1 << 20).await;
    let client = cluster.client();

    client.create_file("/logs/app").await.unwrap();
    client.create_file("/logs/db").await.unwrap();
    client.create_file("/data/blob").await.unwrap();

    let logs = client.list_directory("/logs").await.unwrap();
    assert_eq!(logs, vec!["/logs/app".to_string(), "/logs/db".to_string()]);

    let all = client.list_directory("/").await.unwrap();
    assert_eq!(all.len(), 3);

    // Unused cluster handle keeps the chunkservers alive for the duration.
    assert_eq!(cluster.chunkservers.len(), 3);
    let _ = &cluster.chunkservers[0].node;
}
