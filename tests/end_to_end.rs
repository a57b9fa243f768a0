//! End-to-end scenarios driven over real TCP sockets on localhost.
//!
//! Every scenario here binds the fixed replica address range
//! (`127.0.0.1:8000..`) and the fixed client address (`127.0.0.1:9000`), so
//! these tests cannot run concurrently with each other. Run this file with
//! `cargo test --test end_to_end -- --test-threads=1`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use pbft_core::codec::{self, Tag};
use pbft_core::common::{self, build_node_table, Message, NodeTable, Request};
use pbft_core::keys::{self, KeyDirectory};
use pbft_core::orchestrator::{run_agreement, AgreementConfig};
use pbft_core::pbft::Replica;
use pbft_core::{client, transport};

struct TempDir(PathBuf);

impl TempDir {
    fn new(label: &str) -> Self {
        let path = std::env::temp_dir().join(format!(
            "pbft-core-e2e-{label}-{}",
            rand_suffix()
        ));
        std::fs::create_dir_all(&path).unwrap();
        Self(path)
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

fn rand_suffix() -> u64 {
    use rand::Rng;
    rand::thread_rng().gen()
}

/// Binds and spawns replicas for every index in `active`, out of a total
/// population of `n`. Indices outside `active` are simply never started,
/// simulating a silent/crashed replica.
async fn spawn_replicas(n: usize, active: &[usize], base_dir: &Path) -> NodeTable {
    keys::bootstrap(base_dir, n).unwrap();
    let node_table = build_node_table(n);

    for &index in active {
        let id = common::replica_id(index);
        let addr = common::replica_addr(index);
        let key_dir = Arc::new(KeyDirectory::load(base_dir, &id).unwrap());
        let replica = Replica::new(id, n, node_table.clone(), key_dir, None);

        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    continue;
                };
                let replica = Arc::clone(&replica);
                tokio::spawn(async move {
                    if let Ok(frame) = transport::read_frame(&mut stream).await {
                        replica.deliver(frame).await;
                    }
                });
            }
        });
    }

    node_table
}

fn client_addr() -> std::net::SocketAddr {
    "127.0.0.1:9000".parse().unwrap()
}

#[tokio::test]
async fn single_request_reaches_quorum_with_all_replicas_up() {
    let dir = TempDir::new("single");
    let config = AgreementConfig {
        n: 4,
        content: "hello pbft".to_string(),
        client_addr: client_addr(),
        base_dir: dir.path().to_path_buf(),
        shaping: None,
    };
    let elapsed = run_agreement(config).await.unwrap();
    assert!(elapsed >= 0.0);
}

#[tokio::test]
async fn quorum_survives_one_silent_replica_at_n_equals_four() {
    let dir = TempDir::new("silent-one");
    let node_table = spawn_replicas(4, &[0, 1, 2], dir.path()).await;
    client::run(&node_table, 4, "partial quorum", client_addr(), None).await.unwrap();
}

#[tokio::test]
async fn quorum_survives_two_silent_replicas_at_n_equals_seven() {
    let dir = TempDir::new("silent-two");
    let node_table = spawn_replicas(7, &[0, 1, 2, 3, 4], dir.path()).await;
    client::run(&node_table, 7, "tolerating two faults", client_addr(), None).await.unwrap();
}

#[tokio::test]
async fn two_sequential_requests_each_commit() {
    let dir = TempDir::new("sequential");
    let node_table = spawn_replicas(4, &[0, 1, 2, 3], dir.path()).await;

    client::run(&node_table, 4, "first request", client_addr(), None).await.unwrap();
    client::run(&node_table, 4, "second request", client_addr(), None).await.unwrap();
}

#[tokio::test]
async fn forged_pre_prepare_signature_never_propagates_to_prepare() {
    let dir = TempDir::new("forged");
    let n = 4;
    keys::bootstrap(dir.path(), n).unwrap();
    let node_table = build_node_table(n);

    // N2 stands in as an observer: if N1 were fooled by the forged
    // pre-prepare it would broadcast a Prepare that lands here.
    let observer_addr = *node_table.get(&common::replica_id(2)).unwrap();
    let observer = tokio::net::TcpListener::bind(observer_addr).await.unwrap();

    let n1_keys = Arc::new(KeyDirectory::load(dir.path(), &common::replica_id(1)).unwrap());
    let n1 = Replica::new(common::replica_id(1), n, node_table.clone(), n1_keys, None);

    let request = Request {
        message: Message { content: "attack".into(), id: 42 },
        timestamp: 0,
        client_addr: "127.0.0.1:9001".into(),
    };
    let digest = common::digest(&request);

    // Signed with N3's key, not N0's: a forged pre-prepare.
    let impostor_keys = KeyDirectory::load(dir.path(), &common::replica_id(3)).unwrap();
    let signature = pbft_core::crypto::sign(&digest, impostor_keys.private_key());
    let pre_prepare = codec::PrePrepare {
        request,
        digest: common::digest_hex(&digest),
        sequence: 1,
        signature,
    };
    let frame = codec::build_frame(Tag::PrePrepare, &serde_json::to_vec(&pre_prepare).unwrap());

    n1.deliver(frame).await;

    let accept_result = tokio::time::timeout(Duration::from_millis(200), observer.accept()).await;
    assert!(accept_result.is_err(), "N1 should not have broadcast a Prepare for a forged pre-prepare");
}
