//! Wires together the key directory, the per-replica listeners, and the
//! client coordinator for one end-to-end agreement round.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::info;

use crate::client;
use crate::common::{self, build_node_table};
use crate::error::PbftError;
use crate::keys::{self, KeyDirectory};
use crate::pbft::Replica;
use crate::transport::{self, Shaping};

pub struct AgreementConfig {
    pub n: usize,
    pub content: String,
    pub client_addr: SocketAddr,
    pub base_dir: PathBuf,
    pub shaping: Option<Shaping>,
}

/// Spawns `n` replica listeners, waits for all of them to be bound, then
/// drives a single client request to quorum. Returns the wall-clock time,
/// in seconds, the client coordinator spent from dispatch to quorum.
pub async fn run_agreement(config: AgreementConfig) -> Result<f64, PbftError> {
    keys::bootstrap(&config.base_dir, config.n)?;
    let node_table = build_node_table(config.n);

    let (ready_tx, mut ready_rx) = mpsc::channel::<()>(config.n.max(1));

    for index in 0..config.n {
        let id = common::replica_id(index);
        let addr = common::replica_addr(index);
        let key_dir = Arc::new(KeyDirectory::load(&config.base_dir, &id)?);
        let replica = Replica::new(id, config.n, node_table.clone(), key_dir, config.shaping);

        let listener = TcpListener::bind(addr).await?;
        let ready_tx = ready_tx.clone();
        tokio::spawn(async move {
            let _ = ready_tx.send(()).await;
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
    drop(ready_tx);

    for _ in 0..config.n {
        ready_rx.recv().await;
    }

    info!(n = config.n, "all replicas bound, dispatching client request");

    let started = Instant::now();
    client::run(&node_table, config.n, &config.content, config.client_addr, config.shaping).await?;
    Ok(started.elapsed().as_secs_f64())
}
