//! Shared request/digest types and small node-table helpers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// Identifies a replica, e.g. `"N0"`. The primary is always `N0`.
pub type ReplicaId = String;

/// replica id -> listen address.
pub type NodeTable = HashMap<ReplicaId, SocketAddr>;

/// 32-byte SHA-256 digest over a [`Request`]'s canonical encoding.
pub type Digest = [u8; 32];

pub fn replica_id(index: usize) -> ReplicaId {
    format!("N{index}")
}

/// `127.0.0.1:(8000+i)`, per the fixed address scheme.
pub fn replica_addr(index: usize) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8000 + index as u16))
}

pub fn build_node_table(n: usize) -> NodeTable {
    (0..n).map(|i| (replica_id(i), replica_addr(i))).collect()
}

/// The payload a client submits, and the only part of a [`Request`] that
/// ends up in a replica's committed log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub content: String,
    pub id: u64,
}

/// `{ content, id, timestamp, client_address }`. Immutable once formed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub message: Message,
    pub timestamp: i64,
    pub client_addr: String,
}

/// SHA-256 over the JSON encoding of `request`. Deterministic for identical
/// field values: serde's derive always serializes fields in declaration
/// order, so two replicas holding byte-identical requests compute the same
/// digest.
pub fn digest(request: &Request) -> Digest {
    let bytes = serde_json::to_vec(request).expect("Request always serializes");
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hasher.finalize().into()
}

pub fn digest_hex(digest: &Digest) -> String {
    hex::encode(digest)
}

pub fn decode_digest_hex(hex_digest: &str) -> Option<Digest> {
    let bytes = hex::decode(hex_digest).ok()?;
    bytes.try_into().ok()
}

/// A ten-digit client-chosen nonce, uniform over `[10^9, 10^10)`.
pub fn random_request_id() -> u64 {
    use rand::Rng;
    rand::thread_rng().gen_range(1_000_000_000..10_000_000_000)
}

pub fn monotonic_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the epoch")
        .as_nanos() as i64
}
