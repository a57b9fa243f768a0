//! The replica state machine: pre-prepare, prepare, commit, reply, run
//! against a single fixed view with `N0` as the permanent primary.
//!
//! Every handler below runs synchronously under `inner`'s lock and returns
//! the list of messages that need to go out; the caller drops the lock and
//! only then spawns the actual I/O. `std::sync::Mutex` cannot be held
//! across an `.await` point, so this split is forced, not stylistic.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::codec::{self, Tag};
use crate::common::{self, Digest, NodeTable, ReplicaId, Request};
use crate::crypto;
use crate::keys::KeyDirectory;
use crate::transport::Shaping;

#[derive(Default)]
struct Inner {
    seq: u64,
    message_pool: HashMap<Digest, Request>,
    prepare_tally: HashMap<Digest, HashSet<ReplicaId>>,
    commit_tally: HashMap<Digest, HashSet<ReplicaId>>,
    commit_broadcast: HashSet<Digest>,
    replied: HashSet<Digest>,
    temp_prepare: Vec<codec::Prepare>,
    temp_commit: Vec<codec::Commit>,
    local_log: Vec<Digest>,
}

enum Outbound {
    Broadcast(Tag, Vec<u8>),
    ReplyToClient(String, Vec<u8>),
}

pub struct Replica {
    pub id: ReplicaId,
    n: usize,
    node_table: NodeTable,
    keys: Arc<KeyDirectory>,
    shaping: Option<Shaping>,
    inner: Mutex<Inner>,
}

impl Replica {
    pub fn new(
        id: ReplicaId,
        n: usize,
        node_table: NodeTable,
        keys: Arc<KeyDirectory>,
        shaping: Option<Shaping>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            n,
            node_table,
            keys,
            shaping,
            inner: Mutex::new(Inner::default()),
        })
    }

    fn is_primary(&self) -> bool {
        self.id == common::replica_id(0)
    }

    /// The primary never sends itself a Prepare, so it needs `floor(2n/3)`
    /// received from others; every other replica needs one fewer, since
    /// its own (unsent, unrecorded) Prepare is implicitly counted.
    fn prepare_threshold(&self) -> usize {
        let base = (2 * self.n) / 3;
        if self.is_primary() {
            base
        } else {
            base.saturating_sub(1)
        }
    }

    fn commit_threshold(&self) -> usize {
        (2 * self.n) / 3
    }

    /// Entry point for every frame read off an accepted connection.
    pub async fn deliver(self: &Arc<Self>, frame: Vec<u8>) {
        let Some((tag, body)) = codec::parse_frame(&frame) else {
            warn!(replica = %self.id, "dropping frame with unrecognized tag");
            return;
        };
        let actions = match tag {
            Tag::Request => self.handle_client_request(body),
            Tag::PrePrepare => self.handle_pre_prepare(body),
            Tag::Prepare => self.handle_prepare(body),
            Tag::Commit => self.handle_commit(body),
        };
        self.dispatch(actions);
    }

    fn handle_client_request(self: &Arc<Self>, body: &[u8]) -> Vec<Outbound> {
        if !self.is_primary() {
            warn!(replica = %self.id, "ignoring client request received at a non-primary");
            return Vec::new();
        }
        let request: Request = match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(err) => {
                warn!(%err, "malformed client request");
                return Vec::new();
            }
        };

        let digest = common::digest(&request);
        let (sequence, mut actions) = {
            let mut inner = self.inner.lock().unwrap();
            let sequence = inner.seq + 1;
            inner.seq = sequence;
            inner.message_pool.insert(digest, request.clone());
            let actions = self.drain_temp_pools_locked(&mut inner);
            (sequence, actions)
        };

        let signature = crypto::sign(&digest, self.keys.private_key());
        let pre_prepare = codec::PrePrepare {
            request,
            digest: common::digest_hex(&digest),
            sequence,
            signature,
        };
        let wire_body = serde_json::to_vec(&pre_prepare).expect("PrePrepare always serializes");
        let frame = codec::build_frame(Tag::PrePrepare, &wire_body);
        actions.push(Outbound::Broadcast(Tag::PrePrepare, frame));
        actions
    }

    fn handle_pre_prepare(self: &Arc<Self>, body: &[u8]) -> Vec<Outbound> {
        let pre_prepare: codec::PrePrepare = match serde_json::from_slice(body) {
            Ok(pre_prepare) => pre_prepare,
            Err(err) => {
                warn!(%err, "malformed pre-prepare");
                return Vec::new();
            }
        };
        self.process_pre_prepare(pre_prepare)
    }

    /// Handles a PrePrepare received over the wire. The primary never takes
    /// this path for its own request — it broadcasts to everyone else and
    /// updates its own state directly in `handle_client_request`.
    fn process_pre_prepare(self: &Arc<Self>, pre_prepare: codec::PrePrepare) -> Vec<Outbound> {
        let Some(digest) = codec::decode_digest(&pre_prepare.digest) else {
            warn!(replica = %self.id, "pre-prepare carries a malformed digest");
            return Vec::new();
        };
        if common::digest(&pre_prepare.request) != digest {
            warn!(replica = %self.id, "pre-prepare digest does not match its request");
            return Vec::new();
        }
        let primary_key = self.keys.public_key(&common::replica_id(0));
        if !crypto::verify(&digest, &pre_prepare.signature, &primary_key) {
            warn!(replica = %self.id, "pre-prepare signature does not verify");
            return Vec::new();
        }

        let mut inner = self.inner.lock().unwrap();
        if pre_prepare.sequence != inner.seq + 1 {
            warn!(
                replica = %self.id,
                expected = inner.seq + 1,
                got = pre_prepare.sequence,
                "pre-prepare sequence number does not match, refusing to broadcast prepare"
            );
            return Vec::new();
        }
        inner.seq = pre_prepare.sequence;
        inner.message_pool.insert(digest, pre_prepare.request.clone());

        let mut actions = Vec::new();
        let signature = crypto::sign(&digest, self.keys.private_key());
        let prepare = codec::Prepare {
            digest: pre_prepare.digest.clone(),
            sequence: pre_prepare.sequence,
            sender_id: self.id.clone(),
            signature,
        };
        let wire_body = serde_json::to_vec(&prepare).expect("Prepare always serializes");
        actions.push(Outbound::Broadcast(Tag::Prepare, codec::build_frame(Tag::Prepare, &wire_body)));

        actions.extend(self.drain_temp_pools_locked(&mut inner));
        actions
    }

    fn handle_prepare(self: &Arc<Self>, body: &[u8]) -> Vec<Outbound> {
        let prepare: codec::Prepare = match serde_json::from_slice(body) {
            Ok(prepare) => prepare,
            Err(err) => {
                warn!(%err, "malformed prepare");
                return Vec::new();
            }
        };
        let Some(digest) = codec::decode_digest(&prepare.digest) else {
            warn!(replica = %self.id, "prepare carries a malformed digest");
            return Vec::new();
        };

        let mut inner = self.inner.lock().unwrap();
        if !inner.message_pool.contains_key(&digest) {
            inner.temp_prepare.push(prepare);
            return Vec::new();
        }
        self.handle_prepare_locked(&mut inner, prepare, digest)
    }

    fn handle_prepare_locked(&self, inner: &mut Inner, prepare: codec::Prepare, digest: Digest) -> Vec<Outbound> {
        if prepare.sequence != inner.seq {
            warn!(
                replica = %self.id,
                expected = inner.seq,
                got = prepare.sequence,
                "prepare sequence number does not match, refusing to execute commit broadcast"
            );
            return Vec::new();
        }
        let sender_key = self.keys.public_key(&prepare.sender_id);
        if !crypto::verify(&digest, &prepare.signature, &sender_key) {
            warn!(replica = %self.id, sender = %prepare.sender_id, "prepare signature does not verify");
            return Vec::new();
        }
        inner.prepare_tally.entry(digest).or_default().insert(prepare.sender_id);

        let mut actions = Vec::new();
        let tally_len = inner.prepare_tally.get(&digest).map_or(0, HashSet::len);
        if tally_len >= self.prepare_threshold() && !inner.commit_broadcast.contains(&digest) {
            let signature = crypto::sign(&digest, self.keys.private_key());
            let commit = codec::Commit {
                digest: common::digest_hex(&digest),
                sequence: prepare.sequence,
                sender_id: self.id.clone(),
                signature,
            };
            inner.commit_broadcast.insert(digest);
            let wire_body = serde_json::to_vec(&commit).expect("Commit always serializes");
            actions.push(Outbound::Broadcast(Tag::Commit, codec::build_frame(Tag::Commit, &wire_body)));
            actions.extend(self.maybe_reply_locked(inner, digest));
        }
        actions
    }

    fn handle_commit(self: &Arc<Self>, body: &[u8]) -> Vec<Outbound> {
        let commit: codec::Commit = match serde_json::from_slice(body) {
            Ok(commit) => commit,
            Err(err) => {
                warn!(%err, "malformed commit");
                return Vec::new();
            }
        };
        let Some(digest) = codec::decode_digest(&commit.digest) else {
            warn!(replica = %self.id, "commit carries a malformed digest");
            return Vec::new();
        };

        let mut inner = self.inner.lock().unwrap();
        if !inner.prepare_tally.contains_key(&digest) {
            inner.temp_commit.push(commit);
            return Vec::new();
        }
        self.handle_commit_locked(&mut inner, commit, digest)
    }

    fn handle_commit_locked(&self, inner: &mut Inner, commit: codec::Commit, digest: Digest) -> Vec<Outbound> {
        if commit.sequence != inner.seq {
            warn!(
                replica = %self.id,
                expected = inner.seq,
                got = commit.sequence,
                "commit sequence number does not match, refusing to persist to the local log"
            );
            return Vec::new();
        }
        let sender_key = self.keys.public_key(&commit.sender_id);
        if !crypto::verify(&digest, &commit.signature, &sender_key) {
            warn!(replica = %self.id, sender = %commit.sender_id, "commit signature does not verify");
            return Vec::new();
        }
        inner.commit_tally.entry(digest).or_default().insert(commit.sender_id);
        self.maybe_reply_locked(inner, digest)
    }

    /// Replies at most once per digest, and only once the commit gate — a
    /// broadcast commit of our own, plus quorum on the commit tally — is
    /// satisfied.
    fn maybe_reply_locked(&self, inner: &mut Inner, digest: Digest) -> Vec<Outbound> {
        if inner.replied.contains(&digest) || !inner.commit_broadcast.contains(&digest) {
            return Vec::new();
        }
        let tally_len = inner.commit_tally.get(&digest).map_or(0, HashSet::len);
        if tally_len < self.commit_threshold() {
            return Vec::new();
        }
        let Some(request) = inner.message_pool.get(&digest) else {
            return Vec::new();
        };
        inner.replied.insert(digest);
        inner.local_log.push(digest);

        let text = format!(
            "{} node has put msgid:{} into the local message pool, message content：{}",
            self.id, request.message.id, request.message.content
        );
        vec![Outbound::ReplyToClient(request.client_addr.clone(), text.into_bytes())]
    }

    /// Re-delivers every queued Prepare/Commit whose digest has since
    /// become known, in FIFO order, through the normal locked handlers.
    /// Entries whose digest is still unknown go back on the queue.
    fn drain_temp_pools_locked(&self, inner: &mut Inner) -> Vec<Outbound> {
        let mut actions = Vec::new();

        let queued_prepares = std::mem::take(&mut inner.temp_prepare);
        for prepare in queued_prepares {
            match codec::decode_digest(&prepare.digest) {
                Some(digest) if inner.message_pool.contains_key(&digest) => {
                    actions.extend(self.handle_prepare_locked(inner, prepare, digest));
                }
                _ => inner.temp_prepare.push(prepare),
            }
        }

        let queued_commits = std::mem::take(&mut inner.temp_commit);
        for commit in queued_commits {
            match codec::decode_digest(&commit.digest) {
                Some(digest) if inner.prepare_tally.contains_key(&digest) => {
                    actions.extend(self.handle_commit_locked(inner, commit, digest));
                }
                _ => inner.temp_commit.push(commit),
            }
        }

        actions
    }

    fn dispatch(self: &Arc<Self>, actions: Vec<Outbound>) {
        for action in actions {
            match action {
                Outbound::Broadcast(tag, frame) => {
                    for (peer_id, addr) in self.node_table.clone() {
                        if peer_id == self.id {
                            continue;
                        }
                        let frame = frame.clone();
                        let shaping = self.shaping;
                        tokio::spawn(async move {
                            if let Err(err) = crate::transport::connect_and_send(addr, frame, shaping.as_ref()).await {
                                warn!(%err, peer = %peer_id, ?tag, "failed to deliver message");
                            }
                        });
                    }
                }
                Outbound::ReplyToClient(client_addr, body) => {
                    let shaping = self.shaping;
                    tokio::spawn(async move {
                        let Ok(addr) = client_addr.parse() else {
                            warn!(%client_addr, "malformed client address in reply");
                            return;
                        };
                        if let Err(err) = crate::transport::connect_and_send(addr, body, shaping.as_ref()).await {
                            warn!(%err, %client_addr, "failed to deliver reply");
                        }
                    });
                }
            }
        }
    }
}
