//! Wire framing: `tag[12] || json_body`. One message per TCP connection;
//! EOF delimits the body, so no length prefix is needed.

use serde::{Deserialize, Serialize};

use crate::common::{Digest, ReplicaId, Request};

const TAG_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Request,
    PrePrepare,
    Prepare,
    Commit,
}

impl Tag {
    fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::PrePrepare => "preprepare",
            Self::Prepare => "prepare",
            Self::Commit => "commit",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "request" => Some(Self::Request),
            "preprepare" => Some(Self::PrePrepare),
            "prepare" => Some(Self::Prepare),
            "commit" => Some(Self::Commit),
            _ => None,
        }
    }
}

/// Right-pads `tag` with zero bytes to 12 and appends `body`.
pub fn build_frame(tag: Tag, body: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; TAG_LEN];
    let tag_bytes = tag.as_str().as_bytes();
    frame[..tag_bytes.len()].copy_from_slice(tag_bytes);
    frame.extend_from_slice(body);
    frame
}

/// Trims trailing zero bytes from the tag field, then looks it up. Returns
/// `None` on a too-short frame or an unrecognized tag; the caller drops the
/// message silently in either case.
pub fn parse_frame(frame: &[u8]) -> Option<(Tag, &[u8])> {
    if frame.len() < TAG_LEN {
        return None;
    }
    let (tag_field, body) = frame.split_at(TAG_LEN);
    let trimmed_len = tag_field.iter().take_while(|&&b| b != 0).count();
    let tag_str = std::str::from_utf8(&tag_field[..trimmed_len]).ok()?;
    Some((Tag::from_str(tag_str)?, body))
}

/// `{ request, digest, sequence, signature }`. Signature is over `digest`
/// with the primary's private key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrePrepare {
    pub request: Request,
    pub digest: String,
    pub sequence: u64,
    pub signature: Vec<u8>,
}

/// `{ digest, sequence, sender_id, signature }`, shared shape for Prepare
/// and Commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prepare {
    pub digest: String,
    pub sequence: u64,
    pub sender_id: ReplicaId,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub digest: String,
    pub sequence: u64,
    pub sender_id: ReplicaId,
    pub signature: Vec<u8>,
}

pub fn decode_digest(hex_digest: &str) -> Option<Digest> {
    crate::common::decode_digest_hex(hex_digest)
}
