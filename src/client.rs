//! The client coordinator: a single closed-loop request against the
//! primary, waiting for a replica quorum before returning.

use std::net::SocketAddr;

use tracing::info;

use crate::codec::{self, Tag};
use crate::common::{self, Message, NodeTable, Request};
use crate::error::PbftError;
use crate::transport::{self, Shaping};

/// Binds a reply listener, sends one [`Request`] carrying `content` to the
/// primary, and returns once more than `floor(2n/3)` replicas have replied.
/// Reply bodies are opaque — only their count matters.
pub async fn run(
    node_table: &NodeTable,
    n: usize,
    content: &str,
    client_addr: SocketAddr,
    shaping: Option<Shaping>,
) -> Result<(), PbftError> {
    let listener = tokio::net::TcpListener::bind(client_addr).await?;

    let request = Request {
        message: Message {
            content: content.to_string(),
            id: common::random_request_id(),
        },
        timestamp: common::monotonic_nanos(),
        client_addr: client_addr.to_string(),
    };

    let primary = *node_table
        .get(&common::replica_id(0))
        .expect("node table always contains the primary");
    let wire_body = serde_json::to_vec(&request).expect("Request always serializes");
    let frame = codec::build_frame(Tag::Request, &wire_body);
    transport::connect_and_send(primary, frame, shaping.as_ref()).await?;

    let quorum = (2 * n) / 3;
    let mut replies = 0usize;

    loop {
        let (mut stream, _) = listener.accept().await?;
        if transport::read_frame(&mut stream).await.is_ok() {
            replies += 1;
            info!(replies, quorum, "received reply");
            if replies > quorum {
                break;
            }
        }
    }

    Ok(())
}
