//! Connection-oriented transport: one message per TCP connection. The
//! writer dials, writes the full frame, and half-closes; the reader reads
//! to EOF. No length prefix — EOF is the only delimiter.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Optional bandwidth throttling and latency jitter, applied uniformly to
/// every connection a replica or client opens. `0` in either field means
/// "unshaped" for that dimension.
#[derive(Debug, Clone, Copy)]
pub struct Shaping {
    pub bandwidth_bytes_per_second: u64,
    pub mean_latency_ms: u64,
}

impl Shaping {
    /// Sleeps a uniformly random duration in `[0.1 * mean, mean]` ms before
    /// the connection is opened, standing in for network latency.
    async fn jitter(&self) {
        if self.mean_latency_ms == 0 {
            return;
        }
        let low = ((self.mean_latency_ms as f64) * 0.1).round() as u64;
        let high = self.mean_latency_ms.max(low + 1);
        let millis = rand::thread_rng().gen_range(low..=high);
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }

    /// Writes `body` in chunks sized to a tenth of a second's worth of
    /// bandwidth, sleeping 100ms between chunks.
    async fn write_throttled(&self, stream: &mut TcpStream, body: &[u8]) -> io::Result<()> {
        if self.bandwidth_bytes_per_second == 0 {
            stream.write_all(body).await?;
            return Ok(());
        }
        let chunk_size = (self.bandwidth_bytes_per_second / 10).max(1) as usize;
        for chunk in body.chunks(chunk_size) {
            stream.write_all(chunk).await?;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(())
    }
}

/// Dials `addr`, writes `frame`, then half-closes the write side. Used for
/// every outbound replica-to-replica and replica-to-client message.
pub async fn connect_and_send(
    addr: SocketAddr,
    frame: Vec<u8>,
    shaping: Option<&Shaping>,
) -> io::Result<()> {
    if let Some(shaping) = shaping {
        shaping.jitter().await;
    }
    let mut stream = TcpStream::connect(addr).await?;
    match shaping {
        Some(shaping) => shaping.write_throttled(&mut stream, &frame).await?,
        None => stream.write_all(&frame).await?,
    }
    stream.shutdown().await?;
    Ok(())
}

/// Reads a full message from an accepted connection. The sender always
/// half-closes after its last byte, so EOF is the frame boundary.
pub async fn read_frame(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    Ok(buf)
}
