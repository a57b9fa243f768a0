use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use pbft_core::error::PbftError;
use pbft_core::orchestrator::{run_agreement, AgreementConfig};
use pbft_core::transport::Shaping;

/// Runs one PBFT agreement round among `n` replicas and reports how long
/// the client waited for quorum.
#[derive(Debug, Parser)]
struct Cli {
    /// Number of replicas to start.
    #[arg(short, long, default_value_t = 4)]
    n: usize,

    /// Message content the client submits as its single request.
    #[arg(short, long, default_value = "hello pbft")]
    content: String,

    /// Address the client binds to receive replies on.
    #[arg(long, default_value = "127.0.0.1:9000")]
    client_addr: SocketAddr,

    /// Directory holding (or to generate) the `Keys/` tree.
    #[arg(long, default_value = "./pbft-data")]
    base_dir: PathBuf,

    /// Simulated link bandwidth, in Mbps. Omit for no shaping.
    #[arg(long)]
    bandwidth_mbps: Option<f64>,

    /// Simulated mean one-way latency, in milliseconds. Omit for no shaping.
    #[arg(long)]
    mean_latency_ms: Option<u64>,
}

fn main() -> Result<(), PbftError> {
    pbft_core::logging::init();
    let cli = Cli::parse();

    let shaping = match (cli.bandwidth_mbps, cli.mean_latency_ms) {
        (None, None) => None,
        (bandwidth, latency) => Some(Shaping {
            bandwidth_bytes_per_second: bandwidth.map_or(0, mbps_to_bytes_per_second),
            mean_latency_ms: latency.unwrap_or(0),
        }),
    };

    let config = AgreementConfig {
        n: cli.n,
        content: cli.content,
        client_addr: cli.client_addr,
        base_dir: cli.base_dir,
        shaping,
    };

    let runtime = tokio::runtime::Runtime::new()?;
    let elapsed = runtime.block_on(run_agreement(config))?;
    println!("agreement reached in {elapsed:.6}s");
    Ok(())
}

/// Matches the original artifact's `bandwidth * 1024 * 1024 / 8` conversion
/// from megabits/second to bytes/second.
fn mbps_to_bytes_per_second(mbps: f64) -> u64 {
    (mbps * 1024.0 * 1024.0 / 8.0) as u64
}
