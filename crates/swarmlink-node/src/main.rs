//! Swarmlink node binary.
//!
//! # Usage
//!
//! ```bash
//! # Default self-test: 4 workers, XX handshake, snapshot logged only
//! swarmlink-node
//!
//! # Heavier run, IK handshake with key rotation, snapshot written as CBOR
//! swarmlink-node --workers 16 --iterations 50000 --pattern IK \
//!     --rekey-interval 1000 --snapshot swarm.cbor
//! ```

use std::{
    fs::File,
    io::{BufWriter, Write},
    time::Duration,
};

use clap::Parser;
use swarmlink_crypto::{ChannelConfig, HandshakePattern};
use swarmlink_node::{NodeConfig, run_swarm};
use swarmlink_shm::WatchdogConfig;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Swarmlink node
#[derive(Parser, Debug)]
#[command(name = "swarmlink-node")]
#[command(about = "Swarmlink loopback self-test and stat snapshot publisher")]
#[command(version)]
struct Args {
    /// Node name recorded in the snapshot
    #[arg(long, default_value = "swarmlink-node")]
    name: String,

    /// Worker threads sharing the memory system
    #[arg(short, long, default_value = "4")]
    workers: usize,

    /// Operations per worker
    #[arg(short, long, default_value = "1000")]
    iterations: usize,

    /// Work queue capacity
    #[arg(long, default_value = "64")]
    ring_capacity: usize,

    /// Ping round trips over the secure channel
    #[arg(short, long, default_value = "100")]
    messages: usize,

    /// Handshake pattern (NN, NK, NX, KK, XX, IK, IX)
    #[arg(short, long, default_value = "XX")]
    pattern: HandshakePattern,

    /// Transport padding block in bytes (0 disables padding)
    #[arg(long, default_value = "64")]
    padding_block: usize,

    /// Rotate keys after this many messages per direction
    #[arg(long)]
    rekey_interval: Option<u64>,

    /// Watchdog scan period in milliseconds
    #[arg(long, default_value = "50")]
    poll_interval_ms: u64,

    /// Locks held longer than this many milliseconds are reclaimed
    #[arg(long, default_value = "5000")]
    lock_timeout_ms: u64,

    /// Write the CBOR snapshot to this path
    #[arg(short, long)]
    snapshot: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn node_config(&self) -> NodeConfig {
        NodeConfig {
            name: self.name.clone(),
            workers: self.workers,
            iterations: self.iterations,
            ring_capacity: self.ring_capacity,
            messages: self.messages,
            channel: ChannelConfig {
                pattern: self.pattern,
                padding_block: (self.padding_block > 0).then_some(self.padding_block),
                rekey_interval: self.rekey_interval,
                ..ChannelConfig::default()
            },
            watchdog: WatchdogConfig {
                poll_interval: Duration::from_millis(self.poll_interval_ms),
                lock_timeout: Duration::from_millis(self.lock_timeout_ms),
            },
            ..NodeConfig::default()
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!(name = %args.name, pattern = %args.pattern, "swarmlink node starting");

    let snapshot = run_swarm(&args.node_config())?;

    tracing::info!(
        handshake_ms = snapshot.channel.handshake_time_ms,
        encrypt_avg_ms = snapshot.channel.encrypt_latency.avg_ms(),
        key_rotations = snapshot.channel.key_rotations,
        cas = snapshot.memory.cas_operations,
        contention = snapshot.memory.contention_count,
        peak_latency_ns = snapshot.memory.peak_latency_ns,
        "snapshot"
    );

    if let Some(path) = &args.snapshot {
        let mut writer = BufWriter::new(File::create(path)?);
        snapshot.write_cbor(&mut writer)?;
        writer.flush()?;
        tracing::info!("Snapshot written to {}", path);
    }

    Ok(())
}
