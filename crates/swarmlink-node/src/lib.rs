//! Swarmlink node.
//!
//! Production glue around [`swarmlink_crypto`] and [`swarmlink_shm`]: a
//! loopback self-test swarm that drives every shared-memory primitive from
//! worker threads and a secure channel between two in-process peers, then
//! publishes what it measured as a CBOR [`SwarmSnapshot`].
//!
//! # Components
//!
//! - [`NodeConfig`]: run parameters, built by the binary from CLI arguments
//! - [`run_swarm`]: the self-test itself
//! - [`SwarmSnapshot`]: combined channel and memory telemetry

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod error;
mod snapshot;
mod swarm;

use std::time::Duration;

pub use error::NodeError;
pub use snapshot::SwarmSnapshot;
use swarmlink_crypto::{ChannelConfig, MAX_PADDING_BLOCK};
use swarmlink_shm::{DEFAULT_MAX_SPINS, MAX_RING_CAPACITY, MIN_RING_CAPACITY, WatchdogConfig};
pub use swarm::run_swarm;

/// Self-test run configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Name recorded in the snapshot
    pub name: String,
    /// Worker threads sharing the memory system
    pub workers: usize,
    /// Operations per worker
    pub iterations: usize,
    /// Slots in the shared work queue
    pub ring_capacity: usize,
    /// Ping round trips over the secure channel
    pub messages: usize,
    /// CAS attempts per spinlock acquisition before a worker yields
    pub lock_spins: u64,
    /// How long a worker waits for the shared lock before giving up
    pub lock_wait: Duration,
    /// Channel parameters for both peers
    pub channel: ChannelConfig,
    /// Stale-lock watchdog parameters
    pub watchdog: WatchdogConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "swarmlink-node".to_string(),
            workers: 4,
            iterations: 1000,
            ring_capacity: 64,
            messages: 100,
            lock_spins: DEFAULT_MAX_SPINS,
            lock_wait: Duration::from_secs(10),
            channel: ChannelConfig::default(),
            watchdog: WatchdogConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Reject configurations the self-test cannot run.
    ///
    /// # Errors
    ///
    /// `Config` describing the first invalid field.
    pub fn validate(&self) -> Result<(), NodeError> {
        if self.workers == 0 {
            return Err(NodeError::Config("at least one worker is required".to_string()));
        }
        if !(MIN_RING_CAPACITY..=MAX_RING_CAPACITY).contains(&self.ring_capacity) {
            return Err(NodeError::Config(format!(
                "ring capacity must be within {MIN_RING_CAPACITY}..={MAX_RING_CAPACITY}, got {}",
                self.ring_capacity
            )));
        }
        // Counters live in i32 slots.
        let total = self.workers.checked_mul(self.iterations);
        if total.is_none_or(|total| i32::try_from(total).is_err()) {
            return Err(NodeError::Config(format!(
                "{} workers x {} iterations overflows a 32-bit counter",
                self.workers, self.iterations
            )));
        }
        if let Some(block) = self.channel.padding_block.filter(|&block| block > MAX_PADDING_BLOCK) {
            return Err(NodeError::Config(format!(
                "padding block {block} exceeds {MAX_PADDING_BLOCK} bytes"
            )));
        }
        if self.watchdog.poll_interval.is_zero() {
            return Err(NodeError::Config("watchdog poll interval must be non-zero".to_string()));
        }
        Ok(())
    }
}
