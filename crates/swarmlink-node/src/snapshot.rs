//! Stat snapshot published after a swarm run.
//!
//! Encoded as CBOR so reporters in other processes can decode it without
//! sharing Rust types.

use std::{io, time::Duration};

use serde::Serialize;
use swarmlink_crypto::{ChannelStats, Environment, HandshakePattern};
use swarmlink_shm::{MemoryStats, MemorySystem, SegmentInfo};

use crate::{NodeConfig, NodeError};

/// Combined channel and memory telemetry for one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwarmSnapshot {
    /// Node name from the configuration
    pub node: String,
    /// Wall clock when captured, milliseconds since the Unix epoch
    pub taken_at_ms: u64,
    /// Run duration
    pub elapsed_ms: u64,
    /// Worker threads
    pub workers: usize,
    /// Operations per counter (workers x iterations)
    pub operations: u64,
    /// Handshake pattern of the loopback channel
    pub pattern: HandshakePattern,
    /// Initiator-side channel counters
    pub channel: ChannelStats,
    /// Memory system counters
    pub memory: MemoryStats,
    /// Live segments at capture time, by name
    pub segments: Vec<SegmentInfo>,
}

impl SwarmSnapshot {
    pub(crate) fn capture<E: Environment>(
        config: &NodeConfig,
        env: &E,
        system: &MemorySystem,
        channel: ChannelStats,
        operations: u64,
        elapsed: Duration,
    ) -> Self {
        let segments = system
            .segment_names()
            .iter()
            .filter_map(|name| system.lookup_segment(name))
            .filter_map(|id| system.segment_info(id))
            .collect();

        Self {
            node: config.name.clone(),
            taken_at_ms: env.wall_clock_millis(),
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            workers: config.workers,
            operations,
            pattern: config.channel.pattern,
            channel,
            memory: system.stats(),
            segments,
        }
    }

    /// Encode as CBOR.
    ///
    /// # Errors
    ///
    /// `Encode` if serialization or the writer fails.
    pub fn write_cbor<W: io::Write>(&self, writer: W) -> Result<(), NodeError> {
        ciborium::ser::into_writer(self, writer)
            .map_err(|e| NodeError::Encode(format!("CBOR encode failed: {e}")))
    }

    /// Encode as a CBOR byte vector.
    ///
    /// # Errors
    ///
    /// `Encode` if serialization fails.
    pub fn to_cbor(&self) -> Result<Vec<u8>, NodeError> {
        let mut buf = Vec::new();
        self.write_cbor(&mut buf)?;
        Ok(buf)
    }
}
