//! Connection statistics for telemetry consumers.

use std::time::Duration;

use serde::Serialize;

/// Weight of the newest sample in the rolling latency average.
const EMA_ALPHA: f64 = 0.1;

/// Snapshot of a channel's counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChannelStats {
    /// Messages encrypted
    pub messages_sent: u64,
    /// Messages decrypted successfully
    pub messages_received: u64,
    /// Plaintext bytes encrypted
    pub bytes_sent: u64,
    /// Plaintext bytes decrypted
    pub bytes_received: u64,
    /// Wall time from the first handshake message to completion
    pub handshake_time_ms: u64,
    /// Rolling encrypt latency
    pub encrypt_latency: LatencyStats,
    /// Rolling decrypt latency
    pub decrypt_latency: LatencyStats,
    /// Key rotations performed in either direction
    pub key_rotations: u64,
}

/// Exponential moving average and peak of an operation's latency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    /// Moving average in nanoseconds
    pub avg_ns: f64,
    /// Largest sample seen, in nanoseconds
    pub peak_ns: u64,
    /// Samples recorded
    pub samples: u64,
}

impl LatencyStats {
    /// Fold one sample into the average and peak.
    pub fn record(&mut self, elapsed: Duration) {
        let ns = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.avg_ns = if self.samples == 0 {
            ns as f64
        } else {
            EMA_ALPHA * ns as f64 + (1.0 - EMA_ALPHA) * self.avg_ns
        };
        self.peak_ns = self.peak_ns.max(ns);
        self.samples += 1;
    }

    /// Average in milliseconds.
    pub fn avg_ms(&self) -> f64 {
        self.avg_ns / 1_000_000.0
    }
}
