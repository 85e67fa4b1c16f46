//! Node error types.

use std::io;

use swarmlink_crypto::ChannelError;
use swarmlink_shm::{LockError, MemoryError, RingError};
use thiserror::Error;

/// Errors that can occur while running the node.
#[derive(Error, Debug)]
pub enum NodeError {
    /// Configuration rejected before anything started.
    ///
    /// Fatal. Fix the arguments and restart.
    #[error("configuration error: {0}")]
    Config(String),

    /// Secure channel failed during the loopback exchange.
    ///
    /// Never transient: a handshake or integrity failure between two
    /// in-process peers indicates a bug.
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Segment allocation failed.
    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),

    /// A worker could not take the shared lock in time.
    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    /// Work queue could not be created.
    #[error("ring error: {0}")]
    Ring(#[from] RingError),

    /// Thread spawn or snapshot output failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Snapshot could not be encoded as CBOR.
    #[error("snapshot encoding failed: {0}")]
    Encode(String),

    /// A worker thread panicked. Worker 0 is the ring consumer.
    #[error("worker {worker} panicked")]
    WorkerPanicked {
        /// Worker owner id
        worker: i32,
    },

    /// A loopback message decrypted to something other than what was sent.
    #[error("loopback message {index} corrupted")]
    Corrupted {
        /// Round trip that failed
        index: usize,
    },

    /// A self-test invariant did not hold after the run.
    #[error("self-test check {check} failed: expected {expected}, got {actual}")]
    Mismatch {
        /// Which check
        check: &'static str,
        /// Expected value
        expected: u64,
        /// Observed value
        actual: u64,
    },
}
