//! Swarmlink Shared Memory
//!
//! Named segments of 32-bit slots shared by worker threads, with atomic
//! operations, owner-tagged spinlocks, a stale-lock watchdog and a bounded
//! MPMC ring buffer laid out inside a segment.
//!
//! # Layout
//!
//! ```text
//! MemorySystem
//!   ├── registry (RwLock)   name → SegmentId → MemorySegment
//!   │                        64-byte aligned cache lines of AtomicI32
//!   ├── lock table (Mutex)   (segment, slot) → owner, acquired-at
//!   ├── clock               hold times, idle tracking, latency
//!   └── stats               reads, writes, CAS, contention, latency
//! ```
//!
//! # Failure Model
//!
//! Slot operations never panic and never return `Err`: an unknown segment or
//! out-of-range index comes back as an [`AtomicResult`] with `success ==
//! false`. Registry, lock and ring constructors return `Result`.
//!
//! A lock owner that stops making progress is detected by age alone. The
//! [`Watchdog`] force-releases locks held past the configured timeout and
//! reports each one to the registered stale-lock callbacks exactly once.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod clock;
pub mod error;
pub mod lock;
pub mod ring;
pub mod segment;
pub mod stats;
pub mod system;
pub mod watchdog;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{AccessError, LockError, MemoryError, RingError};
pub use lock::{DEFAULT_MAX_SPINS, LockCallback, LockEvent, LockKey, UNLOCKED};
pub use ring::{HEADER_SLOTS, MAX_RING_CAPACITY, MIN_RING_CAPACITY, RingBuffer, ring_slots};
pub use segment::{
    CACHE_LINE_BYTES, MAX_SEGMENT_BYTES, MemorySegment, SLOT_BYTES, SegmentConfig, SegmentId,
    SegmentInfo,
};
pub use stats::MemoryStats;
pub use system::{AtomicResult, MemorySystem};
pub use watchdog::{DEFAULT_LOCK_TIMEOUT, DEFAULT_POLL_INTERVAL, Watchdog, WatchdogConfig};
