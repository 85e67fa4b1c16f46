//! Time source for the memory system.
//!
//! Lock hold times, segment idle tracking and operation latency all read
//! the clock through [`Clock`]. [`SystemClock`] is the production source;
//! [`ManualClock`] only moves when told to, so stale-lock and idle logic can
//! be tested without sleeping.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

/// Monotonic and wall clock readings.
///
/// # Safety
///
/// Implementations MUST guarantee that `now()` never goes backwards.
pub trait Clock: fmt::Debug + Send + Sync + 'static {
    /// Current monotonic instant.
    fn now(&self) -> Instant;

    /// Milliseconds since the Unix epoch. Zero means "unset".
    fn wall_clock_millis(&self) -> u64;
}

/// Operating system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[allow(clippy::disallowed_methods)]
    fn now(&self) -> Instant {
        Instant::now()
    }

    #[allow(clippy::disallowed_methods)]
    fn wall_clock_millis(&self) -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |elapsed| elapsed.as_millis() as u64)
    }
}

/// Clock that advances only through [`ManualClock::advance`].
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    origin_ms: u64,
    offset_ns: AtomicU64,
}

impl ManualClock {
    /// Clock frozen at the current system time.
    pub fn new() -> Self {
        Self {
            origin: SystemClock.now(),
            origin_ms: SystemClock.wall_clock_millis(),
            offset_ns: AtomicU64::new(0),
        }
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let nanos = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        let _ = self.offset_ns.fetch_update(Ordering::AcqRel, Ordering::Acquire, |offset| {
            Some(offset.saturating_add(nanos))
        });
    }

    fn offset(&self) -> Duration {
        Duration::from_nanos(self.offset_ns.load(Ordering::Acquire))
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin.checked_add(self.offset()).unwrap_or(self.origin)
    }

    fn wall_clock_millis(&self) -> u64 {
        let offset_ms = u64::try_from(self.offset().as_millis()).unwrap_or(u64::MAX);
        self.origin_ms.saturating_add(offset_ms)
    }
}
