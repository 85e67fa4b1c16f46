//! Stale-lock watchdog.
//!
//! A background thread that periodically calls
//! [`MemorySystem::reclaim_stale_locks`], so a worker that dies while holding
//! a lock cannot wedge everyone else. The thread holds only a weak reference:
//! dropping the last `Arc<MemorySystem>` ends it on the next tick.

use std::{
    io,
    sync::{Arc, Condvar, Mutex, PoisonError, Weak},
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::system::MemorySystem;

/// Default scan period.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default time a lock may be held before it is considered abandoned.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Watchdog configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogConfig {
    /// Time between scans
    pub poll_interval: Duration,
    /// Locks held longer than this are force-released
    pub lock_timeout: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self { poll_interval: DEFAULT_POLL_INTERVAL, lock_timeout: DEFAULT_LOCK_TIMEOUT }
    }
}

#[derive(Default)]
struct Shutdown {
    requested: Mutex<bool>,
    signal: Condvar,
}

impl Shutdown {
    /// Sleep for `interval`, returning true if shutdown was requested.
    fn wait(&self, interval: Duration) -> bool {
        let guard = self.requested.lock().unwrap_or_else(PoisonError::into_inner);
        let (requested, _) = self
            .signal
            .wait_timeout_while(guard, interval, |requested| !*requested)
            .unwrap_or_else(PoisonError::into_inner);
        *requested
    }

    fn request(&self) {
        *self.requested.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.signal.notify_all();
    }
}

/// Handle to a running watchdog thread. Stops on [`Watchdog::stop`] or drop.
pub struct Watchdog {
    shutdown: Arc<Shutdown>,
    handle: Option<JoinHandle<()>>,
    config: WatchdogConfig,
}

impl Watchdog {
    /// Start scanning `system`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the thread cannot be spawned.
    pub fn spawn(system: &Arc<MemorySystem>, config: WatchdogConfig) -> io::Result<Self> {
        let shutdown = Arc::new(Shutdown::default());
        let weak = Arc::downgrade(system);
        let thread_shutdown = Arc::clone(&shutdown);

        let handle = thread::Builder::new()
            .name("swarmlink-watchdog".into())
            .spawn(move || run(&weak, &thread_shutdown, config))?;

        tracing::debug!(
            poll_ms = config.poll_interval.as_millis() as u64,
            timeout_ms = config.lock_timeout.as_millis() as u64,
            "watchdog started"
        );
        Ok(Self { shutdown, handle: Some(handle), config })
    }

    /// Configuration in effect.
    pub fn config(&self) -> WatchdogConfig {
        self.config
    }

    /// Signal the thread and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.shutdown.request();
        if handle.join().is_err() {
            tracing::warn!("watchdog thread panicked");
        }
        tracing::debug!("watchdog stopped");
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("config", &self.config)
            .field("running", &self.handle.is_some())
            .finish()
    }
}

fn run(system: &Weak<MemorySystem>, shutdown: &Shutdown, config: WatchdogConfig) {
    loop {
        if shutdown.wait(config.poll_interval) {
            return;
        }
        let Some(system) = system.upgrade() else {
            return;
        };
        system.reclaim_stale_locks(config.lock_timeout);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Instant,
    };

    use super::*;
    use crate::{lock::UNLOCKED, segment::SegmentConfig};

    #[test]
    fn reclaims_abandoned_lock() {
        let system = Arc::new(MemorySystem::new());
        let id = system.allocate_segment(&SegmentConfig::new("locks", 64)).unwrap();

        let reclaimed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&reclaimed);
        system.on_stale_lock(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let config = WatchdogConfig {
            poll_interval: Duration::from_millis(10),
            lock_timeout: Duration::from_millis(30),
        };
        let watchdog = Watchdog::spawn(&system, config).unwrap();

        system.acquire_spinlock(id, 0, 9, 1).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while system.atomic_read(id, 0).value != UNLOCKED {
            assert!(Instant::now() < deadline, "lock never reclaimed");
            thread::sleep(Duration::from_millis(5));
        }

        watchdog.stop();
        assert_eq!(reclaimed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stops_when_system_dropped() {
        let system = Arc::new(MemorySystem::new());
        let watchdog = Watchdog::spawn(
            &system,
            WatchdogConfig { poll_interval: Duration::from_millis(5), ..WatchdogConfig::default() },
        )
        .unwrap();

        drop(system);
        let deadline = Instant::now() + Duration::from_secs(2);
        while !watchdog.handle.as_ref().is_some_and(JoinHandle::is_finished) {
            assert!(Instant::now() < deadline, "watchdog outlived its system");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn drop_stops_thread() {
        let system = Arc::new(MemorySystem::new());
        let watchdog = Watchdog::spawn(&system, WatchdogConfig::default()).unwrap();
        let start = Instant::now();
        drop(watchdog);
        assert!(start.elapsed() < DEFAULT_LOCK_TIMEOUT);
    }
}
