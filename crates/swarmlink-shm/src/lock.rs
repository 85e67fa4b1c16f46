//! Spinlocks over segment slots.
//!
//! A lock is one slot: [`UNLOCKED`] or the positive id of its owner. Only
//! CAS moves it between the two. Alongside the slot, the system keeps a table
//! of held locks and when they were taken, which is what the watchdog scans to
//! find owners that died mid-critical-section.
//!
//! # Waiting
//!
//! [`MemorySystem::acquire_spinlock`] busy-waits with exponential backoff.
//! [`MemorySystem::wait_for_lock`] parks on a condition variable between
//! attempts and is woken by every release or reclamation.

use std::{
    collections::HashMap,
    fmt,
    hint,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock},
    time::{Duration, Instant},
};

use crate::{
    error::LockError,
    segment::SegmentId,
    system::MemorySystem,
};

/// Value of a free lock slot.
pub const UNLOCKED: i32 = 0;

/// Default attempt budget for [`MemorySystem::acquire_spinlock`].
pub const DEFAULT_MAX_SPINS: u64 = 1000;

/// Largest number of spin hints between attempts.
const MAX_BACKOFF: u32 = 1024;

/// Longest single sleep in [`MemorySystem::wait_for_lock`].
const MAX_WAIT_SLICE: Duration = Duration::from_secs(1);

/// Address of a lock slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockKey {
    /// Segment holding the lock
    pub segment: SegmentId,
    /// Slot index within the segment
    pub index: usize,
}

/// Reported to callbacks on release and on stale reclamation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockEvent {
    /// Lock slot
    pub key: LockKey,
    /// Owner that held it
    pub owner: i32,
    /// How long it was held
    pub held_for: Duration,
}

/// Callback invoked with a [`LockEvent`].
pub type LockCallback = Arc<dyn Fn(&LockEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct HeldLock {
    owner: i32,
    since: Instant,
}

#[derive(Default)]
struct Callbacks {
    on_release: Vec<LockCallback>,
    on_stale: Vec<LockCallback>,
}

/// Held-lock bookkeeping and the wake-up primitive.
#[derive(Default)]
pub(crate) struct LockTable {
    held: Mutex<HashMap<LockKey, HeldLock>>,
    /// Bumped on every release so sleepers can detect a missed wake-up
    generation: Mutex<u64>,
    released: Condvar,
    callbacks: RwLock<Callbacks>,
}

impl LockTable {
    fn held(&self) -> MutexGuard<'_, HashMap<LockKey, HeldLock>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn generation(&self) -> u64 {
        *self.generation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        let mut generation = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        *generation = generation.wrapping_add(1);
        self.released.notify_all();
    }

    /// Sleep until the generation moves past `seen` or `timeout` elapses.
    fn wait(&self, seen: u64, timeout: Duration) {
        let guard = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = self
            .released
            .wait_timeout_while(guard, timeout, |generation| *generation == seen)
            .unwrap_or_else(PoisonError::into_inner);
    }

    fn release_callbacks(&self) -> Vec<LockCallback> {
        self.callbacks.read().unwrap_or_else(PoisonError::into_inner).on_release.clone()
    }

    fn stale_callbacks(&self) -> Vec<LockCallback> {
        self.callbacks.read().unwrap_or_else(PoisonError::into_inner).on_stale.clone()
    }

    pub(crate) fn forget_segment(&self, segment: SegmentId) {
        self.held().retain(|key, _| key.segment != segment);
        self.notify();
    }

    pub(crate) fn clear(&self) {
        self.held().clear();
        self.notify();
    }
}

impl fmt::Debug for LockTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockTable").field("held", &self.held().len()).finish_non_exhaustive()
    }
}

impl MemorySystem {
    /// Try to take the lock at `(segment, index)` for `owner`.
    ///
    /// Makes up to `max_spins` CAS attempts, spinning 1, 2, 4 … up to 1024
    /// hints between them. Not reentrant: an owner retrying its own lock
    /// times out.
    ///
    /// # Errors
    ///
    /// - `InvalidOwner` if `owner <= 0`
    /// - `Memory` if the slot cannot be addressed
    /// - `Timeout` if every attempt found the lock held
    pub fn acquire_spinlock(
        &self,
        segment: SegmentId,
        index: usize,
        owner: i32,
        max_spins: u64,
    ) -> Result<(), LockError> {
        if owner <= UNLOCKED {
            return Err(LockError::InvalidOwner(owner));
        }

        let attempts = max_spins.max(1);
        let mut backoff = 1;
        for attempt in 0..attempts {
            let result = self.compare_and_swap(segment, index, UNLOCKED, owner);
            if let Some(err) = result.error {
                return Err(err.into());
            }
            if result.success {
                self.locks
                    .held()
                    .insert(LockKey { segment, index }, HeldLock { owner, since: self.now() });
                return Ok(());
            }

            if attempt + 1 < attempts {
                for _ in 0..backoff {
                    hint::spin_loop();
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }

        Err(LockError::Timeout { attempts })
    }

    /// Release a lock held by `owner`, wake sleepers and run release
    /// callbacks.
    ///
    /// # Errors
    ///
    /// - `InvalidOwner` if `owner <= 0`
    /// - `NotOwner` if the slot holds anything but `owner` (including after
    ///   the watchdog reclaimed it)
    /// - `Memory` if the slot cannot be addressed
    pub fn release_spinlock(
        &self,
        segment: SegmentId,
        index: usize,
        owner: i32,
    ) -> Result<(), LockError> {
        if owner <= UNLOCKED {
            return Err(LockError::InvalidOwner(owner));
        }
        let key = LockKey { segment, index };

        // The table entry is removed under the same guard as the CAS so a
        // new owner's entry can never be mistaken for ours.
        let mut held = self.locks.held();
        let result = self.compare_and_swap(segment, index, owner, UNLOCKED);
        if let Some(err) = result.error {
            return Err(err.into());
        }
        if !result.success {
            return Err(LockError::NotOwner { current: result.value });
        }
        let since = if held.get(&key).is_some_and(|entry| entry.owner == owner) {
            held.remove(&key).map(|entry| entry.since)
        } else {
            None
        };
        drop(held);

        self.locks.notify();

        let now = self.now();
        let event = LockEvent {
            key,
            owner,
            held_for: since.map_or(Duration::ZERO, |since| now.saturating_duration_since(since)),
        };
        for callback in self.locks.release_callbacks() {
            callback(&event);
        }
        Ok(())
    }

    /// Block until the lock is acquired or `timeout` elapses.
    ///
    /// Sleeps between attempts instead of spinning; any release or
    /// reclamation wakes it for another try. The deadline is measured on
    /// the system's clock; a timeout too large to form a deadline (such as
    /// `Duration::MAX`) waits indefinitely.
    ///
    /// # Errors
    ///
    /// - `Timeout` if the deadline passes
    /// - `InvalidOwner` / `Memory` as for [`Self::acquire_spinlock`]
    pub fn wait_for_lock(
        &self,
        segment: SegmentId,
        index: usize,
        owner: i32,
        timeout: Duration,
    ) -> Result<(), LockError> {
        let deadline = self.now().checked_add(timeout);
        let mut attempts = 0;

        loop {
            // Snapshot before trying so a release between the attempt and
            // the wait still wakes us.
            let seen = self.locks.generation();
            attempts += 1;
            match self.acquire_spinlock(segment, index, owner, 1) {
                Err(LockError::Timeout { .. }) => {},
                other => return other,
            }

            let slice = match deadline {
                Some(deadline) => {
                    let now = self.now();
                    if now >= deadline {
                        return Err(LockError::Timeout { attempts });
                    }
                    (deadline - now).min(MAX_WAIT_SLICE)
                },
                None => MAX_WAIT_SLICE,
            };
            self.locks.wait(seen, slice);
        }
    }

    /// Register a callback run after every successful release.
    pub fn on_lock_release(&self, callback: impl Fn(&LockEvent) + Send + Sync + 'static) {
        self.locks
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .on_release
            .push(Arc::new(callback));
    }

    /// Register a callback run once per stale-lock reclamation.
    pub fn on_stale_lock(&self, callback: impl Fn(&LockEvent) + Send + Sync + 'static) {
        self.locks
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .on_stale
            .push(Arc::new(callback));
    }

    /// Locks currently held, with their owners.
    pub fn held_locks(&self) -> Vec<(LockKey, i32)> {
        let mut held: Vec<_> =
            self.locks.held().iter().map(|(key, entry)| (*key, entry.owner)).collect();
        held.sort_unstable();
        held
    }

    /// Force-release every lock held longer than `timeout`.
    ///
    /// Each reclaimed lock is reset to [`UNLOCKED`] by CAS, sleepers are
    /// woken, and every stale-lock callback runs exactly once for it. Entries
    /// whose slot no longer holds the recorded owner are dropped silently.
    pub fn reclaim_stale_locks(&self, timeout: Duration) -> Vec<LockEvent> {
        let now = self.now();
        let mut events = Vec::new();

        let mut held = self.locks.held();
        held.retain(|key, entry| {
            let held_for = now.saturating_duration_since(entry.since);
            if held_for <= timeout {
                return true;
            }
            let result = self.compare_and_swap(key.segment, key.index, entry.owner, UNLOCKED);
            if result.success {
                events.push(LockEvent { key: *key, owner: entry.owner, held_for });
            }
            false
        });
        drop(held);

        if events.is_empty() {
            return events;
        }

        self.locks.notify();
        let callbacks = self.locks.stale_callbacks();
        for event in &events {
            self.record_stale_reclaim();
            tracing::warn!(
                segment = %event.key.segment,
                index = event.key.index,
                owner = event.owner,
                held_ms = event.held_for.as_millis() as u64,
                "reclaimed stale lock"
            );
            for callback in &callbacks {
                callback(event);
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{clock::ManualClock, segment::SegmentConfig};

    fn system() -> (MemorySystem, SegmentId) {
        let system = MemorySystem::new();
        let id = system.allocate_segment(&SegmentConfig::new("locks", 64)).unwrap();
        (system, id)
    }

    #[test]
    fn acquire_and_release() {
        let (system, id) = system();

        system.acquire_spinlock(id, 0, 7, 10).unwrap();
        assert_eq!(system.atomic_read(id, 0).value, 7);
        assert_eq!(system.held_locks(), vec![(LockKey { segment: id, index: 0 }, 7)]);

        system.release_spinlock(id, 0, 7).unwrap();
        assert_eq!(system.atomic_read(id, 0).value, UNLOCKED);
        assert!(system.held_locks().is_empty());
    }

    #[test]
    fn second_owner_times_out() {
        let (system, id) = system();
        system.acquire_spinlock(id, 0, 1, 10).unwrap();

        assert_eq!(system.acquire_spinlock(id, 0, 2, 5), Err(LockError::Timeout { attempts: 5 }));
        assert_eq!(system.acquire_spinlock(id, 0, 1, 1), Err(LockError::Timeout { attempts: 1 }));
    }

    #[test]
    fn non_owner_cannot_release() {
        let (system, id) = system();
        system.acquire_spinlock(id, 0, 1, 10).unwrap();

        assert_eq!(system.release_spinlock(id, 0, 2), Err(LockError::NotOwner { current: 1 }));
        assert_eq!(system.atomic_read(id, 0).value, 1);
    }

    #[test]
    fn invalid_owner_rejected() {
        let (system, id) = system();
        assert_eq!(system.acquire_spinlock(id, 0, 0, 10), Err(LockError::InvalidOwner(0)));
        assert_eq!(system.acquire_spinlock(id, 0, -3, 10), Err(LockError::InvalidOwner(-3)));
        assert_eq!(system.release_spinlock(id, 0, 0), Err(LockError::InvalidOwner(0)));
    }

    #[test]
    fn bad_slot_is_memory_error() {
        let (system, id) = system();
        assert!(matches!(system.acquire_spinlock(id, 99, 1, 10), Err(LockError::Memory(_))));
    }

    #[test]
    fn release_fires_callbacks() {
        let (system, id) = system();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        system.on_lock_release(move |event| {
            assert_eq!(event.owner, 4);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        system.acquire_spinlock(id, 3, 4, 10).unwrap();
        system.release_spinlock(id, 3, 4).unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reclaim_only_touches_expired_locks() {
        let (system, id) = system();
        system.acquire_spinlock(id, 0, 1, 10).unwrap();

        assert!(system.reclaim_stale_locks(Duration::from_secs(60)).is_empty());
        assert_eq!(system.atomic_read(id, 0).value, 1);

        std::thread::sleep(Duration::from_millis(5));
        let events = system.reclaim_stale_locks(Duration::from_millis(1));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].owner, 1);
        assert_eq!(system.atomic_read(id, 0).value, UNLOCKED);

        // The reclaimed owner no longer holds it.
        assert_eq!(system.release_spinlock(id, 0, 1), Err(LockError::NotOwner { current: 0 }));
        assert_eq!(system.stats().stale_locks_reclaimed, 1);
    }

    #[test]
    fn reclaim_follows_the_clock() {
        let clock = Arc::new(ManualClock::new());
        let system = MemorySystem::with_clock(Arc::<ManualClock>::clone(&clock));
        let id = system.allocate_segment(&SegmentConfig::new("clocked", 64)).unwrap();
        system.acquire_spinlock(id, 0, 5, 10).unwrap();

        clock.advance(Duration::from_millis(100));
        assert!(system.reclaim_stale_locks(Duration::from_millis(100)).is_empty());

        clock.advance(Duration::from_millis(1));
        let events = system.reclaim_stale_locks(Duration::from_millis(100));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].held_for, Duration::from_millis(101));
    }

    #[test]
    fn release_reports_hold_time() {
        let clock = Arc::new(ManualClock::new());
        let system = MemorySystem::with_clock(Arc::<ManualClock>::clone(&clock));
        let id = system.allocate_segment(&SegmentConfig::new("timed", 64)).unwrap();
        let held = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&held);
        system.on_lock_release(move |event| sink.lock().unwrap().push(event.held_for));

        system.acquire_spinlock(id, 1, 3, 10).unwrap();
        clock.advance(Duration::from_millis(42));
        system.release_spinlock(id, 1, 3).unwrap();

        assert_eq!(*held.lock().unwrap(), vec![Duration::from_millis(42)]);
    }

    #[test]
    fn wait_for_lock_wakes_on_release() {
        let system = Arc::new(MemorySystem::new());
        let id = system.allocate_segment(&SegmentConfig::new("wait", 64)).unwrap();
        system.acquire_spinlock(id, 0, 1, 10).unwrap();

        let waiter = {
            let system = Arc::clone(&system);
            std::thread::spawn(move || system.wait_for_lock(id, 0, 2, Duration::from_secs(5)))
        };

        std::thread::sleep(Duration::from_millis(20));
        system.release_spinlock(id, 0, 1).unwrap();

        assert_eq!(waiter.join().unwrap(), Ok(()));
        assert_eq!(system.atomic_read(id, 0).value, 2);
    }

    #[test]
    fn unbounded_wait_takes_free_lock() {
        let (system, id) = system();
        assert_eq!(system.wait_for_lock(id, 0, 1, Duration::MAX), Ok(()));
        assert_eq!(system.atomic_read(id, 0).value, 1);
    }

    #[test]
    fn unbounded_wait_wakes_on_release() {
        let system = Arc::new(MemorySystem::new());
        let id = system.allocate_segment(&SegmentConfig::new("forever", 64)).unwrap();
        system.acquire_spinlock(id, 0, 1, 10).unwrap();

        let waiter = {
            let system = Arc::clone(&system);
            std::thread::spawn(move || system.wait_for_lock(id, 0, 2, Duration::MAX))
        };

        std::thread::sleep(Duration::from_millis(20));
        system.release_spinlock(id, 0, 1).unwrap();

        assert_eq!(waiter.join().unwrap(), Ok(()));
        assert_eq!(system.atomic_read(id, 0).value, 2);
    }

    #[test]
    fn wait_for_lock_times_out() {
        let (system, id) = system();
        system.acquire_spinlock(id, 0, 1, 10).unwrap();

        let start = Instant::now();
        let result = system.wait_for_lock(id, 0, 2, Duration::from_millis(30));

        assert!(matches!(result, Err(LockError::Timeout { .. })));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
