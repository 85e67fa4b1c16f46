//! Segment registry and atomic operations.
//!
//! [`MemorySystem`] is the context object every worker shares (usually
//! behind an `Arc`). The registry maps names and ids to reference-counted
//! segments behind its own `RwLock`. A slot operation holds the read side
//! only long enough to clone the segment handle, then works on the slot with
//! the registry unlocked. A segment deallocated mid-operation stays alive
//! until that operation finishes.
//!
//! # Memory ordering
//!
//! Loads are `Acquire`, stores `Release`, read-modify-writes `AcqRel`. A
//! value stored before a successful publishing CAS is visible to any thread
//! whose load observes the publish.

use std::{
    collections::HashMap,
    sync::{
        Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicI32, AtomicU64, Ordering},
    },
    time::Instant,
};

use crate::{
    clock::{Clock, SystemClock},
    error::{AccessError, MemoryError},
    lock::LockTable,
    segment::{MemorySegment, SegmentConfig, SegmentId, SegmentInfo},
    stats::{MemoryStats, OpKind, StatsRecorder},
};

/// Outcome of a slot operation.
///
/// Failures are data: `success == false` with `error` set for addressing
/// problems, or with `error == None` for a CAS whose expectation did not
/// hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomicResult {
    /// Whether the operation took effect
    pub success: bool,
    /// Slot value after the operation (current value on CAS mismatch)
    pub value: i32,
    /// Slot value before the operation
    pub previous_value: i32,
    /// Time spent, including registry lookup, as measured by the system's
    /// clock
    pub latency_ns: u64,
    /// Addressing failure, if any
    pub error: Option<AccessError>,
}

impl AtomicResult {
    fn failed(error: AccessError, latency_ns: u64) -> Self {
        Self { success: false, value: 0, previous_value: 0, latency_ns, error: Some(error) }
    }

    /// `Ok(value)` on success, `Err` with the addressing error otherwise.
    /// A CAS mismatch yields `Ok(current)` with `success == false`, so check
    /// `success` for CAS.
    pub fn value(&self) -> Result<i32, AccessError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.value),
        }
    }
}

#[derive(Debug, Default)]
struct Registry {
    by_name: HashMap<String, SegmentId>,
    segments: HashMap<SegmentId, Arc<MemorySegment>>,
}

/// Shared-memory context: registry, slot operations, locks and stats.
#[derive(Debug)]
pub struct MemorySystem {
    registry: RwLock<Registry>,
    clock: Arc<dyn Clock>,
    next_id: AtomicU64,
    stats: StatsRecorder,
    pub(crate) locks: LockTable,
}

impl Default for MemorySystem {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySystem {
    /// Empty system on the operating system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Empty system reading time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            clock,
            next_id: AtomicU64::new(1),
            stats: StatsRecorder::default(),
            locks: LockTable::default(),
        }
    }

    /// Allocate and register a segment.
    ///
    /// # Errors
    ///
    /// - `NameInUse` if a live segment already has this name
    /// - `InvalidSize` / `InvalidAlignment` for bad configurations
    pub fn allocate_segment(&self, config: &SegmentConfig) -> Result<SegmentId, MemoryError> {
        let id = SegmentId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let segment = Arc::new(MemorySegment::new(id, config, self.clock.as_ref())?);
        let size = segment.size();

        let mut registry = self.write_registry();
        if registry.by_name.contains_key(&config.name) {
            return Err(MemoryError::NameInUse(config.name.clone()));
        }
        registry.by_name.insert(config.name.clone(), id);
        registry.segments.insert(id, segment);
        drop(registry);

        tracing::debug!(segment = %id, name = %config.name, size, "allocated segment");
        Ok(id)
    }

    /// Remove a segment. Returns false if it did not exist.
    ///
    /// Locks tracked on the segment are forgotten; waiters are woken and will
    /// observe `SegmentNotFound`.
    pub fn deallocate_segment(&self, id: SegmentId) -> bool {
        let mut registry = self.write_registry();
        let Some(segment) = registry.segments.remove(&id) else {
            return false;
        };
        registry.by_name.remove(segment.name());
        drop(registry);

        self.locks.forget_segment(id);
        tracing::debug!(segment = %id, name = segment.name(), "deallocated segment");
        true
    }

    /// Id of the live segment called `name`.
    pub fn lookup_segment(&self, name: &str) -> Option<SegmentId> {
        self.read_registry().by_name.get(name).copied()
    }

    /// Metadata for segment `id`.
    pub fn segment_info(&self, id: SegmentId) -> Option<SegmentInfo> {
        let now = self.now();
        self.read_registry().segments.get(&id).map(|segment| segment.info(now))
    }

    /// Slot count of segment `id`.
    pub fn segment_len(&self, id: SegmentId) -> Option<usize> {
        self.read_registry().segments.get(&id).map(|segment| segment.len())
    }

    /// Names of all live segments, sorted.
    pub fn segment_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read_registry().by_name.keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop every segment and tracked lock. Returns the number of segments
    /// freed.
    pub fn cleanup(&self) -> usize {
        let mut registry = self.write_registry();
        let freed = registry.segments.len();
        registry.segments.clear();
        registry.by_name.clear();
        drop(registry);

        self.locks.clear();
        tracing::debug!(freed, "memory system cleaned up");
        freed
    }

    /// Current counters plus registry totals.
    pub fn stats(&self) -> MemoryStats {
        let mut stats = self.stats.snapshot();
        let registry = self.read_registry();
        stats.total_segments = registry.segments.len();
        stats.total_allocated = registry.segments.values().map(|segment| segment.size()).sum();
        stats
    }

    /// Load a slot.
    pub fn atomic_read(&self, id: SegmentId, index: usize) -> AtomicResult {
        self.apply(id, index, OpKind::Read, |slot| {
            let value = slot.load(Ordering::Acquire);
            (true, value, value)
        })
    }

    /// Store into a slot. No previous value is observed, so
    /// `previous_value` equals `value`; use [`Self::atomic_exchange`] to
    /// learn it.
    pub fn atomic_write(&self, id: SegmentId, index: usize, value: i32) -> AtomicResult {
        self.apply(id, index, OpKind::Write, |slot| {
            slot.store(value, Ordering::Release);
            (true, value, value)
        })
    }

    /// Swap a value into a slot, returning the old one.
    pub fn atomic_exchange(&self, id: SegmentId, index: usize, value: i32) -> AtomicResult {
        self.apply(id, index, OpKind::Write, |slot| {
            let previous = slot.swap(value, Ordering::AcqRel);
            (true, value, previous)
        })
    }

    /// Wrapping add.
    pub fn atomic_add(&self, id: SegmentId, index: usize, delta: i32) -> AtomicResult {
        self.apply(id, index, OpKind::Write, |slot| {
            let previous = slot.fetch_add(delta, Ordering::AcqRel);
            (true, previous.wrapping_add(delta), previous)
        })
    }

    /// Bitwise OR.
    pub fn atomic_or(&self, id: SegmentId, index: usize, mask: i32) -> AtomicResult {
        self.apply(id, index, OpKind::Write, |slot| {
            let previous = slot.fetch_or(mask, Ordering::AcqRel);
            (true, previous | mask, previous)
        })
    }

    /// Bitwise AND.
    pub fn atomic_and(&self, id: SegmentId, index: usize, mask: i32) -> AtomicResult {
        self.apply(id, index, OpKind::Write, |slot| {
            let previous = slot.fetch_and(mask, Ordering::AcqRel);
            (true, previous & mask, previous)
        })
    }

    /// Replace `expected` with `new`.
    ///
    /// On mismatch `success` is false, `value` holds the current contents
    /// and the contention counter increments.
    pub fn compare_and_swap(
        &self,
        id: SegmentId,
        index: usize,
        expected: i32,
        new: i32,
    ) -> AtomicResult {
        let result = self.apply(id, index, OpKind::Cas, |slot| {
            match slot.compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(previous) => (true, new, previous),
                Err(current) => (false, current, current),
            }
        });
        if !result.success && result.error.is_none() {
            self.stats.record_contention();
            tracing::trace!(
                segment = %id,
                index,
                expected,
                current = result.value,
                "cas contention"
            );
        }
        result
    }

    pub(crate) fn record_stale_reclaim(&self) {
        self.stats.record_stale_reclaim();
    }

    /// Current reading of the system's clock.
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Resolve `(id, index)` and run `op` on the slot. The registry is
    /// unlocked before `op` runs. `op` returns `(success, value,
    /// previous_value)`.
    fn apply<F>(&self, id: SegmentId, index: usize, kind: OpKind, op: F) -> AtomicResult
    where
        F: FnOnce(&AtomicI32) -> (bool, i32, i32),
    {
        let start = self.now();
        let segment = self.read_registry().segments.get(&id).cloned();

        let outcome = match &segment {
            Some(segment) => segment.slot(index, start).map(op),
            None => Err(AccessError::SegmentNotFound(id)),
        };

        let latency = self.now().saturating_duration_since(start);
        let latency_ns = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        match outcome {
            Ok((success, value, previous_value)) => {
                self.stats.record(kind, latency);
                AtomicResult { success, value, previous_value, latency_ns, error: None }
            },
            Err(err) => AtomicResult::failed(err, latency_ns),
        }
    }

    fn read_registry(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_registry(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::*;
    use crate::clock::ManualClock;

    fn system_with(slots: usize) -> (MemorySystem, SegmentId) {
        let system = MemorySystem::new();
        let id = system.allocate_segment(&SegmentConfig::with_slots("test", slots)).unwrap();
        (system, id)
    }

    #[test]
    fn allocate_and_lookup() {
        let system = MemorySystem::new();
        let id = system.allocate_segment(&SegmentConfig::new("counters", 100)).unwrap();

        assert_eq!(system.lookup_segment("counters"), Some(id));
        assert_eq!(system.segment_info(id).unwrap().size, 128);
        assert_eq!(system.segment_len(id), Some(32));
        assert_eq!(system.segment_names(), vec!["counters".to_string()]);
    }

    #[test]
    fn duplicate_name_rejected() {
        let system = MemorySystem::new();
        let first = system.allocate_segment(&SegmentConfig::new("dup", 64)).unwrap();

        assert_eq!(
            system.allocate_segment(&SegmentConfig::new("dup", 64)),
            Err(MemoryError::NameInUse("dup".into()))
        );
        assert_eq!(system.lookup_segment("dup"), Some(first));
    }

    #[test]
    fn name_reusable_after_deallocate() {
        let system = MemorySystem::new();
        let first = system.allocate_segment(&SegmentConfig::new("reuse", 64)).unwrap();
        assert!(system.deallocate_segment(first));
        assert!(!system.deallocate_segment(first));

        let second = system.allocate_segment(&SegmentConfig::new("reuse", 64)).unwrap();
        assert_ne!(first, second);
        assert_eq!(system.lookup_segment("reuse"), Some(second));
    }

    #[test]
    fn unknown_segment_is_soft_failure() {
        let system = MemorySystem::new();
        let result = system.atomic_read(SegmentId(99), 0);
        assert!(!result.success);
        assert_eq!(result.error, Some(AccessError::SegmentNotFound(SegmentId(99))));
    }

    #[test]
    fn out_of_range_is_soft_failure() {
        let (system, id) = system_with(16);
        let result = system.atomic_write(id, 16, 1);
        assert!(!result.success);
        assert_eq!(result.error, Some(AccessError::IndexOutOfRange { index: 16, len: 16 }));
    }

    #[test]
    fn read_modify_write_ops() {
        let (system, id) = system_with(16);

        assert_eq!(system.atomic_write(id, 0, 5).value, 5);
        let add = system.atomic_add(id, 0, 3);
        assert_eq!((add.previous_value, add.value), (5, 8));
        let or = system.atomic_or(id, 0, 0b0001);
        assert_eq!((or.previous_value, or.value), (8, 9));
        let and = system.atomic_and(id, 0, 0b1000);
        assert_eq!((and.previous_value, and.value), (9, 8));
        let swap = system.atomic_exchange(id, 0, -1);
        assert_eq!((swap.previous_value, swap.value), (8, -1));
        assert_eq!(system.atomic_read(id, 0).value(), Ok(-1));
    }

    #[test]
    fn add_wraps() {
        let (system, id) = system_with(16);
        system.atomic_write(id, 0, i32::MAX);
        assert_eq!(system.atomic_add(id, 0, 1).value, i32::MIN);
    }

    #[test]
    fn cas_mismatch_reports_current_and_counts_contention() {
        let (system, id) = system_with(16);
        system.atomic_write(id, 1, 7);

        let miss = system.compare_and_swap(id, 1, 0, 9);
        assert!(!miss.success);
        assert_eq!(miss.value, 7);
        assert_eq!(miss.error, None);

        let hit = system.compare_and_swap(id, 1, 7, 9);
        assert!(hit.success);
        assert_eq!((hit.previous_value, hit.value), (7, 9));

        let stats = system.stats();
        assert_eq!(stats.cas_operations, 2);
        assert_eq!(stats.contention_count, 1);
    }

    #[test]
    fn stats_track_registry() {
        let system = MemorySystem::new();
        system.allocate_segment(&SegmentConfig::new("a", 64)).unwrap();
        system.allocate_segment(&SegmentConfig::new("b", 100)).unwrap();

        let stats = system.stats();
        assert_eq!(stats.total_segments, 2);
        assert_eq!(stats.total_allocated, 64 + 128);

        assert_eq!(system.cleanup(), 2);
        assert_eq!(system.stats().total_segments, 0);
        assert!(system.segment_names().is_empty());
    }

    #[test]
    fn manual_clock_drives_latency_and_idle() {
        let clock = Arc::new(ManualClock::new());
        let system = MemorySystem::with_clock(Arc::<ManualClock>::clone(&clock));
        let id = system.allocate_segment(&SegmentConfig::new("idle", 64)).unwrap();

        assert_eq!(system.atomic_add(id, 0, 1).latency_ns, 0);
        clock.advance(Duration::from_millis(7));
        assert_eq!(system.segment_info(id).unwrap().idle_ms, 7);
        assert_eq!(system.now(), clock.now());
    }

    #[test]
    fn slot_ops_unaffected_by_registry_churn() {
        let system = Arc::new(MemorySystem::new());
        let id = system.allocate_segment(&SegmentConfig::new("hot", 64)).unwrap();

        let churn = {
            let system = Arc::clone(&system);
            thread::spawn(move || {
                for round in 0..200 {
                    let name = format!("churn-{round}");
                    let other = system.allocate_segment(&SegmentConfig::new(&name, 64)).unwrap();
                    assert!(system.deallocate_segment(other));
                }
            })
        };
        for _ in 0..2_000 {
            assert!(system.atomic_add(id, 0, 1).success);
        }
        churn.join().unwrap();

        assert_eq!(system.atomic_read(id, 0).value, 2_000);
        assert_eq!(system.stats().total_segments, 1);
    }
}
