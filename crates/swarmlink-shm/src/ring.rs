//! Bounded multi-producer multi-consumer ring buffer over a segment.
//!
//! # Layout
//!
//! ```text
//! slot 0          head ticket
//! slot 1          tail ticket
//! slot 2          capacity
//! slot 3 ..       values[capacity]
//! slot 3+cap ..   sequences[capacity]
//! ```
//!
//! Tickets count pushes (tail) and pops (head) modulo a lap limit that is a
//! multiple of the capacity, so `ticket % capacity` always names the same
//! slot across wrap-around. Empty is `head == tail`, full is
//! `tail - head == capacity`.
//!
//! Each value slot has a sequence number saying whose turn it is:
//!
//! - `seq == t`: free for the producer holding tail ticket `t`
//! - `seq == t + 1`: holds the value pushed with ticket `t`, ready for the
//!   consumer holding head ticket `t`
//! - after that consumer is done, `seq = t + capacity`, the next lap's
//!   producer ticket
//!
//! Claiming a ticket (CAS on head/tail) and publishing the slot (store of the
//! sequence) are separate steps, so a consumer never reads a slot whose value
//! has not been written yet, and a producer never overwrites a value that has
//! not been read.

use std::{hint, sync::Arc};

use crate::{
    error::{AccessError, MemoryError, RingError},
    segment::{SegmentConfig, SegmentId},
    system::MemorySystem,
};

const HEAD: usize = 0;
const TAIL: usize = 1;
const CAPACITY: usize = 2;

/// Slots before the value array.
pub const HEADER_SLOTS: usize = 3;

/// Smallest supported capacity. With one slot, "published" (`t + 1`) and
/// "released" (`t + capacity`) sequence values coincide.
pub const MIN_RING_CAPACITY: usize = 2;

/// Largest supported capacity.
pub const MAX_RING_CAPACITY: usize = 1 << 24;

fn check_capacity(capacity: usize) -> Result<(), RingError> {
    if (MIN_RING_CAPACITY..=MAX_RING_CAPACITY).contains(&capacity) {
        Ok(())
    } else {
        Err(RingError::InvalidCapacity {
            capacity,
            min: MIN_RING_CAPACITY,
            max: MAX_RING_CAPACITY,
        })
    }
}

/// Slots a ring of `capacity` occupies.
pub fn ring_slots(capacity: usize) -> usize {
    HEADER_SLOTS + 2 * capacity
}

/// Handle to a ring stored in a [`MemorySystem`] segment.
///
/// Cheap to clone; every clone operates on the same shared slots.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    system: Arc<MemorySystem>,
    segment: SegmentId,
    capacity: u64,
    /// Tickets wrap at this multiple of `capacity`
    lap: u64,
}

impl RingBuffer {
    /// Allocate a segment named `name` and initialize an empty ring in it.
    ///
    /// # Errors
    ///
    /// - `InvalidCapacity` outside [`MIN_RING_CAPACITY`]..=[`MAX_RING_CAPACITY`]
    /// - `Memory` if the segment cannot be allocated (e.g. name in use)
    pub fn create(
        system: &Arc<MemorySystem>,
        name: &str,
        capacity: usize,
    ) -> Result<Self, RingError> {
        check_capacity(capacity)?;

        let segment =
            system.allocate_segment(&SegmentConfig::with_slots(name, ring_slots(capacity)))?;
        let ring = Self::with_capacity(system, segment, capacity);

        ring.store(CAPACITY, capacity as u64)?;
        for index in 0..capacity {
            ring.store(ring.sequence_slot(index as u64), index as u64)?;
        }
        ring.store(HEAD, 0)?;
        ring.store(TAIL, 0)?;

        tracing::debug!(segment = %segment, name, capacity, "created ring buffer");
        Ok(ring)
    }

    /// Open a ring previously created in segment `segment`.
    ///
    /// # Errors
    ///
    /// - `Memory` if the segment does not exist
    /// - `InvalidCapacity` / `LayoutMismatch` if the header does not describe
    ///   a ring that fits the segment
    pub fn attach(system: &Arc<MemorySystem>, segment: SegmentId) -> Result<Self, RingError> {
        let len = system
            .segment_len(segment)
            .ok_or(MemoryError::Access(AccessError::SegmentNotFound(segment)))?;
        let stored = system.atomic_read(segment, CAPACITY).value()?;

        let capacity = usize::try_from(stored).unwrap_or(0);
        check_capacity(capacity)?;
        if ring_slots(capacity) > len {
            return Err(RingError::LayoutMismatch { id: segment, len, capacity });
        }
        Ok(Self::with_capacity(system, segment, capacity))
    }

    fn with_capacity(system: &Arc<MemorySystem>, segment: SegmentId, capacity: usize) -> Self {
        let capacity = capacity as u64;
        Self {
            system: Arc::clone(system),
            segment,
            capacity,
            lap: (u64::from(u32::MAX) / capacity) * capacity,
        }
    }

    /// Backing segment.
    pub fn segment(&self) -> SegmentId {
        self.segment
    }

    /// Maximum number of queued values.
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Queued values at this instant. Approximate under concurrency.
    pub fn len(&self) -> usize {
        let (Some(head), Some(tail)) = (self.load(HEAD), self.load(TAIL)) else {
            return 0;
        };
        self.distance(head, tail).min(self.capacity) as usize
    }

    /// True if no values are queued at this instant.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue `value`. Returns false if the ring is full or its segment is
    /// gone.
    pub fn push(&self, value: i32) -> bool {
        loop {
            let Some(tail) = self.load(TAIL) else { return false };
            let Some(head) = self.load(HEAD) else { return false };

            let used = self.distance(head, tail);
            if used > self.capacity {
                // Torn snapshot: head moved past the tail we read.
                hint::spin_loop();
                continue;
            }
            if used == self.capacity {
                return false;
            }

            let sequence_slot = self.sequence_slot(tail);
            let Some(sequence) = self.load(sequence_slot) else { return false };
            if sequence != tail {
                // Slot still owned by a consumer, or our tail is stale.
                hint::spin_loop();
                continue;
            }

            let next = self.advance(tail, 1);
            let claim = self.system.compare_and_swap(
                self.segment,
                TAIL,
                encode(tail),
                encode(next),
            );
            if claim.error.is_some() {
                return false;
            }
            if claim.success {
                self.system.atomic_write(self.segment, self.value_slot(tail), value);
                self.system.atomic_write(self.segment, sequence_slot, encode(next));
                return true;
            }
        }
    }

    /// Dequeue the oldest value. `None` if empty or the segment is gone.
    pub fn pop(&self) -> Option<i32> {
        loop {
            let head = self.load(HEAD)?;
            let tail = self.load(TAIL)?;

            let used = self.distance(head, tail);
            if used == 0 {
                return None;
            }
            if used > self.capacity {
                hint::spin_loop();
                continue;
            }

            let sequence_slot = self.sequence_slot(head);
            let next = self.advance(head, 1);
            if self.load(sequence_slot)? != next {
                // Producer claimed the slot but has not published yet.
                hint::spin_loop();
                continue;
            }

            // Read before advancing head; once head moves, a producer may
            // reuse the slot on the next lap.
            let value = self.system.atomic_read(self.segment, self.value_slot(head)).value().ok()?;

            let claim = self.system.compare_and_swap(
                self.segment,
                HEAD,
                encode(head),
                encode(next),
            );
            if claim.error.is_some() {
                return None;
            }
            if claim.success {
                let released = self.advance(head, self.capacity);
                self.system.atomic_write(self.segment, sequence_slot, encode(released));
                return Some(value);
            }
        }
    }

    fn value_slot(&self, ticket: u64) -> usize {
        HEADER_SLOTS + (ticket % self.capacity) as usize
    }

    fn sequence_slot(&self, ticket: u64) -> usize {
        HEADER_SLOTS + self.capacity as usize + (ticket % self.capacity) as usize
    }

    fn advance(&self, ticket: u64, by: u64) -> u64 {
        (ticket + by) % self.lap
    }

    /// Tickets from `head` forward to `tail`.
    fn distance(&self, head: u64, tail: u64) -> u64 {
        (tail + self.lap - head) % self.lap
    }

    fn load(&self, slot: usize) -> Option<u64> {
        self.system.atomic_read(self.segment, slot).value().ok().map(decode)
    }

    fn store(&self, slot: usize, ticket: u64) -> Result<(), RingError> {
        self.system.atomic_write(self.segment, slot, encode(ticket)).value()?;
        Ok(())
    }
}

/// Tickets live below 2^32 and are stored as the raw bits of an `i32` slot.
fn encode(ticket: u64) -> i32 {
    ticket as u32 as i32
}

fn decode(raw: i32) -> u64 {
    u64::from(raw as u32)
}
