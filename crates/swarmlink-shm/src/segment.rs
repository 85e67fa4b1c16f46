//! Fixed-layout memory segments.
//!
//! A segment is a run of cache-line blocks, each holding sixteen 32-bit
//! atomic slots. Every accessor addresses memory in units of
//! [`SLOT_BYTES`]; byte sizes only appear at allocation time.
//!
//! ```text
//! ┌──────────────── 64 bytes ────────────────┐
//! │ slot 0 │ slot 1 │ ...           │ slot 15│  CacheLine 0
//! ├──────────────────────────────────────────┤
//! │ slot 16│ ...                             │  CacheLine 1
//! └──────────────────────────────────────────┘
//! ```

use std::{
    fmt,
    sync::atomic::{AtomicI32, AtomicU64, Ordering},
    time::Instant,
};

use serde::{Deserialize, Serialize};

use crate::{
    clock::Clock,
    error::{AccessError, MemoryError},
};

/// Width of one slot in bytes.
pub const SLOT_BYTES: usize = 4;

/// Cache line size and default segment alignment.
pub const CACHE_LINE_BYTES: usize = 64;

/// Largest segment accepted, in bytes.
pub const MAX_SEGMENT_BYTES: usize = 1 << 30;

const SLOTS_PER_LINE: usize = CACHE_LINE_BYTES / SLOT_BYTES;

/// Unique segment identifier. Never reused within a [`crate::MemorySystem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentId(pub u64);

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Segment allocation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentConfig {
    /// Unique name among live segments
    pub name: String,
    /// Requested size in bytes, rounded up to `alignment`
    pub size: usize,
    /// Value every slot starts with (zero if unset)
    #[serde(default)]
    pub initial_value: Option<i32>,
    /// Size granularity in bytes; power of two, at least one slot
    #[serde(default)]
    pub alignment: Option<usize>,
}

impl SegmentConfig {
    /// Request `size` bytes under `name`.
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self { name: name.into(), size, initial_value: None, alignment: None }
    }

    /// Request room for at least `slots` slots.
    pub fn with_slots(name: impl Into<String>, slots: usize) -> Self {
        Self::new(name, slots.saturating_mul(SLOT_BYTES))
    }

    /// Fill every slot with `value`.
    #[must_use]
    pub fn initial_value(mut self, value: i32) -> Self {
        self.initial_value = Some(value);
        self
    }

    /// Override the default cache-line alignment.
    #[must_use]
    pub fn alignment(mut self, alignment: usize) -> Self {
        self.alignment = Some(alignment);
        self
    }

    /// Size after rounding up to the alignment.
    ///
    /// # Errors
    ///
    /// - `InvalidAlignment` if the alignment is not a power of two of at
    ///   least [`SLOT_BYTES`]
    /// - `InvalidSize` if the size is zero or exceeds [`MAX_SEGMENT_BYTES`]
    pub fn aligned_size(&self) -> Result<usize, MemoryError> {
        let alignment = self.alignment.unwrap_or(CACHE_LINE_BYTES);
        if !alignment.is_power_of_two() || alignment < SLOT_BYTES {
            return Err(MemoryError::InvalidAlignment { alignment });
        }
        if self.size == 0 || self.size > MAX_SEGMENT_BYTES {
            return Err(MemoryError::InvalidSize { size: self.size });
        }
        Ok(self.size.div_ceil(alignment) * alignment)
    }
}

#[repr(C, align(64))]
struct CacheLine([AtomicI32; SLOTS_PER_LINE]);

impl CacheLine {
    fn filled(value: i32) -> Self {
        Self(std::array::from_fn(|_| AtomicI32::new(value)))
    }
}

/// A named region of atomic slots.
pub struct MemorySegment {
    id: SegmentId,
    name: String,
    lines: Box<[CacheLine]>,
    len: usize,
    size: usize,
    alignment: usize,
    access_count: AtomicU64,
    created_at: Instant,
    created_at_ms: u64,
    /// Nanoseconds after `created_at` of the latest access
    last_access_ns: AtomicU64,
}

impl MemorySegment {
    pub(crate) fn new(
        id: SegmentId,
        config: &SegmentConfig,
        clock: &dyn Clock,
    ) -> Result<Self, MemoryError> {
        let size = config.aligned_size()?;
        let len = size / SLOT_BYTES;
        let initial = config.initial_value.unwrap_or(0);
        let lines = (0..len.div_ceil(SLOTS_PER_LINE)).map(|_| CacheLine::filled(initial)).collect();

        Ok(Self {
            id,
            name: config.name.clone(),
            lines,
            len,
            size,
            alignment: config.alignment.unwrap_or(CACHE_LINE_BYTES),
            access_count: AtomicU64::new(0),
            created_at: clock.now(),
            created_at_ms: clock.wall_clock_millis(),
            last_access_ns: AtomicU64::new(0),
        })
    }

    /// Segment id.
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Segment name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of addressable slots.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; segments hold at least one slot.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size in bytes after alignment.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Slot `index`, recording the access.
    pub(crate) fn slot(&self, index: usize, now: Instant) -> Result<&AtomicI32, AccessError> {
        if index >= self.len {
            return Err(AccessError::IndexOutOfRange { index, len: self.len });
        }
        self.access_count.fetch_add(1, Ordering::Relaxed);
        let since_creation = now.saturating_duration_since(self.created_at).as_nanos();
        self.last_access_ns.fetch_max(since_creation as u64, Ordering::Relaxed);

        Ok(&self.lines[index / SLOTS_PER_LINE].0[index % SLOTS_PER_LINE])
    }

    /// Description as of `now`.
    pub fn info(&self, now: Instant) -> SegmentInfo {
        let last_access_ns = self.last_access_ns.load(Ordering::Relaxed);
        let idle = now.saturating_duration_since(self.created_at).as_nanos() as u64;
        SegmentInfo {
            id: self.id,
            name: self.name.clone(),
            size: self.size,
            slots: self.len,
            alignment: self.alignment,
            access_count: self.access_count.load(Ordering::Relaxed),
            created_at_ms: self.created_at_ms,
            idle_ms: idle.saturating_sub(last_access_ns) / 1_000_000,
        }
    }
}

impl fmt::Debug for MemorySegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySegment")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("slots", &self.len)
            .finish_non_exhaustive()
    }
}

/// Snapshot of a segment's metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentInfo {
    /// Segment id
    pub id: SegmentId,
    /// Segment name
    pub name: String,
    /// Size in bytes after alignment
    pub size: usize,
    /// Addressable slots
    pub slots: usize,
    /// Alignment in bytes
    pub alignment: usize,
    /// Slot accesses since allocation
    pub access_count: u64,
    /// Wall clock at allocation, milliseconds since the Unix epoch
    pub created_at_ms: u64,
    /// Milliseconds since the last slot access (or since allocation)
    pub idle_ms: u64,
}
