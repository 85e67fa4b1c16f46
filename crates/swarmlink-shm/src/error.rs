//! Error types for the shared-memory layer.
//!
//! Data-plane failures ([`AccessError`]) are reported inside
//! [`crate::AtomicResult`] rather than returned as `Err`, so hot loops can
//! retry without branching on `Result`. Registry, lock and ring operations
//! return ordinary `Result`s.

use thiserror::Error;

use crate::segment::SegmentId;

/// A slot could not be addressed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessError {
    /// No live segment with this id
    #[error("segment {0} not found")]
    SegmentNotFound(SegmentId),

    /// Slot index past the end of the segment
    #[error("slot index {index} out of range for segment of {len} slots")]
    IndexOutOfRange {
        /// Requested slot
        index: usize,
        /// Slots in the segment
        len: usize,
    },
}

/// Registry errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// Slot addressing failed
    #[error(transparent)]
    Access(#[from] AccessError),

    /// A live segment already uses this name
    #[error("segment name {0:?} already in use")]
    NameInUse(String),

    /// Requested size is zero or too large
    #[error("invalid segment size: {size} bytes")]
    InvalidSize {
        /// Requested size in bytes
        size: usize,
    },

    /// Alignment is not a power of two of at least one slot
    #[error("invalid alignment: {alignment} bytes")]
    InvalidAlignment {
        /// Requested alignment in bytes
        alignment: usize,
    },
}

/// Spinlock errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Lock still held after the attempt budget or deadline
    #[error("lock not acquired after {attempts} attempts")]
    Timeout {
        /// CAS attempts made
        attempts: u64,
    },

    /// Release by a caller that does not hold the lock
    #[error("lock held by {current}, not the caller")]
    NotOwner {
        /// Value found in the lock slot
        current: i32,
    },

    /// Owner ids must be positive; zero means unlocked
    #[error("invalid lock owner id {0}")]
    InvalidOwner(i32),

    /// Lock slot could not be addressed
    #[error(transparent)]
    Memory(#[from] AccessError),
}

impl LockError {
    /// Returns true if retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Ring buffer construction errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RingError {
    /// Backing segment could not be allocated or read
    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// Capacity outside the supported range
    #[error("invalid ring capacity {capacity} (supported {min}..={max})")]
    InvalidCapacity {
        /// Requested or stored capacity
        capacity: usize,
        /// Supported minimum
        min: usize,
        /// Supported maximum
        max: usize,
    },

    /// Segment is too small for the capacity in its header
    #[error("segment {id} of {len} slots cannot hold a ring of capacity {capacity}")]
    LayoutMismatch {
        /// Segment inspected
        id: SegmentId,
        /// Slots in the segment
        len: usize,
        /// Capacity stored in the header
        capacity: usize,
    },
}

impl From<AccessError> for RingError {
    fn from(err: AccessError) -> Self {
        Self::Memory(MemoryError::Access(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeout_is_transient() {
        assert!(LockError::Timeout { attempts: 3 }.is_transient());
        assert!(!LockError::NotOwner { current: 7 }.is_transient());
        assert!(!LockError::InvalidOwner(0).is_transient());
    }

    #[test]
    fn access_errors_convert_through_layers() {
        let access = AccessError::IndexOutOfRange { index: 20, len: 16 };
        assert_eq!(RingError::from(access), RingError::Memory(MemoryError::Access(access)));
        assert_eq!(LockError::from(access), LockError::Memory(access));
        assert_eq!(
            access.to_string(),
            "slot index 20 out of range for segment of 16 slots"
        );
    }
}
