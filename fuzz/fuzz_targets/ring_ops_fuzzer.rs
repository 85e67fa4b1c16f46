//! Fuzz target for shared-memory slot and ring operations
//!
//! Drives a ring buffer and a raw segment with arbitrary operation
//! sequences, checking the ring against a bounded queue model.
//!
//! # Strategy
//!
//! - Push/pop sequences across many laps of a small ring
//! - Slot operations at arbitrary (often out-of-range) indices
//! - Lock acquire/release with arbitrary owner ids
//!
//! # Invariants
//!
//! - NEVER panic on any index, owner or operation order
//! - Ring contents always match the model queue
//! - Out-of-range slot operations fail softly and leave memory untouched
//! - A lock slot only ever holds UNLOCKED or its current owner

#![no_main]

use std::{collections::VecDeque, sync::Arc};

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use swarmlink_shm::{
    LockError, MemorySystem, RingBuffer, SegmentConfig, MIN_RING_CAPACITY, UNLOCKED,
};

const SLOTS: usize = 32;

#[derive(Debug, Clone, Arbitrary)]
struct Scenario {
    capacity: u8,
    operations: Vec<Operation>,
}

#[derive(Debug, Clone, Arbitrary)]
enum Operation {
    Push(i32),
    Pop,
    Add { index: u16, delta: i32 },
    Cas { index: u16, expected: i32, new: i32 },
    Acquire { index: u8, owner: i32 },
    Release { index: u8, owner: i32 },
}

fuzz_target!(|scenario: Scenario| {
    let capacity = MIN_RING_CAPACITY + scenario.capacity as usize % 63;
    let system = Arc::new(MemorySystem::new());
    let Ok(ring) = RingBuffer::create(&system, "ring", capacity) else {
        panic!("ring of capacity {capacity} must be creatable");
    };
    let Ok(segment) = system.allocate_segment(&SegmentConfig::with_slots("raw", SLOTS)) else {
        panic!("raw segment must be allocatable");
    };

    let mut model = VecDeque::new();
    let mut owners = [UNLOCKED; SLOTS];

    for op in scenario.operations {
        match op {
            Operation::Push(value) => {
                let accepted = ring.push(value);
                assert_eq!(accepted, model.len() < capacity);
                if accepted {
                    model.push_back(value);
                }
            },

            Operation::Pop => assert_eq!(ring.pop(), model.pop_front()),

            Operation::Add { index, delta } => {
                let index = index as usize;
                let result = system.atomic_add(segment, index, delta);
                // INVARIANT: soft failure exactly when out of range
                assert_eq!(result.success, index < SLOTS);
                assert_eq!(result.error.is_some(), index >= SLOTS);
                if result.success {
                    assert_eq!(result.value, result.previous_value.wrapping_add(delta));
                    owners[index] = result.value;
                }
            },

            Operation::Cas { index, expected, new } => {
                let index = index as usize;
                let result = system.compare_and_swap(segment, index, expected, new);
                if index >= SLOTS {
                    assert!(result.error.is_some());
                    continue;
                }
                assert_eq!(result.success, owners[index] == expected);
                if result.success {
                    owners[index] = new;
                }
                assert_eq!(system.atomic_read(segment, index).value, owners[index]);
            },

            Operation::Acquire { index, owner } => {
                let index = index as usize % SLOTS;
                match system.acquire_spinlock(segment, index, owner, 2) {
                    Ok(()) => {
                        assert!(owner > UNLOCKED);
                        assert_eq!(owners[index], UNLOCKED);
                        owners[index] = owner;
                    },
                    Err(LockError::InvalidOwner(_)) => assert!(owner <= UNLOCKED),
                    Err(LockError::Timeout { .. }) => assert_ne!(owners[index], UNLOCKED),
                    Err(err) => panic!("unexpected lock error: {err}"),
                }
            },

            Operation::Release { index, owner } => {
                let index = index as usize % SLOTS;
                match system.release_spinlock(segment, index, owner) {
                    Ok(()) => {
                        assert_eq!(owners[index], owner);
                        owners[index] = UNLOCKED;
                    },
                    Err(LockError::InvalidOwner(_)) => assert!(owner <= UNLOCKED),
                    Err(LockError::NotOwner { current }) => {
                        assert_eq!(current, owners[index]);
                        assert_ne!(current, owner);
                    },
                    Err(err) => panic!("unexpected release error: {err}"),
                }
            },
        }
    }

    assert_eq!(ring.len(), model.len());
});
