//! Loopback self-test swarm.
//!
//! ```text
//!   worker 1..N ──┬─ atomic_add ────────────► counters[ATOMIC]
//!                 ├─ spinlock ─ read+write ─► counters[GUARDED]
//!                 └─ push ──► work ring ──► consumer (count, checksum)
//!
//!   initiator ◄── handshake / ping / pong ──► responder
//! ```
//!
//! Every worker hits the same slots so the run exercises contention, and
//! the watchdog runs alongside so a wedged lock cannot hang the node.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Instant,
};

use swarmlink_crypto::{
    ChannelConfig, ChannelStats, Environment, KeyPair, SecureChannel, SystemEnv,
};
use swarmlink_shm::{
    LockError, MemoryError, MemorySystem, RingBuffer, SegmentConfig, SegmentId, Watchdog,
};

use crate::{NodeConfig, NodeError, SwarmSnapshot};

const ATOMIC: usize = 0;
const GUARDED: usize = 1;
const LOCK: usize = 2;
const COUNTER_SLOTS: usize = 16;

/// What the consumer drained from the work ring.
#[derive(Debug, Default, Clone, Copy)]
struct Drained {
    count: u64,
    checksum: u64,
}

/// Run the self-test and return its snapshot.
///
/// # Errors
///
/// - `Config` if `config` fails validation
/// - `Lock` if a worker cannot take the shared lock within `lock_wait`
/// - `Channel` if the loopback handshake or a ping fails
/// - `Mismatch` if a counter or the drained ring disagrees with the work done
/// - `Corrupted` if a loopback message comes back altered
pub fn run_swarm(config: &NodeConfig) -> Result<SwarmSnapshot, NodeError> {
    config.validate()?;
    let started = Instant::now();
    let env = SystemEnv::new();

    let system = Arc::new(MemorySystem::new());
    let watchdog = Watchdog::spawn(&system, config.watchdog)?;
    let counters =
        system.allocate_segment(&SegmentConfig::with_slots("swarm/counters", COUNTER_SLOTS))?;
    let ring = RingBuffer::create(&system, "swarm/work", config.ring_capacity)?;

    tracing::info!(
        workers = config.workers,
        iterations = config.iterations,
        ring_capacity = config.ring_capacity,
        "starting swarm"
    );

    let drained = run_workers(&system, counters, &ring, config)?;
    watchdog.stop();

    let operations = (config.workers * config.iterations) as u64;
    check("atomic counter", operations, read_counter(&system, counters, ATOMIC))?;
    check("guarded counter", operations, read_counter(&system, counters, GUARDED))?;
    check("ring count", operations, drained.count)?;
    check("ring checksum", expected_checksum(config), drained.checksum)?;

    let channel = exchange_pings(&env, config)?;

    let snapshot = SwarmSnapshot::capture(
        config,
        &env,
        &system,
        channel,
        operations,
        started.elapsed(),
    );
    system.cleanup();

    tracing::info!(
        operations,
        elapsed_ms = snapshot.elapsed_ms,
        contention = snapshot.memory.contention_count,
        "swarm complete"
    );
    Ok(snapshot)
}

/// Spawn the workers and one consumer, wait for all of them.
fn run_workers(
    system: &MemorySystem,
    counters: SegmentId,
    ring: &RingBuffer,
    config: &NodeConfig,
) -> Result<Drained, NodeError> {
    let finished = AtomicUsize::new(0);

    thread::scope(|scope| {
        let consumer = scope.spawn(|| drain(ring, &finished, config.workers));

        let workers: Vec<_> = (1..=config.workers as i32)
            .map(|owner| {
                let finished = &finished;
                let handle = scope.spawn(move || {
                    let result = work(system, counters, ring, owner, config);
                    finished.fetch_add(1, Ordering::Release);
                    result
                });
                (owner, handle)
            })
            .collect();

        let mut outcome = Ok(());
        for (owner, handle) in workers {
            let result = handle
                .join()
                .unwrap_or_else(|_| Err(NodeError::WorkerPanicked { worker: owner }));
            if let Err(err) = result {
                tracing::warn!(worker = owner, error = %err, "worker failed");
                if outcome.is_ok() {
                    outcome = Err(err);
                }
            }
        }

        let drained = consumer.join().map_err(|_| NodeError::WorkerPanicked { worker: 0 })?;
        outcome.map(|()| drained)
    })
}

fn work(
    system: &MemorySystem,
    counters: SegmentId,
    ring: &RingBuffer,
    owner: i32,
    config: &NodeConfig,
) -> Result<(), NodeError> {
    for iteration in 0..config.iterations {
        system.atomic_add(counters, ATOMIC, 1).value().map_err(MemoryError::from)?;

        lock(system, counters, owner, config)?;
        let current = system.atomic_read(counters, GUARDED).value();
        if let Ok(value) = current {
            system.atomic_write(counters, GUARDED, value + 1);
        }
        // Release even if the slot vanished so the lock table stays clean.
        system.release_spinlock(counters, LOCK, owner)?;
        current.map_err(MemoryError::from)?;

        let item = work_item(iteration);
        while !ring.push(item) {
            thread::yield_now();
        }
    }
    tracing::debug!(worker = owner, "worker done");
    Ok(())
}

/// Spin briefly, then park until the lock frees up.
fn lock(
    system: &MemorySystem,
    counters: SegmentId,
    owner: i32,
    config: &NodeConfig,
) -> Result<(), LockError> {
    match system.acquire_spinlock(counters, LOCK, owner, config.lock_spins) {
        Err(LockError::Timeout { .. }) => {
            system.wait_for_lock(counters, LOCK, owner, config.lock_wait)
        },
        other => other,
    }
}

fn drain(ring: &RingBuffer, finished: &AtomicUsize, workers: usize) -> Drained {
    let mut drained = Drained::default();
    loop {
        // Sampled before the pop: once every worker has returned, an empty
        // ring means nothing is left in flight.
        let done = finished.load(Ordering::Acquire) == workers;
        match ring.pop() {
            Some(item) => {
                drained.count += 1;
                drained.checksum = drained.checksum.wrapping_add(item as u64);
            },
            None if done => return drained,
            None => thread::yield_now(),
        }
    }
}

fn work_item(iteration: usize) -> i32 {
    (iteration % (i32::MAX as usize)) as i32 + 1
}

fn expected_checksum(config: &NodeConfig) -> u64 {
    let per_worker =
        (0..config.iterations).fold(0u64, |sum, i| sum.wrapping_add(work_item(i) as u64));
    per_worker.wrapping_mul(config.workers as u64)
}

fn read_counter(system: &MemorySystem, counters: SegmentId, index: usize) -> u64 {
    system.atomic_read(counters, index).value.max(0) as u64
}

fn check(check: &'static str, expected: u64, actual: u64) -> Result<(), NodeError> {
    if expected == actual {
        Ok(())
    } else {
        Err(NodeError::Mismatch { check, expected, actual })
    }
}

/// Handshake two in-process peers and bounce `messages` pings off the
/// responder. Returns the initiator's stats.
fn exchange_pings<E: Environment>(
    env: &E,
    config: &NodeConfig,
) -> Result<ChannelStats, NodeError> {
    let pattern = config.channel.pattern;
    let initiator_keys = KeyPair::generate(env);
    let responder_keys = KeyPair::generate(env);

    let mut initiator_config = ChannelConfig { remote_static: None, ..config.channel.clone() };
    let mut responder_config = initiator_config.clone();
    if pattern.responder_static_premessage() {
        initiator_config.remote_static = Some(*responder_keys.public_key());
    }
    if pattern.initiator_static_premessage() {
        responder_config.remote_static = Some(*initiator_keys.public_key());
    }

    let mut initiator = SecureChannel::new(env.clone(), initiator_keys, initiator_config);
    let mut responder = SecureChannel::new(env.clone(), responder_keys, responder_config);

    let mut message = initiator.initiate_handshake(None)?;
    let mut to_responder = true;
    loop {
        let receiver = if to_responder { &mut responder } else { &mut initiator };
        match receiver.process_handshake(&message)? {
            Some(reply) => message = reply,
            None => break,
        }
        to_responder = !to_responder;
    }
    tracing::debug!(%pattern, "loopback handshake complete");

    for i in 0..config.messages {
        let ping = format!("ping {i}");
        let received = responder.decrypt(&initiator.encrypt(ping.as_bytes())?)?;
        let echoed = initiator.decrypt(&responder.encrypt(b"pong")?)?;
        if received != ping.as_bytes() || echoed != b"pong" {
            return Err(NodeError::Corrupted { index: i });
        }
    }

    let stats = initiator.stats();
    initiator.close();
    responder.close();
    Ok(stats)
}
