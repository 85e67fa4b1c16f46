//! Fuzz target for handshake message processing
//!
//! Runs a full loopback handshake for an arbitrary pattern and corrupts one
//! message in flight.
//!
//! # Strategy
//!
//! - Replace: message swapped for arbitrary bytes
//! - Bit flip: single bit flipped anywhere in the message
//! - Truncate / extend: message cut short or padded with junk
//!
//! # Invariants
//!
//! - NEVER panic on malformed handshake input
//! - An altered message never lets both peers reach Established
//! - An untouched exchange always completes with matching transcripts

#![no_main]

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use swarmlink_crypto::{ChannelConfig, Environment, HandshakePattern, KeyPair, SecureChannel};

#[derive(Clone)]
struct FuzzEnv {
    state: Arc<AtomicU64>,
}

impl Environment for FuzzEnv {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    fn wall_clock_millis(&self) -> u64 {
        1_700_000_000_000
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        for chunk in buffer.chunks_mut(8) {
            let mut z = self.state.fetch_add(0x9E37_79B9_7F4A_7C15, Ordering::Relaxed);
            z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
            z ^= z >> 31;
            chunk.copy_from_slice(&z.to_le_bytes()[..chunk.len()]);
        }
    }
}

#[derive(Debug, Clone, Arbitrary)]
struct Scenario {
    pattern: u8,
    seed: u64,
    /// Index of the message to corrupt (wrapped to the pattern's length)
    target: u8,
    attack: Option<Attack>,
}

#[derive(Debug, Clone, Arbitrary)]
enum Attack {
    Replace(Vec<u8>),
    FlipBit { index: u16, bit: u8 },
    Truncate { len: u16 },
    Extend(Vec<u8>),
}

impl Attack {
    fn apply(&self, message: &mut Vec<u8>) {
        match self {
            Attack::Replace(bytes) => *message = bytes.clone(),
            Attack::FlipBit { index, bit } => {
                if !message.is_empty() {
                    let i = *index as usize % message.len();
                    message[i] ^= 1 << (bit % 8);
                }
            },
            Attack::Truncate { len } => message.truncate(*len as usize),
            Attack::Extend(junk) => message.extend_from_slice(junk),
        }
    }
}

fuzz_target!(|scenario: Scenario| {
    let pattern = HandshakePattern::ALL[scenario.pattern as usize % HandshakePattern::ALL.len()];
    let env = FuzzEnv { state: Arc::new(AtomicU64::new(scenario.seed)) };

    let initiator_keys = KeyPair::generate(&env);
    let responder_keys = KeyPair::generate(&env);
    let mut initiator_config = ChannelConfig { pattern, ..ChannelConfig::default() };
    let mut responder_config = initiator_config.clone();
    if pattern.responder_static_premessage() {
        initiator_config.remote_static = Some(*responder_keys.public_key());
    }
    if pattern.initiator_static_premessage() {
        responder_config.remote_static = Some(*initiator_keys.public_key());
    }
    let mut initiator = SecureChannel::new(env.clone(), initiator_keys, initiator_config);
    let mut responder = SecureChannel::new(env, responder_keys, responder_config);

    let target = scenario.target as usize % pattern.message_count();
    let mut altered = false;

    let Ok(mut message) = initiator.initiate_handshake(None) else {
        panic!("initiator must start {pattern}");
    };
    let mut index = 0;
    let mut to_responder = true;
    loop {
        if index == target {
            if let Some(attack) = &scenario.attack {
                let original = message.clone();
                attack.apply(&mut message);
                altered = message != original;
            }
        }

        let receiver = if to_responder { &mut responder } else { &mut initiator };
        match receiver.process_handshake(&message) {
            Ok(Some(reply)) => message = reply,
            Ok(None) => break,
            Err(err) => {
                // INVARIANT: rejection only ever follows tampering
                assert!(altered, "{pattern}: clean message rejected: {err}");
                assert!(!receiver.is_connected());
                return;
            },
        }
        index += 1;
        to_responder = !to_responder;
    }

    if altered {
        // INVARIANT: a tampered transcript never yields a shared session
        assert!(!(initiator.is_connected() && responder.is_connected()), "{pattern}");
    } else {
        assert!(initiator.is_connected() && responder.is_connected(), "{pattern}");
        assert_eq!(initiator.handshake_hash(), responder.handshake_hash());
    }
});
