//! Fuzz target for transport message decoding and decryption
//!
//! Establishes an XX channel, then interleaves genuine traffic with forged,
//! tampered and replayed messages.
//!
//! # Strategy
//!
//! - Forge: arbitrary bytes decoded as an encrypted message
//! - Tamper: one bit flipped in a genuine encoded message
//! - Replay: the last delivered message sent again
//! - Unpad: arbitrary bytes fed straight to padding removal
//!
//! # Invariants
//!
//! - NEVER panic on malformed input
//! - Forged, tampered and replayed messages are rejected and close the channel
//! - Genuine messages round-trip until the channel closes
//! - Padding removal never returns more bytes than it was given

#![no_main]

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use swarmlink_crypto::{
    remove_padding, ChannelConfig, EncryptedMessage, Environment, SecureChannel,
};

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
    seed: u64,
    padding_block: Option<u8>,
    rekey_interval: Option<u8>,
    operations: Vec<Operation>,
}

#[derive(Debug, Clone, Arbitrary)]
enum Operation {
    Send { from_initiator: bool, data: Vec<u8> },
    Forge(Vec<u8>),
    Tamper { data: Vec<u8>, index: u16, bit: u8 },
    Replay,
    Unpad(Vec<u8>),
}

fuzz_target!(|scenario: Scenario| {
    let env = FuzzEnv { state: Arc::new(AtomicU64::new(scenario.seed)) };
    let config = ChannelConfig {
        padding_block: scenario.padding_block.map(usize::from),
        rekey_interval: scenario.rekey_interval.map(u64::from),
        ..ChannelConfig::default()
    };
    let mut initiator = SecureChannel::generate(env.clone(), config.clone());
    let mut responder = SecureChannel::generate(env, config);

    let Ok(first) = initiator.initiate_handshake(None) else { return };
    let Ok(Some(second)) = responder.process_handshake(&first) else { return };
    let Ok(Some(third)) = initiator.process_handshake(&second) else { return };
    let Ok(None) = responder.process_handshake(&third) else { return };
    assert!(initiator.is_connected() && responder.is_connected());

    let mut last_to_responder: Option<EncryptedMessage> = None;

    for op in scenario.operations {
        match op {
            Operation::Send { from_initiator, data } => {
                let (sender, receiver) = if from_initiator {
                    (&mut initiator, &mut responder)
                } else {
                    (&mut responder, &mut initiator)
                };
                let Ok(message) = sender.encrypt(&data) else { return };
                let Ok(plaintext) = receiver.decrypt(&message) else {
                    panic!("genuine message rejected");
                };
                assert_eq!(plaintext, data);
                if from_initiator {
                    last_to_responder = Some(message);
                }
            },

            Operation::Forge(bytes) => {
                let Ok(forged) = EncryptedMessage::decode(&bytes) else { continue };
                // INVARIANT: no forgery decrypts
                assert!(responder.decrypt(&forged).is_err());
                assert!(!responder.is_connected());
                return;
            },

            Operation::Tamper { data, index, bit } => {
                let Ok(message) = initiator.encrypt(&data) else { return };
                let mut encoded = message.encode();
                let i = index as usize % encoded.len();
                encoded[i] ^= 1 << (bit % 8);

                if let Ok(tampered) = EncryptedMessage::decode(&encoded) {
                    assert!(responder.decrypt(&tampered).is_err());
                    assert!(!responder.is_connected());
                }
                return;
            },

            Operation::Replay => {
                let Some(message) = &last_to_responder else { continue };
                // INVARIANT: a delivered message is never accepted twice
                assert!(responder.decrypt(message).is_err());
                return;
            },

            Operation::Unpad(bytes) => {
                if let Ok(plaintext) = remove_padding(&bytes) {
                    assert!(plaintext.len() <= bytes.len());
                }
            },
        }
    }
});
