//! Swarmlink Secure Channel
//!
//! A Noise-style handshake followed by an authenticated, length-hiding
//! transport cipher. Sans-IO: every operation takes and returns byte buffers,
//! and the caller carries them across the boundary. Time and randomness come
//! from an [`Environment`] so tests run deterministically.
//!
//! # Key Lifecycle
//!
//! ```text
//! Protocol name + prologue
//!        │
//!        ▼
//! Handshake tokens (e, s, ee, es, se, ss) → chaining key, transcript hash
//!        │
//!        ▼ Split
//! Send key / Receive key (one per direction)
//!        │
//!        ▼ HMAC-SHA256 rotation at the rekey limit
//! ChaCha20-Poly1305 → EncryptedMessage
//! ```
//!
//! # Security
//!
//! Forward Secrecy:
//! - Fresh ephemeral key per handshake, wiped when the handshake state drops
//! - Rotation replaces a direction's key with a one-way hash of it
//!
//! Authenticity:
//! - Every handshake message after the first DH carries a tag bound to the
//!   whole transcript
//! - Transport nonce and timestamp are associated data
//! - Any failed tag closes the channel
//!
//! Replay Protection:
//! - The receiver accepts only the next nonce in sequence

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod cipher_state;

pub mod channel;
pub mod env;
pub mod error;
pub mod keys;
pub mod noise;
pub mod transport;

pub use channel::{ChannelConfig, ChannelState, DEFAULT_PROLOGUE, SecureChannel};
pub use cipher_state::{KEY_LEN, TAG_LEN};
pub use env::{Environment, SystemEnv};
pub use error::{ChannelError, IntegrityError, ProtocolError};
pub use keys::{DH_LEN, KeyPair, PublicKeyBytes};
pub use noise::{HandshakePattern, HandshakeState, HandshakeStatus, Role, TransportKeys};
pub use transport::{
    ChannelStats, EncryptedMessage, LatencyStats, MAX_PADDING_BLOCK, MAX_PLAINTEXT_LEN,
    TransportCipher, TransportConfig, apply_padding, remove_padding,
};
