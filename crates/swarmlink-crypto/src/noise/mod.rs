//! Noise-style handshake engine.
//!
//! # Architecture
//!
//! ```text
//! HandshakePattern ──> token lists per message
//!        │
//!        ▼
//! HandshakeState ──> SymmetricState { ck, h, CipherState }
//!        │
//!        ▼ finalize()
//! TransportKeys { send, recv, handshake_hash, remote_static }
//! ```
//!
//! The cipher suite is fixed: X25519, ChaCha20-Poly1305, SHA-256.

mod handshake;
mod pattern;
mod symmetric;

pub use handshake::{
    HandshakeState, HandshakeStatus, MAX_HANDSHAKE_MESSAGE_LEN, Role, TransportKeys,
};
pub use pattern::{HandshakePattern, Token};
pub use symmetric::HASH_LEN;
