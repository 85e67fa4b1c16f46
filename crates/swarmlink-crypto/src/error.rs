//! Error types for the handshake and transport layers.
//!
//! Three families, mirroring how callers must react:
//!
//! - [`ProtocolError`]: malformed or out-of-order handshake input. Fatal, the
//!   channel must be torn down and a fresh handshake started.
//! - [`IntegrityError`]: authentication tag, nonce or padding mismatch after
//!   the handshake. Fatal, assume tampering or desynchronized state.
//! - [`ChannelError`]: what [`crate::SecureChannel`] returns, wrapping the two
//!   above plus lifecycle misuse.
//!
//! None of these are ever retried internally; silently retrying a failed
//! decrypt could mask an active attack.

use std::io;

use thiserror::Error;

use crate::noise::{HandshakePattern, HandshakeStatus};

/// Errors raised while driving a handshake.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Operation not allowed in the current handshake state
    #[error("invalid handshake state: cannot {operation} while {state:?}")]
    InvalidState {
        /// State when the error occurred
        state: HandshakeStatus,
        /// Operation that was attempted
        operation: &'static str,
    },

    /// Incoming message ended before all expected tokens were read
    #[error("handshake message truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        /// Bytes required by the next token
        needed: usize,
        /// Bytes left in the message
        remaining: usize,
    },

    /// Incoming message carried bytes after the expected tokens
    #[error("unexpected handshake payload of {len} bytes")]
    UnexpectedPayload {
        /// Length of the payload
        len: usize,
    },

    /// A key the pattern requires was not supplied or not yet received
    #[error("pattern {pattern} requires the {key} key")]
    MissingKey {
        /// Pattern being executed
        pattern: HandshakePattern,
        /// Which key was missing
        key: &'static str,
    },

    /// An embedded static key or payload failed authentication
    #[error("handshake decryption failed")]
    DecryptFailed,

    /// Remote public key produced an all-zero shared secret
    #[error("remote public key is a low-order point")]
    InvalidPublicKey,

    /// Message exceeds the Noise maximum
    #[error("handshake message of {len} bytes exceeds {max}")]
    MessageTooLarge {
        /// Actual length
        len: usize,
        /// Maximum allowed
        max: usize,
    },

    /// Pattern name not one of the supported patterns
    #[error("unknown handshake pattern: {0}")]
    UnknownPattern(String),

    /// Token string not recognised
    #[error("unknown handshake token: {0}")]
    UnknownToken(String),
}

/// Errors raised by the transport cipher after the handshake.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    /// AEAD authentication failed
    #[error("authentication tag mismatch")]
    TagMismatch,

    /// Message nonce is not the next expected one (replay, drop or reorder)
    #[error("unexpected nonce: expected {expected}, received {received}")]
    NonceMismatch {
        /// Next nonce the receiver expects
        expected: u64,
        /// Nonce carried by the message
        received: u64,
    },

    /// Decrypted plaintext carries an impossible length prefix
    #[error("malformed padding: prefix declares {declared} bytes, {available} available")]
    MalformedPadding {
        /// Length declared in the prefix
        declared: usize,
        /// Bytes after the prefix
        available: usize,
    },

    /// Serialized message shorter than its fixed header
    #[error("encrypted message truncated: {len} bytes")]
    Truncated {
        /// Length of the input
        len: usize,
    },
}

/// Errors returned by [`crate::SecureChannel`] and [`crate::TransportCipher`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Handshake failure
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Tampering or desynchronisation detected
    #[error("integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    /// Encrypt/decrypt called before the handshake completed
    #[error("channel not established")]
    NotEstablished,

    /// Channel was closed, either explicitly or by a fatal error
    #[error("channel closed")]
    Closed,

    /// Plaintext larger than the supported maximum
    #[error("message of {len} bytes exceeds {max}")]
    MessageTooLarge {
        /// Actual length
        len: usize,
        /// Maximum allowed
        max: usize,
    },

    /// Configured padding block larger than the supported maximum
    #[error("padding block of {block} bytes exceeds {max}")]
    InvalidPaddingBlock {
        /// Configured block size
        block: usize,
        /// Maximum allowed
        max: usize,
    },

    /// `initiate_handshake` called after the handshake started
    #[error("handshake already initiated")]
    AlreadyInitiated,

    /// Handshake message fed to an established channel
    #[error("channel already established")]
    AlreadyEstablished,
}

impl ChannelError {
    /// Returns true if this error tears the channel down.
    ///
    /// Protocol and integrity failures indicate a broken or malicious peer.
    /// Lifecycle misuse and oversized input are caller bugs and leave the
    /// channel untouched.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Integrity(_))
    }
}

/// Convert `ChannelError` to `io::Error` for transports built on std I/O.
impl From<ChannelError> for io::Error {
    fn from(err: ChannelError) -> Self {
        let kind = match &err {
            ChannelError::Protocol(_) | ChannelError::Integrity(_) => io::ErrorKind::InvalidData,
            ChannelError::NotEstablished => io::ErrorKind::NotConnected,
            ChannelError::Closed => io::ErrorKind::BrokenPipe,
            ChannelError::MessageTooLarge { .. } | ChannelError::InvalidPaddingBlock { .. } => {
                io::ErrorKind::InvalidInput
            },
            ChannelError::AlreadyInitiated | ChannelError::AlreadyEstablished => {
                io::ErrorKind::AlreadyExists
            },
        };
        Self::new(kind, err.to_string())
    }
}
