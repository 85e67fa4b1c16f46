//! Token-driven handshake state machine.
//!
//! One engine executes every pattern: each message is a list of tokens, and
//! writing/reading a message walks the list, appending or consuming key
//! material and mixing DH results into the chaining key. Both sides advance
//! the transcript hash identically, so any divergence (wrong order, tampered
//! bytes, wrong static key) surfaces as a failed decryption.

use std::fmt;

use zeroize::Zeroize;

use super::{
    pattern::{HandshakePattern, Token},
    symmetric::{HASH_LEN, SymmetricState},
};
use crate::{
    cipher_state::{KEY_LEN, TAG_LEN},
    env::Environment,
    error::ProtocolError,
    keys::{DH_LEN, KeyPair, PublicKeyBytes},
};

/// Noise maximum message length.
pub const MAX_HANDSHAKE_MESSAGE_LEN: usize = 65535;

/// Which side of the handshake this state plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends the first message
    Initiator,
    /// Receives the first message
    Responder,
}

/// Coarse handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// No message processed yet
    Uninitialized,
    /// Messages remain
    Handshaking {
        /// Messages still to be written or read
        remaining: usize,
    },
    /// All messages processed, transport keys may be derived
    Complete,
}

/// Keys and bindings produced by a completed handshake.
///
/// `send`/`recv` are already oriented for the local role: the initiator's
/// `send` equals the responder's `recv`.
pub struct TransportKeys {
    pub(crate) send: [u8; KEY_LEN],
    pub(crate) recv: [u8; KEY_LEN],
    /// Final transcript hash, usable for channel binding
    pub handshake_hash: [u8; HASH_LEN],
    /// Remote static key, if the pattern authenticated one
    pub remote_static: Option<PublicKeyBytes>,
}

impl Drop for TransportKeys {
    fn drop(&mut self) {
        self.send.zeroize();
        self.recv.zeroize();
    }
}

impl fmt::Debug for TransportKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportKeys")
            .field("remote_static", &self.remote_static)
            .finish_non_exhaustive()
    }
}

/// In-flight handshake.
///
/// Owns every secret of the exchange. Dropping it, whether after
/// [`HandshakeState::finalize`] or on abandonment, wipes the ephemeral key and
/// the chaining key.
pub struct HandshakeState {
    pattern: HandshakePattern,
    role: Role,
    symmetric: SymmetricState,
    /// Local static key pair
    s: Option<KeyPair>,
    /// Local ephemeral key pair
    e: Option<KeyPair>,
    /// Remote static public key
    rs: Option<PublicKeyBytes>,
    /// Remote ephemeral public key
    re: Option<PublicKeyBytes>,
    /// Index of the next message to write or read
    message_index: usize,
}

impl HandshakeState {
    /// Initialize a handshake.
    ///
    /// Mixes the prologue and any pre-message static keys (initiator's
    /// first) into the transcript.
    ///
    /// # Errors
    ///
    /// - `MissingKey` if the pattern needs a local static key or a known
    ///   remote static key that was not supplied
    pub fn new(
        pattern: HandshakePattern,
        role: Role,
        prologue: &[u8],
        local_static: Option<KeyPair>,
        remote_static: Option<PublicKeyBytes>,
    ) -> Result<Self, ProtocolError> {
        let needs_static = match role {
            Role::Initiator => pattern.initiator_has_static(),
            Role::Responder => pattern.responder_has_static(),
        };
        if needs_static && local_static.is_none() {
            return Err(ProtocolError::MissingKey { pattern, key: "local static" });
        }

        let (local_premessage, remote_premessage) = match role {
            Role::Initiator => {
                (pattern.initiator_static_premessage(), pattern.responder_static_premessage())
            },
            Role::Responder => {
                (pattern.responder_static_premessage(), pattern.initiator_static_premessage())
            },
        };
        if remote_premessage && remote_static.is_none() {
            return Err(ProtocolError::MissingKey { pattern, key: "remote static" });
        }

        let mut symmetric = SymmetricState::initialize(pattern.protocol_name().as_bytes());
        symmetric.mix_hash(prologue);

        let local_public = local_static.as_ref().map(|pair| *pair.public_key());
        let premessage_keys = match role {
            Role::Initiator => [
                local_premessage.then_some(local_public).flatten(),
                remote_premessage.then_some(remote_static).flatten(),
            ],
            Role::Responder => [
                remote_premessage.then_some(remote_static).flatten(),
                local_premessage.then_some(local_public).flatten(),
            ],
        };
        for key in premessage_keys.iter().flatten() {
            symmetric.mix_hash(key);
        }

        Ok(Self {
            pattern,
            role,
            symmetric,
            s: local_static,
            e: None,
            rs: if remote_premessage { remote_static } else { None },
            re: None,
            message_index: 0,
        })
    }

    /// Pattern being executed.
    pub fn pattern(&self) -> HandshakePattern {
        self.pattern
    }

    /// Local role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current progress.
    pub fn status(&self) -> HandshakeStatus {
        let total = self.pattern.message_count();
        match self.message_index {
            0 => HandshakeStatus::Uninitialized,
            index if index >= total => HandshakeStatus::Complete,
            index => HandshakeStatus::Handshaking { remaining: total - index },
        }
    }

    /// True once every message has been written or read.
    pub fn is_complete(&self) -> bool {
        self.message_index >= self.pattern.message_count()
    }

    /// True if the next message is ours to write.
    pub fn is_my_turn(&self) -> bool {
        let initiator_turn = self.message_index % 2 == 0;
        (self.role == Role::Initiator) == initiator_turn
    }

    /// Current transcript hash.
    pub fn handshake_hash(&self) -> [u8; HASH_LEN] {
        self.symmetric.handshake_hash()
    }

    /// Remote static key, once known.
    pub fn remote_static(&self) -> Option<&PublicKeyBytes> {
        self.rs.as_ref()
    }

    /// Write the next handshake message, ending with the encrypted payload.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if complete or not our turn
    /// - `MissingKey` if a DH token needs a key we do not have
    /// - `MessageTooLarge` if the payload pushes the message past the limit
    pub fn write_message<E: Environment>(
        &mut self,
        env: &E,
        payload: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        self.check_turn(true, "write a message")?;
        let tokens = self.pattern.tokens(self.message_index)?;

        let mut message = Vec::with_capacity(DH_LEN * 2 + TAG_LEN * 2 + payload.len());
        for token in tokens {
            match token {
                Token::E => {
                    let ephemeral = KeyPair::generate(env);
                    message.extend_from_slice(ephemeral.public_key());
                    self.symmetric.mix_hash(ephemeral.public_key());
                    self.e = Some(ephemeral);
                },
                Token::S => {
                    let public = *self.local_static()?.public_key();
                    let encrypted = self.symmetric.encrypt_and_hash(&public);
                    message.extend_from_slice(&encrypted);
                },
                dh_token => self.mix_dh(dh_token)?,
            }
        }
        message.extend_from_slice(&self.symmetric.encrypt_and_hash(payload));

        if message.len() > MAX_HANDSHAKE_MESSAGE_LEN {
            return Err(ProtocolError::MessageTooLarge {
                len: message.len(),
                max: MAX_HANDSHAKE_MESSAGE_LEN,
            });
        }

        self.message_index += 1;
        tracing::debug!(
            pattern = %self.pattern,
            role = ?self.role,
            index = self.message_index,
            len = message.len(),
            "wrote handshake message"
        );
        Ok(message)
    }

    /// Read the next handshake message and return its decrypted payload.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if complete or it is our turn to write
    /// - `Truncated` if the message ends before a token is satisfied
    /// - `DecryptFailed` if the static key or payload fails authentication
    /// - `InvalidPublicKey` for low-order remote keys
    pub fn read_message(&mut self, message: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        self.check_turn(false, "read a message")?;
        if message.len() > MAX_HANDSHAKE_MESSAGE_LEN {
            return Err(ProtocolError::MessageTooLarge {
                len: message.len(),
                max: MAX_HANDSHAKE_MESSAGE_LEN,
            });
        }
        let tokens = self.pattern.tokens(self.message_index)?;

        let mut cursor = message;
        for token in tokens {
            match token {
                Token::E => {
                    let public = read_public_key(take(&mut cursor, DH_LEN)?);
                    self.symmetric.mix_hash(&public);
                    self.re = Some(public);
                },
                Token::S => {
                    let len = if self.symmetric.has_key() { DH_LEN + TAG_LEN } else { DH_LEN };
                    let encrypted = take(&mut cursor, len)?;
                    let public = self.symmetric.decrypt_and_hash(encrypted)?;
                    self.rs = Some(read_public_key(&public));
                },
                dh_token => self.mix_dh(dh_token)?,
            }
        }

        if self.symmetric.has_key() && cursor.len() < TAG_LEN {
            return Err(ProtocolError::Truncated { needed: TAG_LEN, remaining: cursor.len() });
        }
        let payload = self.symmetric.decrypt_and_hash(cursor)?;

        self.message_index += 1;
        tracing::debug!(
            pattern = %self.pattern,
            role = ?self.role,
            index = self.message_index,
            len = message.len(),
            "read handshake message"
        );
        Ok(payload)
    }

    /// Split the chaining key into transport keys oriented for our role.
    ///
    /// Consumes the state so ephemeral secrets cannot outlive the handshake.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if messages remain
    pub fn finalize(self) -> Result<TransportKeys, ProtocolError> {
        if !self.is_complete() {
            return Err(ProtocolError::InvalidState {
                state: self.status(),
                operation: "finalize",
            });
        }

        let (initiator_to_responder, responder_to_initiator) = self.symmetric.split();
        let (send, recv) = match self.role {
            Role::Initiator => (initiator_to_responder, responder_to_initiator),
            Role::Responder => (responder_to_initiator, initiator_to_responder),
        };

        Ok(TransportKeys {
            send,
            recv,
            handshake_hash: self.symmetric.handshake_hash(),
            remote_static: self.rs,
        })
    }

    fn check_turn(&self, writing: bool, operation: &'static str) -> Result<(), ProtocolError> {
        if self.is_complete() || self.is_my_turn() != writing {
            return Err(ProtocolError::InvalidState { state: self.status(), operation });
        }
        Ok(())
    }

    fn local_static(&self) -> Result<&KeyPair, ProtocolError> {
        self.s
            .as_ref()
            .ok_or(ProtocolError::MissingKey { pattern: self.pattern, key: "local static" })
    }

    fn local_ephemeral(&self) -> Result<&KeyPair, ProtocolError> {
        self.e.as_ref().ok_or(ProtocolError::MissingKey {
            pattern: self.pattern,
            key: "local ephemeral",
        })
    }

    fn remote_static_key(&self) -> Result<&PublicKeyBytes, ProtocolError> {
        self.rs
            .as_ref()
            .ok_or(ProtocolError::MissingKey { pattern: self.pattern, key: "remote static" })
    }

    fn remote_ephemeral(&self) -> Result<&PublicKeyBytes, ProtocolError> {
        self.re.as_ref().ok_or(ProtocolError::MissingKey {
            pattern: self.pattern,
            key: "remote ephemeral",
        })
    }

    /// Perform the DH named by `token` and mix it into the chaining key.
    ///
    /// `es` is always initiator-ephemeral with responder-static, `se` the
    /// reverse, so the local key choice depends on our role.
    fn mix_dh(&mut self, token: Token) -> Result<(), ProtocolError> {
        let initiator = self.role == Role::Initiator;
        let mut shared = match token {
            Token::EE => self.local_ephemeral()?.dh(self.remote_ephemeral()?)?,
            Token::ES if initiator => self.local_ephemeral()?.dh(self.remote_static_key()?)?,
            Token::ES => self.local_static()?.dh(self.remote_ephemeral()?)?,
            Token::SE if initiator => self.local_static()?.dh(self.remote_ephemeral()?)?,
            Token::SE => self.local_ephemeral()?.dh(self.remote_static_key()?)?,
            Token::SS => self.local_static()?.dh(self.remote_static_key()?)?,
            Token::E | Token::S => unreachable!("key tokens are handled by the caller"),
        };
        self.symmetric.mix_key(&shared);
        shared.zeroize();
        Ok(())
    }
}

impl fmt::Debug for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeState")
            .field("pattern", &self.pattern)
            .field("role", &self.role)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Split `len` bytes off the front of `cursor`.
fn take<'a>(cursor: &mut &'a [u8], len: usize) -> Result<&'a [u8], ProtocolError> {
    if cursor.len() < len {
        return Err(ProtocolError::Truncated { needed: len, remaining: cursor.len() });
    }
    let (head, tail) = cursor.split_at(len);
    *cursor = tail;
    Ok(head)
}

fn read_public_key(bytes: &[u8]) -> PublicKeyBytes {
    let mut key = [0u8; DH_LEN];
    key.copy_from_slice(&bytes[..DH_LEN]);
    key
}
