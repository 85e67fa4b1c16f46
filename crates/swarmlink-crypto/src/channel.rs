//! Secure channel: handshake followed by transport encryption.
//!
//! Owns the local static key, the in-flight [`HandshakeState`] and, once the
//! handshake completes, the [`TransportCipher`]. Purely a state machine: the
//! caller moves the produced bytes across whatever boundary it uses and feeds
//! the peer's bytes back in, preserving message boundaries and order.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐ initiate / first process ┌─────────────┐  last message  ┌─────────────┐
//! │ Idle │─────────────────────────>│ Handshaking │───────────────>│ Established │
//! └──────┘                          └─────────────┘                └─────────────┘
//!                                          │ fatal error / close          │
//!                                          ↓                              ↓
//!                                     ┌────────┐                     ┌────────┐
//!                                     │ Closed │<────────────────────│ Closed │
//!                                     └────────┘                     └────────┘
//! ```
//!
//! Protocol and integrity failures close the channel; recovery means a new
//! channel and a fresh handshake.

use crate::{
    env::Environment,
    error::{ChannelError, ProtocolError},
    keys::{KeyPair, PublicKeyBytes},
    noise::{HASH_LEN, HandshakePattern, HandshakeState, Role},
    transport::{ChannelStats, EncryptedMessage, TransportCipher, TransportConfig},
};

/// Prologue bound into every handshake transcript by default.
pub const DEFAULT_PROLOGUE: &[u8] = b"swarmlink/1";

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No handshake message sent or received
    Idle,
    /// Handshake in progress
    Handshaking,
    /// Transport keys derived, encrypt/decrypt available
    Established,
    /// Closed explicitly or by a fatal error
    Closed,
}

/// Channel configuration. Both peers must agree on everything except
/// `remote_static`.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Handshake pattern
    pub pattern: HandshakePattern,
    /// Bytes mixed into the transcript before the first message
    pub prologue: Vec<u8>,
    /// Transport padding block size, `None` disables padding
    pub padding_block: Option<usize>,
    /// Rotate each direction's key after this many messages
    pub rekey_interval: Option<u64>,
    /// Peer static key known in advance (NK, KK, IK initiators; KK
    /// responders)
    pub remote_static: Option<PublicKeyBytes>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            pattern: HandshakePattern::XX,
            prologue: DEFAULT_PROLOGUE.to_vec(),
            padding_block: Some(64),
            rekey_interval: None,
            remote_static: None,
        }
    }
}

impl ChannelConfig {
    fn transport(&self) -> TransportConfig {
        TransportConfig { padding_block: self.padding_block, rekey_interval: self.rekey_interval }
    }
}

/// A handshake-authenticated, encrypted channel endpoint.
pub struct SecureChannel<E: Environment> {
    env: E,
    config: ChannelConfig,
    static_keys: KeyPair,
    state: ChannelState,
    handshake: Option<HandshakeState>,
    handshake_started: Option<E::Instant>,
    transport: Option<TransportCipher<E>>,
    remote_static: Option<PublicKeyBytes>,
    handshake_hash: Option<[u8; HASH_LEN]>,
    /// Stats captured when the transport is torn down
    final_stats: Option<ChannelStats>,
}

impl<E: Environment> SecureChannel<E> {
    /// Create a channel around an existing static key pair.
    pub fn new(env: E, static_keys: KeyPair, config: ChannelConfig) -> Self {
        Self {
            env,
            config,
            static_keys,
            state: ChannelState::Idle,
            handshake: None,
            handshake_started: None,
            transport: None,
            remote_static: None,
            handshake_hash: None,
            final_stats: None,
        }
    }

    /// Create a channel with a freshly generated static key pair.
    pub fn generate(env: E, config: ChannelConfig) -> Self {
        let static_keys = KeyPair::generate(&env);
        Self::new(env, static_keys, config)
    }

    /// Start the handshake as initiator and return the first message.
    ///
    /// `remote_static` overrides [`ChannelConfig::remote_static`] for
    /// patterns where the responder's key is known in advance.
    ///
    /// # Errors
    ///
    /// - `Closed` if the channel was closed
    /// - `AlreadyInitiated` on a second call or after the channel started
    ///   responding
    /// - `Protocol(MissingKey)` if the pattern needs a remote key that was
    ///   not supplied (fatal)
    pub fn initiate_handshake(
        &mut self,
        remote_static: Option<PublicKeyBytes>,
    ) -> Result<Vec<u8>, ChannelError> {
        match self.state {
            ChannelState::Closed => return Err(ChannelError::Closed),
            ChannelState::Idle => {},
            ChannelState::Handshaking | ChannelState::Established => {
                return Err(ChannelError::AlreadyInitiated);
            },
        }

        let remote_static = remote_static.or(self.config.remote_static);
        let result = self.begin(Role::Initiator, remote_static).and_then(|mut handshake| {
            let message = handshake.write_message(&self.env, &[])?;
            Ok((handshake, message))
        });

        match result {
            Ok((handshake, message)) => {
                self.handshake = Some(handshake);
                Ok(message)
            },
            Err(err) => Err(self.fail(err.into())),
        }
    }

    /// Consume a handshake message from the peer.
    ///
    /// The first call on an idle channel makes it the responder. Returns the
    /// next message to send, or `None` when the message just read was the
    /// last one. The channel is established as soon as the final message is
    /// written or read, so the side that writes it is connected before the
    /// peer has seen it.
    ///
    /// # Errors
    ///
    /// - `Closed` if the channel was closed
    /// - `AlreadyEstablished` once the handshake has completed
    /// - `Protocol` for any malformed, unauthenticated or unexpected message
    ///   (fatal)
    pub fn process_handshake(&mut self, message: &[u8]) -> Result<Option<Vec<u8>>, ChannelError> {
        match self.state {
            ChannelState::Closed => return Err(ChannelError::Closed),
            ChannelState::Established => return Err(ChannelError::AlreadyEstablished),
            ChannelState::Idle | ChannelState::Handshaking => {},
        }

        self.advance(message).map_err(|err| self.fail(err))
    }

    /// Encrypt an application message.
    ///
    /// # Errors
    ///
    /// - `NotEstablished` before the handshake completes
    /// - `Closed` after close or a fatal error
    /// - `MessageTooLarge` for oversized plaintexts
    /// - `InvalidPaddingBlock` if `padding_block` exceeds
    ///   [`crate::MAX_PADDING_BLOCK`]
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<EncryptedMessage, ChannelError> {
        let result = self.transport_mut()?.encrypt(plaintext);
        result.map_err(|err| self.fail(err))
    }

    /// Decrypt the next application message from the peer.
    ///
    /// # Errors
    ///
    /// - `NotEstablished` before the handshake completes
    /// - `Closed` after close or a fatal error
    /// - `Integrity` on replay, reordering, tampering or bad padding (fatal)
    pub fn decrypt(&mut self, message: &EncryptedMessage) -> Result<Vec<u8>, ChannelError> {
        let result = self.transport_mut()?.decrypt(message);
        result.map_err(|err| self.fail(err))
    }

    /// Rehash both transport keys. The peer must rotate at the same point.
    ///
    /// # Errors
    ///
    /// - `NotEstablished` or `Closed` if there is no transport
    pub fn rotate_keys(&mut self) -> Result<(), ChannelError> {
        self.transport_mut()?.rotate_keys();
        Ok(())
    }

    /// True once transport keys are in place and the channel is open.
    pub fn is_connected(&self) -> bool {
        self.state == ChannelState::Established
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Pattern this channel runs.
    pub fn pattern(&self) -> HandshakePattern {
        self.config.pattern
    }

    /// Local static public key.
    pub fn public_key(&self) -> &PublicKeyBytes {
        self.static_keys.public_key()
    }

    /// Peer static key, if the pattern authenticated one.
    pub fn remote_static(&self) -> Option<&PublicKeyBytes> {
        self.remote_static.as_ref()
    }

    /// Final handshake transcript hash, for channel binding.
    pub fn handshake_hash(&self) -> Option<&[u8; HASH_LEN]> {
        self.handshake_hash.as_ref()
    }

    /// Transport counters. Remain readable after close.
    pub fn stats(&self) -> ChannelStats {
        self.transport
            .as_ref()
            .map(|transport| transport.stats().clone())
            .or_else(|| self.final_stats.clone())
            .unwrap_or_default()
    }

    /// Close the channel and wipe every key it holds except the static pair.
    pub fn close(&mut self) {
        if self.state == ChannelState::Closed {
            return;
        }
        self.handshake = None;
        if let Some(transport) = self.transport.take() {
            self.final_stats = Some(transport.stats().clone());
        }
        self.state = ChannelState::Closed;
        tracing::debug!(pattern = %self.config.pattern, "channel closed");
    }

    fn begin(
        &mut self,
        role: Role,
        remote_static: Option<PublicKeyBytes>,
    ) -> Result<HandshakeState, ProtocolError> {
        let pattern = self.config.pattern;
        let needs_static = match role {
            Role::Initiator => pattern.initiator_has_static(),
            Role::Responder => pattern.responder_has_static(),
        };
        let local_static = needs_static.then(|| self.static_keys.clone());

        let handshake =
            HandshakeState::new(pattern, role, &self.config.prologue, local_static, remote_static)?;

        self.state = ChannelState::Handshaking;
        self.handshake_started = Some(self.env.now());
        tracing::debug!(pattern = %pattern, role = ?role, "handshake started");
        Ok(handshake)
    }

    fn advance(&mut self, message: &[u8]) -> Result<Option<Vec<u8>>, ChannelError> {
        let mut handshake = match self.handshake.take() {
            Some(handshake) => handshake,
            None => self.begin(Role::Responder, self.config.remote_static)?,
        };

        let payload = handshake.read_message(message)?;
        if !payload.is_empty() {
            return Err(ProtocolError::UnexpectedPayload { len: payload.len() }.into());
        }
        if handshake.is_complete() {
            self.establish(handshake)?;
            return Ok(None);
        }

        let reply = handshake.write_message(&self.env, &[])?;
        if handshake.is_complete() {
            self.establish(handshake)?;
        } else {
            self.handshake = Some(handshake);
        }
        Ok(Some(reply))
    }

    fn establish(&mut self, handshake: HandshakeState) -> Result<(), ChannelError> {
        let role = handshake.role();
        let keys = handshake.finalize()?;

        let mut transport = TransportCipher::new(self.env.clone(), &keys, self.config.transport());
        if let Some(started) = self.handshake_started {
            transport.record_handshake_time(self.env.now() - started);
        }

        self.remote_static = keys.remote_static;
        self.handshake_hash = Some(keys.handshake_hash);
        self.transport = Some(transport);
        self.state = ChannelState::Established;
        tracing::debug!(pattern = %self.config.pattern, role = ?role, "channel established");
        Ok(())
    }

    fn transport_mut(&mut self) -> Result<&mut TransportCipher<E>, ChannelError> {
        match self.state {
            ChannelState::Closed => Err(ChannelError::Closed),
            ChannelState::Idle | ChannelState::Handshaking => Err(ChannelError::NotEstablished),
            ChannelState::Established => {
                self.transport.as_mut().ok_or(ChannelError::NotEstablished)
            },
        }
    }

    /// Close on fatal errors, pass everything through.
    fn fail(&mut self, err: ChannelError) -> ChannelError {
        if err.is_fatal() {
            tracing::warn!(
                pattern = %self.config.pattern,
                error = %err,
                "closing channel after fatal error"
            );
            self.close();
        }
        err
    }
}

impl<E: Environment> std::fmt::Debug for SecureChannel<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("pattern", &self.config.pattern)
            .field("state", &self.state)
            .field("public_key", self.static_keys.public_key())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{env::SystemEnv, error::IntegrityError};

    fn channel(config: ChannelConfig) -> SecureChannel<SystemEnv> {
        SecureChannel::generate(SystemEnv::new(), config)
    }

    fn connect(
        initiator: &mut SecureChannel<SystemEnv>,
        responder: &mut SecureChannel<SystemEnv>,
    ) -> usize {
        let mut message = initiator.initiate_handshake(None).unwrap();
        let mut count = 1;
        let mut to_responder = true;
        loop {
            let receiver = if to_responder { &mut *responder } else { &mut *initiator };
            match receiver.process_handshake(&message).unwrap() {
                Some(next) => {
                    message = next;
                    count += 1;
                    to_responder = !to_responder;
                },
                None => return count,
            }
        }
    }

    #[test]
    fn xx_connects_in_three_messages() {
        let mut alice = channel(ChannelConfig::default());
        let mut bob = channel(ChannelConfig::default());

        assert_eq!(connect(&mut alice, &mut bob), 3);
        assert!(alice.is_connected());
        assert!(bob.is_connected());
        assert_eq!(alice.remote_static(), Some(bob.public_key()));
        assert_eq!(bob.remote_static(), Some(alice.public_key()));
        assert_eq!(alice.handshake_hash(), bob.handshake_hash());
    }

    #[test]
    fn ping_roundtrip() {
        let mut alice = channel(ChannelConfig::default());
        let mut bob = channel(ChannelConfig::default());
        connect(&mut alice, &mut bob);

        let message = alice.encrypt(b"ping").unwrap();
        assert_eq!(bob.decrypt(&message).unwrap(), b"ping");
        let reply = bob.encrypt(b"pong").unwrap();
        assert_eq!(alice.decrypt(&reply).unwrap(), b"pong");
    }

    #[test]
    fn encrypt_before_handshake_rejected() {
        let mut alice = channel(ChannelConfig::default());
        assert_eq!(alice.encrypt(b"early"), Err(ChannelError::NotEstablished));

        alice.initiate_handshake(None).unwrap();
        assert_eq!(alice.encrypt(b"early"), Err(ChannelError::NotEstablished));
        assert_eq!(alice.state(), ChannelState::Handshaking);
    }

    #[test]
    fn second_initiate_rejected() {
        let mut alice = channel(ChannelConfig::default());
        alice.initiate_handshake(None).unwrap();
        assert_eq!(alice.initiate_handshake(None), Err(ChannelError::AlreadyInitiated));
        assert_eq!(alice.state(), ChannelState::Handshaking);
    }

    #[test]
    fn tampered_handshake_closes_channel() {
        let mut alice = channel(ChannelConfig::default());
        let mut bob = channel(ChannelConfig::default());

        let m1 = alice.initiate_handshake(None).unwrap();
        let mut m2 = bob.process_handshake(&m1).unwrap().unwrap();
        let last = m2.len() - 1;
        m2[last] ^= 0x80;

        assert_eq!(
            alice.process_handshake(&m2),
            Err(ChannelError::Protocol(ProtocolError::DecryptFailed))
        );
        assert_eq!(alice.state(), ChannelState::Closed);
        assert_eq!(alice.process_handshake(&m2), Err(ChannelError::Closed));
    }

    #[test]
    fn tampered_transport_message_closes_channel() {
        let mut alice = channel(ChannelConfig::default());
        let mut bob = channel(ChannelConfig::default());
        connect(&mut alice, &mut bob);

        let mut message = alice.encrypt(b"data").unwrap();
        message.auth_tag[0] ^= 1;

        assert_eq!(
            bob.decrypt(&message),
            Err(ChannelError::Integrity(IntegrityError::TagMismatch))
        );
        assert!(!bob.is_connected());
        assert_eq!(bob.encrypt(b"more"), Err(ChannelError::Closed));
    }

    #[test]
    fn handshake_message_after_established_rejected() {
        let mut alice = channel(ChannelConfig::default());
        let mut bob = channel(ChannelConfig::default());
        connect(&mut alice, &mut bob);

        assert_eq!(alice.process_handshake(&[0u8; 32]), Err(ChannelError::AlreadyEstablished));
        assert!(alice.is_connected());
        assert_eq!(alice.initiate_handshake(None), Err(ChannelError::AlreadyInitiated));
        assert!(alice.is_connected());

        let message = alice.encrypt(b"still open").unwrap();
        assert_eq!(bob.decrypt(&message).unwrap(), b"still open");
    }

    #[test]
    fn oversized_padding_block_leaves_channel_open() {
        let config = ChannelConfig { padding_block: Some(usize::MAX), ..ChannelConfig::default() };
        let mut alice = channel(config.clone());
        let mut bob = channel(config);
        connect(&mut alice, &mut bob);

        assert!(matches!(
            alice.encrypt(b"ping"),
            Err(ChannelError::InvalidPaddingBlock { block: usize::MAX, .. })
        ));
        assert!(alice.is_connected());
    }

    #[test]
    fn stats_survive_close() {
        let mut alice = channel(ChannelConfig::default());
        let mut bob = channel(ChannelConfig::default());
        connect(&mut alice, &mut bob);

        let message = alice.encrypt(b"counted").unwrap();
        bob.decrypt(&message).unwrap();
        alice.close();

        assert_eq!(alice.stats().messages_sent, 1);
        assert_eq!(alice.encrypt(b"x"), Err(ChannelError::Closed));
    }

    #[test]
    fn ik_requires_known_responder_key() {
        let config = ChannelConfig { pattern: HandshakePattern::IK, ..ChannelConfig::default() };
        let mut alice = channel(config);

        assert!(matches!(
            alice.initiate_handshake(None),
            Err(ChannelError::Protocol(ProtocolError::MissingKey { .. }))
        ));
        assert_eq!(alice.state(), ChannelState::Closed);
    }

    #[test]
    fn kk_connects_with_configured_keys() {
        let env = SystemEnv::new();
        let alice_keys = KeyPair::generate(&env);
        let bob_keys = KeyPair::generate(&env);
        let alice_public = *alice_keys.public_key();
        let bob_public = *bob_keys.public_key();

        let mut alice = SecureChannel::new(
            env,
            alice_keys,
            ChannelConfig {
                pattern: HandshakePattern::KK,
                remote_static: Some(bob_public),
                ..ChannelConfig::default()
            },
        );
        let mut bob = SecureChannel::new(
            env,
            bob_keys,
            ChannelConfig {
                pattern: HandshakePattern::KK,
                remote_static: Some(alice_public),
                ..ChannelConfig::default()
            },
        );

        assert_eq!(connect(&mut alice, &mut bob), 2);
        assert!(alice.is_connected() && bob.is_connected());
    }
}
