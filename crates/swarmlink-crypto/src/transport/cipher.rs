//! Post-handshake transport cipher.
//!
//! Two one-directional [`CipherState`]s derived from the handshake. Each
//! direction counts its own messages; the counter is both the AEAD nonce and
//! the replay guard on the receiving side.
//!
//! # Associated data
//!
//! `nonce (u64 BE) || timestamp_ms (u64 BE)`. Rewriting either field on the
//! wire breaks the tag.
//!
//! # Rotation
//!
//! When a direction's counter reaches the rotation limit, that direction's
//! key is rehashed and its counter resets to zero. Both peers observe the
//! same counter values, so the sender and receiver of a direction rotate at
//! the same message.

use std::time::Duration;

use super::{
    padding::{apply_padding, remove_padding},
    stats::ChannelStats,
};
use crate::{
    cipher_state::{CipherState, TAG_LEN},
    env::Environment,
    error::{ChannelError, IntegrityError},
    noise::TransportKeys,
};

/// Largest plaintext accepted by [`TransportCipher::encrypt`].
pub const MAX_PLAINTEXT_LEN: usize = 16 * 1024 * 1024;

/// Serialized header: nonce, timestamp, tag.
pub const ENCRYPTED_HEADER_LEN: usize = 8 + 8 + TAG_LEN;

/// Transport cipher settings. Both peers must agree on every field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    /// Pad plaintexts to multiples of this many bytes; `None` disables
    /// padding
    pub padding_block: Option<usize>,
    /// Rotate a direction's key after this many messages; `None` rotates
    /// only before the counter would overflow
    pub rekey_interval: Option<u64>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self { padding_block: Some(64), rekey_interval: None }
    }
}

impl TransportConfig {
    fn rotation_limit(&self) -> u64 {
        self.rekey_interval.map_or(u64::MAX, |interval| interval.max(1))
    }
}

/// One encrypted transport message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedMessage {
    /// Encrypted (and possibly padded) plaintext
    pub ciphertext: Vec<u8>,
    /// Poly1305 tag over ciphertext and associated data
    pub auth_tag: [u8; TAG_LEN],
    /// Sender's message counter for this key
    pub nonce: u64,
    /// Sender's wall clock in milliseconds, zero if unset
    pub timestamp_ms: u64,
}

impl EncryptedMessage {
    /// Serialize as `nonce | timestamp_ms | tag | ciphertext`, integers
    /// big-endian.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENCRYPTED_HEADER_LEN + self.ciphertext.len());
        out.extend_from_slice(&self.nonce.to_be_bytes());
        out.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        out.extend_from_slice(&self.auth_tag);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Parse the [`Self::encode`] layout.
    ///
    /// # Errors
    ///
    /// - `Truncated` if `bytes` is shorter than the fixed header
    pub fn decode(bytes: &[u8]) -> Result<Self, IntegrityError> {
        let truncated = IntegrityError::Truncated { len: bytes.len() };
        let (nonce, rest) = bytes.split_first_chunk::<8>().ok_or(truncated.clone())?;
        let (timestamp, rest) = rest.split_first_chunk::<8>().ok_or(truncated.clone())?;
        let (tag, ciphertext) = rest.split_first_chunk::<TAG_LEN>().ok_or(truncated)?;

        Ok(Self {
            ciphertext: ciphertext.to_vec(),
            auth_tag: *tag,
            nonce: u64::from_be_bytes(*nonce),
            timestamp_ms: u64::from_be_bytes(*timestamp),
        })
    }
}

/// Bidirectional authenticated encryption for an established session.
pub struct TransportCipher<E: Environment> {
    env: E,
    send: CipherState,
    recv: CipherState,
    config: TransportConfig,
    stats: ChannelStats,
}

impl<E: Environment> TransportCipher<E> {
    /// Build from handshake output.
    pub fn new(env: E, keys: &TransportKeys, config: TransportConfig) -> Self {
        Self {
            env,
            send: CipherState::with_key(keys.send),
            recv: CipherState::with_key(keys.recv),
            config,
            stats: ChannelStats::default(),
        }
    }

    /// Encrypt `plaintext` under the next send nonce.
    ///
    /// # Errors
    ///
    /// - `MessageTooLarge` if `plaintext` exceeds [`MAX_PLAINTEXT_LEN`]
    /// - `InvalidPaddingBlock` if the configured block is too large
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<EncryptedMessage, ChannelError> {
        if plaintext.len() > MAX_PLAINTEXT_LEN {
            return Err(ChannelError::MessageTooLarge {
                len: plaintext.len(),
                max: MAX_PLAINTEXT_LEN,
            });
        }
        let start = self.env.now();

        let mut body = match self.config.padding_block {
            Some(block) => apply_padding(&self.env, plaintext, block)?,
            None => plaintext.to_vec(),
        };
        let nonce = self.send.nonce();
        let timestamp_ms = self.env.wall_clock_millis();
        let auth_tag = self.send.seal_in_place(&associated_data(nonce, timestamp_ms), &mut body);

        if self.send.nonce() >= self.config.rotation_limit() {
            self.send.rekey();
            self.stats.key_rotations += 1;
            tracing::debug!(direction = "send", "rotated transport key");
        }

        self.stats.messages_sent += 1;
        self.stats.bytes_sent += plaintext.len() as u64;
        self.stats.encrypt_latency.record(self.env.now() - start);

        Ok(EncryptedMessage { ciphertext: body, auth_tag, nonce, timestamp_ms })
    }

    /// Authenticate and decrypt the next message in sequence.
    ///
    /// Every failure is fatal for the session; the receive counter does not
    /// move, but the caller must not retry.
    ///
    /// # Errors
    ///
    /// - `NonceMismatch` if the message is not the next expected one
    /// - `TagMismatch` if authentication fails
    /// - `MalformedPadding` if the decrypted length prefix is inconsistent
    pub fn decrypt(&mut self, message: &EncryptedMessage) -> Result<Vec<u8>, ChannelError> {
        let start = self.env.now();

        let expected = self.recv.nonce();
        if message.nonce != expected {
            return Err(IntegrityError::NonceMismatch { expected, received: message.nonce }.into());
        }

        let mut body = message.ciphertext.clone();
        let ad = associated_data(message.nonce, message.timestamp_ms);
        if !self.recv.open_in_place(message.nonce, &ad, &mut body, &message.auth_tag) {
            return Err(IntegrityError::TagMismatch.into());
        }

        if self.recv.nonce() >= self.config.rotation_limit() {
            self.recv.rekey();
            self.stats.key_rotations += 1;
            tracing::debug!(direction = "recv", "rotated transport key");
        }

        let plaintext = match self.config.padding_block {
            Some(_) => remove_padding(&body)?.to_vec(),
            None => body,
        };

        self.stats.messages_received += 1;
        self.stats.bytes_received += plaintext.len() as u64;
        self.stats.decrypt_latency.record(self.env.now() - start);

        Ok(plaintext)
    }

    /// Rehash both directions and reset both counters.
    ///
    /// Both peers must call this at the same point in the message stream.
    pub fn rotate_keys(&mut self) {
        self.send.rekey();
        self.recv.rekey();
        self.stats.key_rotations += 1;
        tracing::debug!(direction = "both", "rotated transport keys");
    }

    /// Next nonce this side will send.
    pub fn send_nonce(&self) -> u64 {
        self.send.nonce()
    }

    /// Next nonce this side expects to receive.
    pub fn recv_nonce(&self) -> u64 {
        self.recv.nonce()
    }

    /// Current counters.
    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    pub(crate) fn record_handshake_time(&mut self, elapsed: Duration) {
        self.stats.handshake_time_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
    }
}

impl<E: Environment> std::fmt::Debug for TransportCipher<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportCipher")
            .field("send_nonce", &self.send.nonce())
            .field("recv_nonce", &self.recv.nonce())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn associated_data(nonce: u64, timestamp_ms: u64) -> [u8; 16] {
    let mut ad = [0u8; 16];
    ad[..8].copy_from_slice(&nonce.to_be_bytes());
    ad[8..].copy_from_slice(&timestamp_ms.to_be_bytes());
    ad
}
