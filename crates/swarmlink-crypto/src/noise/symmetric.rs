//! Noise symmetric state: chaining key, transcript hash and handshake cipher.

use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::{
    cipher_state::{CipherState, KEY_LEN},
    error::ProtocolError,
};

/// SHA-256 output length
pub const HASH_LEN: usize = 32;

pub(crate) struct SymmetricState {
    /// Chaining key, accumulates every DH result
    ck: [u8; HASH_LEN],
    /// Transcript hash, used as AD for handshake encryption
    h: [u8; HASH_LEN],
    cipher: CipherState,
}

impl SymmetricState {
    /// `InitializeSymmetric(protocol_name)`.
    ///
    /// Names up to 32 bytes are zero-padded into `h`, longer names hashed.
    pub(crate) fn initialize(protocol_name: &[u8]) -> Self {
        let mut h = [0u8; HASH_LEN];
        if protocol_name.len() <= HASH_LEN {
            h[..protocol_name.len()].copy_from_slice(protocol_name);
        } else {
            h.copy_from_slice(&Sha256::digest(protocol_name));
        }
        Self { ck: h, h, cipher: CipherState::empty() }
    }

    pub(crate) fn handshake_hash(&self) -> [u8; HASH_LEN] {
        self.h
    }

    pub(crate) fn has_key(&self) -> bool {
        self.cipher.has_key()
    }

    /// `h = SHA-256(h || data)`
    pub(crate) fn mix_hash(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.h);
        hasher.update(data);
        self.h.copy_from_slice(&hasher.finalize());
    }

    /// Feed a DH output into the chaining key and rekey the handshake cipher
    /// with a fresh key and nonce zero.
    pub(crate) fn mix_key(&mut self, input_key_material: &[u8]) {
        let (next_ck, mut temp_k) = hkdf2(&self.ck, input_key_material);
        self.ck.zeroize();
        self.ck = next_ck;
        self.cipher = CipherState::with_key(temp_k);
        temp_k.zeroize();
    }

    pub(crate) fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let ciphertext = self.cipher.encrypt_with_ad(&self.h, plaintext);
        self.mix_hash(&ciphertext);
        ciphertext
    }

    pub(crate) fn decrypt_and_hash(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let h = self.h;
        let plaintext =
            self.cipher.decrypt_with_ad(&h, ciphertext).ok_or(ProtocolError::DecryptFailed)?;
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }

    /// Derive the two transport keys from the final chaining key.
    ///
    /// The first key protects initiator → responder traffic, the second
    /// responder → initiator.
    pub(crate) fn split(&self) -> ([u8; KEY_LEN], [u8; KEY_LEN]) {
        hkdf2(&self.ck, &[])
    }
}

impl Drop for SymmetricState {
    fn drop(&mut self) {
        self.ck.zeroize();
        self.h.zeroize();
    }
}

/// Noise `HKDF(ck, ikm)` with two outputs.
///
/// HKDF-SHA256 with `ck` as salt and empty info expands to exactly the
/// Noise construction: `temp = HMAC(ck, ikm)`, `o1 = HMAC(temp, 0x01)`,
/// `o2 = HMAC(temp, o1 || 0x02)`.
fn hkdf2(chaining_key: &[u8; HASH_LEN], ikm: &[u8]) -> ([u8; HASH_LEN], [u8; HASH_LEN]) {
    let hkdf = Hkdf::<Sha256>::new(Some(chaining_key), ikm);

    let mut okm = [0u8; 2 * HASH_LEN];
    let Ok(()) = hkdf.expand(&[], &mut okm) else {
        unreachable!("64 bytes is a valid HKDF-SHA256 output length");
    };

    let mut first = [0u8; HASH_LEN];
    let mut second = [0u8; HASH_LEN];
    first.copy_from_slice(&okm[..HASH_LEN]);
    second.copy_from_slice(&okm[HASH_LEN..]);
    okm.zeroize();

    (first, second)
}
