//! ChaCha20-Poly1305 cipher state shared by the handshake and transport.
//!
//! One key plus a 64-bit message counter. The counter forms the 96-bit AEAD
//! nonce (`0u32 || counter_le`) and increments after every successful
//! operation, so a nonce is never used twice with the same key.

use chacha20poly1305::{
    ChaCha20Poly1305, Nonce, Tag,
    aead::{AeadInPlace, KeyInit},
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroize;

type HmacSha256 = Hmac<Sha256>;

/// Symmetric key size in bytes
pub const KEY_LEN: usize = 32;

/// Poly1305 tag size in bytes
pub const TAG_LEN: usize = 16;

/// Label mixed into the key on rotation
const REKEY_LABEL: &[u8] = b"swarmlink rekey";

/// Key plus nonce counter.
#[derive(Clone)]
pub(crate) struct CipherState {
    key: [u8; KEY_LEN],
    nonce: u64,
    initialized: bool,
}

impl CipherState {
    /// Cipher state with no key. Encryption passes plaintext through.
    pub(crate) fn empty() -> Self {
        Self { key: [0u8; KEY_LEN], nonce: 0, initialized: false }
    }

    /// Cipher state keyed with `key`, nonce reset to zero.
    pub(crate) fn with_key(key: [u8; KEY_LEN]) -> Self {
        Self { key, nonce: 0, initialized: true }
    }

    pub(crate) fn has_key(&self) -> bool {
        self.initialized
    }

    /// Next nonce this state will use.
    pub(crate) fn nonce(&self) -> u64 {
        self.nonce
    }

    #[cfg(test)]
    pub(crate) fn key(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    /// Handshake-style encryption: returns `ciphertext || tag`, or the
    /// plaintext unchanged when no key has been mixed in yet.
    pub(crate) fn encrypt_with_ad(&mut self, ad: &[u8], plaintext: &[u8]) -> Vec<u8> {
        if !self.initialized {
            return plaintext.to_vec();
        }
        let mut out = Vec::with_capacity(plaintext.len() + TAG_LEN);
        out.extend_from_slice(plaintext);
        let tag = self.seal_in_place(ad, &mut out);
        out.extend_from_slice(&tag);
        out
    }

    /// Inverse of [`Self::encrypt_with_ad`]. `None` on authentication failure.
    pub(crate) fn decrypt_with_ad(&mut self, ad: &[u8], ciphertext: &[u8]) -> Option<Vec<u8>> {
        if !self.initialized {
            return Some(ciphertext.to_vec());
        }
        let body_len = ciphertext.len().checked_sub(TAG_LEN)?;
        let (body, tag_bytes) = ciphertext.split_at(body_len);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(tag_bytes);

        let mut out = body.to_vec();
        if self.open_in_place(self.nonce, ad, &mut out, &tag) { Some(out) } else { None }
    }

    /// Encrypt `buffer` in place under the current nonce, returning the
    /// detached tag, then advance the counter.
    pub(crate) fn seal_in_place(&mut self, ad: &[u8], buffer: &mut [u8]) -> [u8; TAG_LEN] {
        let cipher = ChaCha20Poly1305::new((&self.key).into());
        let nonce = build_nonce(self.nonce);

        let Ok(tag) = cipher.encrypt_in_place_detached(Nonce::from_slice(&nonce), ad, buffer)
        else {
            unreachable!("ChaCha20-Poly1305 encryption cannot fail below 256 GiB");
        };
        self.nonce = self.nonce.wrapping_add(1);

        let mut out = [0u8; TAG_LEN];
        out.copy_from_slice(&tag);
        out
    }

    /// Decrypt `buffer` in place under `nonce`. The counter advances past
    /// `nonce` only when the tag verifies.
    pub(crate) fn open_in_place(
        &mut self,
        nonce: u64,
        ad: &[u8],
        buffer: &mut [u8],
        tag: &[u8; TAG_LEN],
    ) -> bool {
        let cipher = ChaCha20Poly1305::new((&self.key).into());
        let nonce_bytes = build_nonce(nonce);

        let verified = cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&nonce_bytes),
                ad,
                buffer,
                Tag::from_slice(tag),
            )
            .is_ok();
        if verified {
            self.nonce = nonce.wrapping_add(1);
        }
        verified
    }

    /// Replace the key with `HMAC-SHA256(key, label)` and reset the counter.
    pub(crate) fn rekey(&mut self) {
        let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(&self.key) else {
            unreachable!("HMAC-SHA256 accepts any key size");
        };
        mac.update(REKEY_LABEL);
        let next = mac.finalize().into_bytes();

        self.key.zeroize();
        self.key.copy_from_slice(&next);
        self.nonce = 0;
    }
}

impl Drop for CipherState {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Build the 96-bit nonce: four zero bytes then the little-endian counter.
fn build_nonce(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..12].copy_from_slice(&counter.to_le_bytes());
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_state_passes_through() {
        let mut state = CipherState::empty();
        assert_eq!(state.encrypt_with_ad(b"ad", b"hello"), b"hello");
        assert_eq!(state.decrypt_with_ad(b"ad", b"hello").unwrap(), b"hello");
        assert_eq!(state.nonce(), 0);
    }

    #[test]
    fn keyed_roundtrip_advances_nonce() {
        let mut sender = CipherState::with_key([9u8; KEY_LEN]);
        let mut receiver = CipherState::with_key([9u8; KEY_LEN]);

        for i in 0..3u64 {
            let ct = sender.encrypt_with_ad(b"ad", b"payload");
            assert_eq!(ct.len(), 7 + TAG_LEN);
            assert_eq!(receiver.decrypt_with_ad(b"ad", &ct).unwrap(), b"payload");
            assert_eq!(sender.nonce(), i + 1);
            assert_eq!(receiver.nonce(), i + 1);
        }
    }

    #[test]
    fn wrong_ad_fails_and_keeps_nonce() {
        let mut sender = CipherState::with_key([9u8; KEY_LEN]);
        let mut receiver = CipherState::with_key([9u8; KEY_LEN]);

        let ct = sender.encrypt_with_ad(b"ad", b"payload");
        assert!(receiver.decrypt_with_ad(b"other", &ct).is_none());
        assert_eq!(receiver.nonce(), 0);
    }

    #[test]
    fn short_ciphertext_rejected() {
        let mut receiver = CipherState::with_key([9u8; KEY_LEN]);
        assert!(receiver.decrypt_with_ad(b"", &[0u8; TAG_LEN - 1]).is_none());
    }

    #[test]
    fn rekey_changes_key_and_resets_nonce() {
        let mut state = CipherState::with_key([3u8; KEY_LEN]);
        state.encrypt_with_ad(b"", b"x");
        let before = *state.key();

        state.rekey();

        assert_ne!(*state.key(), before);
        assert_eq!(state.nonce(), 0);
    }

    #[test]
    fn rekey_is_deterministic() {
        let mut a = CipherState::with_key([3u8; KEY_LEN]);
        let mut b = CipherState::with_key([3u8; KEY_LEN]);
        a.rekey();
        b.rekey();
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn rekey_is_hmac_of_label() {
        let mut state = CipherState::with_key([3u8; KEY_LEN]);
        state.rekey();

        let mut mac = <HmacSha256 as Mac>::new_from_slice(&[3u8; KEY_LEN]).unwrap();
        mac.update(REKEY_LABEL);
        assert_eq!(state.key()[..], mac.finalize().into_bytes()[..]);
    }

    #[test]
    fn nonce_structure() {
        let nonce = build_nonce(0x0102_0304_0506_0708);
        assert_eq!(&nonce[0..4], &[0, 0, 0, 0]);
        assert_eq!(&nonce[4..12], &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
    }
}
