//! X25519 key pairs for static and ephemeral keys.

use std::fmt;

use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::{env::Environment, error::ProtocolError};

/// Length of an X25519 public key and of a DH output.
pub const DH_LEN: usize = 32;

/// A 32-byte X25519 public key.
pub type PublicKeyBytes = [u8; DH_LEN];

/// An X25519 key pair.
///
/// Used both as the long-lived static identity of a peer and as the
/// per-handshake ephemeral key. The secret half is zeroized on drop by
/// `x25519-dalek`.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKeyBytes,
}

impl KeyPair {
    /// Generate a fresh key pair from the environment's RNG.
    pub fn generate<E: Environment>(env: &E) -> Self {
        let mut bytes = [0u8; DH_LEN];
        env.random_bytes(&mut bytes);
        let pair = Self::from_secret_bytes(bytes);
        bytes.zeroize();
        pair
    }

    /// Build a key pair from existing secret bytes.
    pub fn from_secret_bytes(bytes: [u8; DH_LEN]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    /// Public half of the pair.
    pub fn public_key(&self) -> &PublicKeyBytes {
        &self.public
    }

    /// Diffie-Hellman with a remote public key.
    ///
    /// Rejects non-contributory results (low-order remote points), which
    /// would otherwise give an attacker a known shared secret.
    pub(crate) fn dh(&self, remote: &PublicKeyBytes) -> Result<[u8; DH_LEN], ProtocolError> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*remote));
        if !shared.was_contributory() {
            return Err(ProtocolError::InvalidPublicKey);
        }
        Ok(*shared.as_bytes())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair").field("public", &self.public).finish_non_exhaustive()
    }
}
