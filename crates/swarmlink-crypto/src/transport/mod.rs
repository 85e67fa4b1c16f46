//! Transport layer: AEAD over the handshake's split keys.

mod cipher;
mod padding;
mod stats;

pub use cipher::{
    ENCRYPTED_HEADER_LEN, EncryptedMessage, MAX_PLAINTEXT_LEN, TransportCipher, TransportConfig,
};
pub use padding::{
    LENGTH_PREFIX_LEN, MAX_PADDING_BLOCK, apply_padding, padded_len, remove_padding,
};
pub use stats::{ChannelStats, LatencyStats};
