//! Length-hiding padding.
//!
//! ```text
//! ┌──────────────┬───────────────┬──────────────────────┐
//! │ len: u32 BE  │ plaintext     │ random filler        │
//! └──────────────┴───────────────┴──────────────────────┘
//! |<────────── multiple of block_size ─────────────────>|
//! ```
//!
//! The padded form always carries the 4-byte prefix, so even an empty
//! message occupies one full block on the wire.

use super::cipher::MAX_PLAINTEXT_LEN;
use crate::{
    env::Environment,
    error::{ChannelError, IntegrityError},
};

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Largest supported padding block.
pub const MAX_PADDING_BLOCK: usize = 64 * 1024;

/// Padded length for a `len`-byte plaintext at `block_size`.
///
/// A block size of zero is treated as one (prefix only, no filler).
/// Saturates at `usize::MAX` instead of overflowing.
pub fn padded_len(len: usize, block_size: usize) -> usize {
    let block = block_size.max(1);
    LENGTH_PREFIX_LEN.saturating_add(len).div_ceil(block).saturating_mul(block)
}

/// Prefix `plaintext` with its length and fill to the next block boundary
/// with random bytes.
///
/// # Errors
///
/// - `InvalidPaddingBlock` if `block_size` exceeds [`MAX_PADDING_BLOCK`]
/// - `MessageTooLarge` if `plaintext` exceeds [`MAX_PLAINTEXT_LEN`]
pub fn apply_padding<E: Environment>(
    env: &E,
    plaintext: &[u8],
    block_size: usize,
) -> Result<Vec<u8>, ChannelError> {
    check_block(block_size)?;
    if plaintext.len() > MAX_PLAINTEXT_LEN {
        return Err(ChannelError::MessageTooLarge {
            len: plaintext.len(),
            max: MAX_PLAINTEXT_LEN,
        });
    }
    let total = padded_len(plaintext.len(), block_size);

    let mut padded = Vec::with_capacity(total);
    padded.extend_from_slice(&(plaintext.len() as u32).to_be_bytes());
    padded.extend_from_slice(plaintext);

    let filled = padded.len();
    padded.resize(total, 0);
    env.random_bytes(&mut padded[filled..]);
    Ok(padded)
}

pub(crate) fn check_block(block_size: usize) -> Result<(), ChannelError> {
    if block_size > MAX_PADDING_BLOCK {
        return Err(ChannelError::InvalidPaddingBlock { block: block_size, max: MAX_PADDING_BLOCK });
    }
    Ok(())
}

/// Strip padding, returning exactly the bytes the prefix declares.
///
/// # Errors
///
/// - `MalformedPadding` if the input is shorter than the prefix or the
///   prefix declares more bytes than follow it
pub fn remove_padding(padded: &[u8]) -> Result<&[u8], IntegrityError> {
    let Some((prefix, rest)) = padded.split_first_chunk::<LENGTH_PREFIX_LEN>() else {
        return Err(IntegrityError::MalformedPadding {
            declared: LENGTH_PREFIX_LEN,
            available: padded.len(),
        });
    };

    let declared = u32::from_be_bytes(*prefix) as usize;
    rest.get(..declared)
        .ok_or(IntegrityError::MalformedPadding { declared, available: rest.len() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::SystemEnv;

    #[test]
    fn pads_to_block_boundary() {
        let env = SystemEnv::new();
        assert_eq!(apply_padding(&env, b"", 64).unwrap().len(), 64);
        assert_eq!(apply_padding(&env, &[1u8; 60], 64).unwrap().len(), 64);
        assert_eq!(apply_padding(&env, &[1u8; 61], 64).unwrap().len(), 128);
    }

    #[test]
    fn always_adds_prefix() {
        let env = SystemEnv::new();
        let padded = apply_padding(&env, b"abcd", 1).unwrap();
        assert_eq!(padded.len(), 8);
        assert_eq!(&padded[..4], &[0, 0, 0, 4]);
    }

    #[test]
    fn zero_block_size_means_prefix_only() {
        assert_eq!(padded_len(10, 0), 14);
    }

    #[test]
    fn huge_block_is_rejected() {
        let env = SystemEnv::new();
        assert_eq!(
            apply_padding(&env, b"ping", usize::MAX),
            Err(ChannelError::InvalidPaddingBlock { block: usize::MAX, max: MAX_PADDING_BLOCK })
        );
        assert_eq!(apply_padding(&env, b"", MAX_PADDING_BLOCK).unwrap().len(), MAX_PADDING_BLOCK);
        assert_eq!(padded_len(usize::MAX, usize::MAX), usize::MAX);
    }

    #[test]
    fn removes_exact_plaintext() {
        let env = SystemEnv::new();
        let padded = apply_padding(&env, b"ping", 32).unwrap();
        assert_eq!(remove_padding(&padded).unwrap(), b"ping");
    }

    #[test]
    fn rejects_short_input() {
        assert_eq!(
            remove_padding(&[0, 0]),
            Err(IntegrityError::MalformedPadding { declared: 4, available: 2 })
        );
    }

    #[test]
    fn rejects_oversized_prefix() {
        let mut padded = vec![0, 0, 0, 9];
        padded.extend_from_slice(b"abc");
        assert_eq!(
            remove_padding(&padded),
            Err(IntegrityError::MalformedPadding { declared: 9, available: 3 })
        );
    }
}
