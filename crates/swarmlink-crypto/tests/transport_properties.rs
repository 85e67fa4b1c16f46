//! Property-based tests for padding and message encoding
//!
//! 1. **Padding round-trip**: remove_padding(apply_padding(m, b)) == m for
//!    every supported block size; larger blocks are refused, never panic
//! 2. **Length hiding**: padded length depends only on the block count
//! 3. **Encoding round-trip**: decode(encode(msg)) == msg

use proptest::prelude::*;
use swarmlink_crypto::{
    ChannelError, EncryptedMessage, IntegrityError, MAX_PADDING_BLOCK, SystemEnv, apply_padding,
    remove_padding, transport::padded_len,
};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: padding always strips back to the original plaintext.
    #[test]
    fn prop_padding_roundtrip(
        plaintext in prop::collection::vec(any::<u8>(), 0..2048),
        block in 0usize..1024,
    ) {
        let env = SystemEnv::new();
        let padded = apply_padding(&env, &plaintext, block).unwrap();
        prop_assert_eq!(remove_padding(&padded).unwrap(), plaintext.as_slice());
    }

    /// Property: output is a whole number of blocks and always adds the
    /// length prefix.
    #[test]
    fn prop_padding_fills_blocks(
        len in 0usize..4096,
        block in 1usize..512,
    ) {
        let env = SystemEnv::new();
        let padded = apply_padding(&env, &vec![0xAB; len], block).unwrap();

        prop_assert_eq!(padded.len() % block, 0);
        prop_assert!(padded.len() >= len + 4);
        prop_assert!(padded.len() < len + 4 + block);
        prop_assert_eq!(padded.len(), padded_len(len, block));
    }

    /// Property: block sizes past the limit are an error, not an allocation
    /// failure.
    #[test]
    fn prop_oversized_block_rejected(
        plaintext in prop::collection::vec(any::<u8>(), 0..64),
        block in (MAX_PADDING_BLOCK + 1)..=usize::MAX,
    ) {
        let env = SystemEnv::new();
        prop_assert_eq!(
            apply_padding(&env, &plaintext, block),
            Err(ChannelError::InvalidPaddingBlock { block, max: MAX_PADDING_BLOCK })
        );
    }

    /// Property: plaintexts in the same block bucket are indistinguishable
    /// by length.
    #[test]
    fn prop_same_bucket_same_length(a in 0usize..60, b in 0usize..60) {
        prop_assert_eq!(padded_len(a, 64), padded_len(b, 64));
    }

    /// Property: a prefix larger than the remaining bytes is rejected, never
    /// sliced out of bounds.
    #[test]
    fn prop_oversized_prefix_rejected(
        body in prop::collection::vec(any::<u8>(), 0..64),
        extra in 1u32..1000,
    ) {
        let declared = body.len() as u32 + extra;
        let mut padded = declared.to_be_bytes().to_vec();
        padded.extend_from_slice(&body);

        prop_assert_eq!(
            remove_padding(&padded),
            Err(IntegrityError::MalformedPadding {
                declared: declared as usize,
                available: body.len(),
            })
        );
    }

    /// Property: the wire encoding preserves every field.
    #[test]
    fn prop_encoding_roundtrip(
        ciphertext in prop::collection::vec(any::<u8>(), 0..256),
        auth_tag in any::<[u8; 16]>(),
        nonce in any::<u64>(),
        timestamp_ms in any::<u64>(),
    ) {
        let message = EncryptedMessage { ciphertext, auth_tag, nonce, timestamp_ms };
        prop_assert_eq!(EncryptedMessage::decode(&message.encode()).unwrap(), message);
    }
}
