//! Block cipher used for key derivation and payload encryption.
//!
//! The adapter's `my_encrypt`/`my_decrypt` operate on a 16-byte key and a
//! 16-byte block in ECB mode, keyed from fixed ASCII literals — the
//! unmistakable shape of AES-128. The vendor's `crypto.h` is not present in
//! the retrieved sources, so the exact primitive cannot be proven
//! byte-for-byte from the corpus alone, but the 16/16 ECB + ASCII-key
//! signature points squarely at AES-128 rather than a bespoke transform, so
//! this module is built on the `aes` crate instead of a hand-rolled stand-in
//! (see `DESIGN.md` for the reasoning and its limits).

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;

/// A 128-bit cipher key.
pub type Key = [u8; 16];

/// A 128-bit cipher block.
pub type Block = [u8; 16];

/// Encrypts a single 16-byte block under `key`.
pub fn encrypt(key: &Key, block: &Block) -> Block {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut out = *GenericArray::from_slice(block);
    cipher.encrypt_block(&mut out);
    out.into()
}

/// Decrypts a single 16-byte block under `key`.
pub fn decrypt(key: &Key, block: &Block) -> Block {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut out = *GenericArray::from_slice(block);
    cipher.decrypt_block(&mut out);
    out.into()
}

/// Derives a key by encrypting the per-device derivation block under a key
/// built from a fixed ASCII literal. The literal is padded with zero bytes
/// to 16 bytes (it is always shorter than a block in practice).
pub fn derive(literal: &str, block: &Block) -> Block {
    let mut key = [0u8; 16];
    let bytes = literal.as_bytes();
    let n = bytes.len().min(16);
    key[..n].copy_from_slice(&bytes[..n]);
    encrypt(&key, block)
}

/// Encrypts a buffer in place, 16 bytes at a time. `buf.len()` must be a
/// multiple of 16; callers are responsible for padding (see
/// [`crate::flash`]).
pub fn encrypt_buffer(key: &Key, buf: &mut [u8]) {
    debug_assert_eq!(buf.len() % 16, 0, "encrypt_buffer requires block-aligned input");
    for chunk in buf.chunks_exact_mut(16) {
        let mut block: Block = [0u8; 16];
        block.copy_from_slice(chunk);
        chunk.copy_from_slice(&encrypt(key, &block));
    }
}

/// Decrypts a buffer in place, 16 bytes at a time, tolerating a final
/// partial chunk shorter than 16 bytes: that tail is padded with `0xFF` up
/// to a full block before the transform, then truncated back down.
pub fn decrypt_buffer(key: &Key, buf: &mut [u8]) {
    let mut offset = 0;
    while offset < buf.len() {
        let remaining = buf.len() - offset;
        let take = remaining.min(16);
        let mut block: Block = [0xFF; 16];
        block[..take].copy_from_slice(&buf[offset..offset + take]);
        let out = decrypt(key, &block);
        buf[offset..offset + take].copy_from_slice(&out[..take]);
        offset += take;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn round_trip_single_block() {
        let key: Key = hex!("000102030405060708090A0B0C0D0E0F");
        let block: Block = hex!("AABBCCDDEEFF00112233445566778899");
        let ciphertext = encrypt(&key, &block);
        assert_ne!(ciphertext, block, "cipher should not be the identity transform");
        let plaintext = decrypt(&key, &ciphertext);
        assert_eq!(plaintext, block);
    }

    #[test]
    fn matches_fips_197_aes128_known_answer_test() {
        // FIPS-197 appendix C.1, the standard AES-128 known-answer test.
        let key: Key = hex!("000102030405060708090a0b0c0d0e0f");
        let plaintext: Block = hex!("00112233445566778899aabbccddeeff");
        let expected_ciphertext: Block = hex!("69c4e0d86a7b0430d8cdb78070b4c55a");
        assert_eq!(encrypt(&key, &plaintext), expected_ciphertext);
        assert_eq!(decrypt(&key, &expected_ciphertext), plaintext);
    }

    #[test]
    fn round_trip_zero_block() {
        let key: Key = [0u8; 16];
        let block: Block = [0u8; 16];
        let ciphertext = encrypt(&key, &block);
        assert_eq!(decrypt(&key, &ciphertext), block);
    }

    #[test]
    fn deterministic_for_same_key_and_block() {
        let key: Key = hex!("FEDCBA9876543210FEDCBA9876543210");
        let block: Block = hex!("0102030405060708090A0B0C0D0E0F10");
        assert_eq!(encrypt(&key, &block), encrypt(&key, &block));
    }

    #[test]
    fn derive_is_deterministic_and_depends_on_block() {
        let block_a: Block = [0x11; 16];
        let block_b: Block = [0x22; 16];
        let key_a = derive("I am key, wawawa", &block_a);
        let key_a_again = derive("I am key, wawawa", &block_a);
        let key_b = derive("I am key, wawawa", &block_b);
        assert_eq!(key_a, key_a_again);
        assert_ne!(key_a, key_b);
    }

    #[test]
    fn derive_differs_by_literal() {
        let block: Block = [0x33; 16];
        let firmware_key = derive("I am key, wawawa", &block);
        let anti_clone_tag = derive("What are you doing", &block);
        assert_ne!(firmware_key, anti_clone_tag);
    }

    #[test]
    fn encrypt_buffer_round_trips_multi_block() {
        let key: Key = hex!("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA");
        let mut buf = [0x5Au8; 48];
        let original = buf;
        encrypt_buffer(&key, &mut buf);
        assert_ne!(buf[..], original[..]);
        decrypt_buffer(&key, &mut buf);
        assert_eq!(buf[..], original[..]);
    }

    #[test]
    fn decrypt_buffer_handles_short_final_chunk() {
        let key: Key = hex!("0F0F0F0F0F0F0F0F0F0F0F0F0F0F0F0F");
        let mut buf = vec![0x7Bu8; 16 + 5];
        let original = buf.clone();
        encrypt_buffer_with_padding(&key, &mut buf);
        decrypt_buffer(&key, &mut buf[..16 + 5]);
        assert_eq!(&buf[..16 + 5], &original[..]);
    }

    fn encrypt_buffer_with_padding(key: &Key, buf: &mut Vec<u8>) {
        let mut offset = 0;
        while offset < buf.len() {
            let remaining = buf.len() - offset;
            let take = remaining.min(16);
            let mut block: Block = [0xFF; 16];
            block[..take].copy_from_slice(&buf[offset..offset + take]);
            let out = encrypt(key, &block);
            buf[offset..offset + take].copy_from_slice(&out[..take]);
            offset += take;
        }
    }
}
