//! AES-256-GCM sealing for chunk bodies and index pieces.
//!
//! Sealed format: `[12 bytes: random IV][N bytes: ciphertext][16 bytes: tag]`.
//! The IV and tag are part of the stored body, so a chunk's declared
//! stored size always covers them.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;

use crate::CodecError;

/// Size of a raw AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of the random GCM IV prepended to each sealed body.
pub const IV_SIZE: usize = 12;

/// Size of the GCM authentication tag appended to each sealed body.
pub const TAG_SIZE: usize = 16;

/// Fixed per-body growth when sealing: IV + tag.
pub const ENCRYPTION_OVERHEAD: usize = IV_SIZE + TAG_SIZE;

/// A raw 32-byte chunk encryption key.
pub type EncryptionKey = [u8; KEY_SIZE];

/// Seal `plaintext` with a fresh random IV.
///
/// Returns `[IV][ciphertext][tag]`.
pub fn seal(key: &EncryptionKey, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
    let cipher = Aes256Gcm::new_from_slice(key).expect("key length is KEY_SIZE");

    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    let nonce = Nonce::from_slice(&iv);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CodecError::DecryptionFailed)?;

    let mut sealed = Vec::with_capacity(IV_SIZE + ciphertext.len());
    sealed.extend_from_slice(&iv);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Open a sealed body produced by [`seal`].
///
/// Any failure — short input, wrong key, flipped bit — surfaces as
/// [`CodecError::DecryptionFailed`]; GCM does not distinguish causes.
pub fn open(key: &EncryptionKey, sealed: &[u8]) -> Result<Vec<u8>, CodecError> {
    if sealed.len() < ENCRYPTION_OVERHEAD {
        return Err(CodecError::DecryptionFailed);
    }

    let (iv, ciphertext) = sealed.split_at(IV_SIZE);
    let cipher = Aes256Gcm::new_from_slice(key).expect("key length is KEY_SIZE");

    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| CodecError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = [7u8; KEY_SIZE];
        let sealed = seal(&key, b"hello, sealed world!").unwrap();
        let opened = open(&key, &sealed).unwrap();
        assert_eq!(opened, b"hello, sealed world!");
    }

    #[test]
    fn test_sealed_size() {
        let key = [0u8; KEY_SIZE];
        let sealed = seal(&key, &[0u8; 1000]).unwrap();
        assert_eq!(sealed.len(), 1000 + ENCRYPTION_OVERHEAD);
    }

    #[test]
    fn test_open_wrong_key() {
        let sealed = seal(&[1u8; KEY_SIZE], b"secret").unwrap();
        assert!(matches!(
            open(&[2u8; KEY_SIZE], &sealed),
            Err(CodecError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_open_tampered_body() {
        let key = [3u8; KEY_SIZE];
        let mut sealed = seal(&key, b"secret").unwrap();
        sealed[IV_SIZE] ^= 0xFF;
        assert!(matches!(
            open(&key, &sealed),
            Err(CodecError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_open_too_short() {
        let key = [4u8; KEY_SIZE];
        assert!(matches!(
            open(&key, &[0u8; ENCRYPTION_OVERHEAD - 1]),
            Err(CodecError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_fresh_iv_per_seal() {
        let key = [5u8; KEY_SIZE];
        let a = seal(&key, b"same input").unwrap();
        let b = seal(&key, b"same input").unwrap();
        assert_ne!(a[..IV_SIZE], b[..IV_SIZE], "IVs must not repeat");
    }
}
