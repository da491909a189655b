//! pinfs-codec: the versioned binary container for one file chunk.
//!
//! Wire layout (little-endian integers):
//! ```text
//! [1: version=0x01][4: chunk index][1: compressed?][1: encrypted?]
//! [4: original size][4: stored size][stored size: body]
//! [1: hash algo=0x01 (MD5)][16: MD5 of the plaintext payload]
//! ```
//!
//! Pipeline order is fixed: compress → encrypt on the way in,
//! decrypt → decompress → hash-verify on the way out. The MD5 is always
//! computed over the plaintext payload, never the stored body, so it acts
//! as an end-to-end integrity check behind the AEAD tag.

pub mod crypto;
pub mod wire;

pub use crypto::{open, seal, EncryptionKey, ENCRYPTION_OVERHEAD, IV_SIZE, KEY_SIZE, TAG_SIZE};
pub use wire::{decode, encode, DecodedChunk, CHUNK_VERSION, HASH_ALGO_MD5, MD5_SIZE};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unsupported chunk version {0:#04x}")]
    UnsupportedChunkVersion(u8),

    #[error("unknown hash algorithm id {0:#04x}")]
    UnknownHashAlgorithm(u8),

    #[error("chunk hash does not match decoded payload")]
    HashMismatch,

    #[error("chunk decryption failed: wrong key, missing key, or corrupted body")]
    DecryptionFailed,

    #[error("chunk decompression failed")]
    Decompression(#[source] std::io::Error),

    #[error("decompressed size {got} does not match declared original size {want}")]
    DecompressionSizeMismatch { got: usize, want: usize },

    #[error("chunk truncated: needed {needed} more bytes for {field}")]
    Truncated { field: &'static str, needed: usize },

    #[error("chunk compression failed")]
    Compression(#[source] std::io::Error),

    #[error("payload of {0} bytes exceeds the chunk container limit")]
    PayloadTooLarge(usize),
}

/// Headroom reserved for the container itself: header, hash trailer, IV
/// and AEAD tag all fit within this margin.
pub const CHUNK_MARGIN: usize = 256;

/// Worst-case growth of an LZ4 block (the LZ4_COMPRESSBOUND overhead).
pub fn lz4_max_expansion(len: usize) -> usize {
    len / 255 + 16
}

/// Largest plaintext payload whose encoded chunk is guaranteed to fit an
/// attachment of `max_attachment_size` bytes.
pub fn chunk_payload_size(max_attachment_size: usize) -> usize {
    max_attachment_size
        .saturating_sub(lz4_max_expansion(max_attachment_size))
        .saturating_sub(CHUNK_MARGIN)
}
