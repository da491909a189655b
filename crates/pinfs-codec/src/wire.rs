//! Encode/decode of the chunk container described in the crate docs.

use lz4::block::{self, CompressionMode};
use md5::{Digest, Md5};

use crate::crypto::{self, EncryptionKey};
use crate::CodecError;

/// The only chunk container version this codec understands.
pub const CHUNK_VERSION: u8 = 0x01;

/// Hash algorithm id for MD5, the only one defined at version 0x01.
pub const HASH_ALGO_MD5: u8 = 0x01;

/// Length of an MD5 digest.
pub const MD5_SIZE: usize = 16;

/// LZ4 high-compression level used for chunk bodies.
const LZ4_HC_LEVEL: i32 = 6;

/// A decoded chunk: plaintext payload plus the metadata the container
/// carried for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedChunk {
    pub payload: Vec<u8>,
    /// 0-based position of this chunk within its logical file
    pub index: u32,
    /// MD5 of `payload`, as verified during decode
    pub hash: [u8; MD5_SIZE],
}

/// Encode one chunk payload into the wire container.
///
/// The hash is computed over `payload` before any transformation, then the
/// body goes through compress (LZ4-HC, when `compress` is set) and encrypt
/// (AES-256-GCM, when a key is given), in that order.
pub fn encode(
    payload: &[u8],
    index: u32,
    compress: bool,
    key: Option<&EncryptionKey>,
) -> Result<Vec<u8>, CodecError> {
    if u32::try_from(payload.len()).is_err() {
        return Err(CodecError::PayloadTooLarge(payload.len()));
    }

    let hash = md5_of(payload);

    let mut body = if compress {
        block::compress(payload, Some(CompressionMode::HIGHCOMPRESSION(LZ4_HC_LEVEL)), false)
            .map_err(CodecError::Compression)?
    } else {
        payload.to_vec()
    };

    if let Some(key) = key {
        body = crypto::seal(key, &body)?;
    }

    let stored_size =
        u32::try_from(body.len()).map_err(|_| CodecError::PayloadTooLarge(body.len()))?;

    let mut out = Vec::with_capacity(15 + body.len() + 1 + MD5_SIZE);
    out.push(CHUNK_VERSION);
    out.extend_from_slice(&index.to_le_bytes());
    out.push(compress as u8);
    out.push(key.is_some() as u8);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&stored_size.to_le_bytes());
    out.extend_from_slice(&body);
    out.push(HASH_ALGO_MD5);
    out.extend_from_slice(&hash);
    Ok(out)
}

/// Decode a wire container back into its plaintext payload.
///
/// Verifies, in order: version, body length, hash algorithm, AEAD tag
/// (when encrypted), decompressed length against the declared original
/// size, and finally the MD5 of the recovered plaintext.
pub fn decode(bytes: &[u8], key: Option<&EncryptionKey>) -> Result<DecodedChunk, CodecError> {
    let mut r = Reader::new(bytes);

    let version = r.u8("version")?;
    if version != CHUNK_VERSION {
        return Err(CodecError::UnsupportedChunkVersion(version));
    }

    let index = r.u32("index")?;
    let is_compressed = r.u8("compressed flag")? != 0;
    let is_encrypted = r.u8("encrypted flag")? != 0;
    let original_size = r.u32("original size")? as usize;
    let stored_size = r.u32("stored size")? as usize;
    let body = r.bytes(stored_size, "body")?;

    let hash_algo = r.u8("hash algorithm")?;
    if hash_algo != HASH_ALGO_MD5 {
        return Err(CodecError::UnknownHashAlgorithm(hash_algo));
    }
    let mut hash = [0u8; MD5_SIZE];
    hash.copy_from_slice(r.bytes(MD5_SIZE, "hash")?);

    let body = if is_encrypted {
        let key = key.ok_or(CodecError::DecryptionFailed)?;
        crypto::open(key, body)?
    } else {
        body.to_vec()
    };

    let payload = if is_compressed {
        let out = block::decompress(&body, Some(original_size as i32))
            .map_err(CodecError::Decompression)?;
        if out.len() != original_size {
            return Err(CodecError::DecompressionSizeMismatch {
                got: out.len(),
                want: original_size,
            });
        }
        out
    } else {
        if body.len() != original_size {
            return Err(CodecError::DecompressionSizeMismatch {
                got: body.len(),
                want: original_size,
            });
        }
        body
    };

    if md5_of(&payload) != hash {
        return Err(CodecError::HashMismatch);
    }

    Ok(DecodedChunk { payload, index, hash })
}

fn md5_of(data: &[u8]) -> [u8; MD5_SIZE] {
    // One hasher per call: MD5 state is cheap and not shareable
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Little-endian cursor that reports truncation with the field it was
/// reading.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn bytes(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], CodecError> {
        let remaining = self.buf.len() - self.pos;
        if remaining < n {
            return Err(CodecError::Truncated {
                field,
                needed: n - remaining,
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, CodecError> {
        Ok(self.bytes(1, field)?[0])
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, CodecError> {
        let raw = self.bytes(4, field)?;
        Ok(u32::from_le_bytes(raw.try_into().expect("4 bytes")))
    }
}
