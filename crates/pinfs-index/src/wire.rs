//! Binary serialization of an [`Index`] snapshot.
//!
//! Layout (little-endian integers, length-prefixed UTF-8 strings):
//! ```text
//! [1: version=0x01][8: built_at][4: entry count]
//! per entry:
//!   [2: path len][path][8: length][8: mtime]
//!   [1: hash len][hash][4: chunk count]
//!   per chunk: [2: url len][url][4: stored size]
//! ```
//! The artifact is opaque to the transport; it only has to round-trip.

use crate::model::{Index, IndexEntry, IndexFileChunk};
use crate::IndexError;

/// The only index artifact version this crate understands.
pub const INDEX_VERSION: u8 = 0x01;

impl Index {
    pub fn serialize(&self) -> Result<Vec<u8>, IndexError> {
        let mut out = Vec::new();
        out.push(INDEX_VERSION);
        out.extend_from_slice(&self.built_at.to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());

        for entry in self.entries.values() {
            write_str(&mut out, &entry.relative_path)?;
            out.extend_from_slice(&entry.length.to_le_bytes());
            out.extend_from_slice(&entry.mtime.to_le_bytes());

            let hash_len =
                u8::try_from(entry.hash.len()).map_err(|_| IndexError::StringTooLong(entry.hash.len()))?;
            out.push(hash_len);
            out.extend_from_slice(&entry.hash);

            out.extend_from_slice(&(entry.chunks.len() as u32).to_le_bytes());
            for chunk in &entry.chunks {
                write_str(&mut out, &chunk.url)?;
                out.extend_from_slice(&chunk.size.to_le_bytes());
            }
        }

        Ok(out)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Index, IndexError> {
        let mut r = Reader::new(bytes);

        let version = r.u8("version")?;
        if version != INDEX_VERSION {
            return Err(IndexError::UnsupportedIndexVersion(version));
        }

        let built_at = r.u64("built_at")?;
        let count = r.u32("entry count")?;

        let mut index = Index {
            version,
            built_at,
            entries: Default::default(),
        };

        for _ in 0..count {
            let relative_path = r.str("entry path")?;
            let length = r.u64("entry length")?;
            let mtime = r.u64("entry mtime")?;

            let hash_len = r.u8("hash length")? as usize;
            let hash = r.bytes(hash_len, "entry hash")?.to_vec();

            let chunk_count = r.u32("chunk count")?;
            let mut chunks = Vec::with_capacity(chunk_count.min(1024) as usize);
            for _ in 0..chunk_count {
                let url = r.str("chunk url")?;
                let size = r.u32("chunk size")?;
                chunks.push(IndexFileChunk { url, size });
            }

            index.upsert(IndexEntry {
                relative_path,
                length,
                mtime,
                hash,
                chunks,
            });
        }

        Ok(index)
    }
}

fn write_str(out: &mut Vec<u8>, s: &str) -> Result<(), IndexError> {
    let len = u16::try_from(s.len()).map_err(|_| IndexError::StringTooLong(s.len()))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn bytes(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], IndexError> {
        if self.buf.len() - self.pos < n {
            return Err(IndexError::Truncated { field });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, IndexError> {
        Ok(self.bytes(1, field)?[0])
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, IndexError> {
        Ok(u16::from_le_bytes(self.bytes(2, field)?.try_into().expect("2 bytes")))
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, IndexError> {
        Ok(u32::from_le_bytes(self.bytes(4, field)?.try_into().expect("4 bytes")))
    }

    fn u64(&mut self, field: &'static str) -> Result<u64, IndexError> {
        Ok(u64::from_le_bytes(self.bytes(8, field)?.try_into().expect("8 bytes")))
    }

    fn str(&mut self, field: &'static str) -> Result<String, IndexError> {
        let len = self.u16(field)? as usize;
        let raw = self.bytes(len, field)?;
        String::from_utf8(raw.to_vec()).map_err(|_| IndexError::InvalidUtf8)
    }
}
