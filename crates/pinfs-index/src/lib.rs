//! pinfs-index: the serializable directory snapshot the provider syncs.
//!
//! An [`Index`] maps normalized relative paths to file entries (length,
//! mtime, whole-file MD5, and the chunk attachments holding the content).
//! Snapshots serialize to a self-describing binary artifact, diff against
//! each other with added/deleted/modified semantics, and are built from a
//! local directory walk.
//!
//! Path comparison is case-insensitive and separator-normalized: entries
//! are keyed by the lowercased forward-slash form while keeping the
//! original spelling for display.

pub mod model;
pub mod scan;
pub mod wire;

pub use model::{diff, Index, IndexDiff, IndexEntry, IndexFileChunk};
pub use scan::build_for_directory;
pub use wire::INDEX_VERSION;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("unsupported index version {0:#04x}")]
    UnsupportedIndexVersion(u8),

    #[error("index truncated while reading {field}")]
    Truncated { field: &'static str },

    #[error("index string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("string of {0} bytes exceeds the index field limit")]
    StringTooLong(usize),

    #[error("scanning directory: {0}")]
    Scan(#[from] std::io::Error),
}
