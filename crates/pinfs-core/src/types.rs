use serde::{Deserialize, Serialize};

/// Readiness of the remote provider as seen by the host.
///
/// `Ready` requires: transport connected, index message id known, and the
/// last-known remote index materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderStatus {
    NotReady,
    Ready,
}

/// What happened to a file between two index snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Created,
    Deleted,
    Modified,
    /// Full resync: the host should reconcile its whole mirror
    All,
}

/// A lightweight stand-in for a file: metadata without content.
///
/// Handed to the host so it can materialize dehydrated entries (size and
/// mtime show up in listings before any content is downloaded).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placeholder {
    /// Path relative to the mirror root, forward slashes, no leading slash
    pub relative_path: String,
    /// File size in bytes
    pub size: u64,
    /// Last modified time, Unix seconds
    pub mtime: u64,
    /// Whole-file content hash
    pub hash: Vec<u8>,
}

/// A file-change notification emitted toward the host.
///
/// Delivery is best-effort, at-least-once per transition edge; duplicates
/// are tolerable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChangeEvent {
    pub kind: ChangeKind,
    /// Previous path of the file, when one applies
    pub old_relative_path: Option<String>,
    /// Metadata of the affected file; absent for `All`
    pub placeholder: Option<Placeholder>,
    /// True when the host should re-enumerate subdirectories too
    pub resync_subdirectories: bool,
}

impl FileChangeEvent {
    /// The event emitted by the periodic full-resync timer.
    pub fn full_resync() -> Self {
        FileChangeEvent {
            kind: ChangeKind::All,
            old_relative_path: None,
            placeholder: None,
            resync_subdirectories: true,
        }
    }
}
