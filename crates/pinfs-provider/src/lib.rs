//! pinfs-provider: the remote provider state machine and read path.
//!
//! The provider owns the relationship with the chat service: it discovers
//! the pinned index message in the metadata channel, keeps the last-known
//! remote index materialized, rewrites it on demand (suppressing the echo
//! of its own edits), runs a periodic full resync, and surfaces state and
//! file-change events to the host. Read streams fetch chunk attachments in
//! parallel and assemble the requested byte window into a caller-supplied
//! buffer.
//!
//! ```text
//! host ── open/read ──► ReadStream ── fetch ──► ChatTransport
//!   ▲                      │ index snapshot
//!   │ events               ▼
//!   └────────────── Provider ◄── connect / message-updated / timer
//! ```

pub mod events;
pub mod provider;
pub mod read;

pub use events::EventBus;
pub use provider::{Provider, ProviderError};
pub use read::{OpenCode, OpenResult, ReadError, ReadOutcome, ReadStream};

use thiserror::Error;

/// API-misuse errors; never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("provider is not ready")]
    NotReady,

    #[error("stream is already open")]
    AlreadyOpen,

    #[error("stream is not open")]
    NotOpen,

    #[error("disposed")]
    Disposed,
}

/// Synchronization failures the state machine handles or logs.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("index artifact could not be decoded: {0}")]
    IndexDecodeFailed(String),

    #[error("index message is missing")]
    IndexMessageMissing,
}
