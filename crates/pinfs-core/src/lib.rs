//! pinfs-core: configuration and shared types for the pinfs provider.
//!
//! pinfs presents a local directory as a mirror of a remote index kept in a
//! chat service: file content lives as chunk attachments in a data channel,
//! and the index itself is the attachment set of a single pinned message in
//! a metadata channel. This crate holds what every other pinfs crate needs:
//! the provider configuration and the event/placeholder types surfaced to
//! the host.

pub mod config;
pub mod types;

pub use config::{ConfigError, ProviderConfig, ENCRYPTION_KEY_SIZE};
pub use types::{ChangeKind, FileChangeEvent, Placeholder, ProviderStatus};
