//! pinfs-transport: the capability seam between the provider core and a
//! concrete chat service.
//!
//! The provider never talks HTTP; it consumes [`ChatTransport`] — channel
//! lookup/creation, pinned-message listing, attachment upload/download,
//! message edits, and a connection event stream. Production plugs a real
//! chat client in; tests plug [`memory::MemoryTransport`].

pub mod backoff;
pub mod memory;

pub use backoff::with_backoff;

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport is offline")]
    Offline,

    #[error("network unavailable")]
    NetworkUnavailable,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("rate limited")]
    RateLimited,
}

macro_rules! id_type {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_type!(ChannelId);
id_type!(MessageId);
id_type!(UserId);

/// One attachment as reported by the chat service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub url: String,
    pub size: u64,
}

/// An attachment to upload: filename plus content.
#[derive(Debug, Clone)]
pub struct AttachmentUpload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// A chat message as the provider sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    /// Last edit time in Unix milliseconds, if the message was ever edited
    pub edited_at: Option<u64>,
    pub attachments: Vec<Attachment>,
}

/// Connection and message events pushed by the transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    Disconnected(Option<String>),
    MessageUpdated {
        channel_id: ChannelId,
        message: Message,
    },
}

/// Channel permission bits the provider cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    ManageMessages,
    ViewChannel,
    SendMessages,
    AttachFiles,
    ReadMessageHistory,
    AddReactions,
}

/// Permission overwrites applied when a channel is created: what the bot
/// identity may do and what everyone else may do (everything else denied).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPolicy {
    pub bot_allow: Vec<Permission>,
    pub everyone_allow: Vec<Permission>,
}

impl ChannelPolicy {
    /// The provider's policy: the bot manages and posts, everyone else may
    /// only look (and react).
    pub fn provider_default() -> Self {
        use Permission::*;
        ChannelPolicy {
            bot_allow: vec![
                ManageMessages,
                ViewChannel,
                SendMessages,
                AttachFiles,
                ReadMessageHistory,
                AddReactions,
            ],
            everyone_allow: vec![ViewChannel, AddReactions],
        }
    }
}

/// Everything the provider state machine needs from a chat service.
///
/// Implementations retry `RateLimited` internally (see [`with_backoff`])
/// and surface every other failure to the caller.
#[async_trait]
pub trait ChatTransport: Send + Sync + 'static {
    /// The identity this transport posts as.
    fn bot_user_id(&self) -> UserId;

    /// Subscribe to connection and message-update events.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Idempotent channel lookup/creation; `policy` is applied on creation.
    async fn get_or_create_channel(
        &self,
        name: &str,
        policy: &ChannelPolicy,
    ) -> Result<ChannelId, TransportError>;

    async fn pinned_messages(&self, channel: ChannelId) -> Result<Vec<Message>, TransportError>;

    async fn get_message(
        &self,
        channel: ChannelId,
        message: MessageId,
    ) -> Result<Message, TransportError>;

    async fn send_files(
        &self,
        channel: ChannelId,
        text: &str,
        files: Vec<AttachmentUpload>,
    ) -> Result<Message, TransportError>;

    async fn pin_message(
        &self,
        channel: ChannelId,
        message: MessageId,
    ) -> Result<(), TransportError>;

    /// Replace the full attachment set of a message; atomic from the
    /// host's perspective. Returns the refreshed message.
    async fn edit_attachments(
        &self,
        channel: ChannelId,
        message: MessageId,
        files: Vec<AttachmentUpload>,
    ) -> Result<Message, TransportError>;

    async fn fetch_attachment(&self, url: &str) -> Result<Vec<u8>, TransportError>;
}
