//! In-memory chat transport for tests.
//!
//! Plays the role a real chat client plays in production: channels,
//! pinned messages, attachment blobs addressed by `mem://` URLs, and an
//! event stream the test can drive (connects, disconnects, external
//! message edits, injected failures). Every RPC goes through
//! [`with_backoff`], so injected `RateLimited` failures are retried away
//! while everything else surfaces on the first attempt.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::{
    with_backoff, Attachment, AttachmentUpload, ChannelId, ChannelPolicy, ChatTransport, Message,
    MessageId, TransportError, TransportEvent, UserId,
};

const BOT_USER: UserId = UserId(1);

#[derive(Clone)]
pub struct MemoryTransport {
    state: Arc<Mutex<State>>,
    events: broadcast::Sender<TransportEvent>,
}

struct StoredMessage {
    message: Message,
    text: String,
}

struct State {
    next_id: u64,
    /// Logical clock for `edited_at`, strictly increasing per edit
    clock_ms: u64,
    channels: HashMap<String, ChannelId>,
    policies: HashMap<ChannelId, ChannelPolicy>,
    messages: HashMap<(ChannelId, MessageId), StoredMessage>,
    pins: HashMap<ChannelId, Vec<MessageId>>,
    blobs: HashMap<String, Vec<u8>>,
    fail_next: VecDeque<TransportError>,
}

impl State {
    fn take_injected_failure(&mut self) -> Result<(), TransportError> {
        match self.fail_next.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn fresh_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn tick_ms(&mut self) -> u64 {
        self.clock_ms += 1;
        self.clock_ms
    }

    fn store_attachments(
        &mut self,
        channel: ChannelId,
        message: MessageId,
        files: Vec<AttachmentUpload>,
    ) -> Vec<Attachment> {
        files
            .into_iter()
            .map(|f| {
                let url = format!("mem://{}/{}/{}", channel.0, message.0, f.filename);
                let size = f.bytes.len() as u64;
                self.blobs.insert(url.clone(), f.bytes);
                Attachment {
                    filename: f.filename,
                    url,
                    size,
                }
            })
            .collect()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        MemoryTransport {
            state: Arc::new(Mutex::new(State {
                next_id: 1000,
                clock_ms: 1_700_000_000_000,
                channels: HashMap::new(),
                policies: HashMap::new(),
                messages: HashMap::new(),
                pins: HashMap::new(),
                blobs: HashMap::new(),
                fail_next: VecDeque::new(),
            })),
            events,
        }
    }

    // ── Test-side controls ──────────────────────────────────────────────

    pub fn emit_connected(&self) {
        let _ = self.events.send(TransportEvent::Connected);
    }

    pub fn emit_disconnected(&self, reason: Option<String>) {
        let _ = self.events.send(TransportEvent::Disconnected(reason));
    }

    /// Queue an error; the next RPC attempt fails with it. A queued
    /// `RateLimited` is consumed by the retry loop.
    pub fn inject_failure(&self, err: TransportError) {
        self.state.lock().unwrap().fail_next.push_back(err);
    }

    /// Replace a message's attachments as if another client edited it,
    /// emitting the corresponding `MessageUpdated` event.
    pub fn edit_message_externally(
        &self,
        channel: ChannelId,
        message: MessageId,
        files: Vec<AttachmentUpload>,
    ) -> Message {
        let updated = {
            let mut state = self.state.lock().unwrap();
            let attachments = state.store_attachments(channel, message, files);
            let edited_at = state.tick_ms();
            let stored = state
                .messages
                .get_mut(&(channel, message))
                .expect("message exists");
            stored.message.attachments = attachments;
            stored.message.edited_at = Some(edited_at);
            stored.message.clone()
        };
        let _ = self.events.send(TransportEvent::MessageUpdated {
            channel_id: channel,
            message: updated.clone(),
        });
        updated
    }

    /// Re-deliver the update event for a message without changing it
    /// (simulates the chat service echoing our own edit back).
    pub fn echo_message_update(&self, channel: ChannelId, message: MessageId) {
        let msg = {
            let state = self.state.lock().unwrap();
            state.messages[&(channel, message)].message.clone()
        };
        let _ = self.events.send(TransportEvent::MessageUpdated {
            channel_id: channel,
            message: msg,
        });
    }

    /// Drop a message entirely (simulates out-of-band deletion).
    pub fn delete_message(&self, channel: ChannelId, message: MessageId) {
        let mut state = self.state.lock().unwrap();
        state.messages.remove(&(channel, message));
        if let Some(pins) = state.pins.get_mut(&channel) {
            pins.retain(|id| *id != message);
        }
    }

    /// Post a pinned message authored by someone other than the bot.
    pub fn seed_foreign_pin(&self, channel: ChannelId, filename: &str) -> MessageId {
        let mut state = self.state.lock().unwrap();
        let id = MessageId(state.fresh_id());
        let attachments = state.store_attachments(
            channel,
            id,
            vec![AttachmentUpload {
                filename: filename.into(),
                bytes: Vec::new(),
            }],
        );
        state.messages.insert(
            (channel, id),
            StoredMessage {
                message: Message {
                    id,
                    channel_id: channel,
                    author_id: UserId(999),
                    edited_at: None,
                    attachments,
                },
                text: String::new(),
            },
        );
        state.pins.entry(channel).or_default().push(id);
        id
    }

    pub fn channel_policy(&self, channel: ChannelId) -> Option<ChannelPolicy> {
        self.state.lock().unwrap().policies.get(&channel).cloned()
    }

    pub fn message_text(&self, channel: ChannelId, message: MessageId) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .messages
            .get(&(channel, message))
            .map(|m| m.text.clone())
    }
}

// ── RPC bodies ──────────────────────────────────────────────────────────
// One attempt each; the trait methods below run them through
// `with_backoff`, so retrying `RateLimited` stays transparent at the call
// site the way the teacher layers retries onto every storage call.

impl MemoryTransport {
    async fn do_get_or_create_channel(
        &self,
        name: &str,
        policy: &ChannelPolicy,
    ) -> Result<ChannelId, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.take_injected_failure()?;

        if let Some(id) = state.channels.get(name) {
            return Ok(*id);
        }
        let id = ChannelId(state.fresh_id());
        state.channels.insert(name.to_string(), id);
        state.policies.insert(id, policy.clone());
        Ok(id)
    }

    async fn do_pinned_messages(
        &self,
        channel: ChannelId,
    ) -> Result<Vec<Message>, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.take_injected_failure()?;

        let ids = state.pins.get(&channel).cloned().unwrap_or_default();
        Ok(ids
            .into_iter()
            .filter_map(|id| state.messages.get(&(channel, id)))
            .map(|m| m.message.clone())
            .collect())
    }

    async fn do_get_message(
        &self,
        channel: ChannelId,
        message: MessageId,
    ) -> Result<Message, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.take_injected_failure()?;

        state
            .messages
            .get(&(channel, message))
            .map(|m| m.message.clone())
            .ok_or_else(|| TransportError::NotFound(format!("message {message}")))
    }

    async fn do_send_files(
        &self,
        channel: ChannelId,
        text: &str,
        files: Vec<AttachmentUpload>,
    ) -> Result<Message, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.take_injected_failure()?;

        let id = MessageId(state.fresh_id());
        let attachments = state.store_attachments(channel, id, files);
        let message = Message {
            id,
            channel_id: channel,
            author_id: BOT_USER,
            edited_at: None,
            attachments,
        };
        state.messages.insert(
            (channel, id),
            StoredMessage {
                message: message.clone(),
                text: text.to_string(),
            },
        );
        Ok(message)
    }

    async fn do_pin_message(
        &self,
        channel: ChannelId,
        message: MessageId,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.take_injected_failure()?;

        if !state.messages.contains_key(&(channel, message)) {
            return Err(TransportError::NotFound(format!("message {message}")));
        }
        let pins = state.pins.entry(channel).or_default();
        if !pins.contains(&message) {
            pins.push(message);
        }
        Ok(())
    }

    async fn do_edit_attachments(
        &self,
        channel: ChannelId,
        message: MessageId,
        files: Vec<AttachmentUpload>,
    ) -> Result<Message, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.take_injected_failure()?;

        if !state.messages.contains_key(&(channel, message)) {
            return Err(TransportError::NotFound(format!("message {message}")));
        }
        let attachments = state.store_attachments(channel, message, files);
        let edited_at = state.tick_ms();
        let stored = state.messages.get_mut(&(channel, message)).expect("checked");
        stored.message.attachments = attachments;
        stored.message.edited_at = Some(edited_at);
        Ok(stored.message.clone())
    }

    async fn do_fetch_attachment(&self, url: &str) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.take_injected_failure()?;

        state
            .blobs
            .get(url)
            .cloned()
            .ok_or_else(|| TransportError::NotFound(url.to_string()))
    }
}

#[async_trait]
impl ChatTransport for MemoryTransport {
    fn bot_user_id(&self) -> UserId {
        BOT_USER
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn get_or_create_channel(
        &self,
        name: &str,
        policy: &ChannelPolicy,
    ) -> Result<ChannelId, TransportError> {
        with_backoff("get_or_create_channel", || {
            self.do_get_or_create_channel(name, policy)
        })
        .await
    }

    async fn pinned_messages(&self, channel: ChannelId) -> Result<Vec<Message>, TransportError> {
        with_backoff("pinned_messages", || self.do_pinned_messages(channel)).await
    }

    async fn get_message(
        &self,
        channel: ChannelId,
        message: MessageId,
    ) -> Result<Message, TransportError> {
        with_backoff("get_message", || self.do_get_message(channel, message)).await
    }

    async fn send_files(
        &self,
        channel: ChannelId,
        text: &str,
        files: Vec<AttachmentUpload>,
    ) -> Result<Message, TransportError> {
        with_backoff("send_files", || {
            self.do_send_files(channel, text, files.clone())
        })
        .await
    }

    async fn pin_message(
        &self,
        channel: ChannelId,
        message: MessageId,
    ) -> Result<(), TransportError> {
        with_backoff("pin_message", || self.do_pin_message(channel, message)).await
    }

    async fn edit_attachments(
        &self,
        channel: ChannelId,
        message: MessageId,
        files: Vec<AttachmentUpload>,
    ) -> Result<Message, TransportError> {
        with_backoff("edit_attachments", || {
            self.do_edit_attachments(channel, message, files.clone())
        })
        .await
    }

    async fn fetch_attachment(&self, url: &str) -> Result<Vec<u8>, TransportError> {
        with_backoff("fetch_attachment", || self.do_fetch_attachment(url)).await
    }
}
