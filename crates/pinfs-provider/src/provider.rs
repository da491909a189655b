//! The remote provider state machine.
//!
//! Phases: `Disconnected → Connecting → Discovered → Ready ⇄ Degraded`.
//! `Ready` means the transport is connected, the pinned index message is
//! known, and the last-known remote index is materialized. `Degraded` is
//! entered when a sync fails while connected; the next successful sync
//! returns to `Ready`.
//!
//! All mutable sync state lives behind one `tokio::sync::Mutex`, held
//! across the chat RPCs of a sync step. That lock is what makes
//! `write_index` and index retrieval mutually exclusive.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
// tokio's Instant so the suppression window follows the runtime clock
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use pinfs_codec::EncryptionKey;
use pinfs_core::{
    ChangeKind, ConfigError, FileChangeEvent, Placeholder, ProviderConfig, ProviderStatus,
};
use pinfs_index::{diff, Index, IndexEntry};
use pinfs_transport::{
    AttachmentUpload, ChannelId, ChannelPolicy, ChatTransport, Message, MessageId, TransportError,
    TransportEvent,
};

use crate::events::EventBus;
use crate::read::ReadStream;
use crate::{StateError, SyncError};

/// Default timeout applied to every chat RPC.
const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Settle time between rewriting the index message and refetching it.
const EDIT_SETTLE_DELAY: Duration = Duration::from_millis(1500);

/// How long a recorded self-edit stays suppressible.
const PENDING_EDIT_TTL: Duration = Duration::from_secs(30);

/// Filename of the first index piece; also the discovery marker.
const INDEX_FILENAME: &str = "index.db";

/// Body text of the index message. Informational only — the attachment
/// set is the truth.
const INDEX_MESSAGE_TEXT: &str = "**FILE DATABASE**\n\
    Do not edit or unpin this message. It holds the file index for this \
    drive; changing it by hand will corrupt the mirror.";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("serializing index: {0}")]
    Index(#[from] pinfs_index::IndexError),

    #[error("sealing index piece: {0}")]
    Codec(#[from] pinfs_codec::CodecError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Disconnected,
    Connecting,
    Discovered,
    Ready,
    Degraded,
}

struct PendingEdit {
    /// `edited_at` reported by the post-write refetch (kept for logging)
    edited_at: u64,
    recorded: Instant,
}

struct SyncState {
    phase: Phase,
    db_channel: Option<ChannelId>,
    data_channel: Option<ChannelId>,
    index_message: Option<MessageId>,
    last_index: Option<Arc<Index>>,
    pending_edits: VecDeque<PendingEdit>,
    /// Cancels the resync timer of the current Ready period
    timer_cancel: Option<CancellationToken>,
}

pub(crate) struct Inner<T: ChatTransport> {
    pub(crate) transport: Arc<T>,
    pub(crate) config: ProviderConfig,
    pub(crate) key: Option<EncryptionKey>,
    /// Plaintext bytes carried per content chunk, derived from the
    /// attachment limit
    pub(crate) chunk_payload: u64,
    state: Mutex<SyncState>,
    pub(crate) status_tx: watch::Sender<ProviderStatus>,
    events: EventBus,
    cancel: CancellationToken,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    full_sync_running: AtomicBool,
}

/// Handle to the provider; clones share one state machine.
pub struct Provider<T: ChatTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: ChatTransport> Clone for Provider<T> {
    fn clone(&self) -> Self {
        Provider {
            inner: self.inner.clone(),
        }
    }
}

impl<T: ChatTransport> Provider<T> {
    pub fn new(transport: T, config: ProviderConfig) -> Result<Self, ConfigError> {
        let key = config.encryption_key()?;
        let chunk_payload =
            pinfs_codec::chunk_payload_size(config.max_attachment_size as usize) as u64;
        let (status_tx, _) = watch::channel(ProviderStatus::NotReady);

        Ok(Provider {
            inner: Arc::new(Inner {
                transport: Arc::new(transport),
                config,
                key,
                chunk_payload,
                state: Mutex::new(SyncState {
                    phase: Phase::Disconnected,
                    db_channel: None,
                    data_channel: None,
                    index_message: None,
                    last_index: None,
                    pending_edits: VecDeque::new(),
                    timer_cancel: None,
                }),
                status_tx,
                events: EventBus::new(),
                cancel: CancellationToken::new(),
                tasks: StdMutex::new(Vec::new()),
                started: AtomicBool::new(false),
                full_sync_running: AtomicBool::new(false),
            }),
        })
    }

    // ── Host-facing surface ─────────────────────────────────────────────

    pub fn status(&self) -> ProviderStatus {
        *self.inner.status_tx.borrow()
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<ProviderStatus> {
        self.inner.events.subscribe_state()
    }

    pub fn subscribe_files(&self) -> broadcast::Receiver<FileChangeEvent> {
        self.inner.events.subscribe_files()
    }

    /// Immutable snapshot of the last-known remote index, if materialized.
    pub async fn index_snapshot(&self) -> Option<Arc<Index>> {
        self.inner.state.lock().await.last_index.clone()
    }

    /// The data channel chunk uploads go to, once connected.
    pub async fn data_channel(&self) -> Option<ChannelId> {
        self.inner.state.lock().await.data_channel
    }

    /// A fresh, unopened read stream bound to this provider.
    pub fn reader(&self) -> ReadStream<T> {
        ReadStream::new(self.inner.clone(), self.inner.cancel.child_token())
    }

    /// Spawn the background tasks: transport event dispatch and the
    /// pending-edit sweeper. Idempotent.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let dispatcher = {
            let this = self.clone();
            tokio::spawn(async move { this.event_loop().await })
        };
        let sweeper = {
            let this = self.clone();
            tokio::spawn(async move { this.pending_edit_sweeper().await })
        };
        let mut tasks = self.inner.tasks.lock().expect("tasks lock");
        tasks.push(dispatcher);
        tasks.push(sweeper);
    }

    /// Cancel everything and wait for the background tasks to finish, so
    /// no late callback touches freed state.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let tasks: Vec<_> = {
            let mut guard = self.inner.tasks.lock().expect("tasks lock");
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
    }

    // ── Event dispatch ──────────────────────────────────────────────────

    async fn event_loop(&self) {
        let mut rx = self.inner.transport.subscribe();
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(TransportEvent::Connected) => {
                        let this = self.clone();
                        let handle = tokio::spawn(async move {
                            if let Err(e) = this.connect().await {
                                error!(error = %e, "connect cycle failed");
                            }
                        });
                        self.inner.tasks.lock().expect("tasks lock").push(handle);
                    }
                    Ok(TransportEvent::Disconnected(reason)) => {
                        self.handle_disconnected(reason).await;
                    }
                    Ok(TransportEvent::MessageUpdated { channel_id, message }) => {
                        self.handle_message_updated(channel_id, message).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "transport event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    async fn pending_edit_sweeper(&self) {
        let mut tick = tokio::time::interval(PENDING_EDIT_TTL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = tick.tick() => {
                    let mut state = self.inner.state.lock().await;
                    let before = state.pending_edits.len();
                    prune_pending(&mut state.pending_edits);
                    let expired = before - state.pending_edits.len();
                    if expired > 0 {
                        debug!(expired, "expired stale pending edits");
                    }
                }
            }
        }
    }

    // ── Connect / disconnect ────────────────────────────────────────────

    /// Run one full connect cycle: ensure channels, discover the index
    /// message, materialize the index, reach `Ready`.
    pub async fn connect(&self) -> Result<(), ProviderError> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        self.set_phase(&mut state, Phase::Connecting);
        info!(guild = inner.config.guild_id, "connecting");

        let policy = ChannelPolicy::provider_default();
        let db_channel = rpc(inner
            .transport
            .get_or_create_channel(&inner.config.db_channel_name, &policy))
        .await?;
        let data_channel = rpc(inner
            .transport
            .get_or_create_channel(&inner.config.data_channel_name, &policy))
        .await?;
        state.db_channel = Some(db_channel);
        state.data_channel = Some(data_channel);

        let pinned = rpc(inner.transport.pinned_messages(db_channel)).await?;
        let found = identify_index_message(
            &pinned,
            state.index_message,
            inner.transport.bot_user_id().0,
        );
        self.set_phase(&mut state, Phase::Discovered);

        match found {
            Some(message) => {
                info!(message = %message.id, "index message discovered");
                state.index_message = Some(message.id);
                self.retrieve_index(&mut state, &message).await?;
            }
            None => {
                info!("no index message pinned; bootstrapping empty index");
                let index = Index::new();
                self.post_index(&mut state, db_channel, &index).await?;
            }
        }

        self.set_phase(&mut state, Phase::Ready);
        self.start_resync_timer(&mut state);
        Ok(())
    }

    async fn handle_disconnected(&self, reason: Option<String>) {
        let mut state = self.inner.state.lock().await;
        warn!(reason = reason.as_deref().unwrap_or("none"), "transport disconnected");

        if let Some(timer) = state.timer_cancel.take() {
            timer.cancel();
        }
        state.index_message = None;
        state.last_index = None;
        state.pending_edits.clear();
        self.set_phase(&mut state, Phase::Disconnected);
    }

    // ── Index message updates ───────────────────────────────────────────

    async fn handle_message_updated(&self, channel_id: ChannelId, message: Message) {
        let mut state = self.inner.state.lock().await;

        if state.db_channel != Some(channel_id) || state.index_message != Some(message.id) {
            return;
        }

        prune_pending(&mut state.pending_edits);
        if let Some(edit) = state.pending_edits.pop_front() {
            debug!(edited_at = edit.edited_at, "suppressed loopback index edit");
            return;
        }

        info!(message = %message.id, "index message edited externally");
        if let Err(e) = self.retrieve_index(&mut state, &message).await {
            error!(error = %e, "failed to apply external index edit");
            self.set_phase(&mut state, Phase::Degraded);
        } else if state.phase == Phase::Degraded {
            self.set_phase(&mut state, Phase::Ready);
        }
    }

    // ── Index write path ────────────────────────────────────────────────

    /// Replace the remote index with `index`.
    ///
    /// Requires `Ready`. If the pinned message has vanished, a fresh index
    /// message is posted and pinned instead.
    pub async fn write_index(&self, index: Index) -> Result<(), ProviderError> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;

        if !matches!(state.phase, Phase::Ready) {
            return Err(StateError::NotReady.into());
        }
        let db_channel = state.db_channel.ok_or(StateError::NotReady)?;
        let message_id = state.index_message.ok_or(SyncError::IndexMessageMissing)?;

        // The message can vanish out of band; repost rather than fail.
        if let Err(TransportError::NotFound(_)) =
            rpc(inner.transport.get_message(db_channel, message_id)).await
        {
            warn!(message = %message_id, "index message vanished; reposting");
            return self.post_index(&mut state, db_channel, &index).await;
        }

        let pieces = self.index_pieces(&index)?;
        let piece_count = pieces.len();
        rpc(inner.transport.edit_attachments(db_channel, message_id, pieces)).await?;

        // Give the chat service time to settle before trusting editedAt.
        tokio::time::sleep(EDIT_SETTLE_DELAY).await;

        let refreshed = rpc(inner.transport.get_message(db_channel, message_id)).await?;
        if let Some(edited_at) = refreshed.edited_at {
            prune_pending(&mut state.pending_edits);
            state.pending_edits.push_back(PendingEdit {
                edited_at,
                recorded: Instant::now(),
            });
        }

        info!(
            message = %message_id,
            files = index.len(),
            pieces = piece_count,
            "index rewritten"
        );
        state.last_index = Some(Arc::new(index));
        Ok(())
    }

    /// Post a brand-new pinned index message and install `index` as the
    /// last-known remote state.
    async fn post_index(
        &self,
        state: &mut SyncState,
        db_channel: ChannelId,
        index: &Index,
    ) -> Result<(), ProviderError> {
        let inner = &self.inner;
        let pieces = self.index_pieces(index)?;
        let message =
            rpc(inner.transport.send_files(db_channel, INDEX_MESSAGE_TEXT, pieces)).await?;
        rpc(inner.transport.pin_message(db_channel, message.id)).await?;

        info!(message = %message.id, files = index.len(), "index message posted and pinned");
        state.index_message = Some(message.id);
        state.last_index = Some(Arc::new(index.clone()));
        Ok(())
    }

    /// Serialize an index into attachment pieces of at most the chunk
    /// payload size, sealed when encryption is configured.
    fn index_pieces(&self, index: &Index) -> Result<Vec<AttachmentUpload>, ProviderError> {
        let raw = index.serialize()?;
        let piece_size = self.inner.chunk_payload.max(1) as usize;

        // serialize() always emits at least the header, so there is
        // always at least one piece
        let mut pieces = Vec::new();
        for (i, slice) in raw.chunks(piece_size).enumerate() {
            let bytes = match &self.inner.key {
                Some(key) => pinfs_codec::seal(key, slice)?,
                None => slice.to_vec(),
            };
            pieces.push(AttachmentUpload {
                filename: index_piece_name(i),
                bytes,
            });
        }
        Ok(pieces)
    }

    // ── Index retrieval ─────────────────────────────────────────────────

    /// Download, decode, and install the index carried by `message`.
    ///
    /// Cold start (no last-known index) installs silently; otherwise the
    /// new index is diffed against a fresh scan of the local mirror and
    /// the changes are surfaced as file events.
    async fn retrieve_index(
        &self,
        state: &mut SyncState,
        message: &Message,
    ) -> Result<(), ProviderError> {
        let inner = &self.inner;

        let mut attachments = message.attachments.clone();
        attachments.sort_by_key(|a| a.filename.to_lowercase());

        let mut raw = Vec::new();
        for attachment in &attachments {
            let bytes = rpc(inner.transport.fetch_attachment(&attachment.url)).await?;
            match &inner.key {
                Some(key) => {
                    let piece = pinfs_codec::open(key, &bytes)
                        .map_err(|e| SyncError::IndexDecodeFailed(e.to_string()))?;
                    raw.extend_from_slice(&piece);
                }
                None => raw.extend_from_slice(&bytes),
            }
        }

        let remote =
            Index::deserialize(&raw).map_err(|e| SyncError::IndexDecodeFailed(e.to_string()))?;

        if state.last_index.is_none() {
            info!(files = remote.len(), "cold start: installing remote index");
            state.last_index = Some(Arc::new(remote));
            return Ok(());
        }

        // The remote index is the truth; the local mirror tells us what
        // the host already has.
        let local = match pinfs_index::build_for_directory(&inner.config.local_path) {
            Ok(local) => local,
            Err(e) => {
                warn!(error = %e, "local scan failed; diffing against last-known index");
                state
                    .last_index
                    .as_deref()
                    .cloned()
                    .expect("last_index checked above")
            }
        };

        let changes = diff(&local, &remote);
        info!(
            created = changes.deleted.len(),
            deleted = changes.added.len(),
            modified = changes.modified.len(),
            "applying remote index"
        );

        for entry in &changes.deleted {
            self.emit_change(ChangeKind::Created, entry);
        }
        for entry in &changes.added {
            self.emit_change(ChangeKind::Deleted, entry);
        }
        for entry in &changes.modified {
            self.emit_change(ChangeKind::Modified, entry);
        }

        state.last_index = Some(Arc::new(remote));
        Ok(())
    }

    fn emit_change(&self, kind: ChangeKind, entry: &IndexEntry) {
        self.inner.events.emit_file(FileChangeEvent {
            kind,
            old_relative_path: Some(entry.relative_path.clone()),
            placeholder: Some(placeholder_for(entry)),
            resync_subdirectories: false,
        });
    }

    // ── Full resync ─────────────────────────────────────────────────────

    fn start_resync_timer(&self, state: &mut SyncState) {
        if let Some(old) = state.timer_cancel.take() {
            old.cancel();
        }
        let timer_cancel = self.inner.cancel.child_token();
        state.timer_cancel = Some(timer_cancel.clone());

        let period = self.inner.config.resync_period();
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut tick = tokio::time::interval_at(start, period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = timer_cancel.cancelled() => break,
                    _ = tick.tick() => this.full_sync().await,
                }
            }
        });
        self.inner.tasks.lock().expect("tasks lock").push(handle);
    }

    /// One full resync pass: tell the host to reconcile everything, then
    /// refetch the remote index. Single-flight — overlapping fires skip.
    pub async fn full_sync(&self) {
        let inner = &self.inner;
        if inner.full_sync_running.swap(true, Ordering::SeqCst) {
            debug!("full sync already in flight; skipping");
            return;
        }

        self.inner.events.emit_file(FileChangeEvent::full_resync());

        let result = async {
            let mut state = inner.state.lock().await;
            let db_channel = state.db_channel.ok_or(StateError::NotReady)?;
            let message_id = state.index_message.ok_or(SyncError::IndexMessageMissing)?;
            let message = rpc(inner.transport.get_message(db_channel, message_id)).await?;
            let outcome = self.retrieve_index(&mut state, &message).await;
            match &outcome {
                Ok(()) if state.phase == Phase::Degraded => {
                    self.set_phase(&mut state, Phase::Ready)
                }
                Err(_) if state.phase == Phase::Ready => {
                    self.set_phase(&mut state, Phase::Degraded)
                }
                _ => {}
            }
            outcome
        }
        .await;

        if let Err(e) = result {
            error!(error = %e, "full sync failed");
        }
        inner.full_sync_running.store(false, Ordering::SeqCst);
    }

    // ── Status plumbing ─────────────────────────────────────────────────

    fn set_phase(&self, state: &mut SyncState, phase: Phase) {
        let was_ready = matches!(state.phase, Phase::Ready);
        let is_ready = matches!(phase, Phase::Ready);
        state.phase = phase;

        if was_ready != is_ready {
            let status = if is_ready {
                ProviderStatus::Ready
            } else {
                ProviderStatus::NotReady
            };
            info!(?status, "provider status changed");
            let _ = self.inner.status_tx.send(status);
            self.inner.events.emit_state(status);
        }
    }
}

/// Pick the index message from a pinned-message listing.
///
/// A message qualifies if its id matches the cached one, or — when no id
/// is cached — it was authored by the bot and carries an `index.db`
/// attachment. Ties break to the smallest id (the oldest message).
fn identify_index_message(
    pinned: &[Message],
    cached: Option<MessageId>,
    bot_user: u64,
) -> Option<Message> {
    if let Some(id) = cached {
        return pinned.iter().find(|m| m.id == id).cloned();
    }
    pinned
        .iter()
        .filter(|m| m.author_id.0 == bot_user)
        .filter(|m| {
            m.attachments
                .iter()
                .any(|a| a.filename.eq_ignore_ascii_case(INDEX_FILENAME))
        })
        .min_by_key(|m| m.id)
        .cloned()
}

fn index_piece_name(i: usize) -> String {
    if i == 0 {
        INDEX_FILENAME.to_string()
    } else {
        format!("index_{i}.db")
    }
}

fn prune_pending(pending: &mut VecDeque<PendingEdit>) {
    pending.retain(|e| e.recorded.elapsed() < PENDING_EDIT_TTL);
}

pub(crate) fn placeholder_for(entry: &IndexEntry) -> Placeholder {
    Placeholder {
        relative_path: entry.relative_path.clone(),
        size: entry.length,
        mtime: entry.mtime,
        hash: entry.hash.clone(),
    }
}

impl<T: ChatTransport> Inner<T> {
    pub(crate) async fn index_snapshot(&self) -> Option<Arc<Index>> {
        self.state.lock().await.last_index.clone()
    }
}

/// Apply the default RPC timeout; elapsing maps to `NetworkUnavailable`.
pub(crate) async fn rpc<V>(
    fut: impl Future<Output = Result<V, TransportError>>,
) -> Result<V, TransportError> {
    match tokio::time::timeout(RPC_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::NetworkUnavailable),
    }
}
