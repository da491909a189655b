//! Event surface toward the host.
//!
//! Two broadcast channels: provider status edges and file changes.
//! Delivery is best-effort — a host that subscribes late or reads slowly
//! misses events, which the contract tolerates (at-least-once per edge,
//! duplicates allowed).

use pinfs_core::{FileChangeEvent, ProviderStatus};
use tokio::sync::broadcast;

pub struct EventBus {
    state_tx: broadcast::Sender<ProviderStatus>,
    file_tx: broadcast::Sender<FileChangeEvent>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        let (state_tx, _) = broadcast::channel(16);
        let (file_tx, _) = broadcast::channel(256);
        EventBus { state_tx, file_tx }
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<ProviderStatus> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_files(&self) -> broadcast::Receiver<FileChangeEvent> {
        self.file_tx.subscribe()
    }

    pub(crate) fn emit_state(&self, status: ProviderStatus) {
        let _ = self.state_tx.send(status);
    }

    pub(crate) fn emit_file(&self, event: FileChangeEvent) {
        let _ = self.file_tx.send(event);
    }
}
