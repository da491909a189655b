//! The read path: assemble a byte window of a remote file from its chunk
//! attachments.
//!
//! A stream opens against one relative path, capturing the index entry
//! from the snapshot current at open time — later index writes replace
//! the provider's snapshot and never perturb an in-progress read. Reads
//! compute, per selected chunk, where its plaintext lands in the caller's
//! buffer AND which slice of the plaintext is wanted, so windows that
//! start or end mid-chunk stay exact. Chunks download concurrently;
//! completion order does not matter because every slice carries its own
//! target offset.

use std::sync::Arc;

use futures::StreamExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use pinfs_codec::CodecError;
use pinfs_core::{Placeholder, ProviderStatus};
use pinfs_index::IndexEntry;
use pinfs_transport::{ChatTransport, TransportError};

use crate::provider::{placeholder_for, rpc, Inner};
use crate::StateError;

/// Concurrent chunk downloads per read call.
const DEFAULT_MAX_PARALLEL: usize = 8;

/// Result code carried by [`OpenResult`]; mirrors what the host's
/// cloud-files API expects to be told.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenCode {
    Opened,
    /// Provider was not ready
    Offline,
    /// Path absent from the index snapshot
    FileNotFound,
}

#[derive(Debug, Clone)]
pub struct OpenResult {
    pub code: OpenCode,
    /// Present iff `code == Opened`
    pub placeholder: Option<Placeholder>,
}

/// Errors captured on a [`ReadOutcome`] rather than returned as `Err`.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("network unavailable")]
    NetworkUnavailable,

    #[error("read cancelled")]
    Cancelled,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("chunk {index} does not cover its indexed extent")]
    ChunkLayout { index: u32 },
}

#[derive(Debug)]
pub struct ReadOutcome {
    /// Plaintext bytes written into the caller's buffer
    pub bytes_read: usize,
    pub error: Option<ReadError>,
}

impl ReadOutcome {
    fn done(bytes_read: usize) -> Self {
        ReadOutcome {
            bytes_read,
            error: None,
        }
    }

    fn failed(bytes_read: usize, error: ReadError) -> Self {
        ReadOutcome {
            bytes_read,
            error: Some(error),
        }
    }
}

enum StreamPhase {
    New,
    Open {
        /// Cloned out of the index snapshot taken at open time
        entry: IndexEntry,
    },
    Closed,
    Disposed,
}

pub struct ReadStream<T: ChatTransport> {
    inner: Arc<Inner<T>>,
    cancel: CancellationToken,
    max_parallel: usize,
    phase: StreamPhase,
}

impl<T: ChatTransport> ReadStream<T> {
    pub(crate) fn new(inner: Arc<Inner<T>>, cancel: CancellationToken) -> Self {
        ReadStream {
            inner,
            cancel,
            max_parallel: DEFAULT_MAX_PARALLEL,
            phase: StreamPhase::New,
        }
    }

    /// Bound the number of concurrent chunk downloads.
    pub fn set_max_parallel(&mut self, n: usize) {
        self.max_parallel = n.max(1);
    }

    /// The cancellation token honored by in-flight reads.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Open the stream against a relative path.
    ///
    /// `Offline` and `FileNotFound` are result codes, not errors; only
    /// lifecycle misuse returns `Err`. A stream opens once.
    pub async fn open(&mut self, path: &str) -> Result<OpenResult, StateError> {
        match self.phase {
            StreamPhase::New => {}
            StreamPhase::Open { .. } | StreamPhase::Closed => {
                return Err(StateError::AlreadyOpen)
            }
            StreamPhase::Disposed => return Err(StateError::Disposed),
        }

        if *self.inner.status_tx.borrow() != ProviderStatus::Ready {
            return Ok(OpenResult {
                code: OpenCode::Offline,
                placeholder: None,
            });
        }

        let Some(snapshot) = self.inner.index_snapshot().await else {
            return Ok(OpenResult {
                code: OpenCode::Offline,
                placeholder: None,
            });
        };

        match snapshot.get_file(path) {
            None => Ok(OpenResult {
                code: OpenCode::FileNotFound,
                placeholder: None,
            }),
            Some(entry) => {
                let placeholder = placeholder_for(entry);
                debug!(path, length = entry.length, chunks = entry.chunks.len(), "stream opened");
                self.phase = StreamPhase::Open {
                    entry: entry.clone(),
                };
                Ok(OpenResult {
                    code: OpenCode::Opened,
                    placeholder: Some(placeholder),
                })
            }
        }
    }

    /// Fill `buffer[buffer_offset..]` with file bytes starting at
    /// `file_offset`, up to `count` bytes (clamped to EOF and to the
    /// buffer's capacity).
    pub async fn read(
        &mut self,
        buffer: &mut [u8],
        buffer_offset: usize,
        file_offset: u64,
        count: usize,
    ) -> Result<ReadOutcome, StateError> {
        let entry = match &self.phase {
            StreamPhase::Open { entry } => entry.clone(),
            StreamPhase::Disposed => return Err(StateError::Disposed),
            _ => return Err(StateError::NotOpen),
        };

        if *self.inner.status_tx.borrow() != ProviderStatus::Ready {
            return Ok(ReadOutcome::failed(0, ReadError::NetworkUnavailable));
        }

        let available = buffer.len().saturating_sub(buffer_offset);
        let count = count.min(available);
        if count == 0 || file_offset >= entry.length {
            return Ok(ReadOutcome::done(0));
        }
        let window_end = entry.length.min(file_offset + count as u64);

        let slices = plan_slices(
            &entry,
            self.inner.chunk_payload,
            file_offset,
            window_end,
            buffer_offset,
        );
        if slices.is_empty() {
            return Ok(ReadOutcome::done(0));
        }

        let transport = self.inner.transport.clone();
        let key = self.inner.key;
        let fetches = futures::stream::iter(slices.into_iter().map(|slice| {
            let transport = transport.clone();
            async move {
                let bytes = rpc(transport.fetch_attachment(&slice.url))
                    .await
                    .map_err(ReadError::Transport)?;
                let decoded =
                    pinfs_codec::decode(&bytes, key.as_ref()).map_err(ReadError::Codec)?;
                if decoded.index != slice.index
                    || decoded.payload.len() < slice.source_offset + slice.copy_len
                {
                    return Err(ReadError::ChunkLayout { index: slice.index });
                }
                Ok((slice, decoded.payload))
            }
        }))
        .buffer_unordered(self.max_parallel);
        tokio::pin!(fetches);

        let mut bytes_read = 0usize;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Ok(ReadOutcome::failed(bytes_read, ReadError::Cancelled));
                }
                next = fetches.next() => match next {
                    None => break,
                    Some(Ok((slice, payload))) => {
                        let src = &payload[slice.source_offset..slice.source_offset + slice.copy_len];
                        buffer[slice.target_offset..slice.target_offset + slice.copy_len]
                            .copy_from_slice(src);
                        bytes_read += slice.copy_len;
                    }
                    Some(Err(error)) => {
                        // Dropping the stream abandons the other downloads
                        return Ok(ReadOutcome::failed(bytes_read, error));
                    }
                },
            }
        }

        Ok(ReadOutcome::done(bytes_read))
    }

    pub fn close(&mut self) -> Result<(), StateError> {
        match self.phase {
            StreamPhase::Open { .. } => {
                self.phase = StreamPhase::Closed;
                Ok(())
            }
            StreamPhase::Disposed => Err(StateError::Disposed),
            _ => Err(StateError::NotOpen),
        }
    }

    /// Terminal from any state; cancels in-flight reads.
    pub fn dispose(&mut self) {
        self.cancel.cancel();
        self.phase = StreamPhase::Disposed;
    }
}

/// One chunk's contribution to a read window.
#[derive(Debug, PartialEq, Eq)]
struct ChunkSlice {
    index: u32,
    url: String,
    /// Offset within the chunk's plaintext where copying starts
    source_offset: usize,
    copy_len: usize,
    /// Destination offset in the caller's buffer
    target_offset: usize,
}

/// Select the chunks overlapping `[file_offset, window_end)` and compute
/// their source/target slices.
///
/// Every chunk but the last carries exactly `chunk_payload` plaintext
/// bytes; the last carries the remainder of the entry length. The stored
/// attachment sizes in the index are irrelevant here — they describe the
/// wire, not the plaintext.
fn plan_slices(
    entry: &IndexEntry,
    chunk_payload: u64,
    file_offset: u64,
    window_end: u64,
    buffer_offset: usize,
) -> Vec<ChunkSlice> {
    let mut slices = Vec::new();

    for (i, chunk) in entry.chunks.iter().enumerate() {
        let plain_start = i as u64 * chunk_payload;
        if plain_start >= entry.length {
            break;
        }
        let plain_len = chunk_payload.min(entry.length - plain_start);
        let plain_end = plain_start + plain_len;

        let overlap_start = plain_start.max(file_offset);
        let overlap_end = plain_end.min(window_end);
        if overlap_start >= overlap_end {
            continue;
        }

        slices.push(ChunkSlice {
            index: i as u32,
            url: chunk.url.clone(),
            source_offset: (overlap_start - plain_start) as usize,
            copy_len: (overlap_end - overlap_start) as usize,
            target_offset: buffer_offset + (overlap_start - file_offset) as usize,
        });
    }

    slices
}
