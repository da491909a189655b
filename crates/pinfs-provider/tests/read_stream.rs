//! Integration tests: the read path against the in-memory transport.
//!
//! The attachment limit is shrunk to 353 bytes so each chunk carries
//! exactly 80 plaintext bytes — small enough to exercise multi-chunk
//! windows and boundary crossings with hand-checkable numbers.

use pinfs_codec::{chunk_payload_size, CodecError, KEY_SIZE};
use pinfs_core::{ProviderConfig, ProviderStatus};
use pinfs_index::{Index, IndexEntry, IndexFileChunk};
use pinfs_provider::{OpenCode, Provider, ReadError, StateError};
use pinfs_transport::{
    memory::MemoryTransport, AttachmentUpload, ChannelPolicy, ChatTransport,
};
use tempfile::TempDir;

/// Attachment limit chosen so the derived chunk payload is exactly 80.
const MAX_ATTACHMENT: u32 = 353;
const CHUNK_PAYLOAD: usize = 80;

struct Harness {
    provider: Provider<MemoryTransport>,
    transport: MemoryTransport,
    plaintext: Vec<u8>,
    _tmp: TempDir,
}

/// Stand up a Ready provider whose index holds one file named `data.bin`
/// of `file_len` bytes, chunked and uploaded through the codec.
/// `tamper_chunk` flips the final byte of that chunk's encoding.
async fn harness(
    key: Option<[u8; KEY_SIZE]>,
    file_len: usize,
    tamper_chunk: Option<usize>,
) -> Harness {
    assert_eq!(chunk_payload_size(MAX_ATTACHMENT as usize), CHUNK_PAYLOAD);

    let tmp = TempDir::new().unwrap();
    let transport = MemoryTransport::new();
    let cfg = ProviderConfig {
        guild_id: 7,
        local_path: tmp.path().to_path_buf(),
        max_attachment_size: MAX_ATTACHMENT,
        encryption_key: key.map(|_| "00".repeat(KEY_SIZE)),
        ..Default::default()
    };
    let provider = Provider::new(transport.clone(), cfg).unwrap();
    provider.start();
    provider.connect().await.unwrap();

    let data_channel = transport
        .get_or_create_channel("pinfs-data", &ChannelPolicy::provider_default())
        .await
        .unwrap();

    let plaintext: Vec<u8> = (0..file_len).map(|i| (i % 251) as u8).collect();
    let mut chunks = Vec::new();
    for (i, piece) in plaintext.chunks(CHUNK_PAYLOAD).enumerate() {
        let mut encoded =
            pinfs_codec::encode(piece, i as u32, false, key.as_ref()).unwrap();
        if tamper_chunk == Some(i) {
            let last = encoded.len() - 1;
            encoded[last] ^= 0xFF;
        }
        let msg = transport
            .send_files(
                data_channel,
                "",
                vec![AttachmentUpload {
                    filename: format!("chunk_{i}"),
                    bytes: encoded,
                }],
            )
            .await
            .unwrap();
        let att = &msg.attachments[0];
        chunks.push(IndexFileChunk {
            url: att.url.clone(),
            size: att.size as u32,
        });
    }

    let mut index = Index::new();
    index.upsert(IndexEntry {
        relative_path: "data.bin".into(),
        length: file_len as u64,
        mtime: 1_700_000_000,
        hash: vec![0; 16],
        chunks,
    });
    provider.write_index(index).await.unwrap();

    Harness {
        provider,
        transport,
        plaintext,
        _tmp: tmp,
    }
}

#[tokio::test(start_paused = true)]
async fn read_crossing_chunk_boundary() {
    let h = harness(None, 240, None).await;
    let mut stream = h.provider.reader();

    let opened = stream.open("data.bin").await.unwrap();
    assert_eq!(opened.code, OpenCode::Opened);
    let placeholder = opened.placeholder.unwrap();
    assert_eq!(placeholder.size, 240);
    assert_eq!(placeholder.relative_path, "data.bin");

    // Window [70, 160): tail of chunk 0, all of chunk 1
    let mut buffer = vec![0u8; 256];
    let outcome = stream.read(&mut buffer, 0, 70, 90).await.unwrap();

    assert!(outcome.error.is_none(), "error: {:?}", outcome.error);
    assert_eq!(outcome.bytes_read, 90);
    assert_eq!(&buffer[..90], &h.plaintext[70..160]);
    assert!(buffer[90..].iter().all(|&b| b == 0), "rest of buffer untouched");

    stream.close().unwrap();
    h.provider.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn read_whole_file() {
    let h = harness(None, 240, None).await;
    let mut stream = h.provider.reader();
    stream.open("data.bin").await.unwrap();

    let mut buffer = vec![0u8; 240];
    let outcome = stream.read(&mut buffer, 0, 0, 240).await.unwrap();

    assert!(outcome.error.is_none());
    assert_eq!(outcome.bytes_read, 240);
    assert_eq!(buffer, h.plaintext);

    h.provider.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn read_encrypted_file() {
    let h = harness(Some([0u8; KEY_SIZE]), 240, None).await;
    let mut stream = h.provider.reader();
    stream.open("data.bin").await.unwrap();

    let mut buffer = vec![0u8; 240];
    let outcome = stream.read(&mut buffer, 0, 0, 240).await.unwrap();

    assert!(outcome.error.is_none());
    assert_eq!(buffer, h.plaintext);

    h.provider.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn read_boundary_behaviors() {
    let h = harness(None, 240, None).await;
    let mut stream = h.provider.reader();
    stream.open("data.bin").await.unwrap();
    let mut buffer = vec![0u8; 256];

    // count == 0
    let outcome = stream.read(&mut buffer, 0, 0, 0).await.unwrap();
    assert_eq!(outcome.bytes_read, 0);
    assert!(outcome.error.is_none());

    // offset at EOF
    let outcome = stream.read(&mut buffer, 0, 240, 10).await.unwrap();
    assert_eq!(outcome.bytes_read, 0);
    assert!(outcome.error.is_none());

    // window past EOF is clamped
    let outcome = stream.read(&mut buffer, 0, 200, 100).await.unwrap();
    assert_eq!(outcome.bytes_read, 40);
    assert_eq!(&buffer[..40], &h.plaintext[200..240]);

    h.provider.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn read_respects_buffer_offset() {
    let h = harness(None, 240, None).await;
    let mut stream = h.provider.reader();
    stream.open("data.bin").await.unwrap();

    let mut buffer = vec![0xEEu8; 300];
    let outcome = stream.read(&mut buffer, 30, 10, 50).await.unwrap();

    assert_eq!(outcome.bytes_read, 50);
    assert_eq!(&buffer[30..80], &h.plaintext[10..60]);
    assert!(buffer[..30].iter().all(|&b| b == 0xEE));
    assert!(buffer[80..].iter().all(|&b| b == 0xEE));

    h.provider.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn corrupt_chunk_surfaces_on_outcome() {
    let h = harness(None, 240, Some(1)).await;
    let mut stream = h.provider.reader();
    stream.open("data.bin").await.unwrap();

    let mut buffer = vec![0u8; 240];
    let outcome = stream.read(&mut buffer, 0, 0, 240).await.unwrap();

    // The flipped byte lands in chunk 1's hash trailer
    match outcome.error {
        Some(ReadError::Codec(CodecError::HashMismatch)) => {}
        other => panic!("expected HashMismatch, got {other:?}"),
    }

    h.provider.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn open_before_ready_reports_offline() {
    let tmp = TempDir::new().unwrap();
    let transport = MemoryTransport::new();
    let provider = Provider::new(
        transport,
        ProviderConfig {
            local_path: tmp.path().to_path_buf(),
            ..Default::default()
        },
    )
    .unwrap();

    let mut stream = provider.reader();
    let opened = stream.open("anything").await.unwrap();
    assert_eq!(opened.code, OpenCode::Offline);
    assert!(opened.placeholder.is_none());
}

#[tokio::test(start_paused = true)]
async fn open_unknown_path_reports_file_not_found() {
    let h = harness(None, 240, None).await;
    let mut stream = h.provider.reader();

    let opened = stream.open("no/such/file.txt").await.unwrap();
    assert_eq!(opened.code, OpenCode::FileNotFound);

    h.provider.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn read_after_disconnect_is_network_unavailable() {
    let h = harness(None, 240, None).await;
    let mut stream = h.provider.reader();
    stream.open("data.bin").await.unwrap();

    h.transport.emit_disconnected(None);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(h.provider.status(), ProviderStatus::NotReady);

    let mut buffer = vec![0u8; 64];
    let outcome = stream.read(&mut buffer, 0, 0, 64).await.unwrap();
    assert_eq!(outcome.bytes_read, 0);
    assert!(matches!(outcome.error, Some(ReadError::NetworkUnavailable)));

    h.provider.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn snapshot_isolation_from_index_writes() {
    let h = harness(None, 240, None).await;
    let mut stream = h.provider.reader();
    stream.open("data.bin").await.unwrap();

    // The provider's index moves on; the open stream must not notice
    h.provider.write_index(Index::new()).await.unwrap();
    assert!(!h.provider.index_snapshot().await.unwrap().file_exists("data.bin"));

    let mut buffer = vec![0u8; 240];
    let outcome = stream.read(&mut buffer, 0, 0, 240).await.unwrap();
    assert!(outcome.error.is_none());
    assert_eq!(buffer, h.plaintext);

    h.provider.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn cancelled_read_reports_cancelled() {
    let h = harness(None, 240, None).await;
    let mut stream = h.provider.reader();
    stream.open("data.bin").await.unwrap();

    stream.cancellation_token().cancel();

    let mut buffer = vec![0u8; 240];
    let outcome = stream.read(&mut buffer, 0, 0, 240).await.unwrap();
    assert!(matches!(outcome.error, Some(ReadError::Cancelled)));

    h.provider.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stream_lifecycle_misuse() {
    let h = harness(None, 240, None).await;
    let mut buffer = vec![0u8; 16];

    // read before open
    let mut stream = h.provider.reader();
    assert!(matches!(
        stream.read(&mut buffer, 0, 0, 16).await,
        Err(StateError::NotOpen)
    ));

    // close before open
    assert!(matches!(stream.close(), Err(StateError::NotOpen)));

    // double open
    stream.open("data.bin").await.unwrap();
    assert!(matches!(
        stream.open("data.bin").await,
        Err(StateError::AlreadyOpen)
    ));

    // close, then close again / read again
    stream.close().unwrap();
    assert!(matches!(stream.close(), Err(StateError::NotOpen)));
    assert!(matches!(
        stream.read(&mut buffer, 0, 0, 16).await,
        Err(StateError::NotOpen)
    ));

    // dispose is terminal
    let mut disposed = h.provider.reader();
    disposed.open("data.bin").await.unwrap();
    disposed.dispose();
    assert!(matches!(
        disposed.read(&mut buffer, 0, 0, 16).await,
        Err(StateError::Disposed)
    ));
    assert!(matches!(disposed.close(), Err(StateError::Disposed)));

    h.provider.shutdown().await;
}
