//! Chunked file transfer over a message-oriented data channel.
//!
//! The sender announces `{name, size, mimeType, lastModified}` over signaling, then writes
//! fixed-size chunks to the file channel one at a time. There is no end marker: the receiver
//! knows the transfer is complete when the byte count reaches the announced size.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parley_proto::FileMetadata;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::capability::{ChannelPayload, DataChannel};
use crate::error::{CapabilityError, TransferError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Completed { bytes: u64 },
    /// The channel closed after at least one chunk went out.
    Aborted { sent: u64 },
}

#[derive(Clone)]
pub struct FileSender {
    channel: Arc<dyn DataChannel>,
    chunk_size: usize,
    total_size: u64,
    offset_sent: Arc<AtomicU64>,
}

impl FileSender {
    pub fn new(channel: Arc<dyn DataChannel>, chunk_size: usize, total_size: u64) -> Self {
        Self {
            channel,
            chunk_size: chunk_size.max(1),
            total_size,
            offset_sent: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn offset_sent(&self) -> u64 {
        self.offset_sent.load(Ordering::SeqCst)
    }

    /// Shared view of `offset_sent` that outlives the sender.
    pub fn offset_handle(&self) -> Arc<AtomicU64> {
        self.offset_sent.clone()
    }

    /// Stream `reader` to the channel. The offset is back at zero when this returns, whatever
    /// the outcome.
    pub async fn send<R>(&self, reader: R) -> Result<SendOutcome, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        let result = self.stream(reader).await;
        self.offset_sent.store(0, Ordering::SeqCst);
        result
    }

    pub fn spawn<R>(self, reader: R) -> JoinHandle<Result<SendOutcome, TransferError>>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move { self.send(reader).await })
    }

    async fn stream<R>(&self, mut reader: R) -> Result<SendOutcome, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        if !self.channel.is_open() {
            return Err(TransferError::ChannelNotOpen);
        }

        let mut buffer = vec![0u8; self.chunk_size];
        let mut sent = 0u64;
        while sent < self.total_size {
            if !self.channel.is_open() {
                debug!(sent, total = self.total_size, "file channel closed; abandoning send");
                return Ok(SendOutcome::Aborted { sent });
            }

            let len = (self.total_size - sent).min(self.chunk_size as u64) as usize;
            reader
                .read_exact(&mut buffer[..len])
                .await
                .map_err(|err| TransferError::Read(err.to_string()))?;

            let chunk = ChannelPayload::Binary(Bytes::copy_from_slice(&buffer[..len]));
            match self.channel.send(chunk).await {
                Ok(()) => {}
                Err(CapabilityError::ChannelClosed) => {
                    debug!(sent, total = self.total_size, "file channel closed mid-chunk");
                    return Ok(SendOutcome::Aborted { sent });
                }
                Err(err) => return Err(err.into()),
            }

            sent += len as u64;
            self.offset_sent.store(sent, Ordering::SeqCst);
        }

        info!(bytes = sent, "file sent");
        Ok(SendOutcome::Completed { bytes: sent })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub metadata: FileMetadata,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnounceOutcome {
    /// The file is now the active transfer.
    Queued,
    /// Zero-byte file; nothing more will arrive for it.
    Complete(ReceivedFile),
    /// The file is now active, and the partially received one it replaced was discarded.
    Superseded(TransferError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Progress { name: String, received: u64, size: u64 },
    Complete(ReceivedFile),
}

/// Reassembles inbound files. The most recent announcement is the active transfer.
#[derive(Debug, Default)]
pub struct FileReceiver {
    announcements: VecDeque<FileMetadata>,
    chunks: Vec<Bytes>,
    bytes_received: u64,
}

impl FileReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an announcement. Empty files need no chunks and complete here. Bytes already
    /// buffered for the previous active transfer can never complete it once another file is
    /// announced, so that transfer is dropped.
    pub fn announce(&mut self, metadata: FileMetadata) -> AnnounceOutcome {
        if metadata.size == 0 {
            info!(name = %metadata.name, "received empty file");
            return AnnounceOutcome::Complete(ReceivedFile {
                metadata,
                data: Bytes::new(),
            });
        }

        let superseded = if self.bytes_received > 0 {
            self.announcements.pop_back().map(|partial| {
                let err = TransferError::Superseded {
                    name: partial.name,
                    received: self.bytes_received,
                    size: partial.size,
                };
                warn!(error = %err, next = %metadata.name, "discarding partial transfer");
                err
            })
        } else {
            None
        };
        self.clear_buffer();

        debug!(name = %metadata.name, size = metadata.size, "file announced");
        self.announcements.push_back(metadata);
        match superseded {
            Some(err) => AnnounceOutcome::Superseded(err),
            None => AnnounceOutcome::Queued,
        }
    }

    pub fn receive_chunk(&mut self, chunk: Bytes) -> Result<ChunkOutcome, TransferError> {
        let Some(active) = self.announcements.back() else {
            warn!(len = chunk.len(), "chunk arrived with no announced transfer");
            return Err(TransferError::UnexpectedChunk(chunk.len()));
        };

        let received = self.bytes_received + chunk.len() as u64;
        if received > active.size {
            let err = TransferError::SizeExceeded {
                name: active.name.clone(),
                size: active.size,
                received,
            };
            warn!(error = %err, "discarding transfer");
            self.announcements.pop_back();
            self.clear_buffer();
            return Err(err);
        }

        self.chunks.push(chunk);
        self.bytes_received = received;
        if received < active.size {
            return Ok(ChunkOutcome::Progress {
                name: active.name.clone(),
                received,
                size: active.size,
            });
        }

        let mut data = BytesMut::with_capacity(received as usize);
        for chunk in self.chunks.drain(..) {
            data.extend_from_slice(&chunk);
        }
        self.bytes_received = 0;
        let Some(metadata) = self.announcements.pop_back() else {
            return Err(TransferError::UnexpectedChunk(0));
        };
        info!(name = %metadata.name, size = metadata.size, "file received");
        Ok(ChunkOutcome::Complete(ReceivedFile {
            metadata,
            data: data.freeze(),
        }))
    }

    /// Fraction of the active transfer received so far.
    pub fn progress(&self) -> Option<f64> {
        self.announcements
            .back()
            .map(|active| self.bytes_received as f64 / active.size as f64)
    }

    pub fn active(&self) -> Option<&FileMetadata> {
        self.announcements.back()
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn pending_announcements(&self) -> usize {
        self.announcements.len()
    }

    /// Forget buffered bytes and every announcement.
    pub fn reset(&mut self) {
        self.announcements.clear();
        self.clear_buffer();
    }

    fn clear_buffer(&mut self) {
        self.chunks.clear();
        self.bytes_received = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDataChannel;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicBool;

    fn metadata(name: &str, size: u64) -> FileMetadata {
        FileMetadata {
            name: name.into(),
            size,
            mime_type: "application/octet-stream".into(),
            last_modified: 1_700_000_000_000,
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// Closes itself after accepting `limit` chunks.
    struct ClosingChannel {
        open: AtomicBool,
        limit: usize,
        sent: Mutex<Vec<Bytes>>,
    }

    impl ClosingChannel {
        fn new(limit: usize) -> Arc<Self> {
            Arc::new(Self {
                open: AtomicBool::new(true),
                limit,
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl DataChannel for ClosingChannel {
        fn label(&self) -> &str {
            "file"
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        async fn send(&self, payload: ChannelPayload) -> Result<(), CapabilityError> {
            let mut sent = self.sent.lock();
            sent.push(payload.into_bytes());
            if sent.len() >= self.limit {
                self.open.store(false, Ordering::SeqCst);
            }
            Ok(())
        }

        async fn close(&self) {
            self.open.store(false, Ordering::SeqCst);
        }
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn chunks_split_at_chunk_size() {
        let channel = Arc::new(MockDataChannel::open("file"));
        let data = pattern(40_000);
        let sender = FileSender::new(channel.clone(), 16_384, data.len() as u64);

        let outcome = sender.send(data.as_slice()).await.unwrap();
        assert_eq!(outcome, SendOutcome::Completed { bytes: 40_000 });
        assert_eq!(sender.offset_sent(), 0);

        let sizes: Vec<usize> = channel.sent().iter().map(ChannelPayload::len).collect();
        assert_eq!(sizes, vec![16_384, 16_384, 7_232]);

        let mut receiver = FileReceiver::new();
        assert_eq!(
            receiver.announce(metadata("blob.bin", 40_000)),
            AnnounceOutcome::Queued
        );
        let mut outcomes = Vec::new();
        for chunk in channel.sent() {
            outcomes.push(receiver.receive_chunk(chunk.into_bytes()).unwrap());
        }
        assert!(matches!(
            outcomes[0],
            ChunkOutcome::Progress { received: 16_384, size: 40_000, .. }
        ));
        let ChunkOutcome::Complete(file) = &outcomes[2] else {
            panic!("expected completion, got {:?}", outcomes[2]);
        };
        assert_eq!(file.data.as_ref(), data.as_slice());
        assert_eq!(file.metadata.name, "blob.bin");
        assert_eq!(receiver.pending_announcements(), 0);
        assert_eq!(receiver.bytes_received(), 0);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn closed_channel_sends_nothing() {
        let channel = Arc::new(MockDataChannel::new("file"));
        let sender = FileSender::new(channel.clone(), 16_384, 10);

        let result = sender.send(&b"0123456789"[..]).await;
        assert_eq!(result, Err(TransferError::ChannelNotOpen));
        assert_eq!(sender.offset_sent(), 0);
        assert!(channel.sent().is_empty());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn closing_mid_send_aborts_and_resets_offset() {
        let channel = ClosingChannel::new(1);
        let data = pattern(40_000);
        let sender = FileSender::new(channel.clone(), 16_384, data.len() as u64);
        let offset = sender.offset_handle();

        let outcome = sender.clone().spawn(std::io::Cursor::new(data)).await.unwrap();
        assert_eq!(outcome, Ok(SendOutcome::Aborted { sent: 16_384 }));
        assert_eq!(channel.sent.lock().len(), 1);
        assert_eq!(offset.load(Ordering::SeqCst), 0);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn short_source_is_a_read_error() {
        let channel = Arc::new(MockDataChannel::open("file"));
        let sender = FileSender::new(channel, 4, 10);
        let result = sender.send(&b"abc"[..]).await;
        assert!(matches!(result, Err(TransferError::Read(_))));
        assert_eq!(sender.offset_sent(), 0);
    }

    #[test_timeout::timeout]
    fn oversized_transfer_is_discarded() {
        let mut receiver = FileReceiver::new();
        receiver.announce(metadata("small.txt", 10));

        assert!(receiver.receive_chunk(Bytes::from_static(b"12345678")).is_ok());
        let err = receiver
            .receive_chunk(Bytes::from_static(b"9abc"))
            .unwrap_err();
        assert_eq!(
            err,
            TransferError::SizeExceeded {
                name: "small.txt".into(),
                size: 10,
                received: 12,
            }
        );
        assert_eq!(receiver.bytes_received(), 0);
        assert_eq!(receiver.pending_announcements(), 0);
    }

    #[test_timeout::timeout]
    fn chunk_without_announcement_is_rejected() {
        let mut receiver = FileReceiver::new();
        assert_eq!(
            receiver.receive_chunk(Bytes::from_static(b"stray")),
            Err(TransferError::UnexpectedChunk(5))
        );
    }

    #[test_timeout::timeout]
    fn empty_file_completes_on_announcement() {
        let mut receiver = FileReceiver::new();
        let AnnounceOutcome::Complete(file) = receiver.announce(metadata("empty.txt", 0)) else {
            panic!("empty file should complete on announcement");
        };
        assert!(file.data.is_empty());
        assert_eq!(receiver.pending_announcements(), 0);
        assert_eq!(receiver.progress(), None);
    }

    #[test_timeout::timeout]
    fn latest_announcement_is_active() {
        let mut receiver = FileReceiver::new();
        receiver.announce(metadata("first.txt", 4));
        receiver.announce(metadata("second.txt", 2));
        assert_eq!(receiver.active().unwrap().name, "second.txt");

        receiver.receive_chunk(Bytes::from_static(b"a")).unwrap();
        assert_eq!(receiver.progress(), Some(0.5));

        let ChunkOutcome::Complete(file) = receiver.receive_chunk(Bytes::from_static(b"b")).unwrap()
        else {
            panic!("expected completion");
        };
        assert_eq!(file.metadata.name, "second.txt");
        assert_eq!(receiver.active().unwrap().name, "first.txt");
        assert_eq!(receiver.progress(), Some(0.0));
    }

    #[test_timeout::timeout]
    fn new_announcement_drops_partial_transfer() {
        let mut receiver = FileReceiver::new();
        receiver.announce(metadata("a.bin", 4));
        receiver.receive_chunk(Bytes::from_static(b"AA")).unwrap();

        assert_eq!(
            receiver.announce(metadata("b.bin", 4)),
            AnnounceOutcome::Superseded(TransferError::Superseded {
                name: "a.bin".into(),
                received: 2,
                size: 4,
            })
        );
        assert_eq!(receiver.bytes_received(), 0);
        assert_eq!(receiver.pending_announcements(), 1);

        assert!(matches!(
            receiver.receive_chunk(Bytes::from_static(b"bb")).unwrap(),
            ChunkOutcome::Progress { received: 2, .. }
        ));
        let ChunkOutcome::Complete(file) = receiver.receive_chunk(Bytes::from_static(b"BB")).unwrap()
        else {
            panic!("expected completion");
        };
        assert_eq!(file.metadata.name, "b.bin");
        assert_eq!(file.data.as_ref(), b"bbBB");
        assert_eq!(receiver.pending_announcements(), 0);
    }

    #[test_timeout::timeout]
    fn reset_forgets_everything() {
        let mut receiver = FileReceiver::new();
        receiver.announce(metadata("a.txt", 4));
        receiver.receive_chunk(Bytes::from_static(b"ab")).unwrap();

        receiver.reset();
        assert_eq!(receiver.bytes_received(), 0);
        assert_eq!(receiver.pending_announcements(), 0);
    }
}
