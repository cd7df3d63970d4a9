//! Binary payload transfer over the direct transport.
//!
//! Protocol: a `transferStart` control frame announcing total byte size,
//! chunk count and file metadata; the chunks as raw binary frames, in
//! order; a `transferEnd` control frame. The receiver buffers chunks in
//! arrival order and reassembles only after `transferEnd`.
//!
//! The sender paces itself against the transport's outbound buffer: before
//! each chunk it waits until the buffered amount is back under the high
//! water mark. The wait is cooperative and cancellable: it re-checks the
//! transport and the session shutdown flag on every poll tick.
//!
//! No resume and no integrity check beyond transport reliability: a
//! transfer that dies mid-stream is discarded on both sides and a fresh
//! one restarts from chunk zero.

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{chunk_count, chunks, Reassembly};
use crate::core::config::SessionConfig;
use crate::core::connection::DirectTransport;
use crate::core::error::SessionError;
use crate::core::session::sync::SyncMessage;

/// Descriptive metadata shipped in the `transferStart` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferMetadata {
    pub file_name: String,
    pub mime_type: Option<String>,
}

/// Which way a transfer is moving, as seen by this peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Send,
    Receive,
}

// ── Sender ───────────────────────────────────────────────────────────────────

/// Ship `payload` to the peer in bounded chunks.
///
/// Fails with [`SessionError::TransportNotReady`] when the transport is
/// not open at the start, and [`SessionError::TransferInterrupted`] when
/// it closes (or the session shuts down) mid-stream. `on_progress`
/// receives percentages 0..=100.
pub async fn send_payload(
    transport: &Arc<dyn DirectTransport>,
    config: &SessionConfig,
    shutdown: &watch::Receiver<bool>,
    payload: Bytes,
    metadata: &TransferMetadata,
    mut on_progress: impl FnMut(u8),
) -> Result<(), SessionError> {
    if !transport.is_open() {
        return Err(SessionError::TransportNotReady);
    }

    let total_chunks = chunk_count(payload.len(), config.chunk_size);
    transport
        .send_text(
            SyncMessage::TransferStart {
                total_size: payload.len() as u64,
                total_chunks,
                file_name: metadata.file_name.clone(),
                mime_type: metadata.mime_type.clone(),
            }
            .encode(),
        )
        .await?;

    info!(
        event = "transfer_send_start",
        file_name = %metadata.file_name,
        total_size = payload.len(),
        total_chunks,
    );

    for (index, chunk) in chunks(&payload, config.chunk_size).enumerate() {
        wait_for_buffer_space(transport, config, shutdown, chunk.len()).await?;
        transport.send_binary(chunk).await.map_err(|_| {
            SessionError::TransferInterrupted("transport closed mid-transfer".into())
        })?;
        on_progress((((index as u64 + 1) * 100) / total_chunks as u64) as u8);
    }

    transport
        .send_text(SyncMessage::TransferEnd.encode())
        .await
        .map_err(|_| SessionError::TransferInterrupted("transport closed mid-transfer".into()))?;
    on_progress(100);

    info!(event = "transfer_send_complete", file_name = %metadata.file_name);
    Ok(())
}

/// Suspend until the outbound buffer can take `next_len` more bytes.
async fn wait_for_buffer_space(
    transport: &Arc<dyn DirectTransport>,
    config: &SessionConfig,
    shutdown: &watch::Receiver<bool>,
    next_len: usize,
) -> Result<(), SessionError> {
    let fits = |buffered: usize| buffered + next_len <= config.buffered_amount_high;

    if fits(transport.buffered_amount().await) {
        return Ok(());
    }
    debug!(
        event = "transfer_backpressure",
        high_watermark = config.buffered_amount_high,
        next_len,
        "Waiting for send buffer to drain"
    );

    loop {
        if *shutdown.borrow() {
            return Err(SessionError::TransferInterrupted("session ended".into()));
        }
        if !transport.is_open() {
            return Err(SessionError::TransferInterrupted(
                "transport closed during backpressure wait".into(),
            ));
        }
        if fits(transport.buffered_amount().await) {
            return Ok(());
        }
        tokio::time::sleep(config.backpressure_poll).await;
    }
}

// ── Receiver ─────────────────────────────────────────────────────────────────

/// State of one inbound transfer, created by `transferStart` and destroyed
/// by `transferEnd` or transport close.
#[derive(Debug)]
pub struct InboundTransfer {
    pub id: Uuid,
    pub metadata: TransferMetadata,
    reassembly: Reassembly,
}

impl InboundTransfer {
    pub fn begin(
        total_size: u64,
        total_chunks: u32,
        file_name: String,
        mime_type: Option<String>,
    ) -> Self {
        info!(event = "transfer_recv_start", %file_name, total_size, total_chunks);
        Self {
            id: Uuid::new_v4(),
            metadata: TransferMetadata {
                file_name,
                mime_type,
            },
            reassembly: Reassembly::new(total_chunks, total_size),
        }
    }

    /// Buffer one chunk; returns completion percentage.
    pub fn push_chunk(&mut self, chunk: Bytes) -> u8 {
        self.reassembly.push(chunk);
        self.reassembly.percent()
    }

    pub fn percent(&self) -> u8 {
        self.reassembly.percent()
    }

    /// Reassemble the original payload after `transferEnd`.
    pub fn finish(self) -> (TransferMetadata, Bytes) {
        if self.reassembly.received_chunks() != self.reassembly.expected_chunks() {
            warn!(
                event = "transfer_chunk_count_mismatch",
                received = self.reassembly.received_chunks(),
                expected = self.reassembly.expected_chunks(),
                "Reassembling despite count mismatch"
            );
        }
        (self.metadata, self.reassembly.assemble())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::memory::MemoryConnector;
    use crate::core::connection::{Frame, PeerConnector, TransportEvent};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn test_config() -> SessionConfig {
        SessionConfig {
            chunk_size: 4,
            buffered_amount_high: 64,
            backpressure_poll: Duration::from_millis(5),
            ..Default::default()
        }
    }

    struct Pair {
        a: Arc<MemoryConnector>,
        b_rx: mpsc::UnboundedReceiver<TransportEvent>,
        transport: Arc<dyn DirectTransport>,
    }

    async fn connected_pair() -> Pair {
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let (a, b) = MemoryConnector::pair(a_tx, b_tx);
        let offer = a.create_offer().await.unwrap();
        let answer = b.accept_offer(&offer).await.unwrap();
        a.apply_answer(&answer).await.unwrap();
        let transport = a.transport().await.unwrap();
        Pair { a, b_rx, transport }
    }

    fn metadata() -> TransferMetadata {
        TransferMetadata {
            file_name: "track.mp3".into(),
            mime_type: Some("audio/mpeg".into()),
        }
    }

    fn no_shutdown() -> watch::Receiver<bool> {
        // Sender dropped: borrow() keeps returning false, which is all
        // the backpressure wait looks at.
        watch::channel(false).1
    }

    /// Drain frames from the receiving side and run them through an
    /// inbound transfer, exactly as the session dispatcher would.
    fn reassemble(frames: Vec<Frame>) -> Option<(TransferMetadata, Bytes)> {
        let mut inbound: Option<InboundTransfer> = None;
        for frame in frames {
            match frame {
                Frame::Text(text) => match SyncMessage::decode(&text).unwrap() {
                    SyncMessage::TransferStart {
                        total_size,
                        total_chunks,
                        file_name,
                        mime_type,
                    } => {
                        inbound =
                            Some(InboundTransfer::begin(total_size, total_chunks, file_name, mime_type));
                    }
                    SyncMessage::TransferEnd => return inbound.take().map(InboundTransfer::finish),
                    other => panic!("unexpected control frame {other:?}"),
                },
                Frame::Binary(chunk) => {
                    inbound.as_mut().expect("chunk before transferStart").push_chunk(chunk);
                }
            }
        }
        panic!("stream ended without transferEnd");
    }

    fn collect_frames(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let TransportEvent::Frame(f) = ev {
                frames.push(f);
            }
        }
        frames
    }

    #[tokio::test]
    async fn test_send_requires_open_transport() {
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (b_tx, _b_rx) = mpsc::unbounded_channel();
        let (a, _b) = MemoryConnector::pair(a_tx, b_tx);
        let transport: Arc<dyn DirectTransport> = a.raw_transport();

        let err = send_payload(
            &transport,
            &test_config(),
            &no_shutdown(),
            Bytes::from_static(b"data"),
            &metadata(),
            |_| {},
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SessionError::TransportNotReady));
    }

    #[tokio::test]
    async fn test_roundtrip_boundary_sizes() {
        // chunk_size = 4: empty, sub-chunk, exact, one over, large multiple.
        for len in [0usize, 3, 4, 5, 40] {
            let mut pair = connected_pair().await;
            let payload = Bytes::from((0..len).map(|i| i as u8).collect::<Vec<u8>>());

            send_payload(
                &pair.transport,
                &test_config(),
                &no_shutdown(),
                payload.clone(),
                &metadata(),
                |_| {},
            )
            .await
            .unwrap();

            let frames = collect_frames(&mut pair.b_rx);
            let (meta, reassembled) = reassemble(frames).expect("transfer must complete");
            assert_eq!(meta, metadata());
            assert_eq!(reassembled, payload, "len = {len}");
        }
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_ends_at_100() {
        let pair = connected_pair().await;
        let payload = Bytes::from(vec![7u8; 40]); // 10 chunks of 4
        let mut seen = Vec::new();

        send_payload(
            &pair.transport,
            &test_config(),
            &no_shutdown(),
            payload,
            &metadata(),
            |p| seen.push(p),
        )
        .await
        .unwrap();

        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {seen:?}");
        assert_eq!(*seen.first().unwrap(), 10);
        assert_eq!(*seen.last().unwrap(), 100);
    }

    #[tokio::test]
    async fn test_backpressure_holds_chunks_until_drain() {
        let mut pair = connected_pair().await;
        let raw = pair.a.raw_transport();
        let config = test_config();

        // Force the buffer over the mark before anything is sent.
        raw.set_buffered(config.buffered_amount_high + 1);

        let transport = pair.transport.clone();
        let meta = metadata();
        let handle = tokio::spawn(async move {
            send_payload(
                &transport,
                &test_config(),
                &no_shutdown(),
                Bytes::from(vec![1u8; 16]), // 4 chunks
                &meta,
                |_| {},
            )
            .await
        });

        // Give the sender a few poll cycles: transferStart passes, chunks hold.
        tokio::time::sleep(Duration::from_millis(40)).await;
        let frames = collect_frames(&mut pair.b_rx);
        assert_eq!(frames.len(), 1, "only the start frame may pass: {frames:?}");
        assert!(matches!(&frames[0], Frame::Text(t) if t.contains("transferStart")));

        // Drain; the held chunks flow and the transfer completes.
        raw.set_buffered(0);
        handle.await.unwrap().unwrap();

        let frames = collect_frames(&mut pair.b_rx);
        let binary = frames.iter().filter(|f| matches!(f, Frame::Binary(_))).count();
        assert_eq!(binary, 4);
        assert!(matches!(frames.last(), Some(Frame::Text(t)) if t.contains("transferEnd")));
    }

    #[tokio::test]
    async fn test_transport_close_interrupts_backpressured_send() {
        let pair = connected_pair().await;
        let raw = pair.a.raw_transport();
        let config = test_config();
        raw.set_buffered(config.buffered_amount_high + 1);

        let transport = pair.transport.clone();
        let meta = metadata();
        let handle = tokio::spawn(async move {
            send_payload(
                &transport,
                &test_config(),
                &no_shutdown(),
                Bytes::from(vec![1u8; 16]),
                &meta,
                |_| {},
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        pair.a.close().await;

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::TransferInterrupted(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_session_shutdown_cancels_backpressure_wait() {
        let pair = connected_pair().await;
        let raw = pair.a.raw_transport();
        let config = test_config();
        raw.set_buffered(config.buffered_amount_high + 1);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let transport = pair.transport.clone();
        let meta = metadata();
        let handle = tokio::spawn(async move {
            send_payload(
                &transport,
                &test_config(),
                &shutdown_rx,
                Bytes::from(vec![1u8; 16]),
                &meta,
                |_| {},
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_tx.send(true).unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::TransferInterrupted(_)));
    }
}
