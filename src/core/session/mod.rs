//! One peer-pair session: negotiation, sync, transfer, lifecycle.
//!
//! A [`Session`] owns every piece of per-pair state (negotiation machine,
//! candidate queue, playback mirror, transfer buffers) as plain fields
//! with an explicit lifecycle. Two sessions for different pairs share
//! nothing, so tests run many of them side by side.
//!
//! All inbound traffic (relay envelopes and transport events) funnels into
//! a single driver task; that task is the only mutator of negotiation and
//! transfer state. Local UI actions mutate the playback mirror behind a
//! lock; when a local action races an inbound message, the last write
//! wins, which is the protocol's documented policy.

pub mod playback;
pub mod sync;

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::config::SessionConfig;
use crate::core::connection::negotiator::{
    NegotiationOutcome, NegotiationState, Role, SessionNegotiator,
};
use crate::core::connection::webrtc::WebRtcConnector;
use crate::core::connection::{DirectTransport, Frame, LinkState, PeerConnector, TransportEvent};
use crate::core::error::SessionError;
use crate::core::identity::PeerIdentity;
use crate::core::pipeline::transfer::{
    self, InboundTransfer, TransferDirection, TransferMetadata,
};
use crate::core::signal::codec::SignalCodec;
use crate::core::signal::relay::SignalRelay;
use crate::core::signal::{SignalEnvelope, SignalKind, SignalPayload};
use self::playback::{MediaController, PlaybackMirror, SourceDescriptor};
use self::sync::SyncMessage;

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// The local side called [`Session::end`].
    Local,
    /// The peer signalled `end` through the relay.
    Remote,
    /// Negotiation or the transport failed.
    Failed(String),
}

/// Events fanned out to the embedding application.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The negotiation machine moved to a new state.
    StateChanged(NegotiationState),
    /// The direct transport is up; control and transfer traffic may flow.
    Connected,
    /// Chat text from the remote peer.
    ChatReceived { message: String },
    /// The playback mirror changed (local or remote origin).
    PlaybackChanged(PlaybackMirror),
    /// The active media source was replaced.
    SourceChanged(SourceDescriptor),
    TransferProgress {
        id: Uuid,
        direction: TransferDirection,
        file_name: String,
        percent: u8,
    },
    /// An inbound transfer completed; `payload` is the reassembled bytes.
    TransferComplete {
        id: Uuid,
        metadata: TransferMetadata,
        payload: Bytes,
    },
    TransferFailed {
        id: Uuid,
        direction: TransferDirection,
        reason: String,
    },
    /// The media backend refused an action; the session continues.
    CapabilityError { reason: String },
    /// Terminal. Emitted exactly once per session.
    Ended(EndReason),
}

/// Construction parameters.
pub struct SessionParams {
    pub identity: PeerIdentity,
    pub role: Role,
    pub config: SessionConfig,
    /// Long-lived local X25519 secret for signaling decryption. A fresh
    /// keypair is generated when absent, in which case the remote can only
    /// reach us in plaintext until it learns the new public key.
    pub local_secret: Option<[u8; 32]>,
}

/// A live session with one remote peer.
pub struct Session {
    identity: PeerIdentity,
    role: Role,
    config: SessionConfig,
    codec: SignalCodec,
    relay: Arc<dyn SignalRelay>,
    connector: Arc<dyn PeerConnector>,
    media: Option<Arc<dyn MediaController>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    connector_events: StdMutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,

    mirror: StdMutex<PlaybackMirror>,
    transport: RwLock<Option<Arc<dyn DirectTransport>>>,
    inbound: StdMutex<Option<InboundTransfer>>,
    /// Serializes outbound transfers: at most one in flight per direction.
    outbound_gate: Mutex<()>,

    connected: AtomicBool,
    ended: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Session {
    /// Build a session over an already-constructed connector.
    ///
    /// `connector_events` must be the receiving end of the channel the
    /// connector reports into. Returns the session and its event stream.
    pub fn new(
        params: SessionParams,
        relay: Arc<dyn SignalRelay>,
        media: Option<Arc<dyn MediaController>>,
        connector: Arc<dyn PeerConnector>,
        connector_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let codec = match params.local_secret {
            Some(secret) => SignalCodec::with_secret(params.identity.clone(), secret),
            None => SignalCodec::new(params.identity.clone()),
        };
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let session = Arc::new(Self {
            identity: params.identity,
            role: params.role,
            config: params.config,
            codec,
            relay,
            connector,
            media,
            events: events_tx,
            connector_events: StdMutex::new(Some(connector_events)),
            mirror: StdMutex::new(PlaybackMirror::default()),
            transport: RwLock::new(None),
            inbound: StdMutex::new(None),
            outbound_gate: Mutex::new(()),
            connected: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            shutdown_tx,
            shutdown_rx,
        });
        (session, events_rx)
    }

    /// Build a session over the production WebRTC stack.
    pub async fn with_webrtc(
        params: SessionParams,
        relay: Arc<dyn SignalRelay>,
        media: Option<Arc<dyn MediaController>>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>), SessionError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = WebRtcConnector::new(tx).await?;
        Ok(Self::new(params, relay, media, connector, rx))
    }

    /// The local signaling public key, for out-of-band publication.
    pub fn public_key_base64(&self) -> String {
        self.codec.public_key_base64()
    }

    /// A snapshot of the current playback belief.
    pub fn playback(&self) -> PlaybackMirror {
        self.mirror.lock().expect("mirror poisoned").clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    /// Subscribe to the relay, kick off negotiation, and spawn the driver.
    ///
    /// Fails with `SignalingUnavailable` when the relay refuses the
    /// subscription or the initial offer publish; the caller may retry.
    pub async fn start(self: &Arc<Self>) -> Result<(), SessionError> {
        let relay_rx = self.relay.subscribe(&self.identity.local_id).await?;

        let mut negotiator = SessionNegotiator::new(self.role, self.connector.clone());
        if let Some(offer) = negotiator.start().await? {
            self.publish_signal(SignalKind::Offer, &offer).await?;
        }
        self.emit(SessionEvent::StateChanged(negotiator.state()));

        let connector_rx = self
            .connector_events
            .lock()
            .expect("connector events poisoned")
            .take()
            .ok_or_else(|| {
                SessionError::NegotiationFailed("session already started".into())
            })?;

        // Driver: the single mutation path for negotiation and transfers.
        {
            let session = self.clone();
            tokio::spawn(async move {
                session.drive(negotiator, relay_rx, connector_rx).await;
            });
        }

        // Negotiation deadline: a silent peer must not hang us forever.
        {
            let session = self.clone();
            let mut shutdown = self.shutdown_rx.clone();
            let deadline = self.config.negotiation_timeout;
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(deadline) => {
                        if !session.is_connected() && !session.is_ended() {
                            warn!(event = "negotiation_timeout", ?deadline);
                            session
                                .finish(EndReason::Failed("negotiation timed out".into()))
                                .await;
                        }
                    }
                    _ = shutdown.changed() => {}
                }
            });
        }

        Ok(())
    }

    /// Tear the session down. Idempotent: safe to call from any trigger,
    /// any number of times; everything after the first call is a no-op.
    pub async fn end(&self) {
        self.finish(EndReason::Local).await;
    }

    async fn finish(&self, reason: EndReason) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(event = "session_end", ?reason);

        self.abort_inbound("session ended");

        // One terminating signal, best-effort: the peer may already be gone.
        let envelope = self.codec.encode(SignalKind::End, &SignalPayload::End);
        if let Err(e) = self.relay.publish(envelope).await {
            debug!(event = "end_signal_not_delivered", error = %e);
        }

        let _ = self.shutdown_tx.send(true);
        self.connector.close().await;
        *self.transport.write().await = None;

        self.emit(SessionEvent::Ended(reason));
    }

    // ── Local actions ─────────────────────────────────────────────────────

    /// Apply a control action locally and publish it to the peer.
    pub async fn send_control(&self, message: SyncMessage) -> Result<(), SessionError> {
        if matches!(
            message,
            SyncMessage::Play { .. }
                | SyncMessage::Pause { .. }
                | SyncMessage::Seek { .. }
                | SyncMessage::Url { .. }
        ) {
            let mut mirror = self.mirror.lock().expect("mirror poisoned");
            mirror.apply(&message);
            self.emit(SessionEvent::PlaybackChanged(mirror.clone()));
        }
        self.publish_sync(&message).await
    }

    /// Convenience: publish a chat line.
    pub async fn send_chat(&self, message: impl Into<String>) -> Result<(), SessionError> {
        self.publish_sync(&SyncMessage::Chat {
            message: message.into(),
        })
        .await
    }

    /// Convenience: switch both peers to a remote stream URL.
    pub async fn set_source_url(&self, url: impl Into<String>) -> Result<(), SessionError> {
        let url = url.into();
        {
            let mut mirror = self.mirror.lock().expect("mirror poisoned");
            mirror.reset_to(SourceDescriptor::Remote(url.clone()));
            self.emit(SessionEvent::PlaybackChanged(mirror.clone()));
        }
        self.publish_sync(&SyncMessage::Url { url }).await
    }

    /// Ship a binary payload to the peer.
    ///
    /// Transfers serialize: a second call waits until the first finishes.
    /// Progress and failure surface both as events and as the return value.
    pub async fn send_payload(
        &self,
        payload: Bytes,
        metadata: TransferMetadata,
    ) -> Result<(), SessionError> {
        let _gate = self.outbound_gate.lock().await;
        let transport = self
            .transport
            .read()
            .await
            .clone()
            .ok_or(SessionError::TransportNotReady)?;

        let id = Uuid::new_v4();
        let file_name = metadata.file_name.clone();
        let events = self.events.clone();
        let result = transfer::send_payload(
            &transport,
            &self.config,
            &self.shutdown_rx,
            payload,
            &metadata,
            |percent| {
                let _ = events.send(SessionEvent::TransferProgress {
                    id,
                    direction: TransferDirection::Send,
                    file_name: file_name.clone(),
                    percent,
                });
            },
        )
        .await;

        if let Err(e) = &result {
            self.emit(SessionEvent::TransferFailed {
                id,
                direction: TransferDirection::Send,
                reason: e.to_string(),
            });
        }
        result
    }

    async fn publish_sync(&self, message: &SyncMessage) -> Result<(), SessionError> {
        let transport = self
            .transport
            .read()
            .await
            .clone()
            .ok_or(SessionError::TransportNotReady)?;
        sync::SyncBus::new(transport).publish(message).await
    }

    // ── Driver ────────────────────────────────────────────────────────────

    async fn drive(
        self: Arc<Self>,
        mut negotiator: SessionNegotiator,
        mut relay_rx: mpsc::Receiver<SignalEnvelope>,
        mut connector_rx: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let mut shutdown = self.shutdown_rx.clone();
        let mut last_state = negotiator.state();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                envelope = relay_rx.recv() => match envelope {
                    Some(envelope) => self.on_envelope(&mut negotiator, envelope).await,
                    None => {
                        // Relay stream ended; resubscribe once, then give up.
                        match self.relay.subscribe(&self.identity.local_id).await {
                            Ok(rx) => {
                                info!(event = "relay_resubscribed");
                                relay_rx = rx;
                            }
                            Err(e) => {
                                self.finish(EndReason::Failed(format!(
                                    "signaling lost: {e}"
                                )))
                                .await;
                                break;
                            }
                        }
                    }
                },
                event = connector_rx.recv() => match event {
                    Some(event) => self.on_transport_event(&mut negotiator, event).await,
                    None => break, // connector dropped; finish() already ran or is moot
                },
            }

            if negotiator.state() != last_state {
                last_state = negotiator.state();
                self.emit(SessionEvent::StateChanged(last_state));
            }
            if self.is_ended() {
                break;
            }
        }

        negotiator.close();
        debug!(event = "session_driver_stopped");
    }

    async fn on_envelope(&self, negotiator: &mut SessionNegotiator, envelope: SignalEnvelope) {
        if envelope.sender_id != self.identity.remote_id {
            debug!(event = "signal_from_stranger", sender = %envelope.sender_id);
            return;
        }
        let payload = match self.codec.decode(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                // One bad envelope never aborts the session.
                warn!(event = "signal_dropped", error = %e);
                return;
            }
        };

        match negotiator.handle_signal(envelope.kind, payload).await {
            Ok(NegotiationOutcome::Handled) => {}
            Ok(NegotiationOutcome::Reply(kind, payload)) => {
                if let Err(e) = self.publish_signal(kind, &payload).await {
                    warn!(event = "signal_reply_failed", error = %e);
                }
            }
            Ok(NegotiationOutcome::PeerEnded) => {
                self.finish(EndReason::Remote).await;
            }
            Err(e) => {
                self.finish(EndReason::Failed(e.to_string())).await;
            }
        }
    }

    async fn on_transport_event(&self, negotiator: &mut SessionNegotiator, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if let Err(e) = self
                    .publish_signal(SignalKind::Candidate, &SignalPayload::Candidate(candidate))
                    .await
                {
                    warn!(event = "candidate_publish_failed", error = %e);
                }
            }
            TransportEvent::StateChanged(link) => {
                if link == LinkState::Connected {
                    *self.transport.write().await = self.connector.transport().await;
                    self.connected.store(true, Ordering::SeqCst);
                    negotiator.on_link_state(link);
                    self.emit(SessionEvent::Connected);
                    return;
                }
                if let Some(error) = negotiator.on_link_state(link) {
                    self.abort_inbound("transport closed");
                    if !self.is_ended() {
                        self.finish(EndReason::Failed(error.to_string())).await;
                    }
                }
            }
            TransportEvent::Frame(Frame::Text(text)) => match SyncMessage::decode(&text) {
                Ok(message) => self.on_sync_message(message),
                Err(e) => warn!(event = "control_frame_dropped", error = %e),
            },
            TransportEvent::Frame(Frame::Binary(chunk)) => self.on_chunk(chunk),
        }
    }

    // ── Inbound control dispatch ──────────────────────────────────────────

    fn on_sync_message(&self, message: SyncMessage) {
        match message {
            SyncMessage::Chat { message } => {
                self.emit(SessionEvent::ChatReceived { message });
            }
            SyncMessage::TransferStart {
                total_size,
                total_chunks,
                file_name,
                mime_type,
            } => {
                let mut inbound = self.inbound.lock().expect("inbound poisoned");
                if let Some(stale) = inbound.take() {
                    warn!(event = "transfer_replaced", file_name = %stale.metadata.file_name);
                    self.emit(SessionEvent::TransferFailed {
                        id: stale.id,
                        direction: TransferDirection::Receive,
                        reason: "superseded by a new transfer".into(),
                    });
                }
                let started = InboundTransfer::begin(total_size, total_chunks, file_name, mime_type);
                self.emit(SessionEvent::TransferProgress {
                    id: started.id,
                    direction: TransferDirection::Receive,
                    file_name: started.metadata.file_name.clone(),
                    percent: started.percent(),
                });
                *inbound = Some(started);
            }
            SyncMessage::TransferEnd => {
                let finished = self.inbound.lock().expect("inbound poisoned").take();
                match finished {
                    Some(inbound) => {
                        let id = inbound.id;
                        let (metadata, payload) = inbound.finish();
                        let source = SourceDescriptor::Transferred {
                            file_name: metadata.file_name.clone(),
                        };
                        {
                            let mut mirror = self.mirror.lock().expect("mirror poisoned");
                            mirror.reset_to(source.clone());
                            self.emit(SessionEvent::PlaybackChanged(mirror.clone()));
                        }
                        self.emit(SessionEvent::SourceChanged(source));
                        self.emit(SessionEvent::TransferComplete {
                            id,
                            metadata,
                            payload,
                        });
                    }
                    None => warn!(event = "transfer_end_without_start"),
                }
            }
            remote_action => {
                {
                    let mut mirror = self.mirror.lock().expect("mirror poisoned");
                    mirror.apply(&remote_action);
                    self.emit(SessionEvent::PlaybackChanged(mirror.clone()));
                }
                if let SyncMessage::Url { url } = &remote_action {
                    self.emit(SessionEvent::SourceChanged(SourceDescriptor::Remote(
                        url.clone(),
                    )));
                }
                self.drive_media(&remote_action);
            }
        }
    }

    fn on_chunk(&self, chunk: Bytes) {
        let mut inbound = self.inbound.lock().expect("inbound poisoned");
        match inbound.as_mut() {
            Some(transfer) => {
                let percent = transfer.push_chunk(chunk);
                self.emit(SessionEvent::TransferProgress {
                    id: transfer.id,
                    direction: TransferDirection::Receive,
                    file_name: transfer.metadata.file_name.clone(),
                    percent,
                });
            }
            None => warn!(event = "chunk_without_transfer", len = chunk.len()),
        }
    }

    /// Move the media backend to match a remote control action. Position
    /// is reconciled on every action, not just at connect time.
    fn drive_media(&self, message: &SyncMessage) {
        let Some(media) = &self.media else { return };
        let result = match message {
            SyncMessage::Play { time } => media.seek_to(*time).and_then(|_| media.play()),
            SyncMessage::Pause { time } => media.seek_to(*time).and_then(|_| media.pause()),
            SyncMessage::Seek { time } => media.seek_to(*time),
            _ => Ok(()),
        };
        if let Err(e) = result {
            warn!(event = "media_capability_error", error = %e);
            self.emit(SessionEvent::CapabilityError {
                reason: e.to_string(),
            });
        }
    }

    // ── Helpers ───────────────────────────────────────────────────────────

    /// Discard a partially received transfer, reporting it as failed.
    fn abort_inbound(&self, reason: &str) {
        let stale = self.inbound.lock().expect("inbound poisoned").take();
        if let Some(inbound) = stale {
            info!(
                event = "transfer_recv_aborted",
                file_name = %inbound.metadata.file_name,
                received = inbound.percent(),
            );
            self.emit(SessionEvent::TransferFailed {
                id: inbound.id,
                direction: TransferDirection::Receive,
                reason: reason.into(),
            });
        }
    }

    async fn publish_signal(
        &self,
        kind: SignalKind,
        payload: &SignalPayload,
    ) -> Result<(), SessionError> {
        let envelope = self.codec.encode(kind, payload);
        self.relay.publish(envelope).await
    }

    fn emit(&self, event: SessionEvent) {
        // The embedding application may have dropped its receiver.
        let _ = self.events.send(event);
    }
}
