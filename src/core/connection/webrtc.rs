//! WebRTC implementation of the connector and transport traits.
//!
//! One peer connection per session, one data channel (`mediaSync`)
//! carrying both sub-protocols. Candidates trickle: each locally gathered
//! candidate is pushed to the session as a [`TransportEvent::LocalCandidate`]
//! for relay delivery, rather than blocking until gathering completes.
//!
//! `LinkState::Connected` is reported when the data channel opens, not when
//! ICE connects. The session's notion of "connected" is "the channel can
//! carry frames".

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::{DirectTransport, Frame, LinkState, PeerConnector, TransportEvent};
use crate::core::config::{default_ice_servers, SYNC_CHANNEL_LABEL};
use crate::core::error::SessionError;

type ChannelSlot = Arc<RwLock<Option<Arc<RTCDataChannel>>>>;

/// Production connector over webrtc-rs.
pub struct WebRtcConnector {
    peer_connection: Arc<RTCPeerConnection>,
    channel: ChannelSlot,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl WebRtcConnector {
    /// Build the peer connection and register its event plumbing.
    ///
    /// Works for either role: the initiator creates the channel in
    /// [`PeerConnector::create_offer`]; the responder adopts the remote's
    /// channel via `on_data_channel`.
    pub async fn new(
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<Self>, SessionError> {
        Self::build(events)
            .await
            .map_err(|e| SessionError::NegotiationFailed(e.to_string()))
    }

    async fn build(events: mpsc::UnboundedSender<TransportEvent>) -> Result<Arc<Self>> {
        let mut media_engine = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let peer_connection = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers: default_ice_servers(),
                ..Default::default()
            })
            .await?,
        );

        // Connection-level monitoring. Connected is deliberately not
        // forwarded here; the channel's on_open is the usable signal.
        {
            let events = events.clone();
            peer_connection.on_peer_connection_state_change(Box::new(move |state| {
                let events = events.clone();
                Box::pin(async move {
                    match state {
                        RTCPeerConnectionState::Connected => {
                            info!(event = "webrtc_connected", "Peer connection established");
                        }
                        RTCPeerConnectionState::Failed => {
                            error!(event = "webrtc_failed", "Peer connection failed");
                            let _ = events.send(TransportEvent::StateChanged(LinkState::Failed));
                        }
                        RTCPeerConnectionState::Disconnected => {
                            warn!(
                                event = "webrtc_disconnected",
                                "Transient disconnect (ICE may recover)"
                            );
                            let _ =
                                events.send(TransportEvent::StateChanged(LinkState::Disconnected));
                        }
                        RTCPeerConnectionState::Closed => {
                            info!(event = "webrtc_closed", "Peer connection closed");
                            let _ = events.send(TransportEvent::StateChanged(LinkState::Closed));
                        }
                        _ => {}
                    }
                })
            }));
        }

        // Trickle candidates out through the relay.
        {
            let events = events.clone();
            peer_connection.on_ice_candidate(Box::new(move |candidate| {
                let events = events.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    match candidate.to_json().map(|init| serde_json::to_string(&init)) {
                        Ok(Ok(json)) => {
                            let _ = events.send(TransportEvent::LocalCandidate(json));
                        }
                        Ok(Err(e)) => warn!(event = "candidate_encode_failed", error = %e),
                        Err(e) => warn!(event = "candidate_encode_failed", error = %e),
                    }
                })
            }));
        }

        let channel: ChannelSlot = Arc::new(RwLock::new(None));

        // Responder side: adopt the channel the initiator created.
        {
            let events = events.clone();
            let channel = channel.clone();
            peer_connection.on_data_channel(Box::new(move |dc| {
                let events = events.clone();
                let channel = channel.clone();
                Box::pin(async move {
                    if dc.label() != SYNC_CHANNEL_LABEL {
                        debug!(event = "unexpected_channel", label = %dc.label());
                        return;
                    }
                    attach_channel_handlers(&dc, &events);
                    *channel.write().await = Some(dc);
                })
            }));
        }

        Ok(Arc::new(Self {
            peer_connection,
            channel,
            events,
        }))
    }

    /// The underlying peer connection, for applications that attach media
    /// tracks (e.g. a voice link) before negotiation starts.
    pub fn peer_connection(&self) -> Arc<RTCPeerConnection> {
        self.peer_connection.clone()
    }

    async fn local_description_json(&self) -> Result<String> {
        let desc = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| anyhow!("no local description set"))?;
        Ok(serde_json::to_string(&desc)?)
    }
}

/// Wire a data channel's open/close/message callbacks into the session's
/// event stream.
fn attach_channel_handlers(
    dc: &Arc<RTCDataChannel>,
    events: &mpsc::UnboundedSender<TransportEvent>,
) {
    {
        let events = events.clone();
        dc.on_open(Box::new(move || {
            let events = events.clone();
            Box::pin(async move {
                let _ = events.send(TransportEvent::StateChanged(LinkState::Connected));
            })
        }));
    }
    {
        let events = events.clone();
        dc.on_close(Box::new(move || {
            let events = events.clone();
            Box::pin(async move {
                let _ = events.send(TransportEvent::StateChanged(LinkState::Closed));
            })
        }));
    }
    {
        let events = events.clone();
        dc.on_message(Box::new(move |msg| {
            let events = events.clone();
            Box::pin(async move {
                let frame = if msg.is_string {
                    match String::from_utf8(msg.data.to_vec()) {
                        Ok(text) => Frame::Text(text),
                        Err(_) => {
                            warn!(event = "non_utf8_text_frame", "Dropping malformed text frame");
                            return;
                        }
                    }
                } else {
                    Frame::Binary(msg.data)
                };
                let _ = events.send(TransportEvent::Frame(frame));
            })
        }));
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn create_offer(&self) -> Result<String, SessionError> {
        let run = async {
            let dc = self
                .peer_connection
                .create_data_channel(
                    SYNC_CHANNEL_LABEL,
                    Some(RTCDataChannelInit {
                        ordered: Some(true),
                        ..Default::default()
                    }),
                )
                .await?;
            attach_channel_handlers(&dc, &self.events);
            *self.channel.write().await = Some(dc);

            let offer = self.peer_connection.create_offer(None).await?;
            self.peer_connection.set_local_description(offer).await?;
            self.local_description_json().await
        };
        run.await
            .map_err(|e: anyhow::Error| SessionError::NegotiationFailed(e.to_string()))
    }

    async fn accept_offer(&self, offer_sdp: &str) -> Result<String, SessionError> {
        let run = async {
            let desc: RTCSessionDescription =
                serde_json::from_str(offer_sdp).context("offer is not a session description")?;
            self.peer_connection.set_remote_description(desc).await?;

            let answer = self.peer_connection.create_answer(None).await?;
            self.peer_connection.set_local_description(answer).await?;
            self.local_description_json().await
        };
        run.await
            .map_err(|e: anyhow::Error| SessionError::NegotiationFailed(e.to_string()))
    }

    async fn apply_answer(&self, answer_sdp: &str) -> Result<(), SessionError> {
        let run = async {
            let desc: RTCSessionDescription =
                serde_json::from_str(answer_sdp).context("answer is not a session description")?;
            self.peer_connection.set_remote_description(desc).await?;
            Ok::<_, anyhow::Error>(())
        };
        run.await
            .map_err(|e| SessionError::NegotiationFailed(e.to_string()))
    }

    async fn add_candidate(&self, candidate: &str) -> Result<(), SessionError> {
        let run = async {
            let init: RTCIceCandidateInit =
                serde_json::from_str(candidate).context("candidate is not a candidate init")?;
            self.peer_connection.add_ice_candidate(init).await?;
            Ok::<_, anyhow::Error>(())
        };
        run.await
            .map_err(|e| SessionError::NegotiationFailed(e.to_string()))
    }

    async fn transport(&self) -> Option<Arc<dyn DirectTransport>> {
        let dc = self.channel.read().await.clone()?;
        Some(Arc::new(WebRtcTransport {
            peer_connection: self.peer_connection.clone(),
            dc,
        }))
    }

    async fn close(&self) {
        if let Err(e) = self.peer_connection.close().await {
            debug!(event = "peer_connection_close_failed", error = %e);
        }
    }
}

/// The open data channel as seen by the session layer.
pub struct WebRtcTransport {
    peer_connection: Arc<RTCPeerConnection>,
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DirectTransport for WebRtcTransport {
    async fn send_text(&self, text: String) -> Result<(), SessionError> {
        if !self.is_open() {
            return Err(SessionError::TransportNotReady);
        }
        self.dc
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|_| SessionError::TransportNotReady)
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), SessionError> {
        if !self.is_open() {
            return Err(SessionError::TransportNotReady);
        }
        self.dc
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|_| SessionError::TransportNotReady)
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn close(&self) {
        if let Err(e) = self.peer_connection.close().await {
            debug!(event = "peer_connection_close_failed", error = %e);
        }
    }
}
