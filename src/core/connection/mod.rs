//! Direct transport abstraction.
//!
//! The negotiated peer-to-peer channel carries two sub-protocols
//! distinguished by frame type alone: UTF-8 text frames are control
//! messages, binary frames are always transfer chunks. The traits here let
//! the session logic run over the production WebRTC stack or the in-memory
//! pair used by tests.

pub mod memory;
pub mod negotiator;
pub mod webrtc;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

use crate::core::error::SessionError;

/// One message on the direct transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A structured control message (JSON).
    Text(String),
    /// A raw transfer chunk.
    Binary(Bytes),
}

/// Connection-level state of the direct transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    /// Transient loss; the transport may still recover.
    Disconnected,
    Failed,
    Closed,
}

/// Events a connector pushes to its owning session.
#[derive(Debug)]
pub enum TransportEvent {
    /// A locally gathered reachability candidate, serialized, to be
    /// shipped to the peer through the relay.
    LocalCandidate(String),
    StateChanged(LinkState),
    /// An inbound frame from the open channel.
    Frame(Frame),
}

/// The open bidirectional channel between the two peers.
#[async_trait]
pub trait DirectTransport: Send + Sync {
    /// Send a control frame. Fails with `TransportNotReady` when closed.
    async fn send_text(&self, text: String) -> Result<(), SessionError>;

    /// Send a binary chunk frame.
    async fn send_binary(&self, data: Bytes) -> Result<(), SessionError>;

    /// Bytes queued locally but not yet handed to the network. The chunk
    /// sender pauses while this sits above the high water mark.
    async fn buffered_amount(&self) -> usize;

    fn is_open(&self) -> bool;

    async fn close(&self);
}

/// Builds and owns one peer connection; produces the transport once the
/// connection comes up.
///
/// Connectors report candidates, state changes and inbound frames through
/// the event channel they were constructed with. Nothing in this layer
/// throws into the session.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Build the local offer (initiator role). Returns the serialized
    /// local description.
    async fn create_offer(&self) -> Result<String, SessionError>;

    /// Apply a remote offer and build the answer (responder role).
    async fn accept_offer(&self, offer_sdp: &str) -> Result<String, SessionError>;

    /// Apply the remote answer (initiator role).
    async fn apply_answer(&self, answer_sdp: &str) -> Result<(), SessionError>;

    /// Apply a remote reachability candidate. Callers must only invoke
    /// this after the remote description is set.
    async fn add_candidate(&self, candidate: &str) -> Result<(), SessionError>;

    /// The transport, once the connection reached [`LinkState::Connected`].
    async fn transport(&self) -> Option<Arc<dyn DirectTransport>>;

    async fn close(&self);
}

#[async_trait]
impl<T: DirectTransport + ?Sized> DirectTransport for Arc<T> {
    async fn send_text(&self, text: String) -> Result<(), SessionError> {
        (**self).send_text(text).await
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), SessionError> {
        (**self).send_binary(data).await
    }

    async fn buffered_amount(&self) -> usize {
        (**self).buffered_amount().await
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    async fn close(&self) {
        (**self).close().await
    }
}
