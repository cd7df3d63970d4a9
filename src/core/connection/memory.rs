//! In-memory connector/transport pair.
//!
//! Two directly wired endpoints that speak the same [`PeerConnector`] /
//! [`DirectTransport`] contract as the WebRTC stack, with placeholder
//! descriptions and candidates. Used by the test suite and same-process
//! simulations; nothing here touches the network.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::{DirectTransport, Frame, LinkState, PeerConnector, TransportEvent};
use crate::core::error::SessionError;

const OFFER_MARK: &str = "memory-offer";
const ANSWER_MARK: &str = "memory-answer";

#[derive(Clone, Copy)]
enum Side {
    A,
    B,
}

/// State shared by both endpoints of a pair.
struct PairState {
    connected: AtomicBool,
    closed: AtomicBool,
    a_tx: mpsc::UnboundedSender<TransportEvent>,
    b_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl PairState {
    fn events_for(&self, side: Side) -> &mpsc::UnboundedSender<TransportEvent> {
        match side {
            Side::A => &self.a_tx,
            Side::B => &self.b_tx,
        }
    }

    fn peer_of(&self, side: Side) -> &mpsc::UnboundedSender<TransportEvent> {
        match side {
            Side::A => &self.b_tx,
            Side::B => &self.a_tx,
        }
    }

    fn broadcast_state(&self, state: LinkState) {
        let _ = self.a_tx.send(TransportEvent::StateChanged(state));
        let _ = self.b_tx.send(TransportEvent::StateChanged(state));
    }
}

/// One endpoint of the in-memory channel.
pub struct MemoryTransport {
    side: Side,
    state: Arc<PairState>,
    /// Simulated send-buffer fill, settable by tests to force backpressure.
    buffered: AtomicUsize,
}

impl MemoryTransport {
    /// Pretend `n` bytes sit unsent in the local buffer.
    pub fn set_buffered(&self, n: usize) {
        self.buffered.store(n, Ordering::Relaxed);
    }
}

#[async_trait]
impl DirectTransport for MemoryTransport {
    async fn send_text(&self, text: String) -> Result<(), SessionError> {
        if !self.is_open() {
            return Err(SessionError::TransportNotReady);
        }
        self.state
            .peer_of(self.side)
            .send(TransportEvent::Frame(Frame::Text(text)))
            .map_err(|_| SessionError::TransportNotReady)
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), SessionError> {
        if !self.is_open() {
            return Err(SessionError::TransportNotReady);
        }
        self.state
            .peer_of(self.side)
            .send(TransportEvent::Frame(Frame::Binary(data)))
            .map_err(|_| SessionError::TransportNotReady)
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }

    fn is_open(&self) -> bool {
        self.state.connected.load(Ordering::Relaxed) && !self.state.closed.load(Ordering::Relaxed)
    }

    async fn close(&self) {
        if !self.state.closed.swap(true, Ordering::Relaxed) {
            self.state.broadcast_state(LinkState::Closed);
        }
    }
}

/// One endpoint's connector.
pub struct MemoryConnector {
    side: Side,
    state: Arc<PairState>,
    transport: Arc<MemoryTransport>,
    /// Candidates applied via `add_candidate`, in order, for assertions.
    applied_candidates: Mutex<Vec<String>>,
    candidate_counter: AtomicUsize,
}

impl MemoryConnector {
    /// Build a wired pair. Each connector reports into its own session's
    /// event channel.
    pub fn pair(
        a_tx: mpsc::UnboundedSender<TransportEvent>,
        b_tx: mpsc::UnboundedSender<TransportEvent>,
    ) -> (Arc<Self>, Arc<Self>) {
        let state = Arc::new(PairState {
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            a_tx,
            b_tx,
        });
        let make = |side| {
            Arc::new(MemoryConnector {
                side,
                state: state.clone(),
                transport: Arc::new(MemoryTransport {
                    side,
                    state: state.clone(),
                    buffered: AtomicUsize::new(0),
                }),
                applied_candidates: Mutex::new(Vec::new()),
                candidate_counter: AtomicUsize::new(0),
            })
        };
        (make(Side::A), make(Side::B))
    }

    /// Direct handle on this side's transport (test hook).
    pub fn raw_transport(&self) -> Arc<MemoryTransport> {
        self.transport.clone()
    }

    /// Candidates applied so far, in application order (test hook).
    pub fn applied_candidates(&self) -> Vec<String> {
        self.applied_candidates.lock().expect("candidate log poisoned").clone()
    }

    fn emit_local_candidate(&self) {
        let n = self.candidate_counter.fetch_add(1, Ordering::Relaxed);
        let tag = match self.side {
            Side::A => "a",
            Side::B => "b",
        };
        let _ = self
            .state
            .events_for(self.side)
            .send(TransportEvent::LocalCandidate(format!("mem:{tag}:{n}")));
    }
}

#[async_trait]
impl PeerConnector for MemoryConnector {
    async fn create_offer(&self) -> Result<String, SessionError> {
        self.emit_local_candidate();
        Ok(OFFER_MARK.to_string())
    }

    async fn accept_offer(&self, offer_sdp: &str) -> Result<String, SessionError> {
        if offer_sdp != OFFER_MARK {
            return Err(SessionError::NegotiationFailed(format!(
                "unexpected offer: {offer_sdp}"
            )));
        }
        self.emit_local_candidate();
        Ok(ANSWER_MARK.to_string())
    }

    async fn apply_answer(&self, answer_sdp: &str) -> Result<(), SessionError> {
        if answer_sdp != ANSWER_MARK {
            return Err(SessionError::NegotiationFailed(format!(
                "unexpected answer: {answer_sdp}"
            )));
        }
        if self.state.connected.swap(true, Ordering::Relaxed) {
            // Same strictness as a real description exchange.
            return Err(SessionError::NegotiationFailed(
                "answer already applied".into(),
            ));
        }
        self.state.broadcast_state(LinkState::Connected);
        Ok(())
    }

    async fn add_candidate(&self, candidate: &str) -> Result<(), SessionError> {
        self.applied_candidates
            .lock()
            .expect("candidate log poisoned")
            .push(candidate.to_string());
        Ok(())
    }

    async fn transport(&self) -> Option<Arc<dyn DirectTransport>> {
        if self.state.connected.load(Ordering::Relaxed) {
            Some(self.transport.clone())
        } else {
            None
        }
    }

    async fn close(&self) {
        self.transport.close().await;
    }
}
