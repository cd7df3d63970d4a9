//! Connection-establishment state machine.
//!
//! Signaling delivery is best-effort, asynchronous and may reorder
//! candidates against the answer they belong to. The machine holds the
//! three invariants that make negotiation correct under reordering and
//! duplicate delivery, without a consensus protocol:
//!
//! - candidates arriving before the remote description are queued, then
//!   drained exactly once, in arrival order;
//! - after the first accepted answer, further answers are ignored;
//! - state transitions are monotonic except `Connected → Failed/Closed`.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{LinkState, PeerConnector};
use crate::core::error::SessionError;
use crate::core::signal::{SignalKind, SignalPayload};

/// Which side of the offer/answer exchange this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Progress of the connection establishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Initializing,
    /// Initiator only: offer published, answer outstanding.
    AwaitingAnswer,
    /// Responder only: waiting for the peer's offer.
    AwaitingOffer,
    /// Descriptions exchanged, transport still coming up.
    Negotiating,
    Connected,
    Failed,
    Closed,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Failed | NegotiationState::Closed)
    }
}

/// What the session should do after feeding the machine one signal.
#[derive(Debug)]
pub enum NegotiationOutcome {
    /// Nothing to publish.
    Handled,
    /// Publish this payload back through the relay.
    Reply(SignalKind, SignalPayload),
    /// The peer signalled `End`; tear the session down.
    PeerEnded,
}

/// Owns the offer/answer/candidate flow for one peer pair.
pub struct SessionNegotiator {
    role: Role,
    state: NegotiationState,
    connector: Arc<dyn PeerConnector>,
    /// Candidates held until the remote description is applied.
    candidate_queue: Vec<String>,
    remote_description_set: bool,
    /// Duplicate-answer guard: set when the first valid answer is applied.
    answered: bool,
}

impl SessionNegotiator {
    pub fn new(role: Role, connector: Arc<dyn PeerConnector>) -> Self {
        Self {
            role,
            state: NegotiationState::Initializing,
            connector,
            candidate_queue: Vec::new(),
            remote_description_set: false,
            answered: false,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Kick off the exchange. The initiator builds and returns its offer
    /// for the session to publish; the responder just starts waiting.
    pub async fn start(&mut self) -> Result<Option<SignalPayload>, SessionError> {
        match self.role {
            Role::Initiator => {
                let sdp = self.connector.create_offer().await?;
                self.advance(NegotiationState::AwaitingAnswer);
                Ok(Some(SignalPayload::Sdp(sdp)))
            }
            Role::Responder => {
                self.advance(NegotiationState::AwaitingOffer);
                Ok(None)
            }
        }
    }

    /// Feed one decoded inbound signal through the machine.
    ///
    /// Connector failures on offer/answer application surface as
    /// [`SessionError::NegotiationFailed`]; a bad candidate is logged and
    /// absorbed, matching the best-effort nature of candidate delivery.
    pub async fn handle_signal(
        &mut self,
        kind: SignalKind,
        payload: SignalPayload,
    ) -> Result<NegotiationOutcome, SessionError> {
        if self.state.is_terminal() {
            debug!(event = "signal_after_terminal", ?kind, "Ignoring signal in terminal state");
            return Ok(NegotiationOutcome::Handled);
        }
        match (kind, payload) {
            (SignalKind::Offer, SignalPayload::Sdp(sdp)) => self.on_offer(sdp).await,
            (SignalKind::Answer, SignalPayload::Sdp(sdp)) => self.on_answer(sdp).await,
            (SignalKind::Candidate, SignalPayload::Candidate(candidate)) => {
                self.on_candidate(candidate).await;
                Ok(NegotiationOutcome::Handled)
            }
            (SignalKind::End, SignalPayload::End) => {
                info!(event = "peer_ended", "Peer signalled end of session");
                self.advance(NegotiationState::Closed);
                Ok(NegotiationOutcome::PeerEnded)
            }
            (kind, payload) => {
                warn!(event = "signal_kind_mismatch", ?kind, ?payload, "Dropping inconsistent signal");
                Ok(NegotiationOutcome::Handled)
            }
        }
    }

    async fn on_offer(&mut self, sdp: String) -> Result<NegotiationOutcome, SessionError> {
        if self.role != Role::Responder {
            warn!(event = "offer_as_initiator", "Ignoring offer received in initiator role");
            return Ok(NegotiationOutcome::Handled);
        }
        if self.remote_description_set {
            debug!(event = "duplicate_offer", "Remote description already set; ignoring offer");
            return Ok(NegotiationOutcome::Handled);
        }

        let answer = self.connector.accept_offer(&sdp).await?;
        self.remote_description_set = true;
        self.drain_candidates().await;
        self.advance(NegotiationState::Negotiating);
        Ok(NegotiationOutcome::Reply(
            SignalKind::Answer,
            SignalPayload::Sdp(answer),
        ))
    }

    async fn on_answer(&mut self, sdp: String) -> Result<NegotiationOutcome, SessionError> {
        if self.role != Role::Initiator {
            warn!(event = "answer_as_responder", "Ignoring answer received in responder role");
            return Ok(NegotiationOutcome::Handled);
        }
        if self.answered {
            // A retried or duplicated relay delivery; the first answer won.
            debug!(event = "duplicate_answer", "Answer guard active; ignoring");
            return Ok(NegotiationOutcome::Handled);
        }

        self.connector.apply_answer(&sdp).await?;
        self.answered = true;
        self.remote_description_set = true;
        self.drain_candidates().await;
        self.advance(NegotiationState::Negotiating);
        Ok(NegotiationOutcome::Handled)
    }

    async fn on_candidate(&mut self, candidate: String) {
        if !self.remote_description_set {
            self.candidate_queue.push(candidate);
            return;
        }
        if let Err(e) = self.connector.add_candidate(&candidate).await {
            debug!(event = "candidate_apply_failed", error = %e, "Dropping candidate");
        }
    }

    /// Apply every queued candidate in arrival order. Runs once, right
    /// after the remote description is set; the queue is never refilled.
    async fn drain_candidates(&mut self) {
        let queued = std::mem::take(&mut self.candidate_queue);
        if queued.is_empty() {
            return;
        }
        debug!(event = "candidate_queue_drain", count = queued.len());
        for candidate in queued {
            if let Err(e) = self.connector.add_candidate(&candidate).await {
                debug!(event = "candidate_apply_failed", error = %e, "Dropping queued candidate");
            }
        }
    }

    /// Track a transport-level state change. Returns the terminal error
    /// when the link failed, so the session can tear down exactly once.
    pub fn on_link_state(&mut self, link: LinkState) -> Option<SessionError> {
        match link {
            LinkState::Connected => {
                self.advance(NegotiationState::Connected);
                None
            }
            LinkState::Disconnected => {
                // Transient: the transport may recover on its own.
                debug!(event = "link_transient_loss");
                None
            }
            LinkState::Failed => {
                self.advance(NegotiationState::Failed);
                Some(SessionError::NegotiationFailed("transport failed".into()))
            }
            LinkState::Closed => {
                if self.state != NegotiationState::Closed {
                    self.advance(NegotiationState::Closed);
                }
                Some(SessionError::NegotiationFailed("transport closed".into()))
            }
            LinkState::Connecting => None,
        }
    }

    /// Local teardown: release the queue and mark closed.
    pub fn close(&mut self) {
        self.candidate_queue.clear();
        if !self.state.is_terminal() {
            self.advance(NegotiationState::Closed);
        }
    }

    fn advance(&mut self, next: NegotiationState) {
        if self.state == next {
            return;
        }
        debug!(event = "negotiation_transition", from = ?self.state, to = ?next);
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::memory::MemoryConnector;
    use tokio::sync::mpsc;

    fn connectors() -> (Arc<MemoryConnector>, Arc<MemoryConnector>) {
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (b_tx, _b_rx) = mpsc::unbounded_channel();
        // Receivers dropped: unbounded senders still accept events.
        let (a, b) = MemoryConnector::pair(a_tx, b_tx);
        (a, b)
    }

    #[tokio::test]
    async fn test_candidates_queue_until_offer_then_drain_in_order() {
        let (_ignored, conn) = connectors();
        let mut neg = SessionNegotiator::new(Role::Responder, conn.clone());
        neg.start().await.unwrap();
        assert_eq!(neg.state(), NegotiationState::AwaitingOffer);

        // Candidates outrun the offer on the relay.
        for c in ["c1", "c2", "c3"] {
            neg.handle_signal(SignalKind::Candidate, SignalPayload::Candidate(c.into()))
                .await
                .unwrap();
        }
        assert!(conn.applied_candidates().is_empty());

        let outcome = neg
            .handle_signal(SignalKind::Offer, SignalPayload::Sdp("memory-offer".into()))
            .await
            .unwrap();
        assert!(matches!(outcome, NegotiationOutcome::Reply(SignalKind::Answer, _)));
        assert_eq!(conn.applied_candidates(), vec!["c1", "c2", "c3"]);

        // After the drain, candidates apply immediately and only once.
        neg.handle_signal(SignalKind::Candidate, SignalPayload::Candidate("c4".into()))
            .await
            .unwrap();
        assert_eq!(conn.applied_candidates(), vec!["c1", "c2", "c3", "c4"]);
    }

    #[tokio::test]
    async fn test_second_answer_is_a_noop() {
        let (conn, peer) = connectors();
        let mut neg = SessionNegotiator::new(Role::Initiator, conn.clone());
        let offer = neg.start().await.unwrap().unwrap();
        assert_eq!(neg.state(), NegotiationState::AwaitingAnswer);

        let answer = match offer {
            SignalPayload::Sdp(sdp) => peer.accept_offer(&sdp).await.unwrap(),
            other => panic!("expected sdp, got {other:?}"),
        };

        neg.handle_signal(SignalKind::Answer, SignalPayload::Sdp(answer.clone()))
            .await
            .unwrap();
        assert_eq!(neg.state(), NegotiationState::Negotiating);

        // A relay retry delivers the same answer again. The guard absorbs
        // it; re-applying would error on the connector.
        let outcome = neg
            .handle_signal(SignalKind::Answer, SignalPayload::Sdp(answer))
            .await
            .unwrap();
        assert!(matches!(outcome, NegotiationOutcome::Handled));
        assert_eq!(neg.state(), NegotiationState::Negotiating);
    }

    #[tokio::test]
    async fn test_offer_in_initiator_role_is_ignored() {
        let (conn, _peer) = connectors();
        let mut neg = SessionNegotiator::new(Role::Initiator, conn);
        neg.start().await.unwrap();

        let outcome = neg
            .handle_signal(SignalKind::Offer, SignalPayload::Sdp("memory-offer".into()))
            .await
            .unwrap();
        assert!(matches!(outcome, NegotiationOutcome::Handled));
        assert_eq!(neg.state(), NegotiationState::AwaitingAnswer);
    }

    #[tokio::test]
    async fn test_end_signal_closes_and_reports() {
        let (conn, _peer) = connectors();
        let mut neg = SessionNegotiator::new(Role::Responder, conn);
        neg.start().await.unwrap();

        let outcome = neg
            .handle_signal(SignalKind::End, SignalPayload::End)
            .await
            .unwrap();
        assert!(matches!(outcome, NegotiationOutcome::PeerEnded));
        assert_eq!(neg.state(), NegotiationState::Closed);

        // Terminal state absorbs anything that straggles in.
        let outcome = neg
            .handle_signal(SignalKind::Candidate, SignalPayload::Candidate("late".into()))
            .await
            .unwrap();
        assert!(matches!(outcome, NegotiationOutcome::Handled));
    }

    #[tokio::test]
    async fn test_link_failure_is_terminal() {
        let (conn, _peer) = connectors();
        let mut neg = SessionNegotiator::new(Role::Initiator, conn);
        neg.start().await.unwrap();

        assert!(neg.on_link_state(LinkState::Connecting).is_none());
        assert!(neg.on_link_state(LinkState::Disconnected).is_none());
        let err = neg.on_link_state(LinkState::Failed).unwrap();
        assert!(matches!(err, SessionError::NegotiationFailed(_)));
        assert_eq!(neg.state(), NegotiationState::Failed);
    }

    #[tokio::test]
    async fn test_close_releases_queued_candidates() {
        let (_ignored, conn) = connectors();
        let mut neg = SessionNegotiator::new(Role::Responder, conn.clone());
        neg.start().await.unwrap();
        neg.handle_signal(SignalKind::Candidate, SignalPayload::Candidate("c1".into()))
            .await
            .unwrap();

        neg.close();
        assert_eq!(neg.state(), NegotiationState::Closed);

        // A late offer must not resurrect the queue.
        neg.handle_signal(SignalKind::Offer, SignalPayload::Sdp("memory-offer".into()))
            .await
            .unwrap();
        assert!(conn.applied_candidates().is_empty());
    }
}
