//! Relay channel abstraction.
//!
//! The relay is a pure I/O boundary: it ferries signaling envelopes between
//! peer ids before the direct transport exists, with no protocol logic. No
//! ordering guarantee stronger than "at most publish order per sender" may
//! be assumed by upper layers; the negotiator tolerates candidates
//! arriving ahead of the answer they belong to.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use super::SignalEnvelope;
use crate::core::error::SessionError;

/// Out-of-band signaling channel between peers.
#[async_trait]
pub trait SignalRelay: Send + Sync {
    /// Publish an envelope addressed to `envelope.receiver_id`.
    ///
    /// Fails with [`SessionError::SignalingUnavailable`] on transport
    /// error; retrying is the caller's decision.
    async fn publish(&self, envelope: SignalEnvelope) -> Result<(), SessionError>;

    /// Subscribe to envelopes addressed to `self_id`.
    ///
    /// The stream is infinite while the relay is reachable; after a
    /// disconnect the caller may subscribe again.
    async fn subscribe(
        &self,
        self_id: &str,
    ) -> Result<mpsc::Receiver<SignalEnvelope>, SessionError>;
}

#[async_trait]
impl<T: SignalRelay + ?Sized> SignalRelay for Arc<T> {
    async fn publish(&self, envelope: SignalEnvelope) -> Result<(), SessionError> {
        (**self).publish(envelope).await
    }

    async fn subscribe(
        &self,
        self_id: &str,
    ) -> Result<mpsc::Receiver<SignalEnvelope>, SessionError> {
        (**self).subscribe(self_id).await
    }
}

// ── In-memory relay ──────────────────────────────────────────────────────────

/// In-process relay: a broadcast bus filtered per subscriber id.
///
/// Serves tests and same-process simulations; any networked backend that
/// can deliver addressed rows implements [`SignalRelay`] the same way.
pub struct MemoryRelay {
    bus: broadcast::Sender<SignalEnvelope>,
    /// Keeps the bus alive while no session is subscribed.
    _anchor: broadcast::Receiver<SignalEnvelope>,
    down: AtomicBool,
}

impl MemoryRelay {
    pub fn new() -> Arc<Self> {
        let (bus, anchor) = broadcast::channel(256);
        Arc::new(Self {
            bus,
            _anchor: anchor,
            down: AtomicBool::new(false),
        })
    }

    /// Simulate relay outage: subsequent publishes fail.
    pub fn shut_down(&self) {
        self.down.store(true, Ordering::Relaxed);
    }
}

#[async_trait]
impl SignalRelay for MemoryRelay {
    async fn publish(&self, envelope: SignalEnvelope) -> Result<(), SessionError> {
        if self.down.load(Ordering::Relaxed) {
            return Err(SessionError::SignalingUnavailable("relay is down".into()));
        }
        self.bus
            .send(envelope)
            .map_err(|e| SessionError::SignalingUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(
        &self,
        self_id: &str,
    ) -> Result<mpsc::Receiver<SignalEnvelope>, SessionError> {
        if self.down.load(Ordering::Relaxed) {
            return Err(SessionError::SignalingUnavailable("relay is down".into()));
        }
        let mut bus_rx = self.bus.subscribe();
        let (tx, rx) = mpsc::channel(64);
        let self_id = self_id.to_string();
        tokio::spawn(async move {
            loop {
                match bus_rx.recv().await {
                    Ok(env) if env.receiver_id == self_id => {
                        if tx.send(env).await.is_err() {
                            break; // subscriber gone
                        }
                    }
                    Ok(_) => {} // addressed to another peer
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(event = "relay_subscriber_lagged", dropped = n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::signal::SignalKind;

    fn env(from: &str, to: &str) -> SignalEnvelope {
        SignalEnvelope {
            sender_id: from.into(),
            receiver_id: to.into(),
            kind: SignalKind::Candidate,
            signal_data: "{}".into(),
        }
    }

    #[tokio::test]
    async fn test_delivers_only_to_addressee() {
        let relay = MemoryRelay::new();
        let mut bob = relay.subscribe("bob").await.unwrap();
        let mut carol = relay.subscribe("carol").await.unwrap();

        relay.publish(env("alice", "bob")).await.unwrap();
        relay.publish(env("alice", "carol")).await.unwrap();

        assert_eq!(bob.recv().await.unwrap().receiver_id, "bob");
        assert_eq!(carol.recv().await.unwrap().receiver_id, "carol");
        assert!(bob.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_preserves_publish_order_per_sender() {
        let relay = MemoryRelay::new();
        let mut bob = relay.subscribe("bob").await.unwrap();

        for i in 0..5 {
            let mut e = env("alice", "bob");
            e.signal_data = format!("{{\"n\":{i}}}");
            relay.publish(e).await.unwrap();
        }
        for i in 0..5 {
            let got = bob.recv().await.unwrap();
            assert_eq!(got.signal_data, format!("{{\"n\":{i}}}"));
        }
    }

    #[tokio::test]
    async fn test_outage_reports_signaling_unavailable() {
        let relay = MemoryRelay::new();
        relay.shut_down();
        assert!(matches!(
            relay.publish(env("alice", "bob")).await,
            Err(SessionError::SignalingUnavailable(_))
        ));
    }
}
