//! Session error taxonomy.
//!
//! Propagation policy: protocol-internal errors (a single malformed frame
//! or envelope) are absorbed: logged and dropped by the caller.
//! Session-terminal errors (negotiation failure, transport closed) are
//! surfaced exactly once through the session's `Ended` event, never thrown
//! across the capability boundary.

use thiserror::Error;

/// Errors surfaced by the peer session protocol.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The signaling relay rejected a publish or subscribe. Retried by the
    /// caller at a higher layer, not internally.
    #[error("signaling relay unavailable: {0}")]
    SignalingUnavailable(String),

    /// A signaling envelope failed to decode after both the encrypted and
    /// plaintext attempts. Dropped, logged, non-fatal for the session.
    #[error("malformed signal: {0}")]
    MalformedSignal(String),

    /// The offer/answer exchange or the transport itself failed before the
    /// session reached the connected state. Terminal: triggers teardown.
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    /// An operation needed the direct transport but it is not open.
    #[error("direct transport not ready")]
    TransportNotReady,

    /// The transport closed mid-chunk-stream. Terminal for that transfer
    /// only; partially received chunks are discarded on the peer side.
    #[error("transfer interrupted: {0}")]
    TransferInterrupted(String),

    /// The media backend could not perform a seek/play/pause. Surfaced to
    /// the caller per action, non-fatal for the session.
    #[error("media capability unavailable: {0}")]
    CapabilityUnavailable(String),
}
