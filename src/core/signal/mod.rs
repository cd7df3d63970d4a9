//! Signaling envelopes exchanged through the out-of-band relay.
//!
//! One envelope per signaling event: `{sender_id, receiver_id, type,
//! signal_data}`. `signal_data` is either `{"encrypted": "<base64>"}` or a
//! plain JSON object carrying `sdp` or `candidate`. Envelopes are created
//! per event, never persisted, and consumed once.

pub mod codec;
pub mod relay;

use serde::{Deserialize, Serialize};

/// The four signaling event types the relay ferries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    End,
}

/// A signaling event addressed from one peer to another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub sender_id: String,
    pub receiver_id: String,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    /// Opaque negotiation blob: encrypted wrapper or plaintext JSON.
    pub signal_data: String,
}

/// A decoded signaling payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    /// A serialized session description (offer or answer).
    Sdp(String),
    /// A serialized network-reachability candidate.
    Candidate(String),
    /// Session termination marker; carries no data.
    End,
}

/// Plaintext JSON shape inside `signal_data`.
///
/// Mirrors the wire format: exactly one of `sdp` / `candidate` is set for
/// offer/answer/candidate envelopes, neither for `end`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct SignalBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<String>,
}

impl SignalPayload {
    pub(crate) fn to_body(&self) -> SignalBody {
        match self {
            SignalPayload::Sdp(sdp) => SignalBody {
                sdp: Some(sdp.clone()),
                ..Default::default()
            },
            SignalPayload::Candidate(candidate) => SignalBody {
                candidate: Some(candidate.clone()),
                ..Default::default()
            },
            SignalPayload::End => SignalBody::default(),
        }
    }

    pub(crate) fn from_body(kind: SignalKind, body: SignalBody) -> Option<Self> {
        match kind {
            SignalKind::Offer | SignalKind::Answer => body.sdp.map(SignalPayload::Sdp),
            SignalKind::Candidate => body.candidate.map(SignalPayload::Candidate),
            SignalKind::End => Some(SignalPayload::End),
        }
    }
}
