//! Peer pair identity.

use serde::{Deserialize, Serialize};

/// The two endpoints of a session and the remote's published key material.
///
/// Immutable for the session's lifetime. The public key is optional: peers
/// that have not published one still get a session, with signaling carried
/// in plaintext (see [`crate::core::signal::codec::SignalCodec`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerIdentity {
    /// Our id on the relay.
    pub local_id: String,
    /// The remote peer's id on the relay.
    pub remote_id: String,
    /// The remote's X25519 public key, base64-encoded, as published out of
    /// band. Imported lazily on first use and cached by the codec.
    pub remote_public_key: Option<String>,
}

impl PeerIdentity {
    pub fn new(
        local_id: impl Into<String>,
        remote_id: impl Into<String>,
        remote_public_key: Option<String>,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            remote_id: remote_id.into(),
            remote_public_key,
        }
    }
}
