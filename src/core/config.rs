//! Centralized configuration constants for tunelink.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format details (frame shapes, envelope fields)
//! stay in their respective modules.

use std::time::Duration;
use webrtc::ice_transport::ice_server::RTCIceServer;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Payload chunk size in bytes (16 KB).
///
/// Sized to stay well under the 64 KB SCTP message limit common across
/// WebRTC implementations, so a chunk is never fragmented or rejected by
/// the remote's receive buffer.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// High water mark for the data channel send buffer (bytes).
///
/// When `buffered_amount` would exceed this value, the sender pauses chunk
/// transmission until the buffer drains below it. Keeps sender memory
/// bounded and leaves room for control frames between chunks.
pub const BUFFERED_AMOUNT_HIGH: usize = 1024 * 1024; // 1 MB

/// Poll interval while waiting for the send buffer to drain.
pub const BACKPRESSURE_POLL_INTERVAL: Duration = Duration::from_millis(50);

// ── Connection / Negotiation ─────────────────────────────────────────────────

/// Time allowed for the full offer/answer/candidate exchange to reach the
/// connected state before the session gives up with `NegotiationFailed`.
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Label of the single data channel carrying both control frames and chunks.
pub const SYNC_CHANNEL_LABEL: &str = "mediaSync";

/// Default ICE servers: public STUN plus a best-effort TURN relay.
pub fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![
        RTCIceServer {
            urls: vec!["stun:stun.l.google.com:19302".into()],
            ..Default::default()
        },
        RTCIceServer {
            urls: vec!["turn:openrelay.metered.ca:80".into()],
            username: "openrelayproject".into(),
            credential: "openrelayproject".into(),
        },
    ]
}

// ── Per-session overrides ────────────────────────────────────────────────────

/// Tunables a session is constructed with.
///
/// `Default` mirrors the module constants; tests shrink the timeout and the
/// water mark to keep runs fast.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Chunk size for outbound payload transfers.
    pub chunk_size: usize,
    /// Send-buffer high water mark for backpressure.
    pub buffered_amount_high: usize,
    /// Poll interval of the backpressure wait.
    pub backpressure_poll: Duration,
    /// Deadline for reaching the connected state.
    pub negotiation_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            buffered_amount_high: BUFFERED_AMOUNT_HIGH,
            backpressure_poll: BACKPRESSURE_POLL_INTERVAL,
            negotiation_timeout: NEGOTIATION_TIMEOUT,
        }
    }
}
