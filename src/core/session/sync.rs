//! Control-channel messages and the bus that carries them.
//!
//! Every control message is one UTF-8 text frame holding an
//! `action`-tagged JSON object:
//!
//! ```json
//! {"action": "play", "time": 12.0}
//! {"action": "url", "url": "https://..."}
//! {"action": "transferStart", "totalSize": 1024, "totalChunks": 1, "fileName": "a.mp3"}
//! ```
//!
//! There is no sequence numbering: ordering is transport ordering, and the
//! last message applied to the playback mirror wins. Concurrent local and
//! remote actions can race; the protocol accepts whichever lands last.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::core::connection::DirectTransport;
use crate::core::error::SessionError;

/// A typed control message on the direct transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum SyncMessage {
    /// Start playback from `time` seconds.
    Play { time: f64 },
    /// Pause playback at `time` seconds.
    Pause { time: f64 },
    /// Move the playhead to `time` seconds without changing play state.
    Seek { time: f64 },
    /// Replace the active media source with a remote stream URL.
    Url { url: String },
    /// Opaque chat text.
    Chat { message: String },
    /// A binary payload transfer begins; chunks follow as binary frames.
    #[serde(rename_all = "camelCase")]
    TransferStart {
        total_size: u64,
        total_chunks: u32,
        file_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    /// All chunks of the current transfer have been sent.
    TransferEnd,
}

impl SyncMessage {
    /// Decode one inbound text frame. Malformed frames are fatal for the
    /// frame only: the caller logs and drops them.
    pub fn decode(text: &str) -> Result<Self, SessionError> {
        serde_json::from_str(text).map_err(|e| SessionError::MalformedSignal(e.to_string()))
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("control message serialization is infallible")
    }
}

/// Fire-and-forget publisher for control messages.
pub struct SyncBus {
    transport: Arc<dyn DirectTransport>,
}

impl SyncBus {
    pub fn new(transport: Arc<dyn DirectTransport>) -> Self {
        Self { transport }
    }

    /// Publish a control message over the open transport.
    pub async fn publish(&self, message: &SyncMessage) -> Result<(), SessionError> {
        debug!(event = "sync_publish", message = ?message);
        self.transport.send_text(message.encode()).await
    }
}
