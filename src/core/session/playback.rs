//! Local playback state and the media-backend capability.
//!
//! The mirror is this peer's belief of the shared playback state. It is
//! written by local user actions and by applying remotely originated
//! control messages; whichever mutation happens last wins. Every remote
//! play/pause/seek carries the sender's position, so applying one also
//! reconciles clock drift between the peers.

use crate::core::error::SessionError;
use crate::core::session::sync::SyncMessage;

/// What the session is currently playing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceDescriptor {
    /// A remote stream URL supplied by either party.
    Remote(String),
    /// A payload received through a peer-to-peer transfer.
    Transferred { file_name: String },
}

/// The local belief of the shared playback state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaybackMirror {
    pub is_playing: bool,
    pub position_seconds: f64,
    pub source: Option<SourceDescriptor>,
}

impl PlaybackMirror {
    /// Fold one control message into the mirror. Chat and transfer
    /// messages do not touch playback state.
    pub fn apply(&mut self, message: &SyncMessage) {
        match message {
            SyncMessage::Play { time } => {
                self.is_playing = true;
                self.position_seconds = *time;
            }
            SyncMessage::Pause { time } => {
                self.is_playing = false;
                self.position_seconds = *time;
            }
            SyncMessage::Seek { time } => {
                self.position_seconds = *time;
            }
            SyncMessage::Url { url } => {
                self.reset_to(SourceDescriptor::Remote(url.clone()));
            }
            SyncMessage::Chat { .. }
            | SyncMessage::TransferStart { .. }
            | SyncMessage::TransferEnd => {}
        }
    }

    /// Replace the active source and reset playback to its start, paused.
    pub fn reset_to(&mut self, source: SourceDescriptor) {
        self.is_playing = false;
        self.position_seconds = 0.0;
        self.source = Some(source);
    }
}

/// The local media element, consumed as a narrow capability.
///
/// Failures are surfaced per action as `CapabilityUnavailable` and never
/// terminate the session.
pub trait MediaController: Send + Sync {
    fn seek_to(&self, seconds: f64) -> Result<(), SessionError>;
    fn play(&self) -> Result<(), SessionError>;
    fn pause(&self) -> Result<(), SessionError>;
    fn current_time(&self) -> Result<f64, SessionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seek_then_play_converges_from_any_state() {
        for initial in [
            PlaybackMirror::default(),
            PlaybackMirror {
                is_playing: true,
                position_seconds: 99.0,
                source: None,
            },
            PlaybackMirror {
                is_playing: false,
                position_seconds: 3.5,
                source: Some(SourceDescriptor::Remote("u".into())),
            },
        ] {
            let mut mirror = initial;
            mirror.apply(&SyncMessage::Seek { time: 42.0 });
            mirror.apply(&SyncMessage::Play { time: 42.0 });
            assert!(mirror.is_playing);
            assert_eq!(mirror.position_seconds, 42.0);
        }
    }

    #[test]
    fn test_pause_then_play_leaves_playing() {
        let mut mirror = PlaybackMirror::default();
        mirror.apply(&SyncMessage::Pause { time: 12.0 });
        mirror.apply(&SyncMessage::Play { time: 12.0 });
        assert!(mirror.is_playing);
        assert_eq!(mirror.position_seconds, 12.0);
    }

    #[test]
    fn test_seek_preserves_play_state() {
        let mut mirror = PlaybackMirror::default();
        mirror.apply(&SyncMessage::Play { time: 1.0 });
        mirror.apply(&SyncMessage::Seek { time: 7.0 });
        assert!(mirror.is_playing);
        assert_eq!(mirror.position_seconds, 7.0);

        mirror.apply(&SyncMessage::Pause { time: 7.0 });
        mirror.apply(&SyncMessage::Seek { time: 2.0 });
        assert!(!mirror.is_playing);
    }

    #[test]
    fn test_url_resets_mirror() {
        let mut mirror = PlaybackMirror {
            is_playing: true,
            position_seconds: 55.0,
            source: Some(SourceDescriptor::Transferred {
                file_name: "old.mp3".into(),
            }),
        };
        mirror.apply(&SyncMessage::Url { url: "https://yt/x".into() });
        assert_eq!(
            mirror,
            PlaybackMirror {
                is_playing: false,
                position_seconds: 0.0,
                source: Some(SourceDescriptor::Remote("https://yt/x".into())),
            }
        );
    }

    #[test]
    fn test_chat_does_not_touch_playback() {
        let mut mirror = PlaybackMirror {
            is_playing: true,
            position_seconds: 9.0,
            source: None,
        };
        let before = mirror.clone();
        mirror.apply(&SyncMessage::Chat { message: "hi".into() });
        assert_eq!(mirror, before);
    }
}
