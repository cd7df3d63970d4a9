//! tunelink: peer session protocol for synchronized two-party media
//! playback over an encrypted direct link.
//!
//! Two peers exchange encrypted signaling envelopes through a thin relay,
//! negotiate a direct data channel, and then drive each other through it:
//! play/pause/seek stay in lock-step, chat rides alongside, and a media
//! file can be shipped peer-to-peer in bounded chunks instead of being
//! streamed from a server.
//!
//! The crate is peer-symmetric and has no server-side component. External
//! concerns are consumed as narrow capabilities: the relay
//! ([`SignalRelay`]), the media element ([`MediaController`]), and the
//! direct transport ([`crate::core::connection::PeerConnector`], with a
//! WebRTC implementation in-tree).
//!
//! ```no_run
//! use tunelink::{MemoryRelay, PeerIdentity, Role, Session, SessionConfig, SessionParams};
//!
//! # async fn run() -> Result<(), tunelink::SessionError> {
//! let relay = MemoryRelay::new();
//! let (session, mut events) = Session::with_webrtc(
//!     SessionParams {
//!         identity: PeerIdentity::new("alice", "bob", None),
//!         role: Role::Initiator,
//!         config: SessionConfig::default(),
//!         local_secret: None,
//!     },
//!     relay,
//!     None,
//! )
//! .await?;
//! session.start().await?;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod core;

pub use crate::core::config::SessionConfig;
pub use crate::core::connection::negotiator::{NegotiationState, Role};
pub use crate::core::error::SessionError;
pub use crate::core::identity::PeerIdentity;
pub use crate::core::pipeline::transfer::{TransferDirection, TransferMetadata};
pub use crate::core::session::playback::{MediaController, PlaybackMirror, SourceDescriptor};
pub use crate::core::session::sync::SyncMessage;
pub use crate::core::session::{EndReason, Session, SessionEvent, SessionParams};
pub use crate::core::signal::relay::{MemoryRelay, SignalRelay};
pub use crate::core::signal::{SignalEnvelope, SignalKind};
