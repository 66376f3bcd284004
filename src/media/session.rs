//! Media session abstraction
//!
//! The peer-to-peer media layer sits behind [`MediaSession`] and
//! [`MediaSessionFactory`] so the connection logic can be exercised against a
//! scripted implementation. The production factory lives in
//! [`super::webrtc`].

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::track::track_remote::TrackRemote;

use super::source::LocalMediaSource;
use crate::signaling::IceCandidatePayload;
use crate::Result;

/// Lifecycle state of a media session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaSessionState {
    /// Negotiation in progress
    Connecting,
    /// Media flowing
    Connected,
    /// Transport lost, possibly recoverable by the peer
    Disconnected,
    /// Negotiation or transport failed terminally
    Failed,
    /// Locally closed
    Closed,
}

/// Events emitted by a media session
#[derive(Debug)]
pub enum MediaSessionEvent {
    /// Session transitioned to a new state
    StateChanged(MediaSessionState),
    /// A local ICE candidate to forward over signaling
    LocalIceCandidate(IceCandidatePayload),
    /// A remote track arrived carrying transformed media
    RemoteTrack(Arc<TrackRemote>),
}

/// A single ICE server with optional relay credentials
#[derive(Debug, Clone, PartialEq)]
pub struct IceServerEntry {
    /// Server URLs (`stun:` or `turn:` scheme)
    pub urls: Vec<String>,
    /// TURN username; empty for STUN
    pub username: String,
    /// TURN credential; empty for STUN
    pub credential: String,
}

impl IceServerEntry {
    /// STUN entry without credentials
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: String::new(),
            credential: String::new(),
        }
    }

    /// TURN entry with a credential pair
    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: username.into(),
            credential: credential.into(),
        }
    }
}

/// Per-attempt media session parameters
///
/// The ICE server list is scoped to one session build; restart credentials
/// pushed by the server are appended for the rebuilt session only and never
/// leak back into the client configuration.
#[derive(Debug, Clone)]
pub struct MediaSessionConfig {
    /// ICE servers for this attempt
    pub ice_servers: Vec<IceServerEntry>,
}

/// One peer-to-peer media session
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Create a local offer and set it as the local description
    async fn create_offer(&self) -> Result<String>;

    /// Apply a remote offer and produce the local answer
    async fn accept_offer(&self, sdp: &str) -> Result<String>;

    /// Apply the remote answer to a local offer
    async fn accept_answer(&self, sdp: &str) -> Result<()>;

    /// Feed a remote ICE candidate into the session
    async fn add_remote_candidate(&self, candidate: IceCandidatePayload) -> Result<()>;

    /// Tear the session down; idempotent
    async fn close(&self) -> Result<()>;
}

/// Builds media sessions; one call per connection attempt
#[async_trait]
pub trait MediaSessionFactory: Send + Sync {
    /// Create a session, attaching the caller's local tracks by reference
    /// and emitting lifecycle events on `events`
    async fn create(
        &self,
        config: MediaSessionConfig,
        local: Option<&LocalMediaSource>,
        events: mpsc::UnboundedSender<MediaSessionEvent>,
    ) -> Result<Arc<dyn MediaSession>>;
}
