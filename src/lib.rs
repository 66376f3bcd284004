//! Morphstream realtime client
//!
//! Streams live audio/video to a remote inference service over a
//! peer-to-peer media session and receives the transformed media back.
//! Signaling (SDP, ICE candidates, and the application control protocol)
//! runs over a WebSocket carrying JSON frames; media rides WebRTC.
//!
//! # Example
//!
//! ```no_run
//! use morphstream::{ClientConfig, RealtimeSession, SessionEvent};
//!
//! # async fn run() -> morphstream::Result<()> {
//! let config = ClientConfig {
//!     api_key: "sk-...".to_string(),
//!     model: "restyle-512".to_string(),
//!     ..Default::default()
//! };
//!
//! let session = RealtimeSession::new(config)?;
//! let mut events = session.connect(None).await?;
//!
//! session.set_prompt("neon city at night", true).await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         SessionEvent::RemoteTrack(track) => {
//!             // consume transformed media
//!             let _ = track;
//!         }
//!         SessionEvent::State(state) => println!("session: {}", state),
//!         _ => {}
//!     }
//! }
//!
//! session.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub(crate) mod connection;
pub mod diagnostics;
pub mod error;
pub mod media;
pub mod model;
pub mod sdp;
pub mod session;
pub mod signaling;

pub use config::{ClientConfig, InitialPrompt, TurnServerConfig, VideoCodec};
pub use diagnostics::{DiagnosticsEvent, DiagnosticsSink};
pub use error::{Error, Result};
pub use media::{
    AudioClip, AudioInjector, IceServerEntry, LocalMediaSource, MediaSession, MediaSessionConfig,
    MediaSessionEvent, MediaSessionFactory, MediaSessionState, Playback, RtcMediaSessionFactory,
};
pub use model::ModelProfile;
pub use session::retry::RetryPolicy;
pub use session::{
    ConnectionState, RealtimeSession, SessionEvent, SessionEvents, SessionUpdate, SetImageOptions,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
