//! Peer-to-peer media: session abstraction, production WebRTC backing,
//! caller-owned local tracks, and auxiliary audio injection

pub mod injector;
pub mod session;
pub mod source;
pub mod webrtc;

pub use injector::{AudioClip, AudioInjector, Playback};
pub use session::{
    IceServerEntry, MediaSession, MediaSessionConfig, MediaSessionEvent, MediaSessionFactory,
    MediaSessionState,
};
pub use source::LocalMediaSource;
pub use self::webrtc::RtcMediaSessionFactory;
