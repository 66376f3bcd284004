//! Caller-owned local media tracks
//!
//! Tracks are attached to media sessions by shared handle. Rebuilding a
//! session (reconnect, ICE restart) re-attaches the same tracks; the session
//! never copies media and never stops tracks it did not create.

use std::sync::Arc;
use webrtc::track::track_local::TrackLocal;

/// Local audio and/or video tracks supplied by the caller
#[derive(Clone, Default)]
pub struct LocalMediaSource {
    audio: Option<Arc<dyn TrackLocal + Send + Sync>>,
    video: Option<Arc<dyn TrackLocal + Send + Sync>>,
}

impl LocalMediaSource {
    /// Source with both tracks
    pub fn new(
        audio: Option<Arc<dyn TrackLocal + Send + Sync>>,
        video: Option<Arc<dyn TrackLocal + Send + Sync>>,
    ) -> Self {
        Self { audio, video }
    }

    /// Audio-only source
    pub fn audio_only(track: Arc<dyn TrackLocal + Send + Sync>) -> Self {
        Self {
            audio: Some(track),
            video: None,
        }
    }

    /// Video-only source
    pub fn video_only(track: Arc<dyn TrackLocal + Send + Sync>) -> Self {
        Self {
            audio: None,
            video: Some(track),
        }
    }

    /// Audio track, if any
    pub fn audio(&self) -> Option<&Arc<dyn TrackLocal + Send + Sync>> {
        self.audio.as_ref()
    }

    /// Video track, if any
    pub fn video(&self) -> Option<&Arc<dyn TrackLocal + Send + Sync>> {
        self.video.as_ref()
    }

    /// All attached tracks
    pub fn tracks(&self) -> Vec<Arc<dyn TrackLocal + Send + Sync>> {
        self.audio
            .iter()
            .chain(self.video.iter())
            .cloned()
            .collect()
    }

    /// Whether the source carries no tracks
    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }
}

impl std::fmt::Debug for LocalMediaSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMediaSource")
            .field("audio", &self.audio.is_some())
            .field("video", &self.video.is_some())
            .finish()
    }
}
