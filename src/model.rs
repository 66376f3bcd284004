//! Model profile metadata
//!
//! Each realtime model the inference service exposes has a fixed frame rate
//! and output geometry. The identifier is carried as the `model` query
//! parameter on the signaling URL; frame rate and dimensions feed the default
//! video bitrate applied during SDP adjustment.

/// A realtime model profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelProfile {
    /// Model identifier sent to the service
    pub id: &'static str,
    /// Output frame rate in frames per second
    pub frame_rate: u32,
    /// Output width in pixels
    pub width: u32,
    /// Output height in pixels
    pub height: u32,
}

/// Built-in model profiles known to this client version
pub const BUILTIN_MODELS: &[ModelProfile] = &[
    ModelProfile {
        id: "restyle-512",
        frame_rate: 25,
        width: 512,
        height: 512,
    },
    ModelProfile {
        id: "restyle-720p",
        frame_rate: 25,
        width: 1280,
        height: 704,
    },
    ModelProfile {
        id: "avatar-512",
        frame_rate: 25,
        width: 512,
        height: 512,
    },
];

impl ModelProfile {
    /// Look up a built-in profile by identifier
    pub fn builtin(id: &str) -> Option<&'static ModelProfile> {
        BUILTIN_MODELS.iter().find(|m| m.id == id)
    }

    /// Suggested video bitrate in kbps for this profile
    ///
    /// Scales with pixel rate; clamped to a range that keeps the service's
    /// decoder happy.
    pub fn suggested_bitrate_kbps(&self) -> u32 {
        let pixel_rate = self.width as u64 * self.height as u64 * self.frame_rate as u64;
        // ~0.09 bits per pixel, expressed in kbps
        ((pixel_rate * 9 / 100) / 1000).clamp(800, 6000) as u32
    }
}
