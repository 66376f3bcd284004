//! Signaling message catalog
//!
//! Frames are UTF-8 JSON objects with a `type` discriminator. Two families
//! share the channel: transport negotiation (ready/offer/answer/candidates and
//! ICE restart) and application control (prompt/image updates, their
//! acknowledgments, generation ticks, session announcement). The catalog is a
//! closed union; a frame with a tag outside it is a distinct error, never
//! silently dropped.

use serde::{Deserialize, Serialize};

/// ICE candidate payload carried in both directions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IceCandidatePayload {
    /// Candidate string
    pub candidate: String,

    /// SDP media ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    /// SDP media line index
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// Messages sent by the client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Media session constructed; ready for offer/answer exchange
    Ready,

    /// Local SDP offer
    Offer {
        /// SDP offer string
        sdp: String,
    },

    /// Local SDP answer (remote-offer flow)
    Answer {
        /// SDP answer string
        sdp: String,
    },

    /// Local ICE candidate
    IceCandidate {
        /// Candidate payload
        #[serde(flatten)]
        candidate: IceCandidatePayload,
    },

    /// Update the generation prompt
    SetPrompt {
        /// Prompt text
        prompt: String,
        /// Whether the server should enhance the prompt
        enhance: bool,
    },

    /// Update the reference image (None clears it); may carry a prompt
    SetImage {
        /// Base64 image payload, null to clear
        image: Option<String>,
        /// Optional prompt riding along
        #[serde(skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
        /// Optional enhance flag riding along
        #[serde(skip_serializing_if = "Option::is_none")]
        enhance: Option<bool>,
    },
}

/// Messages received from the server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Server directs the client to create and send a local offer
    Ready,

    /// Remote SDP offer
    Offer {
        /// SDP offer string
        sdp: String,
    },

    /// Remote SDP answer
    Answer {
        /// SDP answer string
        sdp: String,
    },

    /// Remote ICE candidate
    IceCandidate {
        /// Candidate payload
        #[serde(flatten)]
        candidate: IceCandidatePayload,
    },

    /// Rebuild the media session with fresh relay credentials
    IceRestart {
        /// TURN server URL
        url: String,
        /// TURN username
        username: String,
        /// TURN credential
        credential: String,
    },

    /// Server-side error
    Error {
        /// Error description
        message: String,
    },

    /// Acknowledgment of a prompt update, correlated by echoed text
    PromptAck {
        /// Echo of the prompt text this acknowledges
        prompt: String,
        /// Whether the update was applied
        success: bool,
        /// Failure reason when not applied
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Acknowledgment of an image update
    ImageAck {
        /// Whether the update was applied
        success: bool,
        /// Failure reason when not applied
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Media is actively being transformed
    GenerationStarted,

    /// Transformation paused; the session remains connected
    GenerationEnded,

    /// Server-assigned session identifier
    SessionId {
        /// Opaque session identifier
        session_id: String,
    },
}

/// Tags in the server catalog, used to distinguish a malformed known frame
/// from an unknown one
const SERVER_TAGS: &[&str] = &[
    "ready",
    "offer",
    "answer",
    "ice-candidate",
    "ice-restart",
    "error",
    "prompt-ack",
    "image-ack",
    "generation-started",
    "generation-ended",
    "session-id",
];

impl ServerMessage {
    /// Parse a frame, distinguishing unknown tags from malformed frames
    pub fn parse(text: &str) -> crate::Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text).map_err(|e| {
            crate::Error::SerializationError(format!("invalid signaling frame: {}", e))
        })?;

        let tag = value
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                crate::Error::SignalingError("frame missing `type` discriminator".to_string())
            })?
            .to_string();

        if !SERVER_TAGS.contains(&tag.as_str()) {
            return Err(crate::Error::UnknownMessage(tag));
        }

        serde_json::from_value(value).map_err(|e| {
            crate::Error::SerializationError(format!("malformed `{}` frame: {}", tag, e))
        })
    }
}

impl ClientMessage {
    /// Serialize to a JSON frame
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| {
            crate::Error::SerializationError(format!("failed to serialize frame: {}", e))
        })
    }
}
