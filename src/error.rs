//! Error types for the realtime client

/// Result type alias using the realtime client Error
pub type Result<T> = std::result::Result<T, Error>;

/// Substrings that mark an error as permanent (never retried). Matched
/// case-insensitively against the full error message.
const PERMANENT_MARKERS: &[&str] = &[
    "unauthorized",
    "forbidden",
    "invalid api key",
    "api key",
    "credential",
    "permission",
    "authentication",
];

/// Errors that can occur in realtime session operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Signaling protocol error (malformed or unexpected frame)
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// Signaling transport closed unexpectedly
    #[error("Signaling transport closed: {0}")]
    SignalingClosed(String),

    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Frame carried a `type` tag outside the message catalog
    #[error("Unknown signaling message type: {0}")]
    UnknownMessage(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// Media session error (peer connection, tracks)
    #[error("Media session error: {0}")]
    MediaSessionError(String),

    /// Media track error (injector, local tracks)
    #[error("Media track error: {0}")]
    MediaTrackError(String),

    /// Server rejected a control request (prompt/image update)
    #[error("Control request rejected: {0}")]
    ControlRejected(String),

    /// A newer control request of the same kind replaced this one
    #[error("Control request superseded by a newer request")]
    Superseded,

    /// Operation exceeded its deadline. Always distinct from explicit failure.
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// Operation requires a connected session
    #[error("Not connected (state: {0})")]
    NotConnected(String),

    /// Connect called on a session that is already active
    #[error("Session already connected")]
    AlreadyConnected,

    /// Server pushed an error frame
    #[error("Server error: {0}")]
    ServerError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check whether this error must never be retried.
    ///
    /// Authorization and permission failures arrive as free-form text from the
    /// server, so classification is by case-insensitive substring against a
    /// fixed deny-list.
    pub fn is_permanent(&self) -> bool {
        if matches!(self, Error::InvalidConfig(_)) {
            return true;
        }
        let msg = self.to_string().to_lowercase();
        PERMANENT_MARKERS.iter().any(|m| msg.contains(m))
    }

    /// Check if this error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// Check if this error is retryable under the reconnect policy
    pub fn is_retryable(&self) -> bool {
        !self.is_permanent()
    }
}
