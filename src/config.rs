//! Configuration types for the realtime client

use crate::session::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Default deadline for a single connect attempt
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default deadline for a prompt-set acknowledgment
pub const DEFAULT_PROMPT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default deadline for an image-set acknowledgment
pub const DEFAULT_IMAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Main configuration for a realtime session
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Signaling endpoint (ws:// or wss://)
    pub base_url: String,

    /// API key, carried as a query parameter (the channel has no headers)
    pub api_key: String,

    /// Model identifier, carried as a query parameter
    pub model: String,

    /// Client identifier appended as the `client` query parameter
    pub client_tag: String,

    /// STUN server URLs (at least one required)
    pub stun_servers: Vec<String>,

    /// Base TURN server configurations
    pub turn_servers: Vec<TurnServerConfig>,

    /// Initial prompt sent before media negotiation starts
    pub initial_prompt: Option<InitialPrompt>,

    /// Initial reference image (base64) sent before media negotiation starts
    pub initial_image: Option<String>,

    /// Overall deadline for one connect attempt
    pub connect_timeout: Duration,

    /// Default deadline for prompt acknowledgments
    pub prompt_timeout: Duration,

    /// Default deadline for image acknowledgments
    pub image_timeout: Duration,

    /// Retry policy for initial connect and reconnect cycles
    pub retry: RetryPolicy,

    /// Video bitrate applied to outgoing offers (kbps); None picks the
    /// model profile's suggested bitrate when the model is built-in
    pub video_bitrate_kbps: Option<u32>,

    /// Preferred outgoing video codec, applied via SDP payload reordering
    pub preferred_video_codec: Option<VideoCodec>,
}

/// Prompt sent during the pre-handshake phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialPrompt {
    /// Prompt text
    pub text: String,
    /// Whether the server should enhance the prompt
    pub enhance: bool,
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Supported outgoing video codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoCodec {
    /// VP8 codec
    Vp8,
    /// VP9 codec
    Vp9,
    /// H.264 codec
    H264,
}

impl VideoCodec {
    /// Codec name as it appears in SDP rtpmap lines
    pub fn sdp_name(&self) -> &'static str {
        match self {
            VideoCodec::Vp8 => "VP8",
            VideoCodec::Vp9 => "VP9",
            VideoCodec::H264 => "H264",
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "wss://api.morphstream.ai/v1/realtime".to_string(),
            api_key: String::new(),
            model: "restyle-512".to_string(),
            client_tag: format!("morphstream-rust/{}", env!("CARGO_PKG_VERSION")),
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            initial_prompt: None,
            initial_image: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            prompt_timeout: DEFAULT_PROMPT_TIMEOUT,
            image_timeout: DEFAULT_IMAGE_TIMEOUT,
            retry: RetryPolicy::default(),
            video_bitrate_kbps: None,
            preferred_video_codec: None,
        }
    }
}

impl ClientConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `base_url` is not a valid WebSocket URL
    /// - `api_key` or `model` is empty
    /// - `stun_servers` is empty
    /// - `video_bitrate_kbps` is outside 100-20000
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if !self.base_url.starts_with("ws://") && !self.base_url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "base_url must start with ws:// or wss://, got {}",
                self.base_url
            )));
        }

        if self.api_key.is_empty() {
            return Err(Error::InvalidConfig("api_key is required".to_string()));
        }

        if self.model.is_empty() {
            return Err(Error::InvalidConfig("model is required".to_string()));
        }

        if self.stun_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN server is required".to_string(),
            ));
        }

        if let Some(kbps) = self.video_bitrate_kbps {
            if !(100..=20_000).contains(&kbps) {
                return Err(Error::InvalidConfig(format!(
                    "video_bitrate_kbps must be in range 100-20000, got {}",
                    kbps
                )));
            }
        }

        if let Some(image) = &self.initial_image {
            validate_base64_image(image)?;
        }

        Ok(())
    }

    /// Build the full signaling URL with api key, model, and client tag as
    /// query parameters
    pub fn signaling_url(&self) -> crate::Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| crate::Error::InvalidConfig(format!("base_url: {}", e)))?;

        url.query_pairs_mut()
            .append_pair("api_key", &self.api_key)
            .append_pair("model", &self.model)
            .append_pair("client", &self.client_tag);

        Ok(url)
    }

    /// Effective video bitrate for outgoing offers
    pub fn effective_bitrate_kbps(&self) -> Option<u32> {
        self.video_bitrate_kbps.or_else(|| {
            crate::model::ModelProfile::builtin(&self.model).map(|m| m.suggested_bitrate_kbps())
        })
    }
}

/// Check that an image payload is valid standard base64 before it goes on
/// the wire
pub(crate) fn validate_base64_image(image: &str) -> crate::Result<()> {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD
        .decode(image)
        .map_err(|e| crate::Error::InvalidConfig(format!("image is not valid base64: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> ClientConfig {
        ClientConfig {
            api_key: "sk-test".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_missing_api_key_fails() {
        let config = ClientConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_http_base_url_fails() {
        let mut config = valid_config();
        config.base_url = "http://localhost:8080".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_stun_servers_fails() {
        let mut config = valid_config();
        config.stun_servers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bitrate_bounds() {
        let mut config = valid_config();
        config.video_bitrate_kbps = Some(50);
        assert!(config.validate().is_err());

        config.video_bitrate_kbps = Some(2500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_initial_image_must_be_base64() {
        let mut config = valid_config();
        config.initial_image = Some("not valid base64!!!".to_string());
        assert!(config.validate().is_err());

        config.initial_image = Some("aGVsbG8=".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_signaling_url_query_params() {
        let config = valid_config();
        let url = config.signaling_url().unwrap();
        let query: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        assert!(query.contains(&("api_key".to_string(), "sk-test".to_string())));
        assert!(query.contains(&("model".to_string(), "restyle-512".to_string())));
        assert!(query.iter().any(|(k, _)| k == "client"));
    }

    #[test]
    fn test_effective_bitrate_falls_back_to_model() {
        let config = valid_config();
        assert_eq!(
            config.effective_bitrate_kbps(),
            Some(
                crate::model::ModelProfile::builtin("restyle-512")
                    .unwrap()
                    .suggested_bitrate_kbps()
            )
        );

        let mut config = valid_config();
        config.video_bitrate_kbps = Some(1234);
        assert_eq!(config.effective_bitrate_kbps(), Some(1234));
    }
}
