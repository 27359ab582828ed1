//! WebSocket transport configuration

use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig as TungsteniteConfig;

use crate::{TransportError, TransportResult};

/// WebSocket-specific configuration
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// WebSocket path agents upgrade on (e.g., "/")
    pub path: String,

    /// Time allowed for an accepted TCP connection to complete its upgrade
    pub handshake_timeout: Duration,

    /// Maximum message size
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            handshake_timeout: Duration::from_secs(10),
            max_message_size: 16 * 1024 * 1024, // 16MB
        }
    }
}

impl WebSocketConfig {
    /// Set WebSocket path
    pub fn with_path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    /// Set handshake timeout
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.path.is_empty() || !self.path.starts_with('/') {
            return Err(TransportError::ConfigurationError(
                "WebSocket path must start with '/'".to_string(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(TransportError::ConfigurationError(
                "Maximum message size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether a request path addresses this endpoint
    pub fn matches_path(&self, path: &str) -> bool {
        let expected = self.path.trim_end_matches('/');
        path.trim_end_matches('/') == expected
    }

    pub(crate) fn protocol_config(&self) -> TungsteniteConfig {
        let mut config = TungsteniteConfig::default();
        config.max_message_size = Some(self.max_message_size);
        config.max_frame_size = Some(self.max_message_size);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(WebSocketConfig::default().validate().is_ok());
    }

    #[test]
    fn test_path_must_be_absolute() {
        let config = WebSocketConfig::default().with_path("tunnel");
        assert!(matches!(
            config.validate(),
            Err(TransportError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_matches_path() {
        let root = WebSocketConfig::default();
        assert!(root.matches_path("/"));
        assert!(!root.matches_path("/other"));

        let nested = WebSocketConfig::default().with_path("/backhaul");
        assert!(nested.matches_path("/backhaul"));
        assert!(nested.matches_path("/backhaul/"));
        assert!(!nested.matches_path("/"));
        assert!(!nested.matches_path("/backhaul/extra"));
    }
}
