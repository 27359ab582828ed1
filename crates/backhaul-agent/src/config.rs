//! Agent configuration

use backhaul_transport_websocket::WebSocketConfig;
use url::Url;

use crate::error::AgentError;
use crate::reconnect::ReconnectConfig;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Relay agent endpoint (ws://host:port/path)
    pub relay_url: Url,
    /// Shared secret presented to the relay
    pub server_key: Option<String>,
    /// Domain this agent serves
    pub domain: String,
    /// Local origin requests are forwarded to
    pub upstream: Url,
    pub websocket: WebSocketConfig,
    pub reconnect: ReconnectConfig,
}

impl AgentConfig {
    pub fn new(relay_url: Url, domain: impl Into<String>, upstream: Url) -> Self {
        Self {
            relay_url,
            server_key: None,
            domain: domain.into(),
            upstream,
            websocket: WebSocketConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn with_server_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.server_key = if key.is_empty() { None } else { Some(key) };
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// `host:port` the agent dials for every forwarded request
    pub fn upstream_address(&self) -> Result<String, AgentError> {
        let host = self
            .upstream
            .host_str()
            .ok_or_else(|| AgentError::InvalidUpstream(self.upstream.to_string()))?;
        let port = self
            .upstream
            .port_or_known_default()
            .ok_or_else(|| AgentError::InvalidUpstream(self.upstream.to_string()))?;
        Ok(format!("{}:{}", host, port))
    }
}
