//! Agent errors

use backhaul_proto::HandshakeError;
use backhaul_transport_websocket::TransportError;
use thiserror::Error;

use crate::reconnect::ReconnectError;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid handshake: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Upstream must have a host and port: {0}")]
    InvalidUpstream(String),

    #[error(transparent)]
    Reconnect(#[from] ReconnectError),
}

/// Errors that can occur while forwarding one channel
#[derive(Debug, Error)]
pub enum ForwarderError {
    #[error("Failed to connect to upstream {address}: {source}")]
    ConnectionFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("Failed to open data connection: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid handshake: {0}")]
    Handshake(#[from] HandshakeError),
}
