//! Backhaul Protocol Definitions
//!
//! This crate defines the wire contract between the relay and its agents:
//! the WebSocket upgrade headers that identify control and data connections,
//! and the binary channel-open command sent over the control connection.

pub mod command;
pub mod handshake;

pub use command::{ChannelOpen, CommandError, CHANNEL_OPEN_LEN};
pub use handshake::{
    normalize_domain, session_id, write_session_id, ControlHandshake, DataHandshake, Handshake,
    HandshakeError, CHANNEL_ID_HEADER, CLIENT_DOMAIN_HEADER, CLIENT_UPSTREAM_HEADER,
    SERVER_KEY_HEADER, SESSION_ID_HEADER,
};

/// Channel identifier, scoped to one control connection
pub type ChannelId = u32;
