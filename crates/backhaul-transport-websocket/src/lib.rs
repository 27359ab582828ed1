//! WebSocket transport for agent connections, using tokio-tungstenite
//!
//! Agents reach the relay over plain WebSocket upgrades. Two kinds of
//! connection share the same listener and are told apart by their
//! handshake headers (see [`backhaul_proto::handshake`]):
//!
//! - **Control**: one long-lived connection per agent. The relay sends
//!   4-byte channel-open commands as binary messages.
//! - **Data**: one short-lived connection per forwarded request. Binary
//!   message payloads are the raw forwarded bytes; [`WsByteStream`] turns
//!   the message stream back into an `AsyncRead + AsyncWrite` byte stream.

pub mod config;
pub mod connector;
pub mod error;
pub mod listener;
pub mod stream;

pub use config::WebSocketConfig;
pub use connector::AgentConnector;
pub use error::{TransportError, TransportResult};
pub use listener::{AgentListener, AgentSession};
pub use stream::WsByteStream;

pub use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, Role};
pub use tokio_tungstenite::tungstenite::Message;
pub use tokio_tungstenite::WebSocketStream;
