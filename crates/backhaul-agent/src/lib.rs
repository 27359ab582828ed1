//! Backhaul agent
//!
//! Runs next to an origin that is not reachable from the internet. The agent
//! keeps a control connection to the relay and, for every channel-open
//! command, connects to the origin and opens a data connection back to the
//! relay carrying the forwarded bytes.
pub mod agent;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod reconnect;

pub use agent::{Agent, SessionEnd};
pub use config::AgentConfig;
pub use error::{AgentError, ForwarderError};
pub use forwarder::Forwarder;
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};
