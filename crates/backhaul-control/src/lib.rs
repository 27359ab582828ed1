//! Control plane for the backhaul relay
//!
//! Agents dial out to the relay and register a domain over a long-lived
//! control connection. When a request for that domain arrives, the
//! [`ChannelBroker`] allocates a channel ID, sends it to the agent, and waits
//! for the agent to open a data connection tagged with the same ID. The
//! matched data connection is then bridged to the requester.
pub mod allocator;
pub mod bridge;
pub mod broker;
pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod registry;

pub use allocator::ChannelIdAllocator;
pub use bridge::{bridge, BoxedStream, BridgeResult, BridgeSide, ByteStream, DataConnection};
pub use broker::{ChannelBroker, ChannelHandle};
pub use channel::{ChannelLease, ChannelState, ChannelTable};
pub use config::{BrokerConfig, ControlConnectionConfig};
pub use connection::{ConnectionState, ControlConnection};
pub use error::{BrokerError, MatchError, RegistryError, SessionError};
pub use handler::AgentHandler;
pub use registry::{ConnectionRegistry, DomainBinding};
