//! Backhaul Library - Public API for embedding a relay or an agent
//!
//! Backhaul exposes services that can only dial out. An agent next to the
//! service keeps a control WebSocket open to the relay and registers a
//! domain; when a request for that domain reaches the relay, the agent is
//! told to open a data connection for it and the two are spliced together.
//!
//! # Running a relay
//!
//! ```ignore
//! use backhaul_lib::{BrokerConfig, Relay, RelayConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RelayConfig::new("0.0.0.0:4443".parse()?, "0.0.0.0:8080".parse()?)
//!         .with_broker(BrokerConfig::default().with_shared_key("secret"));
//!
//!     let relay = Relay::start(config).await?;
//!     println!("Agents connect to ws://{}/", relay.agent_addr());
//!
//!     tokio::signal::ctrl_c().await?;
//!     relay.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Running an agent
//!
//! ```ignore
//! use backhaul_lib::{Agent, AgentConfig};
//! use tokio_util::sync::CancellationToken;
//! use url::Url;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AgentConfig::new(
//!     Url::parse("ws://relay.example.com:4443/")?,
//!     "app.example.com",
//!     Url::parse("http://127.0.0.1:3000")?,
//! )
//! .with_server_key("secret");
//!
//! let agent = Agent::new(config)?;
//! agent.run(CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Lower-level pieces
//!
//! The registry, broker and session handler are re-exported for
//! applications that want to accept agent connections on their own
//! listener, for example to authenticate agents differently.

pub mod relay;

pub use relay::{Relay, RelayConfig, RelayError, RelayHandle};

// Wire format
pub use backhaul_proto::{
    normalize_domain, ChannelId, ChannelOpen, ControlHandshake, DataHandshake, Handshake,
};

// Transport
pub use backhaul_transport_websocket::{
    AgentConnector, AgentListener, AgentSession, TransportError, WebSocketConfig, WsByteStream,
};

// Control plane
pub use backhaul_control::{
    bridge, AgentHandler, BridgeResult, BrokerConfig, BrokerError, ChannelBroker, ChannelHandle,
    ChannelState, ConnectionRegistry, ControlConnection, ControlConnectionConfig, DomainBinding,
    MatchError, RegistryError,
};

// HTTP edge
pub use backhaul_server_http::{HttpServer, HttpServerConfig, HttpServerError};

// Agent
pub use backhaul_agent::{
    Agent, AgentConfig, AgentError, ReconnectConfig, ReconnectManager, SessionEnd,
};
