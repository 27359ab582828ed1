//! Relay assembly: agent listener, control plane and HTTP edge in one process

use backhaul_control::{
    AgentHandler, BrokerConfig, ChannelBroker, ConnectionRegistry, ControlConnectionConfig,
};
use backhaul_server_http::{HttpServer, HttpServerConfig, HttpServerError};
use backhaul_transport_websocket::{AgentListener, TransportError, WebSocketConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Agent listener error: {0}")]
    Transport(#[from] TransportError),

    #[error("HTTP edge error: {0}")]
    HttpServer(#[from] HttpServerError),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Where agents connect their control and data WebSockets
    pub agent_addr: SocketAddr,
    /// Where public HTTP requests arrive
    pub http_addr: SocketAddr,
    pub websocket: WebSocketConfig,
    pub broker: BrokerConfig,
    pub control: ControlConnectionConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            agent_addr: SocketAddr::from(([0, 0, 0, 0], 4443)),
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            websocket: WebSocketConfig::default(),
            broker: BrokerConfig::default(),
            control: ControlConnectionConfig::default(),
        }
    }
}

impl RelayConfig {
    pub fn new(agent_addr: SocketAddr, http_addr: SocketAddr) -> Self {
        Self {
            agent_addr,
            http_addr,
            ..Default::default()
        }
    }

    pub fn with_broker(mut self, broker: BrokerConfig) -> Self {
        self.broker = broker;
        self
    }

    pub fn with_websocket(mut self, websocket: WebSocketConfig) -> Self {
        self.websocket = websocket;
        self
    }

    pub fn with_control(mut self, control: ControlConnectionConfig) -> Self {
        self.control = control;
        self
    }

    fn validate(&self) -> Result<(), RelayError> {
        if self.agent_addr == self.http_addr && self.agent_addr.port() != 0 {
            return Err(RelayError::ConfigError(format!(
                "Agent listener and HTTP edge cannot share {}",
                self.agent_addr
            )));
        }
        if self.broker.channel_open_timeout.is_zero() {
            return Err(RelayError::ConfigError(
                "Channel open timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Entry point for running a relay
pub struct Relay;

impl Relay {
    /// Bind both listeners and start serving
    ///
    /// Returns once both sockets are bound; serving continues in background
    /// tasks until [`RelayHandle::shutdown`] is called.
    pub async fn start(config: RelayConfig) -> Result<RelayHandle, RelayError> {
        config.validate()?;

        let registry = Arc::new(ConnectionRegistry::new(config.broker.shared_key.clone()));
        let broker = Arc::new(ChannelBroker::new(registry.clone(), &config.broker));
        let handler = Arc::new(AgentHandler::new(broker.clone(), config.control.clone()));

        if config.broker.shared_key.is_none() {
            warn!("⚠️  No shared key configured, any agent may register any domain");
        }

        let listener = AgentListener::bind(config.agent_addr, Arc::new(config.websocket)).await?;
        let agent_addr = listener.local_addr()?;

        let http_server = HttpServer::bind(
            HttpServerConfig {
                bind_addr: config.http_addr,
            },
            broker.clone(),
        )
        .await?;
        let http_addr = http_server.local_addr()?;

        let shutdown = CancellationToken::new();
        let mut tasks = JoinSet::new();

        tasks.spawn(accept_agents(listener, handler, shutdown.clone()));

        let http_shutdown = shutdown.clone();
        tasks.spawn(async move {
            tokio::select! {
                _ = http_shutdown.cancelled() => {}
                result = http_server.serve() => {
                    if let Err(e) = result {
                        error!("❌ HTTP edge error: {}", e);
                    }
                }
            }
        });

        info!(
            "🚀 Relay running: agents on {}, HTTP on {}",
            agent_addr, http_addr
        );

        Ok(RelayHandle {
            agent_addr,
            http_addr,
            registry,
            broker,
            shutdown,
            tasks,
        })
    }
}

async fn accept_agents(
    listener: AgentListener,
    handler: Arc<AgentHandler>,
    shutdown: CancellationToken,
) {
    let config = listener.config();

    loop {
        let (stream, remote_addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept agent connection: {}", e);
                    continue;
                }
            },
        };

        let handler = handler.clone();
        let config = config.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let session = match AgentListener::upgrade(stream, remote_addr, &config).await {
                Ok(session) => session,
                Err(e) => {
                    warn!("Rejected agent connection from {}: {}", remote_addr, e);
                    return;
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Dropping agent session from {} on shutdown", remote_addr);
                }
                result = handler.handle_session(session) => {
                    if let Err(e) = result {
                        warn!("Agent session from {} failed: {}", remote_addr, e);
                    }
                }
            }
        });
    }

    debug!("Agent accept loop stopped");
}

/// A running relay
pub struct RelayHandle {
    agent_addr: SocketAddr,
    http_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    broker: Arc<ChannelBroker>,
    shutdown: CancellationToken,
    tasks: JoinSet<()>,
}

impl RelayHandle {
    pub fn agent_addr(&self) -> SocketAddr {
        self.agent_addr
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    pub fn broker(&self) -> Arc<ChannelBroker> {
        self.broker.clone()
    }

    /// Token cancelled when the relay shuts down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Close every agent control connection, stop accepting and wait for
    /// the listener tasks to finish
    pub async fn shutdown(mut self) {
        info!("Shutting down relay");

        for binding in self.registry.list() {
            if let Some(connection) = self.registry.resolve(&binding.domain) {
                connection.close("Relay shutting down").await;
            }
        }
        self.shutdown.cancel();

        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                error!("Relay task failed: {}", e);
            }
        }
    }
}
