//! Agent control loop

use backhaul_proto::{ChannelOpen, ControlHandshake};
use backhaul_transport_websocket::{AgentConnector, CloseCode, Message, TransportError};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::forwarder::Forwarder;
use crate::reconnect::{ReconnectError, ReconnectManager};

/// How a control session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Shutdown was requested locally
    Shutdown,
    /// The relay closed the connection; the reason is empty if none was given
    ClosedByRelay { code: Option<u16>, reason: String },
    /// The connection dropped without a close frame
    Lost,
}

/// Keeps one control connection to the relay alive and serves its channels
pub struct Agent {
    handshake: ControlHandshake,
    connector: Arc<AgentConnector>,
    forwarder: Arc<Forwarder>,
    config: AgentConfig,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let handshake = ControlHandshake::new(
            config.server_key.clone(),
            &config.domain,
            config.upstream.clone(),
        )?;
        let connector = Arc::new(AgentConnector::new(
            config.relay_url.clone(),
            Arc::new(config.websocket.clone()),
        )?);
        let forwarder = Arc::new(Forwarder::new(
            connector.clone(),
            config.server_key.clone(),
            handshake.domain.clone(),
            config.upstream_address()?,
        ));

        Ok(Self {
            handshake,
            connector,
            forwarder,
            config,
        })
    }

    /// Run until shutdown, reconnecting with backoff whenever the session ends
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), AgentError> {
        let mut reconnect = ReconnectManager::new(self.config.reconnect.clone());

        loop {
            match self.run_session(&shutdown, &mut reconnect).await {
                Ok(SessionEnd::Shutdown) => return Ok(()),
                Ok(SessionEnd::ClosedByRelay { code, reason }) => {
                    if code == Some(u16::from(CloseCode::Policy)) {
                        error!("❌ Relay rejected agent: {}", reason);
                    } else {
                        warn!("Relay closed the control connection: {}", reason);
                    }
                }
                Ok(SessionEnd::Lost) => warn!("Control connection lost"),
                Err(e) => error!("Failed to connect to relay: {}", e),
            }

            match reconnect.wait(&shutdown).await {
                Ok(()) => info!("🔄 Reconnecting to {}", self.config.relay_url),
                Err(ReconnectError::Cancelled) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Connect once and serve channel-open commands until the session ends
    pub async fn run_session(
        &self,
        shutdown: &CancellationToken,
        reconnect: &mut ReconnectManager,
    ) -> Result<SessionEnd, AgentError> {
        let (mut socket, session_id) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(SessionEnd::Shutdown),
            connected = self.connector.connect_control(&self.handshake) => connected?,
        };
        reconnect.reset();

        info!(
            "✅ Serving {} -> {} via {}",
            self.handshake.domain, self.handshake.upstream, self.config.relay_url
        );

        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => {
                    if let Err(e) = socket.close(None).await {
                        debug!("Failed to close control connection: {}", e);
                    }
                    return Ok(SessionEnd::Shutdown);
                }
                message = socket.next() => message,
            };

            match message {
                Some(Ok(Message::Binary(data))) => match ChannelOpen::decode(&data) {
                    Ok(command) => self.spawn_forward(command, session_id.clone()),
                    Err(e) => warn!("Ignoring malformed command: {}", e),
                },
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.into_owned()),
                        None => (None, String::new()),
                    };
                    // Complete the close handshake
                    let _ = socket.flush().await;
                    return Ok(SessionEnd::ClosedByRelay { code, reason });
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Control connection error: {}", TransportError::from(e));
                    return Ok(SessionEnd::Lost);
                }
                None => return Ok(SessionEnd::Lost),
            }
        }
    }

    fn spawn_forward(&self, command: ChannelOpen, session_id: Option<String>) {
        let forwarder = self.forwarder.clone();
        let channel_id = command.channel_id;
        tokio::spawn(async move {
            if let Err(e) = forwarder.forward(channel_id, session_id.as_deref()).await {
                warn!(channel_id = channel_id, "Channel forward failed: {}", e);
            }
        });
    }
}
