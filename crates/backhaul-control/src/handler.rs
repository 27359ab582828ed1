//! Agent session handling

use backhaul_proto::{ControlHandshake, DataHandshake};
use backhaul_transport_websocket::{
    AgentSession, CloseCode, CloseFrame, WebSocketStream, WsByteStream,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::bridge::DataConnection;
use crate::broker::ChannelBroker;
use crate::config::ControlConnectionConfig;
use crate::connection::ControlConnection;
use crate::error::{MatchError, SessionError};

/// Drives accepted agent connections through registration or matching
pub struct AgentHandler {
    broker: Arc<ChannelBroker>,
    control_config: ControlConnectionConfig,
}

impl AgentHandler {
    pub fn new(broker: Arc<ChannelBroker>, control_config: ControlConnectionConfig) -> Self {
        Self {
            broker,
            control_config,
        }
    }

    pub fn broker(&self) -> &Arc<ChannelBroker> {
        &self.broker
    }

    /// Handle one upgraded agent connection
    ///
    /// For a control connection this runs until the connection closes.
    pub async fn handle_session<S>(&self, session: AgentSession<S>) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        match session {
            AgentSession::Control {
                handshake,
                socket,
                remote_addr,
                session_id,
            } => {
                self.handle_control(handshake, socket, remote_addr, session_id)
                    .await
            }
            AgentSession::Data {
                handshake,
                socket,
                remote_addr,
            } => self.handle_data(handshake, socket, remote_addr).await,
        }
    }

    async fn handle_control<S>(
        &self,
        handshake: ControlHandshake,
        socket: WebSocketStream<S>,
        remote_addr: SocketAddr,
        session_id: String,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let registry = self.broker.registry();
        let connection = ControlConnection::spawn_session(
            session_id,
            socket,
            handshake.domain.clone(),
            handshake.upstream.clone(),
            remote_addr,
            &self.control_config,
        );

        registry
            .register(handshake.server_key.as_deref(), connection.clone())
            .await?;

        info!(
            "✅ Agent connected: {} -> {} (from {})",
            connection.domain, connection.upstream, remote_addr
        );

        connection.wait_closed().await;

        registry.unregister(&connection.domain, &connection);
        info!(
            "🔌 Agent disconnected: {} ({})",
            connection.domain, connection.connection_id
        );
        Ok(())
    }

    async fn handle_data<S>(
        &self,
        handshake: DataHandshake,
        mut socket: WebSocketStream<S>,
        remote_addr: SocketAddr,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let channel_id = handshake.channel_id;

        if !self
            .broker
            .registry()
            .authenticate(handshake.server_key.as_deref())
        {
            let error = MatchError::AuthenticationFailed(channel_id);
            warn!(
                "Rejected data connection from {} for {}: {}",
                remote_addr, handshake.domain, error
            );
            let frame = CloseFrame {
                code: CloseCode::Policy,
                reason: error.to_string().into(),
            };
            if let Err(e) = socket.close(Some(frame)).await {
                debug!("Failed to close rejected data connection: {}", e);
            }
            return Err(error.into());
        }

        let mut data =
            DataConnection::new(channel_id, Some(remote_addr), WsByteStream::new(socket));
        if let Some(session_id) = handshake.session_id {
            data = data.with_session_id(session_id);
        }
        debug!(
            "[{}] Data connection from {} for {} channel {}",
            data.connection_id, remote_addr, handshake.domain, channel_id
        );

        self.broker
            .match_incoming(&handshake.domain, channel_id, data)
            .await?;
        Ok(())
    }
}
