//! WebSocket listener for agent connections

use backhaul_proto::{write_session_id, ControlHandshake, DataHandshake, Handshake};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};

use crate::config::WebSocketConfig;
use crate::{TransportError, TransportResult};

/// An upgraded agent connection, classified by its handshake
#[derive(Debug)]
pub enum AgentSession<S> {
    Control {
        handshake: ControlHandshake,
        socket: WebSocketStream<S>,
        remote_addr: SocketAddr,
        /// Issued to the agent in the upgrade response
        session_id: String,
    },
    Data {
        handshake: DataHandshake,
        socket: WebSocketStream<S>,
        remote_addr: SocketAddr,
    },
}

impl<S> AgentSession<S> {
    pub fn remote_addr(&self) -> SocketAddr {
        match self {
            AgentSession::Control { remote_addr, .. } | AgentSession::Data { remote_addr, .. } => {
                *remote_addr
            }
        }
    }
}

/// Listener accepting agent connections
///
/// `accept` only accepts the TCP connection; the WebSocket upgrade runs in
/// [`AgentListener::upgrade`] so a slow agent never stalls the accept loop.
pub struct AgentListener {
    tcp_listener: TcpListener,
    config: Arc<WebSocketConfig>,
}

impl std::fmt::Debug for AgentListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentListener")
            .field("local_addr", &self.tcp_listener.local_addr())
            .field("path", &self.config.path)
            .finish()
    }
}

impl AgentListener {
    pub async fn bind(bind_addr: SocketAddr, config: Arc<WebSocketConfig>) -> TransportResult<Self> {
        config.validate()?;

        let tcp_listener =
            TcpListener::bind(bind_addr)
                .await
                .map_err(|e| TransportError::BindError {
                    address: bind_addr.ip().to_string(),
                    port: bind_addr.port(),
                    reason: e.to_string(),
                })?;

        let local_addr = tcp_listener.local_addr()?;
        info!(
            "Agent listener bound to ws://{}{}",
            local_addr, config.path
        );

        Ok(Self {
            tcp_listener,
            config,
        })
    }

    pub async fn accept(&self) -> TransportResult<(TcpStream, SocketAddr)> {
        let (stream, remote_addr) = self.tcp_listener.accept().await?;
        debug!("Incoming agent TCP connection from {}", remote_addr);
        Ok((stream, remote_addr))
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.tcp_listener
            .local_addr()
            .map_err(TransportError::IoError)
    }

    pub fn config(&self) -> Arc<WebSocketConfig> {
        self.config.clone()
    }

    /// Perform the WebSocket upgrade and read the handshake headers
    ///
    /// Requests on the wrong path are refused with 404, malformed handshakes
    /// with 400; both before the upgrade completes. Control upgrades are
    /// answered with a fresh session ID.
    pub async fn upgrade<S>(
        stream: S,
        remote_addr: SocketAddr,
        config: &WebSocketConfig,
    ) -> TransportResult<AgentSession<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut handshake: Option<Handshake> = None;
        let mut rejection: Option<String> = None;
        let session_id = format!("ctl-{}", uuid::Uuid::new_v4());

        let callback = |req: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            if !config.matches_path(req.uri().path()) {
                let reason = format!("Unknown WebSocket path {}", req.uri().path());
                let error = reject(StatusCode::NOT_FOUND, &reason);
                rejection = Some(reason);
                return Err(error);
            }

            match Handshake::from_headers(req.headers()) {
                Ok(parsed) => {
                    if let Handshake::Control(_) = parsed {
                        if let Err(e) = write_session_id(response.headers_mut(), &session_id) {
                            let reason = e.to_string();
                            let error = reject(StatusCode::INTERNAL_SERVER_ERROR, &reason);
                            rejection = Some(reason);
                            return Err(error);
                        }
                    }
                    handshake = Some(parsed);
                    Ok(response)
                }
                Err(e) => {
                    let reason = e.to_string();
                    let error = reject(StatusCode::BAD_REQUEST, &reason);
                    rejection = Some(reason);
                    Err(error)
                }
            }
        };

        let upgraded = tokio::time::timeout(
            config.handshake_timeout,
            tokio_tungstenite::accept_hdr_async_with_config(
                stream,
                callback,
                Some(config.protocol_config()),
            ),
        )
        .await
        .map_err(|_| TransportError::Timeout)?;

        if let Some(reason) = rejection {
            debug!("Rejected agent handshake from {}: {}", remote_addr, reason);
            return Err(TransportError::HandshakeRejected(reason));
        }

        let socket = upgraded?;
        let handshake = handshake.ok_or_else(|| {
            TransportError::HandshakeRejected("Upgrade completed without handshake".to_string())
        })?;

        Ok(match handshake {
            Handshake::Control(handshake) => {
                debug!(
                    "Control handshake from {} for {}",
                    remote_addr, handshake.domain
                );
                AgentSession::Control {
                    handshake,
                    socket,
                    remote_addr,
                    session_id,
                }
            }
            Handshake::Data(handshake) => {
                debug!(
                    "Data handshake from {} for {} channel {}",
                    remote_addr, handshake.domain, handshake.channel_id
                );
                AgentSession::Data {
                    handshake,
                    socket,
                    remote_addr,
                }
            }
        })
    }
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}
