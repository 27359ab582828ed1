//! WebSocket connector used by agents to reach the relay

use backhaul_proto::{session_id, ControlHandshake, DataHandshake, HandshakeError};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};
use url::Url;

use crate::config::WebSocketConfig;
use crate::{TransportError, TransportResult};

/// Opens control and data connections to one relay
pub struct AgentConnector {
    relay_url: Url,
    config: Arc<WebSocketConfig>,
}

impl std::fmt::Debug for AgentConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConnector")
            .field("relay_url", &self.relay_url.as_str())
            .finish()
    }
}

impl AgentConnector {
    pub fn new(relay_url: Url, config: Arc<WebSocketConfig>) -> TransportResult<Self> {
        config.validate()?;

        if relay_url.scheme() != "ws" {
            return Err(TransportError::ConfigurationError(format!(
                "Unsupported relay URL scheme '{}': only ws:// is supported, terminate TLS in front of the relay",
                relay_url.scheme()
            )));
        }
        if relay_url.host_str().is_none() {
            return Err(TransportError::ConfigurationError(format!(
                "Relay URL has no host: {}",
                relay_url
            )));
        }

        Ok(Self { relay_url, config })
    }

    pub fn relay_url(&self) -> &Url {
        &self.relay_url
    }

    /// Open the long-lived control connection
    ///
    /// Returns the socket and the session ID the relay issued for it, if
    /// the relay sent one.
    pub async fn connect_control(
        &self,
        handshake: &ControlHandshake,
    ) -> TransportResult<(WebSocketStream<TcpStream>, Option<String>)> {
        let (socket, response_headers) =
            self.connect(|headers| handshake.write_headers(headers)).await?;
        let session_id = session_id(&response_headers)?;
        info!(
            "Control connection established to {} for {} (session {})",
            self.relay_url,
            handshake.domain,
            session_id.as_deref().unwrap_or("none")
        );
        Ok((socket, session_id))
    }

    /// Open a data connection answering one channel-open command
    pub async fn connect_data(
        &self,
        handshake: &DataHandshake,
    ) -> TransportResult<WebSocketStream<TcpStream>> {
        let (socket, _) = self.connect(|headers| handshake.write_headers(headers)).await?;
        debug!(
            "Data connection established to {} for channel {}",
            self.relay_url, handshake.channel_id
        );
        Ok(socket)
    }

    async fn connect<F>(
        &self,
        write_headers: F,
    ) -> TransportResult<(WebSocketStream<TcpStream>, HeaderMap)>
    where
        F: FnOnce(&mut HeaderMap) -> Result<(), HandshakeError>,
    {
        let host = self
            .relay_url
            .host_str()
            .ok_or_else(|| TransportError::ConfigurationError("Relay URL has no host".to_string()))?;
        let port = self.relay_url.port_or_known_default().unwrap_or(80);

        let tcp_stream = TcpStream::connect((host, port)).await?;
        tcp_stream.set_nodelay(true)?;

        let mut request = self.relay_url.as_str().into_client_request()?;
        write_headers(request.headers_mut())?;

        let (socket, response) = tokio_tungstenite::client_async_with_config(
            request,
            tcp_stream,
            Some(self.config.protocol_config()),
        )
        .await
        .map_err(|e| match e {
            tungstenite::Error::Http(response) => {
                let body = response
                    .body()
                    .as_ref()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default();
                TransportError::HandshakeRejected(format!("{} {}", response.status(), body))
            }
            other => TransportError::WebSocket(other),
        })?;

        Ok((socket, response.into_parts().0.headers))
    }
}
