//! Per-channel forwarding between the relay and the local origin

use backhaul_control::{bridge, BridgeResult};
use backhaul_proto::{ChannelId, DataHandshake};
use backhaul_transport_websocket::{AgentConnector, WsByteStream};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::error::ForwarderError;

/// Answers channel-open commands by bridging a data connection to the origin
pub struct Forwarder {
    connector: Arc<AgentConnector>,
    server_key: Option<String>,
    domain: String,
    upstream_address: String,
}

impl Forwarder {
    pub fn new(
        connector: Arc<AgentConnector>,
        server_key: Option<String>,
        domain: String,
        upstream_address: String,
    ) -> Self {
        Self {
            connector,
            server_key,
            domain,
            upstream_address,
        }
    }

    /// Forward one channel until either side closes
    ///
    /// `session_id` is the session of the control connection that sent the
    /// command; the relay refuses the data connection if it has moved on.
    ///
    /// If the origin cannot be reached the data connection is still opened
    /// and closed right away, so the waiting request fails without running
    /// into the channel timeout.
    pub async fn forward(
        &self,
        channel_id: ChannelId,
        session_id: Option<&str>,
    ) -> Result<BridgeResult, ForwarderError> {
        tracing::debug!(
            channel_id = channel_id,
            upstream = %self.upstream_address,
            "Opening channel"
        );

        let upstream = TcpStream::connect(&self.upstream_address).await;

        let mut handshake = DataHandshake::new(self.server_key.clone(), &self.domain, channel_id)?;
        if let Some(session_id) = session_id {
            handshake = handshake.with_session_id(session_id);
        }
        let socket = self.connector.connect_data(&handshake).await?;
        let mut relay_stream = WsByteStream::new(socket);

        let upstream = match upstream {
            Ok(stream) => stream,
            Err(source) => {
                let _ = relay_stream.shutdown().await;
                return Err(ForwarderError::ConnectionFailed {
                    address: self.upstream_address.clone(),
                    source,
                });
            }
        };
        let _ = upstream.set_nodelay(true);

        let result = bridge(relay_stream, upstream).await;

        tracing::info!(
            channel_id = channel_id,
            bytes_to_upstream = result.a_to_b,
            bytes_to_relay = result.b_to_a,
            "Channel forward completed"
        );

        Ok(result)
    }
}
