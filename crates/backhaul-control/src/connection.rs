//! Agent control connection
//!
//! A control connection is driven by two tasks: a writer that owns the
//! WebSocket sink and serialises every outgoing message, and a reader that
//! watches for close, errors and idleness. Both stop when the connection's
//! cancellation token fires.

use backhaul_proto::{normalize_domain, ChannelId, ChannelOpen};
use backhaul_transport_websocket::{CloseCode, CloseFrame, Message, TransportError, WebSocketStream};
use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::allocator::{ChannelIdAllocator, MAX_ALLOCATION_ATTEMPTS};
use crate::bridge::DataConnection;
use crate::channel::ChannelTable;
use crate::config::ControlConnectionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

enum Command {
    OpenChannel {
        channel_id: ChannelId,
        ack: oneshot::Sender<Result<(), TransportError>>,
    },
    Close {
        reason: String,
    },
}

/// One agent's persistent connection, bound to a domain
pub struct ControlConnection {
    pub connection_id: String,
    pub domain: String,
    pub upstream: Url,
    pub remote_addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
    commands: mpsc::Sender<Command>,
    state: Arc<AtomicU8>,
    closed: CancellationToken,
    allocator: ChannelIdAllocator,
    channels: ChannelTable,
    close_grace: std::time::Duration,
}

impl std::fmt::Debug for ControlConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlConnection")
            .field("connection_id", &self.connection_id)
            .field("domain", &self.domain)
            .field("upstream", &self.upstream.as_str())
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl ControlConnection {
    /// Take over an upgraded WebSocket and start its reader and writer tasks
    pub fn spawn<S>(
        socket: WebSocketStream<S>,
        domain: String,
        upstream: Url,
        remote_addr: SocketAddr,
        config: &ControlConnectionConfig,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connection_id = format!("ctl-{}", uuid::Uuid::new_v4());
        Self::spawn_session(connection_id, socket, domain, upstream, remote_addr, config)
    }

    /// Like [`ControlConnection::spawn`], keyed by the session id the agent
    /// was given at upgrade time
    ///
    /// Data connections presenting a different session id are refused.
    pub fn spawn_session<S>(
        connection_id: String,
        socket: WebSocketStream<S>,
        domain: String,
        upstream: Url,
        remote_addr: SocketAddr,
        config: &ControlConnectionConfig,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let domain = normalize_domain(&domain).unwrap_or(domain);
        let (commands, command_rx) = mpsc::channel(config.command_queue_capacity.max(1));
        let state = Arc::new(AtomicU8::new(STATE_OPEN));
        let closed = CancellationToken::new();
        let channels = ChannelTable::new();

        let (sink, stream) = socket.split();

        tokio::spawn(writer_task(
            connection_id.clone(),
            sink,
            command_rx,
            closed.clone(),
            config.keep_alive_interval,
        ));
        tokio::spawn(reader_task(
            connection_id.clone(),
            stream,
            closed.clone(),
            state.clone(),
            channels.clone(),
            config.idle_timeout,
        ));

        debug!(
            "[{}] Control connection for {} from {} (upstream {})",
            connection_id, domain, remote_addr, upstream
        );

        Arc::new(Self {
            connection_id,
            domain,
            upstream,
            remote_addr,
            connected_at: Utc::now(),
            commands,
            state,
            closed,
            allocator: ChannelIdAllocator::new(),
            channels,
            close_grace: config.close_grace,
        })
    }

    pub fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => ConnectionState::Open,
            STATE_CLOSING => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    /// Whether the connection can no longer carry commands
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.state() != ConnectionState::Open
    }

    /// Send a channel-open command and wait until it has been written
    pub async fn send_open_channel(&self, channel_id: ChannelId) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }

        let (ack, ack_rx) = oneshot::channel();
        self.commands
            .send(Command::OpenChannel { channel_id, ack })
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;

        ack_rx.await.map_err(|_| TransportError::ConnectionClosed)?
    }

    /// Completes once the connection has closed, for whatever reason
    pub async fn wait_closed(&self) {
        self.closed.cancelled().await;
    }

    /// Close with a reason sent to the agent in a policy-violation close frame
    ///
    /// Failures to deliver the frame are ignored. The connection is closed
    /// when this returns.
    pub async fn close(&self, reason: &str) {
        if self
            .state
            .compare_exchange(STATE_OPEN, STATE_CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            info!("[{}] Closing control connection: {}", self.connection_id, reason);
            let command = Command::Close {
                reason: reason.to_string(),
            };
            if self.commands.try_send(command).is_ok() {
                let _ = tokio::time::timeout(self.close_grace, self.closed.cancelled()).await;
            }
        }

        self.state.store(STATE_CLOSED, Ordering::Release);
        self.closed.cancel();
    }

    /// Allocate a channel ID and register it as pending
    pub fn reserve_channel(&self) -> Option<(ChannelId, oneshot::Receiver<DataConnection>)> {
        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let channel_id = self.allocator.next(|id| self.channels.contains(id))?;
            // Another reservation may have taken the ID since the check
            if let Some(rx) = self.channels.insert_pending(channel_id) {
                return Some((channel_id, rx));
            }
        }
        None
    }

    pub fn channels(&self) -> &ChannelTable {
        &self.channels
    }
}

async fn writer_task<S>(
    connection_id: String,
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut commands: mpsc::Receiver<Command>,
    closed: CancellationToken,
    keep_alive_interval: std::time::Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut keep_alive = tokio::time::interval_at(
        tokio::time::Instant::now() + keep_alive_interval,
        keep_alive_interval,
    );

    loop {
        tokio::select! {
            _ = closed.cancelled() => break,

            command = commands.recv() => {
                let Some(command) = command else { break };
                match command {
                    Command::OpenChannel { channel_id, ack } => {
                        let frame = ChannelOpen::new(channel_id).encode();
                        let result = sink
                            .send(Message::Binary(frame.to_vec()))
                            .await
                            .map_err(TransportError::from);
                        let failed = result.is_err();
                        if let Err(e) = &result {
                            warn!("[{}] Failed to send channel-open {}: {}", connection_id, channel_id, e);
                        } else {
                            trace!("[{}] Sent channel-open {}", connection_id, channel_id);
                        }
                        let _ = ack.send(result);
                        if failed {
                            break;
                        }
                    }
                    Command::Close { reason } => {
                        let frame = CloseFrame {
                            code: CloseCode::Policy,
                            reason: reason.into(),
                        };
                        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                            debug!("[{}] Failed to send close frame: {}", connection_id, e);
                            break;
                        }
                    }
                }
            }

            _ = keep_alive.tick() => {
                if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                    debug!("[{}] Keep-alive ping failed: {}", connection_id, e);
                    break;
                }
            }
        }
    }

    closed.cancel();
    trace!("[{}] Writer task finished", connection_id);
}

async fn reader_task<S>(
    connection_id: String,
    mut stream: SplitStream<WebSocketStream<S>>,
    closed: CancellationToken,
    state: Arc<AtomicU8>,
    channels: ChannelTable,
    idle_timeout: std::time::Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = closed.cancelled() => break,
            next = tokio::time::timeout(idle_timeout, stream.next()) => next,
        };

        match next {
            Err(_) => {
                warn!(
                    "[{}] No traffic for {:?}, closing control connection",
                    connection_id, idle_timeout
                );
                break;
            }
            Ok(None) => {
                debug!("[{}] Control stream ended", connection_id);
                break;
            }
            Ok(Some(Ok(Message::Close(frame)))) => {
                debug!("[{}] Agent closed control connection: {:?}", connection_id, frame);
                break;
            }
            Ok(Some(Ok(Message::Binary(data)))) => {
                debug!(
                    "[{}] Ignoring {} byte message from agent",
                    connection_id,
                    data.len()
                );
            }
            Ok(Some(Ok(_))) => {
                // Ping, pong and text only count as activity
            }
            Ok(Some(Err(e))) => {
                debug!("[{}] Control connection error: {}", connection_id, e);
                break;
            }
        }
    }

    state.store(STATE_CLOSED, Ordering::Release);
    closed.cancel();

    let abandoned = channels.abandon_pending();
    if abandoned > 0 {
        debug!(
            "[{}] Abandoned {} pending channel(s) on close",
            connection_id, abandoned
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backhaul_transport_websocket::Role;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    async fn spawn_pair(
        config: ControlConnectionConfig,
    ) -> (Arc<ControlConnection>, WebSocketStream<DuplexStream>) {
        let (server, client) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
        let connection = ControlConnection::spawn(
            server,
            "a.example".to_string(),
            Url::parse("http://127.0.0.1:8080").unwrap(),
            "127.0.0.1:50000".parse().unwrap(),
            &config,
        );
        (connection, client)
    }

    #[tokio::test]
    async fn test_open_channel_commands_arrive_in_order() {
        let (connection, mut agent) = spawn_pair(ControlConnectionConfig::default()).await;

        for id in [1u32, 2, 3] {
            connection.send_open_channel(id).await.unwrap();
        }

        for expected in [1u32, 2, 3] {
            match agent.next().await {
                Some(Ok(Message::Binary(data))) => {
                    assert_eq!(data, expected.to_be_bytes().to_vec());
                }
                other => panic!("unexpected message: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_remote_close_is_observed() {
        let (connection, mut agent) = spawn_pair(ControlConnectionConfig::default()).await;
        assert_eq!(connection.state(), ConnectionState::Open);

        agent.close(None).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), connection.wait_closed())
            .await
            .unwrap();
        assert!(connection.is_closed());
        assert!(matches!(
            connection.send_open_channel(1).await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_sends_reason() {
        let (connection, mut agent) = spawn_pair(ControlConnectionConfig::default()).await;

        let closer = connection.clone();
        let close_task = tokio::spawn(async move { closer.close("Domain taken").await });

        match agent.next().await {
            Some(Ok(Message::Close(Some(frame)))) => {
                assert_eq!(frame.code, CloseCode::Policy);
                assert_eq!(frame.reason, "Domain taken");
            }
            other => panic!("expected close frame, got {:?}", other),
        }

        close_task.await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_close_is_bounded_when_agent_is_silent() {
        let config = ControlConnectionConfig::default().with_close_grace(Duration::from_millis(50));
        let (connection, _agent) = spawn_pair(config).await;

        tokio::time::timeout(Duration::from_secs(5), connection.close("bye"))
            .await
            .unwrap();
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_connection() {
        let config = ControlConnectionConfig::default()
            .with_keep_alive_interval(Duration::from_secs(60))
            .with_idle_timeout(Duration::from_millis(100));
        let (connection, _agent) = spawn_pair(config).await;

        tokio::time::timeout(Duration::from_secs(5), connection.wait_closed())
            .await
            .unwrap();
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_keep_alive_pings_agent() {
        let config = ControlConnectionConfig::default()
            .with_keep_alive_interval(Duration::from_millis(50));
        let (_connection, mut agent) = spawn_pair(config).await;

        match tokio::time::timeout(Duration::from_secs(5), agent.next()).await {
            Ok(Some(Ok(Message::Ping(_)))) => {}
            other => panic!("expected ping, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_abandons_pending_channels() {
        let (connection, agent) = spawn_pair(ControlConnectionConfig::default()).await;
        let (channel_id, rx) = connection.reserve_channel().unwrap();
        assert_eq!(channel_id, 1);

        drop(agent);

        assert!(tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .is_err());
        assert!(connection.channels().is_empty());
    }

    #[tokio::test]
    async fn test_reserve_channel_skips_ids_in_use() {
        let (connection, _agent) = spawn_pair(ControlConnectionConfig::default()).await;
        let (first, _rx1) = connection.reserve_channel().unwrap();
        let (second, _rx2) = connection.reserve_channel().unwrap();
        assert_ne!(first, second);
        assert_eq!(connection.channels().len(), 2);
    }
}
