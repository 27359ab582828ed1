//! Shared helpers for control plane integration tests

#![allow(dead_code)]

use backhaul_control::{AgentHandler, BrokerConfig, ChannelBroker, ConnectionRegistry, ControlConnectionConfig};
use backhaul_proto::{ChannelId, ChannelOpen, ControlHandshake, DataHandshake};
use backhaul_transport_websocket::{AgentSession, Message, Role, WebSocketStream};
use futures_util::StreamExt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use url::Url;

pub type Ws = WebSocketStream<DuplexStream>;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("backhaul=debug,backhaul_control=debug")
        .with_test_writer()
        .try_init();
}

/// In-memory WebSocket pair: (relay side, agent side)
pub async fn ws_pair() -> (Ws, Ws) {
    let (relay, agent) = tokio::io::duplex(256 * 1024);
    let relay = WebSocketStream::from_raw_socket(relay, Role::Server, None).await;
    let agent = WebSocketStream::from_raw_socket(agent, Role::Client, None).await;
    (relay, agent)
}

pub fn remote_addr() -> SocketAddr {
    "127.0.0.1:45000".parse().unwrap()
}

pub struct Harness {
    pub registry: Arc<ConnectionRegistry>,
    pub broker: Arc<ChannelBroker>,
    pub handler: Arc<AgentHandler>,
}

impl Harness {
    pub fn new(config: BrokerConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.shared_key.clone()));
        let broker = Arc::new(ChannelBroker::new(registry.clone(), &config));
        let handler = Arc::new(AgentHandler::new(
            broker.clone(),
            ControlConnectionConfig::default().with_close_grace(Duration::from_millis(200)),
        ));
        Self {
            registry,
            broker,
            handler,
        }
    }

    /// Start a control session; returns the session task and the agent's end
    pub async fn connect_agent(
        &self,
        domain: &str,
        key: Option<&str>,
    ) -> (
        tokio::task::JoinHandle<Result<(), backhaul_control::SessionError>>,
        Ws,
    ) {
        let session_id = format!("ctl-test-{}", NEXT_SESSION.fetch_add(1, Ordering::Relaxed));
        self.connect_agent_session(domain, key, &session_id).await
    }

    /// Start a control session under a known session id
    pub async fn connect_agent_session(
        &self,
        domain: &str,
        key: Option<&str>,
        session_id: &str,
    ) -> (
        tokio::task::JoinHandle<Result<(), backhaul_control::SessionError>>,
        Ws,
    ) {
        let (relay, agent) = ws_pair().await;
        let session_id = session_id.to_string();
        let handshake = ControlHandshake::new(
            key.map(str::to_string),
            domain,
            Url::parse("http://127.0.0.1:3000").unwrap(),
        )
        .unwrap();

        let handler = self.handler.clone();
        let task = tokio::spawn(async move {
            handler
                .handle_session(AgentSession::Control {
                    handshake,
                    socket: relay,
                    remote_addr: remote_addr(),
                    session_id,
                })
                .await
        });
        (task, agent)
    }

    /// Open a data session for a channel; returns the session result and the agent's end
    pub async fn connect_data(
        &self,
        domain: &str,
        key: Option<&str>,
        channel_id: ChannelId,
    ) -> (Result<(), backhaul_control::SessionError>, Ws) {
        self.connect_data_session(domain, key, channel_id, None).await
    }

    /// Open a data session that names the control session it belongs to
    pub async fn connect_data_session(
        &self,
        domain: &str,
        key: Option<&str>,
        channel_id: ChannelId,
        session_id: Option<&str>,
    ) -> (Result<(), backhaul_control::SessionError>, Ws) {
        let (relay, agent) = ws_pair().await;
        let mut handshake =
            DataHandshake::new(key.map(str::to_string), domain, channel_id).unwrap();
        if let Some(session_id) = session_id {
            handshake = handshake.with_session_id(session_id);
        }
        let result = self
            .handler
            .handle_session(AgentSession::Data {
                handshake,
                socket: relay,
                remote_addr: remote_addr(),
            })
            .await;
        (result, agent)
    }

    pub async fn wait_registered(&self, domain: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.registry.resolve(domain).is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("agent never registered");
    }
}

/// Read the next channel-open command, skipping keep-alive traffic
pub async fn next_command(agent: &mut Ws) -> ChannelId {
    loop {
        match agent.next().await {
            Some(Ok(Message::Binary(data))) => return ChannelOpen::decode(&data).unwrap().channel_id,
            Some(Ok(_)) => continue,
            other => panic!("expected channel-open command, got {:?}", other),
        }
    }
}
