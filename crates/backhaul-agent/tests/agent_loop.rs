//! Agent behaviour against a relay-side WebSocket listener

use backhaul_agent::{Agent, AgentConfig, ReconnectConfig, ReconnectManager, SessionEnd};
use backhaul_proto::ChannelOpen;
use backhaul_transport_websocket::{
    AgentListener, AgentSession, CloseCode, CloseFrame, Message, WebSocketConfig, WebSocketStream,
    WsByteStream,
};
use futures_util::SinkExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use url::Url;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("backhaul_agent=debug")
        .with_test_writer()
        .try_init();
}

async fn relay() -> (AgentListener, Url) {
    let listener = AgentListener::bind(
        "127.0.0.1:0".parse().unwrap(),
        Arc::new(WebSocketConfig::default()),
    )
    .await
    .unwrap();
    let url = Url::parse(&format!("ws://{}/", listener.local_addr().unwrap())).unwrap();
    (listener, url)
}

/// TCP origin echoing everything back
async fn echo_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    addr
}

async fn accept(listener: &AgentListener) -> AgentSession<TcpStream> {
    let (tcp, remote_addr) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .unwrap()
        .unwrap();
    AgentListener::upgrade(tcp, remote_addr, &listener.config())
        .await
        .unwrap()
}

fn control_socket(session: AgentSession<TcpStream>) -> (WebSocketStream<TcpStream>, String) {
    match session {
        AgentSession::Control {
            handshake,
            socket,
            session_id,
            ..
        } => {
            assert_eq!(handshake.domain, "a.example");
            (socket, session_id)
        }
        other => panic!("expected control session, got {:?}", other),
    }
}

fn config(relay_url: Url, upstream: SocketAddr) -> AgentConfig {
    AgentConfig::new(
        relay_url,
        "a.example",
        Url::parse(&format!("http://{}", upstream)).unwrap(),
    )
    .with_server_key("secret")
    .with_reconnect(ReconnectConfig {
        initial_backoff: Duration::from_millis(20),
        max_backoff: Duration::from_millis(100),
        multiplier: 2.0,
        max_attempts: None,
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn test_channel_open_is_forwarded_to_origin() {
    init_tracing();
    let (listener, url) = relay().await;
    let origin = echo_origin().await;

    let agent = Agent::new(config(url, origin)).unwrap();
    let shutdown = CancellationToken::new();
    let run = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { agent.run(shutdown).await })
    };

    let (mut control, session_id) = control_socket(accept(&listener).await);

    // A malformed command is ignored, the next one is served
    control.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    control
        .send(Message::Binary(ChannelOpen::new(7).encode().to_vec()))
        .await
        .unwrap();

    let data = match accept(&listener).await {
        AgentSession::Data {
            handshake, socket, ..
        } => {
            assert_eq!(handshake.channel_id, 7);
            assert_eq!(handshake.domain, "a.example");
            assert_eq!(handshake.server_key.as_deref(), Some("secret"));
            assert_eq!(handshake.session_id.as_deref(), Some(session_id.as_str()));
            socket
        }
        other => panic!("expected data session, got {:?}", other),
    };

    let mut stream = WsByteStream::new(data);
    stream.write_all(b"through the tunnel").await.unwrap();
    stream.flush().await.unwrap();
    let mut echoed = [0u8; 18];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"through the tunnel");

    shutdown.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_relay_rejection_ends_session_with_reason() {
    init_tracing();
    let (listener, url) = relay().await;
    let origin = echo_origin().await;
    let agent = Agent::new(config(url, origin)).unwrap();

    let relay_side = tokio::spawn(async move {
        let (mut control, _) = control_socket(accept(&listener).await);
        control
            .close(Some(CloseFrame {
                code: CloseCode::Policy,
                reason: "Domain a.example is already bound to another agent".into(),
            }))
            .await
            .unwrap();
    });

    let shutdown = CancellationToken::new();
    let mut reconnect = ReconnectManager::new(ReconnectConfig::default());
    let end = tokio::time::timeout(
        Duration::from_secs(5),
        agent.run_session(&shutdown, &mut reconnect),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(
        end,
        SessionEnd::ClosedByRelay {
            code: Some(1008),
            reason: "Domain a.example is already bound to another agent".to_string(),
        }
    );
    relay_side.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_agent_reconnects_after_connection_loss() {
    init_tracing();
    let (listener, url) = relay().await;
    let origin = echo_origin().await;
    let agent = Agent::new(config(url, origin)).unwrap();

    let shutdown = CancellationToken::new();
    let run = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { agent.run(shutdown).await })
    };

    let (first, _) = control_socket(accept(&listener).await);
    drop(first);

    // The agent comes back after its backoff
    let _second = control_socket(accept(&listener).await);

    shutdown.cancel();
    assert!(tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap()
        .is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unreachable_origin_closes_data_connection() {
    init_tracing();
    let (listener, url) = relay().await;

    // Reserve a port and free it again so nothing listens there
    let closed_port = {
        let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        placeholder.local_addr().unwrap()
    };

    let agent = Agent::new(config(url, closed_port)).unwrap();
    let shutdown = CancellationToken::new();
    let run = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { agent.run(shutdown).await })
    };

    let (mut control, _) = control_socket(accept(&listener).await);
    control
        .send(Message::Binary(ChannelOpen::new(1).encode().to_vec()))
        .await
        .unwrap();

    let data = match accept(&listener).await {
        AgentSession::Data { socket, .. } => socket,
        other => panic!("expected data session, got {:?}", other),
    };

    let mut stream = WsByteStream::new(data);
    let mut buf = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert!(buf.is_empty());

    shutdown.cancel();
    let _ = run.await;
}
