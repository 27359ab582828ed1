//! HTTP edge server forwarding requests through agent channels
use backhaul_control::{BrokerError, ChannelBroker};
use backhaul_proto::normalize_domain;
use bytes::Bytes;
use http::{header, HeaderValue, Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Buffer size of the in-memory pipe between hyper and a channel
const PIPE_CAPACITY: usize = 64 * 1024;

pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

#[derive(Debug, Error)]
pub enum HttpServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    pub bind_addr: SocketAddr,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

pub struct HttpServer {
    listener: TcpListener,
    broker: Arc<ChannelBroker>,
}

impl HttpServer {
    pub async fn bind(
        config: HttpServerConfig,
        broker: Arc<ChannelBroker>,
    ) -> Result<Self, HttpServerError> {
        let bind_addr = config.bind_addr;
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            HttpServerError::BindError {
                address: bind_addr.ip().to_string(),
                port: bind_addr.port(),
                reason: e.to_string(),
            }
        })?;

        info!("HTTP edge listening on {}", listener.local_addr()?);
        Ok(Self { listener, broker })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, HttpServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the task is dropped
    pub async fn serve(self) -> Result<(), HttpServerError> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let broker = self.broker.clone();
                    tokio::spawn(async move {
                        Self::handle_connection(stream, peer_addr, broker).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept HTTP connection: {}", e);
                }
            }
        }
    }

    async fn handle_connection(stream: TcpStream, peer_addr: SocketAddr, broker: Arc<ChannelBroker>) {
        debug!("New HTTP connection from {}", peer_addr);

        let service = service_fn(move |req| {
            let broker = broker.clone();
            async move { Ok::<_, Infallible>(proxy_request(&broker, req).await) }
        });

        if let Err(e) = hyper::server::conn::http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .await
        {
            debug!("HTTP connection error from {}: {}", peer_addr, e);
        }
    }
}

/// Forward one request to the agent serving its host
pub async fn proxy_request(broker: &ChannelBroker, req: Request<Incoming>) -> Response<ProxyBody> {
    let host = match request_host(&req) {
        Some(host) => host,
        None => {
            return error_response(StatusCode::BAD_REQUEST, "Missing or invalid Host header");
        }
    };

    let handle = match broker.open_channel(&host).await {
        Ok(handle) => handle,
        Err(e) => {
            warn!("No channel for {} {}: {}", req.method(), host, e);
            return broker_error_response(&e);
        }
    };

    info!(
        host = %host,
        channel_id = handle.channel_id,
        upstream = %handle.upstream,
        method = %req.method(),
        uri = %req.uri(),
        "Forwarding request"
    );

    let (edge, channel_side) = tokio::io::duplex(PIPE_CAPACITY);
    tokio::spawn(async move {
        handle.bridge(channel_side).await;
    });

    let (mut sender, connection) =
        match hyper::client::conn::http1::handshake(TokioIo::new(edge)).await {
            Ok(parts) => parts,
            Err(e) => {
                return error_response(
                    StatusCode::BAD_GATEWAY,
                    &format!("Origin connection failed: {}", e),
                )
            }
        };

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("Origin connection for {} ended: {}", host, e);
        }
    });

    match sender.send_request(req).await {
        Ok(response) => response.map(|body| body.boxed_unsync()),
        Err(e) => error_response(StatusCode::BAD_GATEWAY, &format!("Origin error: {}", e)),
    }
}

/// Host a request is addressed to, without port, normalized for lookup
///
/// Bracketed IPv6 literals such as `[::1]:8080` are not names an agent can
/// register and yield `None`, which the edge answers with 400.
pub fn request_host<B>(req: &Request<B>) -> Option<String> {
    let raw = match req.uri().host() {
        Some(host) => host.to_string(),
        None => req.headers().get(header::HOST)?.to_str().ok()?.to_string(),
    };
    normalize_domain(strip_port(&raw)).ok()
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

/// Status code the edge answers with when no channel could be opened
pub fn broker_error_status(error: &BrokerError) -> StatusCode {
    match error {
        BrokerError::ChannelTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        BrokerError::DomainNotBound(_)
        | BrokerError::AgentDisconnected(_)
        | BrokerError::AgentUnreachable { .. }
        | BrokerError::ChannelIdsExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn broker_error_response(error: &BrokerError) -> Response<ProxyBody> {
    error_response(broker_error_status(error), &error.to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let body = format!(
        "{} {}: {}\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Error"),
        message
    );
    let mut response = Response::new(
        Full::new(Bytes::from(body))
            .map_err(|never| match never {})
            .boxed_unsync(),
    );
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
