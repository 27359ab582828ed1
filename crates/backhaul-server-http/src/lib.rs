//! HTTP edge for the backhaul relay
//!
//! Requests are routed by host to the agent registered for that domain and
//! forwarded over a freshly brokered channel.
pub mod server;

pub use server::{
    broker_error_status, proxy_request, request_host, HttpServer, HttpServerConfig,
    HttpServerError, ProxyBody,
};
