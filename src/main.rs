//! Backhaul CLI - run a relay or an agent
//!
//! The relay accepts agent WebSockets and public HTTP requests; the agent
//! runs next to a private service and keeps a control connection open to
//! the relay, reconnecting when it drops.

use anyhow::{Context, Result};
use backhaul_lib::{
    Agent, AgentConfig, BrokerConfig, ControlConnectionConfig, ReconnectConfig, Relay,
    RelayConfig, WebSocketConfig,
};
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

/// Backhaul - expose services that can only dial out
#[derive(Parser, Debug)]
#[command(name = "backhaul")]
#[command(about = "Expose services that can only dial out through a public relay")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, env = "BACKHAUL_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Shorthand for --log-level debug
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the public relay
    #[command(long_about = r#"
Run the public relay. Agents connect to --agent-addr over WebSocket and
register a domain; HTTP requests arriving on --http-addr are routed by
their Host header to the agent serving that domain.

EXAMPLES:
  # Relay with a shared key
  backhaul relay --agent-addr 0.0.0.0:4443 --http-addr 0.0.0.0:8080 \
    --shared-key $BACKHAUL_SHARED_KEY

ENVIRONMENT VARIABLES:
  BACKHAUL_AGENT_ADDR       Agent WebSocket listener address
  BACKHAUL_HTTP_ADDR        Public HTTP listener address
  BACKHAUL_SHARED_KEY       Key agents must present (unset = open relay)
  BACKHAUL_CHANNEL_TIMEOUT  Seconds to wait for an agent to open a channel
    "#)]
    Relay(RelayArgs),

    /// Connect to a relay and serve a domain from a local origin
    #[command(long_about = r#"
Connect to a relay, register a domain and forward every request the relay
receives for it to a local origin. Reconnects with exponential backoff
when the connection drops.

EXAMPLES:
  # Serve app.example.com from a local web server
  backhaul agent --relay ws://relay.example.com:4443/ \
    --domain app.example.com \
    --upstream http://127.0.0.1:3000 \
    --server-key $BACKHAUL_SERVER_KEY

ENVIRONMENT VARIABLES:
  BACKHAUL_RELAY       Relay agent endpoint (ws://host:port/path)
  BACKHAUL_DOMAIN      Domain to register
  BACKHAUL_UPSTREAM    Local origin URL
  BACKHAUL_SERVER_KEY  Key presented to the relay
    "#)]
    Agent(AgentArgs),
}

#[derive(Args, Debug)]
struct RelayArgs {
    /// Address agents connect to
    #[arg(long, env = "BACKHAUL_AGENT_ADDR", default_value = "0.0.0.0:4443")]
    agent_addr: SocketAddr,

    /// Address public HTTP requests arrive on
    #[arg(long, env = "BACKHAUL_HTTP_ADDR", default_value = "0.0.0.0:8080")]
    http_addr: SocketAddr,

    /// Key agents must present; empty or unset disables authentication
    #[arg(long, env = "BACKHAUL_SHARED_KEY")]
    shared_key: Option<String>,

    /// Seconds to wait for an agent to open a requested channel
    #[arg(long, env = "BACKHAUL_CHANNEL_TIMEOUT", default_value = "10")]
    channel_timeout: u64,

    /// WebSocket path agents connect on
    #[arg(long, env = "BACKHAUL_WS_PATH", default_value = "/")]
    ws_path: String,

    /// Seconds between keep-alive pings on control connections
    #[arg(long, env = "BACKHAUL_KEEP_ALIVE", default_value = "30")]
    keep_alive: u64,

    /// Seconds of silence after which a control connection is dropped
    #[arg(long, env = "BACKHAUL_IDLE_TIMEOUT", default_value = "90")]
    idle_timeout: u64,
}

#[derive(Args, Debug)]
struct AgentArgs {
    /// Relay agent endpoint (e.g., ws://relay.example.com:4443/)
    #[arg(long, env = "BACKHAUL_RELAY")]
    relay: Url,

    /// Domain to serve
    #[arg(long, env = "BACKHAUL_DOMAIN")]
    domain: String,

    /// Local origin requests are forwarded to (e.g., http://127.0.0.1:3000)
    #[arg(long, env = "BACKHAUL_UPSTREAM")]
    upstream: Url,

    /// Key presented to the relay
    #[arg(long, env = "BACKHAUL_SERVER_KEY")]
    server_key: Option<String>,

    /// Maximum reconnection attempts (0 = infinite)
    #[arg(long, default_value = "0")]
    max_reconnect_attempts: usize,

    /// Initial reconnection delay in seconds
    #[arg(long, default_value = "1")]
    reconnect_delay: u64,

    /// Maximum reconnection delay in seconds
    #[arg(long, default_value = "60")]
    max_reconnect_delay: u64,
}

fn init_logging(log_level: &str, verbose: bool) -> Result<()> {
    let log_level = if verbose { "debug" } else { log_level };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

async fn run_relay(args: RelayArgs) -> Result<()> {
    let mut broker =
        BrokerConfig::default().with_channel_open_timeout(Duration::from_secs(args.channel_timeout));
    if let Some(key) = args.shared_key {
        broker = broker.with_shared_key(key);
    }

    let config = RelayConfig::new(args.agent_addr, args.http_addr)
        .with_broker(broker)
        .with_websocket(WebSocketConfig::default().with_path(&args.ws_path))
        .with_control(
            ControlConnectionConfig::default()
                .with_keep_alive_interval(Duration::from_secs(args.keep_alive))
                .with_idle_timeout(Duration::from_secs(args.idle_timeout)),
        );

    let relay = Relay::start(config)
        .await
        .context("Failed to start relay")?;

    info!("Agents connect to ws://{}{}", relay.agent_addr(), args.ws_path);
    info!("Public HTTP on {}", relay.http_addr());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down...");

    relay.shutdown().await;
    info!("Relay stopped");
    Ok(())
}

async fn run_agent(args: AgentArgs) -> Result<()> {
    let mut config = AgentConfig::new(args.relay.clone(), &args.domain, args.upstream.clone())
        .with_reconnect(ReconnectConfig {
            initial_backoff: Duration::from_secs(args.reconnect_delay),
            max_backoff: Duration::from_secs(args.max_reconnect_delay),
            max_attempts: (args.max_reconnect_attempts > 0).then_some(args.max_reconnect_attempts),
            ..Default::default()
        });
    if let Some(key) = args.server_key {
        config = config.with_server_key(key);
    } else {
        warn!("⚠️  No server key given, the relay must run without one");
    }

    info!("Relay: {}", args.relay);
    info!("Serving {} -> {}", args.domain, args.upstream);

    let agent = Agent::new(config).context("Failed to create agent")?;

    let shutdown = CancellationToken::new();
    let agent_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { agent.run(shutdown).await })
    };
    tokio::pin!(agent_task);

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, shutting down...");
            shutdown.cancel();
            match (&mut agent_task).await {
                Ok(result) => result.context("Agent failed while shutting down")?,
                Err(e) => error!("Agent task panicked: {}", e),
            }
        }
        result = &mut agent_task => {
            match result {
                Ok(result) => result.context("Agent stopped")?,
                Err(e) => {
                    error!("Agent task panicked: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    info!("Agent stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.verbose)?;

    match cli.command {
        Commands::Relay(args) => run_relay(args).await,
        Commands::Agent(args) => run_agent(args).await,
    }
}
