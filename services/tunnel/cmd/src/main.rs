//! Reverse tunnel binary.
//!
//! `redial server` runs the control-plane endpoint: agents register over
//! `/connect`, peer replicas relay over `/connect/proxy`, and dials reach
//! agent-side endpoints through the registered sessions. `redial agent`
//! runs the reconnection driver against a control plane.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use redial_agent::{AgentConfig, Driver, DriverOutcome, RetryPolicy};
use redial_relay::{PeerManager, ProxyRegistry, RelayClient};
use redial_server::{
    AuthError, ClusterLookup, ClusterRef, NodeParams, NodeRecord, NodeStore, PeerAuthorizer,
    TokenAuthorizer, TunnelServer, WsPeerConnector,
};
use redial_session::SessionRegistry;
use redial_wire::handshake::RegistrationParams;

mod config;

use config::TunnelConfig;

/// Reverse tunnel control plane and agent
#[derive(Parser, Debug)]
#[command(name = "redial", version, about = "Reverse tunnel over a single outbound connection")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the control-plane endpoint
    Server {
        /// Listen address, e.g. 0.0.0.0:8123
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Agent credential accepted by the built-in token index
        #[arg(long)]
        token: Option<String>,

        /// Cluster name the credential maps to
        #[arg(long)]
        cluster: Option<String>,

        /// Shared inter-replica credential (empty disables relaying)
        #[arg(long)]
        peer_token: Option<String>,

        /// This replica's identifier
        #[arg(long)]
        peer_id: Option<String>,

        /// Keepalive interval for relay hops, e.g. 5s
        #[arg(long, default_value = "5s")]
        ping_interval: humantime::Duration,
    },

    /// Run the agent reconnection driver
    Agent {
        /// Tunnel endpoint URL, e.g. wss://control-plane/connect
        #[arg(long)]
        connect: Option<String>,

        /// Credential presented on connect
        #[arg(long)]
        token: Option<String>,

        /// Hostname to register under
        #[arg(long)]
        hostname: Option<String>,

        /// Advertised address
        #[arg(long)]
        address: Option<String>,

        /// Keepalive ping interval, e.g. 5s
        #[arg(long, default_value = "5s")]
        ping_interval: humantime::Duration,

        /// Delay between reconnect attempts, e.g. 5s
        #[arg(long, default_value = "5s")]
        reconnect_delay: humantime::Duration,

        /// Give up after this many consecutive transient failures
        #[arg(long)]
        max_retries: Option<u32>,

        /// Unix socket path the control plane may dial (repeatable)
        #[arg(long)]
        allow_unix: Vec<String>,
    },
}

/// Single-credential token index backed by configuration
struct StaticTokenIndex {
    token: String,
    cluster: String,
}

#[async_trait]
impl ClusterLookup for StaticTokenIndex {
    async fn cluster_by_token(&self, token: &str) -> Result<Option<ClusterRef>, AuthError> {
        Ok((!self.token.is_empty() && token == self.token).then(|| ClusterRef {
            name: self.cluster.clone(),
        }))
    }
}

/// In-memory node registration; re-registration is a no-op update
#[derive(Default)]
struct MemoryNodeStore {
    nodes: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl NodeStore for MemoryNodeStore {
    async fn get_or_create(
        &self,
        cluster: &ClusterRef,
        node: &NodeParams,
    ) -> Result<NodeRecord, AuthError> {
        let key = format!("{}/{}", cluster.name, node.requested_hostname);
        let mut nodes = self.nodes.lock().expect("node table poisoned");
        let name = nodes.entry(key.clone()).or_insert(key).clone();
        Ok(NodeRecord { name })
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("redial={}", args.log_level).parse()?)
        .add_directive(format!("redial_wire={}", args.log_level).parse()?)
        .add_directive(format!("redial_session={}", args.log_level).parse()?)
        .add_directive(format!("redial_relay={}", args.log_level).parse()?)
        .add_directive(format!("redial_server={}", args.log_level).parse()?)
        .add_directive(format!("redial_agent={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!("Starting redial v{}", env!("CARGO_PKG_VERSION"));

    let file_config = TunnelConfig::load_from_file(&args.config)?;

    match args.command {
        Command::Server {
            listen,
            token,
            cluster,
            peer_token,
            peer_id,
            ping_interval,
        } => {
            let section = file_config.server;
            let listen = match listen {
                Some(addr) => addr,
                None => section
                    .listen
                    .parse()
                    .with_context(|| format!("bad listen address {}", section.listen))?,
            };
            run_server(
                listen,
                token.unwrap_or(section.token),
                cluster.unwrap_or(section.cluster),
                peer_token.unwrap_or(section.peer_token),
                peer_id.unwrap_or(section.peer_id),
                section.peers,
                ping_interval.into(),
            )
            .await
        }
        Command::Agent {
            connect,
            token,
            hostname,
            address,
            ping_interval,
            reconnect_delay,
            max_retries,
            allow_unix,
        } => {
            let section = file_config.agent;
            let allow_unix = if allow_unix.is_empty() {
                section.allow_unix
            } else {
                allow_unix
            };
            run_agent(
                connect.unwrap_or(section.connect),
                token.unwrap_or(section.token),
                hostname.unwrap_or(section.hostname),
                address,
                ping_interval.into(),
                reconnect_delay.into(),
                max_retries,
                allow_unix,
            )
            .await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_server(
    listen: SocketAddr,
    token: String,
    cluster: String,
    peer_token: String,
    peer_id: String,
    peers: Vec<String>,
    ping_interval: Duration,
) -> anyhow::Result<()> {
    if token.is_empty() {
        warn!("No agent token configured; every agent handshake will be refused");
    }

    let peer_manager = Arc::new(PeerManager::new(&peer_token, |ip| {
        format!("ws://{ip}/connect/proxy")
    }));
    for peer in &peers {
        peer_manager.observe([(peer.clone(), true)]);
    }

    let registry = Arc::new(SessionRegistry::new());
    let proxies = Arc::new(ProxyRegistry::new());
    let connector = WsPeerConnector::new(&peer_id, &peer_token);
    let relay = RelayClient::new(connector, proxies.clone(), ping_interval);

    let server = TunnelServer::new(registry, proxies, relay);
    let endpoint = redial_server::Endpoint::new(
        server,
        Arc::new(TokenAuthorizer::new(
            Arc::new(StaticTokenIndex { token, cluster }),
            Arc::new(MemoryNodeStore::default()),
        )),
        Arc::new(PeerAuthorizer::new(peer_manager)),
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
                cancel.cancel();
            }
        }
    });

    let listener = redial_server::bind(listen).await?;
    redial_server::run(listener, endpoint, cancel).await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_agent(
    connect: String,
    token: String,
    hostname: String,
    address: Option<String>,
    ping_interval: Duration,
    reconnect_delay: Duration,
    max_retries: Option<u32>,
    allow_unix: Vec<String>,
) -> anyhow::Result<()> {
    let mut agent_config = AgentConfig::new(&connect, &token);
    agent_config.params = RegistrationParams {
        node: Some(redial_wire::handshake::NodeParams {
            requested_hostname: hostname.clone(),
            address,
        }),
        cluster: None,
    };
    agent_config.ping_interval = ping_interval;
    agent_config.reconnect_delay = reconnect_delay;
    agent_config.retry = match max_retries {
        Some(n) => RetryPolicy::Bounded(n),
        None => RetryPolicy::Forever,
    };
    agent_config.allowed_unix_paths = allow_unix;

    let driver = Driver::new(agent_config).on_connect({
        let hostname = hostname.clone();
        move || info!(host = %hostname, "registered with control plane")
    });

    let cancel = driver.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            cancel.cancel();
        }
    });

    match driver.run().await {
        DriverOutcome::Stopped => Ok(()),
        DriverOutcome::IdentityLost => {
            anyhow::bail!("registration no longer exists upstream; re-register this agent")
        }
        DriverOutcome::Fatal(cause) => anyhow::bail!("tunnel failed: {cause:?}"),
    }
}
