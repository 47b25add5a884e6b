//! Full-stack check: driver connects to the real endpoint, the session
//! registers under the authorized identity, and the control plane dials an
//! echo endpoint back through the agent.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use redial_agent::{AgentConfig, Driver, DriverOutcome, RetryPolicy};
use redial_relay::{PeerConnector, ProxyRegistry, RelayClient, RelayError};
use redial_server::{
    bind, run, AuthError, ClusterLookup, ClusterRef, Endpoint, NodeParams, NodeRecord, NodeStore,
    PeerAuthorizer, PeerTokenIndex, TokenAuthorizer, TunnelServer,
};
use redial_session::{SessionRegistry, Transport};
use redial_wire::handshake::RegistrationParams;

struct Clusters;

#[async_trait]
impl ClusterLookup for Clusters {
    async fn cluster_by_token(&self, token: &str) -> Result<Option<ClusterRef>, AuthError> {
        Ok((token == "tok1").then(|| ClusterRef {
            name: "c1".to_string(),
        }))
    }
}

struct Nodes;

#[async_trait]
impl NodeStore for Nodes {
    async fn get_or_create(
        &self,
        cluster: &ClusterRef,
        node: &NodeParams,
    ) -> Result<NodeRecord, AuthError> {
        Ok(NodeRecord {
            name: format!("{}/{}", cluster.name, node.requested_hostname),
        })
    }
}

struct NoPeers;

#[async_trait]
impl PeerTokenIndex for NoPeers {
    async fn token_exists(&self, _id: &str, _token: &str) -> bool {
        false
    }
}

struct NoConnector;

#[async_trait]
impl PeerConnector for NoConnector {
    async fn connect(&self, url: &str, _cluster: &str) -> Result<Transport, RelayError> {
        Err(RelayError::PeerConnect {
            url: url.to_string(),
            reason: "unavailable".to_string(),
        })
    }
}

async fn start_endpoint() -> (SocketAddr, Arc<SessionRegistry>) {
    let registry = Arc::new(SessionRegistry::new());
    let proxies = Arc::new(ProxyRegistry::new());
    let relay = RelayClient::new(Arc::new(NoConnector), proxies.clone(), Duration::from_secs(5));
    let server = TunnelServer::new(registry.clone(), proxies, relay);
    let endpoint = Endpoint::new(
        server,
        Arc::new(TokenAuthorizer::new(Arc::new(Clusters), Arc::new(Nodes))),
        Arc::new(PeerAuthorizer::new(Arc::new(NoPeers))),
    );

    let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(run(listener, endpoint, CancellationToken::new()));
    (addr, registry)
}

async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut sock, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = sock.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_driver_registers_and_serves_dials() {
    let (addr, registry) = start_endpoint().await;
    let echo = spawn_echo().await;

    let mut config = AgentConfig::new(&format!("ws://{addr}/connect"), "tok1");
    config.params = RegistrationParams {
        node: Some(NodeParams {
            requested_hostname: "h1".to_string(),
            address: None,
        }),
        cluster: None,
    };
    config.reconnect_delay = Duration::from_millis(50);
    config.retry = RetryPolicy::Forever;

    let connects = Arc::new(AtomicUsize::new(0));
    let driver = {
        let connects = connects.clone();
        Driver::new(config).on_connect(move || {
            connects.fetch_add(1, Ordering::SeqCst);
        })
    };
    let cancel = driver.cancel_token();
    let run = tokio::spawn(async move { driver.run().await });

    let mut waited = 0;
    while !registry.has_session("c1/h1") {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += 1;
        assert!(waited < 300, "agent session never registered");
    }
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    let mut stream = registry
        .dial("c1/h1", Duration::from_secs(10), "tcp", &echo.to_string())
        .unwrap();
    stream.write_all(b"roundtrip").await.unwrap();
    let mut echoed = [0u8; 9];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"roundtrip");
    drop(stream);

    cancel.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, DriverOutcome::Stopped);
}
