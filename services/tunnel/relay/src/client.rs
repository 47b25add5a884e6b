//! Follower-side relay client.
//!
//! Tracks the current leader URL and owns the outbound hops toward it, one
//! session per target cluster, established lazily on first use. Leadership
//! changes never patch a hop in place: everything is torn down and the next
//! dial reconnects to the new leader.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::RelayError;
use crate::proxy::ProxyRegistry;
use redial_session::transport::Transport;
use redial_session::{Role, Session, SessionConfig, TunnelStream};

/// Establishes the transport for an outbound hop to a peer replica
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Open a relay transport to `url` scoped to `cluster`
    async fn connect(&self, url: &str, cluster: &str) -> Result<Transport, RelayError>;
}

/// Relay client run on every replica; inert while this replica is leader
pub struct RelayClient {
    connector: Arc<dyn PeerConnector>,
    ping_interval: Duration,
    leader_url: StdMutex<Option<String>>,
    /// cluster -> live outbound hop session
    hops: Mutex<HashMap<String, Arc<Session>>>,
    proxies: Arc<ProxyRegistry>,
}

impl RelayClient {
    /// New client. `proxies` is shared with whatever serves inbound relay
    /// callers so leadership changes tear both sides down together.
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        proxies: Arc<ProxyRegistry>,
        ping_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            connector,
            ping_interval,
            leader_url: StdMutex::new(None),
            hops: Mutex::new(HashMap::new()),
            proxies,
        })
    }

    /// Current leader URL, if this replica should relay
    pub fn leader_url(&self) -> Option<String> {
        self.leader_url.lock().expect("leader slot poisoned").clone()
    }

    /// Leadership change notification.
    ///
    /// Every proxy session and outbound hop is closed immediately; stale
    /// relay targets are never kept. When `is_leader` is true this replica
    /// answers dials from its own registry and the relay goes inert.
    pub async fn on_new_leader(&self, url: Option<&str>, is_leader: bool) {
        {
            let mut leader = self.leader_url.lock().expect("leader slot poisoned");
            *leader = if is_leader { None } else { url.map(str::to_string) };
        }
        info!(leader = url.unwrap_or("<none>"), is_leader, "leadership changed");

        self.proxies.close_all();
        let hops: Vec<_> = {
            let mut hops = self.hops.lock().await;
            hops.drain().collect()
        };
        for (cluster, hop) in hops {
            info!(cluster = %cluster, "closing relay hop");
            hop.close();
        }
    }

    /// Hop session toward the leader for `cluster`, connecting if needed
    async fn hop(self: &Arc<Self>, cluster: &str) -> Result<Arc<Session>, RelayError> {
        let url = self.leader_url().ok_or(RelayError::NoLeader)?;

        let mut hops = self.hops.lock().await;
        if let Some(hop) = hops.get(cluster) {
            return Ok(hop.clone());
        }

        let transport = self.connector.connect(&url, cluster).await?;
        let hop = Session::new(
            SessionConfig {
                client_key: cluster.to_string(),
                role: Role::Initiator,
                ping_interval: self.ping_interval,
                // the leader never dials back through a relay hop
                authorizer: None,
            },
            transport,
        );
        info!(cluster, %url, "relay hop established");
        hops.insert(cluster.to_string(), hop.clone());

        tokio::spawn({
            let hop = hop.clone();
            let session_key = hop.session_key();
            let cluster = cluster.to_string();
            let client = self.clone();
            async move {
                if let Err(e) = hop.serve().await {
                    warn!(cluster = %cluster, error = %e, "relay hop ended");
                }
                client.forget_hop(&cluster, session_key).await;
            }
        });
        Ok(hop)
    }

    async fn forget_hop(&self, cluster: &str, session_key: i64) {
        let mut hops = self.hops.lock().await;
        if let Some(hop) = hops.get(cluster) {
            if hop.session_key() == session_key {
                hops.remove(cluster);
            }
        }
    }

    /// Open a virtual connection to `proto`/`address` inside `cluster`'s
    /// session on the leader, relaying through the outbound hop
    pub async fn dial(
        self: &Arc<Self>,
        cluster: &str,
        proto: &str,
        address: &str,
        deadline: Duration,
    ) -> Result<TunnelStream, RelayError> {
        let hop = self.hop(cluster).await?;
        Ok(hop.dial(proto, address, deadline)?)
    }
}
