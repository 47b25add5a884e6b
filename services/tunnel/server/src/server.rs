//! The control-plane dial surface.
//!
//! Wires the session registry, the proxy registry, and the relay client
//! together: a dial prefers the locally held session and falls through to
//! the relay when another replica holds it. Session removal tears down any
//! proxies relaying through the departed session.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::ServerError;
use redial_relay::{ProxyRegistry, RelayClient};
use redial_session::{SessionRegistry, TunnelStream};

/// Shared control-plane tunnel state
pub struct TunnelServer {
    registry: Arc<SessionRegistry>,
    proxies: Arc<ProxyRegistry>,
    relay: Arc<RelayClient>,
}

impl TunnelServer {
    /// Wire the three registries together. Installs the removal hook that
    /// closes relays pointing at a departed session.
    pub fn new(
        registry: Arc<SessionRegistry>,
        proxies: Arc<ProxyRegistry>,
        relay: Arc<RelayClient>,
    ) -> Arc<Self> {
        {
            let proxies = proxies.clone();
            registry.on_remove(Box::new(move |client_key, _session_key| {
                proxies.close_client(client_key);
            }));
        }
        Arc::new(Self {
            registry,
            proxies,
            relay,
        })
    }

    /// Session registry holding locally connected agents
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Proxy registry holding live relays
    pub fn proxies(&self) -> &Arc<ProxyRegistry> {
        &self.proxies
    }

    /// Relay client for sessions held elsewhere
    pub fn relay(&self) -> &Arc<RelayClient> {
        &self.relay
    }

    /// Open a virtual connection to `proto`/`address` inside the named
    /// caller's session, wherever it is held
    pub async fn dial(
        &self,
        client_key: &str,
        deadline: Duration,
        proto: &str,
        address: &str,
    ) -> Result<TunnelStream, ServerError> {
        if self.registry.has_session(client_key) {
            return Ok(self.registry.dial(client_key, deadline, proto, address)?);
        }
        debug!(client = client_key, "no local session, relaying");
        Ok(self.relay.dial(client_key, proto, address, deadline).await?)
    }

    /// A reusable dial handle bound to one identity and deadline, for
    /// drop-in use wherever a dial function is expected
    pub fn dialer(self: &Arc<Self>, client_key: &str, deadline: Duration) -> TunnelDialer {
        TunnelDialer {
            server: self.clone(),
            client_key: client_key.to_string(),
            deadline,
        }
    }
}

/// Dial handle bound to one caller identity
#[derive(Clone)]
pub struct TunnelDialer {
    server: Arc<TunnelServer>,
    client_key: String,
    deadline: Duration,
}

impl TunnelDialer {
    /// Open a virtual connection to `address` over `proto`
    pub async fn dial(&self, proto: &str, address: &str) -> Result<TunnelStream, ServerError> {
        self.server
            .dial(&self.client_key, self.deadline, proto, address)
            .await
    }

    /// Identity this dialer resolves
    pub fn client_key(&self) -> &str {
        &self.client_key
    }
}
