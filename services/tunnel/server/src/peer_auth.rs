//! Inter-replica relay handshake.
//!
//! Replicas present a shared credential rather than an agent token, and
//! relay routing is keyed by the target cluster, not by the caller's own
//! identity. The outbound side ([`WsPeerConnector`]) stamps the same three
//! headers the inbound [`PeerAuthorizer`] checks.

use std::sync::Arc;

use async_trait::async_trait;
use http::HeaderMap;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tracing::debug;

use redial_relay::{PeerManager, RelayError};
use redial_session::transport::{self, Transport};

/// Shared inter-replica credential header
pub const PEER_TOKEN_HEADER: &str = "X-Tunnel-Token";
/// Target cluster the relay caller wants to reach
pub const CLUSTER_HEADER: &str = "X-Tunnel-Cluster";
/// Caller replica's own identifier
pub const ID_HEADER: &str = "X-Tunnel-ID";

/// Existence selector over the replica identity/token index
#[async_trait]
pub trait PeerTokenIndex: Send + Sync {
    /// Whether `token` is the valid credential for replica `id`
    async fn token_exists(&self, id: &str, token: &str) -> bool;
}

/// The peer table doubles as the credential index: a replica is valid when
/// it is known and presents the shared token
#[async_trait]
impl PeerTokenIndex for PeerManager {
    async fn token_exists(&self, id: &str, token: &str) -> bool {
        self.get(id).is_some() && self.token_matches(token)
    }
}

/// Identity of an authorized relay caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Cluster the caller wants relayed
    pub cluster: String,
    /// Caller replica id
    pub proxy_id: String,
}

/// Authorizer for the relay endpoint
pub struct PeerAuthorizer {
    index: Arc<dyn PeerTokenIndex>,
}

impl PeerAuthorizer {
    /// New authorizer over a replica credential index
    pub fn new(index: Arc<dyn PeerTokenIndex>) -> Self {
        Self { index }
    }

    /// Authorize a relay handshake from its headers; `None` refuses
    pub async fn authorize(&self, headers: &HeaderMap) -> Option<PeerIdentity> {
        let value = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string()
        };
        let token = value(PEER_TOKEN_HEADER);
        let cluster = value(CLUSTER_HEADER);
        let id = value(ID_HEADER);
        if token.is_empty() || cluster.is_empty() || id.is_empty() {
            return None;
        }
        if !self.index.token_exists(&id, &token).await {
            debug!(peer = %id, "relay handshake refused");
            return None;
        }
        Some(PeerIdentity {
            cluster,
            proxy_id: id,
        })
    }
}

/// Outbound relay hop connector: opens a WebSocket to a peer's relay
/// endpoint with the inter-replica headers
pub struct WsPeerConnector {
    id: String,
    token: String,
}

impl WsPeerConnector {
    /// New connector presenting this replica's id and the shared token
    pub fn new(id: &str, token: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            token: token.to_string(),
        })
    }
}

#[async_trait]
impl redial_relay::PeerConnector for WsPeerConnector {
    async fn connect(&self, url: &str, cluster: &str) -> Result<Transport, RelayError> {
        let peer_connect_err = |reason: String| RelayError::PeerConnect {
            url: url.to_string(),
            reason,
        };

        let mut request = url
            .into_client_request()
            .map_err(|e| peer_connect_err(e.to_string()))?;
        let headers = request.headers_mut();
        for (name, value) in [
            (PEER_TOKEN_HEADER, self.token.as_str()),
            (CLUSTER_HEADER, cluster),
            (ID_HEADER, self.id.as_str()),
        ] {
            headers.insert(
                name,
                value.parse().map_err(|_| {
                    peer_connect_err(format!("invalid header value for {name}"))
                })?,
            );
        }

        let (ws, _response) = connect_async(request)
            .await
            .map_err(|e| peer_connect_err(e.to_string()))?;
        Ok(transport::websocket(ws))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(token: &str, cluster: &str, id: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in [
            (PEER_TOKEN_HEADER, token),
            (CLUSTER_HEADER, cluster),
            (ID_HEADER, id),
        ] {
            if !value.is_empty() {
                map.insert(name, HeaderValue::from_str(value).unwrap());
            }
        }
        map
    }

    fn authorizer() -> PeerAuthorizer {
        let peers = Arc::new(PeerManager::new("s3cret", |ip| format!("wss://{ip}")));
        peers.add_peer("wss://10.0.0.9", "10.0.0.9", "s3cret");
        PeerAuthorizer::new(peers)
    }

    #[tokio::test]
    async fn test_known_peer_with_token_is_authorized() {
        let identity = authorizer()
            .authorize(&headers("s3cret", "c1", "10.0.0.9"))
            .await
            .unwrap();
        assert_eq!(identity.cluster, "c1");
        assert_eq!(identity.proxy_id, "10.0.0.9");
    }

    #[tokio::test]
    async fn test_wrong_token_or_unknown_peer_refused() {
        let auth = authorizer();
        assert!(auth.authorize(&headers("wrong", "c1", "10.0.0.9")).await.is_none());
        assert!(auth.authorize(&headers("s3cret", "c1", "10.0.0.7")).await.is_none());
    }

    #[tokio::test]
    async fn test_missing_headers_refused() {
        let auth = authorizer();
        assert!(auth.authorize(&headers("", "c1", "10.0.0.9")).await.is_none());
        assert!(auth.authorize(&headers("s3cret", "", "10.0.0.9")).await.is_none());
        assert!(auth.authorize(&headers("s3cret", "c1", "")).await.is_none());
    }
}
