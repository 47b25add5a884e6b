//! Agent handshake authorization.
//!
//! An agent presents a credential in `X-API-Tunnel-Token` and a base64 JSON
//! registration payload in `X-API-Tunnel-Params`. The token resolves to a
//! cluster record through an external lookup; the payload's node section is
//! registered idempotently through an external store, and the resulting
//! record's stable name becomes the session-registry key.
//!
//! An absent or unmatched token is not an error, just "not yet registered":
//! the request is refused without being treated as an attack signal. A
//! malformed params payload is a hard reject.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

pub use redial_wire::handshake::{
    decode_params, encode_params, ClusterParams, NodeParams, RegistrationParams, PARAMS_HEADER,
    TOKEN_HEADER,
};
use redial_wire::ParamsError;

/// Cluster record resolved from a credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterRef {
    /// Stable cluster name
    pub name: String,
}

/// Durable node record returned by registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    /// Stable name; used as the session-registry key
    pub name: String,
}

/// Authorization errors. Only raised for malformed input or collaborator
/// failures; a merely unknown token is a decision, not an error.
#[derive(Error, Debug)]
pub enum AuthError {
    /// Registration payload was not valid base64 JSON
    #[error(transparent)]
    MalformedParams(#[from] ParamsError),

    /// External lookup or store failed
    #[error("registration store: {0}")]
    Store(String),
}

/// Outcome of a handshake authorization
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    /// Upgrade may proceed; register the session under `client_key`
    Authorized {
        /// Session-registry key derived for this caller
        client_key: String,
    },
    /// Credential absent or unknown; refuse without error
    Unauthorized,
}

/// Resolves a credential to a cluster record, indexed by token
#[async_trait]
pub trait ClusterLookup: Send + Sync {
    /// Cluster owning `token`, or `None` when the token is unknown
    async fn cluster_by_token(&self, token: &str) -> Result<Option<ClusterRef>, AuthError>;
}

/// Durable node registration. `get_or_create` is idempotent: re-registering
/// with identical data is a no-op update.
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Resolve or create the node record for `node` within `cluster`
    async fn get_or_create(
        &self,
        cluster: &ClusterRef,
        node: &NodeParams,
    ) -> Result<NodeRecord, AuthError>;
}

/// The primary handshake authorizer for agent connects
pub struct TokenAuthorizer {
    clusters: Arc<dyn ClusterLookup>,
    nodes: Arc<dyn NodeStore>,
}

impl TokenAuthorizer {
    /// New authorizer over the two external collaborators
    pub fn new(clusters: Arc<dyn ClusterLookup>, nodes: Arc<dyn NodeStore>) -> Self {
        Self { clusters, nodes }
    }

    /// Authorize a handshake from its two header values
    pub async fn authorize(
        &self,
        token: &str,
        params_b64: Option<&str>,
    ) -> Result<AuthDecision, AuthError> {
        if token.is_empty() {
            return Ok(AuthDecision::Unauthorized);
        }
        let Some(cluster) = self.clusters.cluster_by_token(token).await? else {
            debug!("unknown tunnel token");
            return Ok(AuthDecision::Unauthorized);
        };

        let params = match params_b64 {
            Some(raw) => decode_params(raw)?,
            None => RegistrationParams::default(),
        };

        let client_key = match &params.node {
            Some(node) => self.nodes.get_or_create(&cluster, node).await?.name,
            None => cluster.name.clone(),
        };
        debug!(client = %client_key, "handshake authorized");
        Ok(AuthDecision::Authorized { client_key })
    }
}
