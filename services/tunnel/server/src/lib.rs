//! Control-plane side of the tunnel.
//!
//! Agents arrive at `GET /connect` with the two tunnel headers; peer
//! replicas relaying for a caller arrive at `GET /connect/proxy`. Authorized
//! requests are upgraded to WebSocket, wrapped in a session, and registered
//! under the caller identity the [`TokenAuthorizer`] derived. The
//! [`TunnelServer`] exposes the Dial contract, falling through to the HA
//! relay when the agent's session lives on another replica.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod authorizer;
pub mod error;
pub mod peer_auth;
pub mod server;
pub mod upgrade;

pub use authorizer::{
    decode_params, encode_params, AuthDecision, AuthError, ClusterLookup, ClusterRef, NodeParams,
    NodeRecord, NodeStore, RegistrationParams, TokenAuthorizer, PARAMS_HEADER, TOKEN_HEADER,
};
pub use error::ServerError;
pub use peer_auth::{
    PeerAuthorizer, PeerIdentity, PeerTokenIndex, WsPeerConnector, CLUSTER_HEADER, ID_HEADER,
    PEER_TOKEN_HEADER,
};
pub use server::{TunnelDialer, TunnelServer};
pub use upgrade::{bind, run, Endpoint};
