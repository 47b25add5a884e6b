//! Relay error types.

use thiserror::Error;

/// Errors raised by the relay layer
#[derive(Error, Debug)]
pub enum RelayError {
    /// No leader URL is known; either leadership was never observed or this
    /// replica is itself the leader and should dial its own registry
    #[error("no relay target: leader unknown or local")]
    NoLeader,

    /// Outbound hop to the leader could not be established
    #[error("peer connect to {url}: {reason}")]
    PeerConnect {
        /// Leader URL the hop was aimed at
        url: String,
        /// Connect failure detail
        reason: String,
    },

    /// Dial through the target session failed
    #[error(transparent)]
    Registry(#[from] redial_session::RegistryError),

    /// Session-level failure on a hop
    #[error(transparent)]
    Session(#[from] redial_session::SessionError),

    /// Caller-hop transport failure
    #[error(transparent)]
    Transport(#[from] redial_session::TransportError),

    /// Undecodable frame on the caller hop
    #[error("wire: {0}")]
    Wire(#[from] redial_wire::WireError),

    /// Proxy session already serving
    #[error("serve already running")]
    AlreadyServing,
}
