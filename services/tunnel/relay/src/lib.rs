//! HA relay for multi-replica control planes.
//!
//! An agent's session lives on exactly one replica. A replica that does not
//! hold it relays through the one that does: a [`ProxySession`] accepts a
//! caller's transport like an acceptor session, lazily keeps an outbound hop
//! to the current holder, and translates connection IDs between the two
//! independently numbered hops.
//!
//! [`PeerManager`] tracks the replica set from membership observations;
//! [`RelayClient`] follows leadership changes and owns the outbound hops.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod error;
pub mod peer;
pub mod proxy;

pub use client::{PeerConnector, RelayClient};
pub use error::RelayError;
pub use peer::{Peer, PeerEvent, PeerManager};
pub use proxy::{ProxyRegistry, ProxySession, TargetDialer};
