//! Session multiplexer for reverse tunnels.
//!
//! One duplex, message-framed transport carries many independent virtual
//! connections. A [`Session`] owns the transport and the connection-ID space,
//! runs the single frame-reading loop, and dispatches Connect/Data/Error
//! frames to [`TunnelStream`]s. The [`SessionRegistry`] maps caller identity
//! to live sessions and exposes the `dial` operation used by the control
//! plane.
//!
//! ## Roles
//!
//! - **Acceptor**: server side; wraps an authorized inbound transport and
//!   dials through it.
//! - **Initiator**: agent side; opens the transport, runs keepalive pings,
//!   and carries a connect authorizer so the control plane can ask it to
//!   dial local endpoints.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use redial_session::{SessionRegistry, transport};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = std::sync::Arc::new(SessionRegistry::new());
//! let (server_side, _agent_side) = transport::memory(64);
//!
//! let session = registry.add("agent1", server_side);
//! let serve = {
//!     let registry = registry.clone();
//!     let session = session.clone();
//!     tokio::spawn(async move {
//!         let result = session.serve().await;
//!         registry.remove(&session);
//!         result
//!     })
//! };
//!
//! let stream = registry.dial("agent1", Duration::from_secs(15), "tcp", "10.0.0.5:80")?;
//! // stream implements AsyncRead + AsyncWrite
//! # drop(stream);
//! # serve.abort();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
mod keepalive;
pub mod registry;
pub mod session;
pub mod transport;

pub use connection::{ConnState, TunnelStream};
pub use registry::{Dialer, RegistryError, SessionRegistry};
pub use session::{ConnectAuthorizer, Role, Session, SessionConfig, SessionError};
pub use transport::{FrameSink, FrameSource, Transport, TransportError};
