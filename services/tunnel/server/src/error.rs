//! Server error types.

use thiserror::Error;

use crate::authorizer::AuthError;

/// Errors raised by the control-plane endpoint
#[derive(Error, Debug)]
pub enum ServerError {
    /// Listener or socket failure
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP-level failure while serving a connection
    #[error("http: {0}")]
    Http(#[from] hyper::Error),

    /// Upgrade handshake failure
    #[error("upgrade: {0}")]
    Upgrade(#[from] hyper_tungstenite::tungstenite::error::ProtocolError),

    /// Handshake authorization failure
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Dial failed on the local registry
    #[error(transparent)]
    Registry(#[from] redial_session::RegistryError),

    /// Dial failed through the relay
    #[error(transparent)]
    Relay(#[from] redial_relay::RelayError),
}
