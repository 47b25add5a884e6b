//! Connect failure classification.
//!
//! The retry policy is platform-independent; this closed enum is the only
//! place a raw error is inspected. Classification goes by error kind and
//! HTTP status, never by matching OS error strings.

use std::io;

use tokio_tungstenite::tungstenite::Error as WsError;

/// Abstract cause of a failed connect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    /// Control plane answered 401/403: the credential was rejected
    HandshakeRejected,
    /// Control plane answered 404/410: this agent's registration is gone
    /// upstream
    IdentityLost,
    /// Control plane answered with any other status: the endpoint is
    /// reachable but not serving upgrades right now (restart, load balancer
    /// draining)
    Unavailable,
    /// Endpoint actively refused the connection
    Refused,
    /// Connection reset or aborted mid-handshake
    ResetByPeer,
    /// Connect or handshake timed out
    Timeout,
    /// Anything else
    Unknown,
}

impl FailureCause {
    /// Whether retrying can plausibly succeed without operator action
    pub fn transient(&self) -> bool {
        matches!(
            self,
            FailureCause::Unavailable
                | FailureCause::Refused
                | FailureCause::ResetByPeer
                | FailureCause::Timeout
        )
    }
}

/// Classify a WebSocket connect error
pub fn classify_ws(err: &WsError) -> FailureCause {
    match err {
        // only the auth and identity statuses are terminal; anything else
        // from the endpoint is worth another attempt
        WsError::Http(response) => match response.status().as_u16() {
            401 | 403 => FailureCause::HandshakeRejected,
            404 | 410 => FailureCause::IdentityLost,
            _ => FailureCause::Unavailable,
        },
        WsError::Io(e) => classify_io(e),
        WsError::ConnectionClosed | WsError::AlreadyClosed => FailureCause::ResetByPeer,
        _ => FailureCause::Unknown,
    }
}

/// Classify an I/O error by kind
pub fn classify_io(err: &io::Error) -> FailureCause {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => FailureCause::Refused,
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => FailureCause::ResetByPeer,
        io::ErrorKind::TimedOut => FailureCause::Timeout,
        _ => FailureCause::Unknown,
    }
}
