//! Keepalive pings for initiator sessions.
//!
//! The initiator opened the transport, so it is the side responsible for
//! detecting a dead middlebox: it sends a Ping frame on conn id 0 at a fixed
//! interval and the acceptor answers with Pong. The ping rides the same
//! serialized writer as connection data.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use redial_wire::Frame;

/// Spawn the keepalive loop. It stops when `cancel` fires or the outbound
/// channel closes.
pub(crate) fn spawn(
    out_tx: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    interval: std::time::Duration,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // first tick fires immediately; skip it so the interval is honest
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    // a full queue already proves the transport is moving
                    // data or dead; the ping can be dropped either way
                    if matches!(out_tx.try_send(Frame::ping()), Err(mpsc::error::TrySendError::Closed(_))) {
                        warn!("keepalive stopped: outbound channel closed");
                        break;
                    }
                    debug!("keepalive ping");
                }
            }
        }
    });
}
