//! Virtual connections: one multiplexed logical stream within a session.
//!
//! A [`TunnelStream`] bridges a local byte-stream consumer to the owning
//! session's frame path. Writes become Data frames on the session's single
//! serialized writer; reads drain the per-connection pipe fed by the
//! session's serve loop. The back reference to the session is weak: the
//! session map is the sole owner, and a stream never extends session
//! lifetime.

use std::io;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

use crate::session::SessionShared;
use redial_wire::Frame;

/// Reason a virtual connection closed, delivered through its pipe.
/// `None` is a clean EOF; `Some` carries the error text.
pub(crate) type CloseReason = Option<String>;

/// Events fed into a virtual connection by the session serve loop
#[derive(Debug)]
pub(crate) enum ConnEvent {
    /// Payload from a Data frame, in send order
    Data(Bytes),
    /// Terminal: remote Error, local teardown, or session close
    Closed(CloseReason),
}

/// Dial lifecycle of an optimistically opened connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Connect sent, nothing heard back yet (caller may write already)
    Pending,
    /// Peer has sent data
    Established,
    /// Peer answered with an Error frame
    Failed,
}

/// One multiplexed logical stream, usable anywhere an
/// `AsyncRead + AsyncWrite` connection is expected.
pub struct TunnelStream {
    conn_id: u64,
    proto: String,
    address: String,
    state: ConnState,
    session: Weak<SessionShared>,
    writer: PollSender<Frame>,
    events: mpsc::UnboundedReceiver<ConnEvent>,
    readbuf: Bytes,
    closed: Option<CloseReason>,
    detached: bool,
}

impl TunnelStream {
    pub(crate) fn new(
        conn_id: u64,
        proto: &str,
        address: &str,
        session: Weak<SessionShared>,
        writer: PollSender<Frame>,
        events: mpsc::UnboundedReceiver<ConnEvent>,
    ) -> Self {
        Self {
            conn_id,
            proto: proto.to_string(),
            address: address.to_string(),
            state: ConnState::Pending,
            session,
            writer,
            events,
            readbuf: Bytes::new(),
            closed: None,
            detached: false,
        }
    }

    /// Connection ID within the owning session
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Dial protocol this stream was opened with
    pub fn proto(&self) -> &str {
        &self.proto
    }

    /// Dial address this stream was opened with
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Current dial lifecycle state
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Remove this stream from the session map and, when the closure was
    /// locally initiated, tell the peer so it drops its mirror entry.
    fn detach(&mut self, notify: Option<&str>) {
        if self.detached {
            return;
        }
        self.detached = true;
        if let Some(shared) = self.session.upgrade() {
            shared.detach_conn(self.conn_id, notify);
        }
    }

    fn closed_error(reason: &CloseReason) -> Option<io::Error> {
        reason
            .as_ref()
            .map(|msg| io::Error::new(io::ErrorKind::ConnectionReset, msg.clone()))
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.readbuf.is_empty() {
                let n = this.readbuf.len().min(buf.remaining());
                buf.put_slice(&this.readbuf[..n]);
                this.readbuf.advance(n);
                return Poll::Ready(Ok(()));
            }

            if let Some(reason) = &this.closed {
                return match Self::closed_error(reason) {
                    Some(err) => Poll::Ready(Err(err)),
                    None => Poll::Ready(Ok(())), // clean EOF
                };
            }

            match this.events.poll_recv(cx) {
                Poll::Ready(Some(ConnEvent::Data(payload))) => {
                    this.state = ConnState::Established;
                    this.readbuf = payload;
                }
                Poll::Ready(Some(ConnEvent::Closed(reason))) => {
                    if reason.is_some() && this.state == ConnState::Pending {
                        this.state = ConnState::Failed;
                    }
                    // remote-initiated or session-driven closure: the map
                    // entry is already gone, never echo an Error frame
                    this.detached = true;
                    this.closed = Some(reason);
                }
                Poll::Ready(None) => {
                    this.detached = true;
                    this.closed = Some(Some("tunnel disconnect".to_string()));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.closed.is_some() || this.detached {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "virtual connection closed",
            )));
        }
        // Pending here is the backpressure path: the outbound queue is
        // bounded, so a transport that stops draining stalls writers
        // instead of buffering frames without limit
        match this.writer.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let frame = Frame::data(this.conn_id, Bytes::copy_from_slice(buf));
                match this.writer.send_item(frame) {
                    Ok(()) => Poll::Ready(Ok(buf.len())),
                    Err(_) => Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "session closed",
                    ))),
                }
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "session closed",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.detach(Some("EOF"));
        Poll::Ready(Ok(()))
    }
}

impl Drop for TunnelStream {
    fn drop(&mut self) {
        self.detach(Some("EOF"));
    }
}

impl std::fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelStream")
            .field("conn_id", &self.conn_id)
            .field("proto", &self.proto)
            .field("address", &self.address)
            .field("state", &self.state)
            .finish()
    }
}
