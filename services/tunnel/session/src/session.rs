//! Session: the multiplexer bound to one transport.
//!
//! A session owns the connection-ID space, the single frame-reading loop,
//! and a single writer task that serializes every outgoing frame (virtual
//! connection data, Error emission, and keepalive pings share it), so a
//! torn frame can never appear on the wire.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::{debug, error, warn};

use crate::connection::{ConnEvent, TunnelStream};
use crate::keepalive;
use crate::transport::{FrameSink, FrameSource, Transport, TransportError};
use redial_wire::{ConnectRequest, Frame, FrameBody, WireError};

/// Read chunk size when bridging a locally dialed socket
const BRIDGE_CHUNK: usize = 32 * 1024;

/// Outbound frame queue depth. A transport that stops draining makes
/// stream writes return Pending once this many frames are queued.
const OUTBOUND_BUFFER: usize = 256;

/// Session role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Agent side: opened the transport, runs keepalive
    Initiator,
    /// Server side: received the transport
    Acceptor,
}

/// Decides whether an inbound Connect may dial the given proto/address
pub type ConnectAuthorizer = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Frame decode failure; frame boundaries are unrecoverable afterwards
    #[error("wire: {0}")]
    Wire(#[from] WireError),

    /// Transport read failure
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    /// Transport write failure, raised by the writer task
    #[error("transport write failed: {0}")]
    WriteFailed(String),

    /// Inbound Connect denied (or received on a session with no authorizer).
    /// Fatal for the whole session: it signals an untrusted peer.
    #[error("connect to {proto}/{address} not allowed")]
    ConnectNotAllowed {
        /// Requested dial protocol
        proto: String,
        /// Requested dial address
        address: String,
    },

    /// Transport ended
    #[error("tunnel disconnect")]
    Disconnect,

    /// Session already closed
    #[error("session closed")]
    Closed,

    /// Outbound frame queue full; the transport is not draining
    #[error("outbound queue full")]
    Backlogged,

    /// serve() called twice
    #[error("serve already running")]
    AlreadyServing,
}

/// Session configuration
#[derive(Clone)]
pub struct SessionConfig {
    /// Caller identity this session belongs to
    pub client_key: String,
    /// Initiator or acceptor
    pub role: Role,
    /// Keepalive ping interval (initiator only)
    pub ping_interval: Duration,
    /// Consulted once per inbound Connect; sessions without one refuse
    /// Connect entirely
    pub authorizer: Option<ConnectAuthorizer>,
}

impl SessionConfig {
    /// Server-side session wrapping an authorized inbound transport
    pub fn acceptor(client_key: &str) -> Self {
        Self {
            client_key: client_key.to_string(),
            role: Role::Acceptor,
            ping_interval: Duration::from_secs(5),
            authorizer: None,
        }
    }

    /// Agent-side session that keeps the transport alive and accepts
    /// inbound Connect requests
    pub fn initiator(client_key: &str, authorizer: ConnectAuthorizer) -> Self {
        Self {
            client_key: client_key.to_string(),
            role: Role::Initiator,
            ping_interval: Duration::from_secs(5),
            authorizer: Some(authorizer),
        }
    }
}

/// State shared between the session, its writer task, and its streams
pub(crate) struct SessionShared {
    client_key: String,
    session_key: i64,
    role: Role,
    out_tx: mpsc::Sender<Frame>,
    /// conn_id -> pipe into the virtual connection. Exclusive access under
    /// this lock; removal is the only path to conn-id retirement.
    conns: StdMutex<HashMap<u64, mpsc::UnboundedSender<ConnEvent>>>,
    next_conn_id: AtomicU64,
    cancel: CancellationToken,
    authorizer: Option<ConnectAuthorizer>,
    fatal: StdMutex<Option<String>>,
}

impl SessionShared {
    /// Enqueue one control frame on the serialized writer. Returns false
    /// once the session is closed. Data frames go through the bounded
    /// [`PollSender`] path instead; a control frame that finds the queue
    /// full is dropped, never awaited.
    pub(crate) fn send_frame(&self, frame: Frame) -> bool {
        self.out_tx.try_send(frame).is_ok()
    }

    /// Drop a connection from the map. When `notify` is set the closure was
    /// locally initiated, so the peer is told to clean up its mirror entry.
    pub(crate) fn detach_conn(&self, conn_id: u64, notify: Option<&str>) {
        let removed = self
            .conns
            .lock()
            .expect("connection map poisoned")
            .remove(&conn_id)
            .is_some();
        if removed {
            debug!(client = %self.client_key, conn_id, "virtual connection removed");
            if let Some(reason) = notify {
                let _ = self.out_tx.try_send(Frame::error(conn_id, reason));
            }
        }
    }

    fn record_fatal(&self, message: String) {
        let mut fatal = self.fatal.lock().expect("fatal slot poisoned");
        fatal.get_or_insert(message);
        self.cancel.cancel();
    }

    fn take_fatal(&self) -> Option<String> {
        self.fatal.lock().expect("fatal slot poisoned").take()
    }
}

/// The multiplexer bound to one transport
pub struct Session {
    shared: Arc<SessionShared>,
    source: Mutex<Option<Box<dyn FrameSource>>>,
}

impl Session {
    /// Wrap a transport in a session. The write half is claimed by a writer
    /// task immediately; `serve` must be called to start dispatching inbound
    /// frames.
    pub fn new(config: SessionConfig, transport: Transport) -> Arc<Self> {
        let (sink, source) = transport;
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let cancel = CancellationToken::new();

        let shared = Arc::new(SessionShared {
            client_key: config.client_key,
            session_key: (rand::random::<u64>() >> 1) as i64,
            role: config.role,
            out_tx,
            conns: StdMutex::new(HashMap::new()),
            // conn id 0 is reserved for keepalive frames
            next_conn_id: AtomicU64::new(1),
            cancel: cancel.clone(),
            authorizer: config.authorizer,
            fatal: StdMutex::new(None),
        });

        tokio::spawn(write_loop(sink, out_rx, shared.clone()));

        if config.role == Role::Initiator {
            keepalive::spawn(
                shared.out_tx.clone(),
                cancel.child_token(),
                config.ping_interval,
            );
        }

        Arc::new(Self {
            shared,
            source: Mutex::new(Some(source)),
        })
    }

    /// Identity this session is registered under
    pub fn client_key(&self) -> &str {
        &self.shared.client_key
    }

    /// Random per-instance discriminator; a caller identity may transiently
    /// hold more than one session during reconnect races
    pub fn session_key(&self) -> i64 {
        self.shared.session_key
    }

    /// Session role
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Number of currently open virtual connections
    pub fn active_connections(&self) -> usize {
        self.shared.conns.lock().expect("connection map poisoned").len()
    }

    /// Run the frame loop until the transport errs or the session closes.
    /// Fatal dispatch errors (decode failure, denied Connect) terminate the
    /// loop and cascade to every virtual connection.
    pub async fn serve(&self) -> Result<(), SessionError> {
        let mut source = {
            let mut slot = self.source.lock().await;
            slot.take().ok_or(SessionError::AlreadyServing)?
        };
        let result = self.serve_frames(&mut source).await;
        self.close();
        result
    }

    async fn serve_frames(
        &self,
        source: &mut Box<dyn FrameSource>,
    ) -> Result<(), SessionError> {
        loop {
            tokio::select! {
                biased;

                _ = self.shared.cancel.cancelled() => {
                    return match self.shared.take_fatal() {
                        Some(message) => Err(SessionError::WriteFailed(message)),
                        None => Ok(()),
                    };
                }

                message = source.recv() => match message {
                    None => return Err(SessionError::Disconnect),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(raw)) => {
                        let frame = Frame::decode(raw)?;
                        self.dispatch(frame)?;
                    }
                }
            }
        }
    }

    fn dispatch(&self, frame: Frame) -> Result<(), SessionError> {
        let conn_id = frame.conn_id;
        match frame.body {
            FrameBody::Connect(request) => self.handle_connect(conn_id, request),
            FrameBody::Data(payload) => {
                self.handle_data(conn_id, payload);
                Ok(())
            }
            FrameBody::Error(message) => {
                self.handle_error(conn_id, message);
                Ok(())
            }
            FrameBody::Ping => {
                self.shared.send_frame(Frame::pong());
                Ok(())
            }
            FrameBody::Pong => {
                debug!(client = %self.shared.client_key, "keepalive pong");
                Ok(())
            }
        }
    }

    fn handle_connect(&self, conn_id: u64, request: ConnectRequest) -> Result<(), SessionError> {
        let allowed = self
            .shared
            .authorizer
            .as_ref()
            .map(|auth| auth(&request.proto, &request.address))
            .unwrap_or(false);
        if !allowed {
            // fatal, not connection-scoped: a hostile or misconfigured
            // Connect signals an untrusted peer
            return Err(SessionError::ConnectNotAllowed {
                proto: request.proto,
                address: request.address,
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut conns = self.shared.conns.lock().expect("connection map poisoned");
            if conns.contains_key(&conn_id) {
                warn!(conn_id, "connect for an id that is already open");
                self.shared
                    .send_frame(Frame::error(conn_id, "connection already exists"));
                return Ok(());
            }
            conns.insert(conn_id, tx);
        }

        debug!(
            client = %self.shared.client_key,
            conn_id,
            proto = %request.proto,
            address = %request.address,
            "inbound connect"
        );
        tokio::spawn(bridge_local(self.shared.clone(), conn_id, request, rx));
        Ok(())
    }

    fn handle_data(&self, conn_id: u64, payload: Bytes) {
        let delivered = {
            let conns = self.shared.conns.lock().expect("connection map poisoned");
            match conns.get(&conn_id) {
                Some(tx) => tx.send(ConnEvent::Data(payload)).is_ok(),
                None => false,
            }
        };
        if !delivered {
            // the peer may not know this connection was already torn down;
            // answer so it can clean up its mirror entry
            debug!(conn_id, "data for unknown connection");
            self.shared
                .send_frame(Frame::error(conn_id, "connection not found"));
        }
    }

    fn handle_error(&self, conn_id: u64, message: String) {
        let entry = self
            .shared
            .conns
            .lock()
            .expect("connection map poisoned")
            .remove(&conn_id);
        match entry {
            Some(tx) => {
                // "EOF" is the peer's clean-close marker
                let reason = if message == "EOF" { None } else { Some(message) };
                let _ = tx.send(ConnEvent::Closed(reason));
            }
            None => {
                // already removed locally; remote close is idempotent
                debug!(conn_id, "error frame for unknown connection");
            }
        }
    }

    /// Open a new virtual connection through this session.
    ///
    /// Optimistic/half-open: the Connect frame is sent and the stream is
    /// returned before any confirmation; a failure surfaces on the stream's
    /// first read as the carried Error.
    pub fn dial(
        &self,
        proto: &str,
        address: &str,
        deadline: Duration,
    ) -> Result<TunnelStream, SessionError> {
        if self.shared.cancel.is_cancelled() {
            return Err(SessionError::Closed);
        }

        let conn_id = self.shared.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .conns
            .lock()
            .expect("connection map poisoned")
            .insert(conn_id, tx);

        let frame = Frame::connect(conn_id, proto, address, deadline.as_millis() as u64);
        if let Err(e) = self.shared.out_tx.try_send(frame) {
            self.shared.detach_conn(conn_id, None);
            return Err(match e {
                TrySendError::Full(_) => SessionError::Backlogged,
                TrySendError::Closed(_) => SessionError::Closed,
            });
        }

        debug!(
            client = %self.shared.client_key,
            conn_id, proto, address, "dial"
        );
        Ok(TunnelStream::new(
            conn_id,
            proto,
            address,
            Arc::downgrade(&self.shared),
            PollSender::new(self.shared.out_tx.clone()),
            rx,
        ))
    }

    /// Stop the session: cancels keepalive and the writer, then closes every
    /// virtual connection with a tunnel-disconnect error.
    pub fn close(&self) {
        self.shared.cancel.cancel();
        let drained: Vec<_> = {
            let mut conns = self.shared.conns.lock().expect("connection map poisoned");
            conns.drain().collect()
        };
        for (conn_id, tx) in drained {
            debug!(client = %self.shared.client_key, conn_id, "closing with session");
            let _ = tx.send(ConnEvent::Closed(Some("tunnel disconnect".to_string())));
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_key", &self.shared.client_key)
            .field("session_key", &self.shared.session_key)
            .field("role", &self.shared.role)
            .finish()
    }
}

/// Drain the outbound channel onto the transport, one frame at a time.
/// Holding the sink here for the full frame write is what keeps writes
/// serialized across data, errors, and pings.
async fn write_loop(
    mut sink: Box<dyn FrameSink>,
    mut out_rx: mpsc::Receiver<Frame>,
    shared: Arc<SessionShared>,
) {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            frame = out_rx.recv() => {
                let Some(frame) = frame else { break };
                let encoded = match frame.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        error!(client = %shared.client_key, error = %e, "unencodable frame dropped");
                        continue;
                    }
                };
                if let Err(e) = sink.send(encoded).await {
                    error!(client = %shared.client_key, error = %e, "transport write failed");
                    shared.record_fatal(e.to_string());
                    break;
                }
            }
        }
    }
    sink.close().await;
}

/// Locally dialed endpoint for an inbound Connect
enum LocalStream {
    Tcp(tokio::net::TcpStream),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

async fn dial_local(request: &ConnectRequest) -> std::io::Result<LocalStream> {
    match request.proto.as_str() {
        "tcp" => Ok(LocalStream::Tcp(
            tokio::net::TcpStream::connect(&request.address).await?,
        )),
        #[cfg(unix)]
        "unix" => Ok(LocalStream::Unix(
            tokio::net::UnixStream::connect(&request.address).await?,
        )),
        other => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("unsupported proto {other}"),
        )),
    }
}

/// Bridge one inbound Connect to a freshly dialed local socket.
///
/// A dial failure tunnel-closes only this connection; the rest of the
/// session is unaffected.
async fn bridge_local(
    shared: Arc<SessionShared>,
    conn_id: u64,
    request: ConnectRequest,
    mut events: mpsc::UnboundedReceiver<ConnEvent>,
) {
    let dialed = if request.deadline_ms > 0 {
        match timeout(Duration::from_millis(request.deadline_ms), dial_local(&request)).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "dial timed out",
            )),
        }
    } else {
        dial_local(&request).await
    };

    let stream = match dialed {
        Ok(stream) => stream,
        Err(e) => {
            warn!(
                conn_id,
                proto = %request.proto,
                address = %request.address,
                error = %e,
                "local dial failed"
            );
            shared.detach_conn(
                conn_id,
                Some(&format!("dial {}/{}: {}", request.proto, request.address, e)),
            );
            return;
        }
    };

    let (mut reader, mut writer): (
        Box<dyn tokio::io::AsyncRead + Unpin + Send>,
        Box<dyn tokio::io::AsyncWrite + Unpin + Send>,
    ) = match stream {
        LocalStream::Tcp(s) => {
            let (r, w) = s.into_split();
            (Box::new(r), Box::new(w))
        }
        #[cfg(unix)]
        LocalStream::Unix(s) => {
            let (r, w) = s.into_split();
            (Box::new(r), Box::new(w))
        }
    };

    let mut chunk = vec![0u8; BRIDGE_CHUNK];
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,

            event = events.recv() => match event {
                Some(ConnEvent::Data(payload)) => {
                    if let Err(e) = writer.write_all(&payload).await {
                        shared.detach_conn(conn_id, Some(&format!("local write: {e}")));
                        break;
                    }
                }
                Some(ConnEvent::Closed(_)) | None => {
                    let _ = writer.shutdown().await;
                    break;
                }
            },

            read = reader.read(&mut chunk) => match read {
                Ok(0) => {
                    shared.detach_conn(conn_id, Some("EOF"));
                    break;
                }
                Ok(n) => {
                    // awaiting here is the backpressure: a full outbound
                    // queue pauses the local read side
                    let frame = Frame::data(conn_id, Bytes::copy_from_slice(&chunk[..n]));
                    if shared.out_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    shared.detach_conn(conn_id, Some(&format!("local read: {e}")));
                    break;
                }
            },
        }
    }
}
