//! Transports carrying tunnel frames.
//!
//! A transport is any ordered duplex channel that preserves message
//! boundaries: one `send` on one side surfaces as exactly one `recv` on the
//! other. Production sessions run over WebSocket (an upgraded HTTP
//! connection); tests and in-process relays use the in-memory pair.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// Transport-level errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Underlying socket error
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket protocol error
    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Transport already closed
    #[error("transport closed")]
    Closed,
}

/// Write half of a transport. One `send` writes one whole frame.
#[async_trait]
pub trait FrameSink: Send {
    /// Write one frame as a single transport message
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Close the transport write side
    async fn close(&mut self);
}

/// Read half of a transport. One `recv` yields one whole frame.
#[async_trait]
pub trait FrameSource: Send {
    /// Read the next frame; `None` means the transport closed cleanly
    async fn recv(&mut self) -> Option<Result<Bytes, TransportError>>;
}

/// A split transport: write half and read half
pub type Transport = (Box<dyn FrameSink>, Box<dyn FrameSource>);

/// Wrap a WebSocket stream as a tunnel transport.
///
/// Only binary messages carry frames; text messages are ignored and a Close
/// message ends the source.
pub fn websocket<S>(ws: WebSocketStream<S>) -> Transport
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    (
        Box::new(WsSink { inner: sink }),
        Box::new(WsSource { inner: stream }),
    )
}

struct WsSink<S> {
    inner: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S> FrameSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.inner
            .send(Message::Binary(frame.to_vec()))
            .await
            .map_err(TransportError::from)
    }

    async fn close(&mut self) {
        let _ = self.inner.send(Message::Close(None)).await;
    }
}

struct WsSource<S> {
    inner: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> FrameSource for WsSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> Option<Result<Bytes, TransportError>> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Binary(raw)) => return Some(Ok(Bytes::from(raw))),
                Ok(Message::Close(_)) => return None,
                // tungstenite answers ws-level pings itself; text has no
                // meaning on this endpoint
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

/// Build a connected in-memory transport pair.
///
/// Frames sent on one side arrive in order on the other. Dropping a side
/// closes the peer's source.
pub fn memory(capacity: usize) -> (Transport, Transport) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    (
        (
            Box::new(MemorySink { tx: Some(a_tx) }),
            Box::new(MemorySource { rx: a_rx }),
        ),
        (
            Box::new(MemorySink { tx: Some(b_tx) }),
            Box::new(MemorySource { rx: b_rx }),
        ),
    )
}

struct MemorySink {
    tx: Option<mpsc::Sender<Bytes>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        match &self.tx {
            Some(tx) => tx.send(frame).await.map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    async fn close(&mut self) {
        self.tx.take();
    }
}

struct MemorySource {
    rx: mpsc::Receiver<Bytes>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> Option<Result<Bytes, TransportError>> {
        self.rx.recv().await.map(Ok)
    }
}
