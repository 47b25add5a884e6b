//! Proxy sessions: frame relay with connection-ID translation.
//!
//! A proxy session bridges two hops with independently numbered connection
//! spaces: the caller hop (an inbound transport served exactly like an
//! acceptor session) and the target hop (virtual connections dialed through
//! whichever real session holds the agent). The `conn_map` records
//! `local conn id -> target conn id`; Data and Error frames are re-framed
//! through it in both directions. The map is owned exclusively by its proxy
//! session, so no cross-session locking is needed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::RelayError;
use redial_session::registry::RegistryError;
use redial_session::transport::{FrameSink, FrameSource, Transport};
use redial_session::TunnelStream;
use redial_wire::{Frame, FrameBody};

/// Opens a virtual connection on the target hop. On a follower this dials
/// through the outbound hop session to the leader; on the holder it dials
/// the local session registry.
pub type TargetDialer =
    Arc<dyn Fn(&str, &str, Duration) -> Result<TunnelStream, RegistryError> + Send + Sync>;

static NEXT_PROXY_ID: AtomicU64 = AtomicU64::new(1);

enum PumpEvent {
    Data(Bytes),
    Close,
}

/// One relay between a caller hop and a target dialer
pub struct ProxySession {
    id: u64,
    cluster: String,
    target: TargetDialer,
    out_tx: mpsc::UnboundedSender<Frame>,
    /// local conn id -> target conn id
    conn_map: StdMutex<HashMap<u64, u64>>,
    pumps: StdMutex<HashMap<u64, mpsc::UnboundedSender<PumpEvent>>>,
    cancel: CancellationToken,
    source: Mutex<Option<Box<dyn FrameSource>>>,
}

impl ProxySession {
    /// Wrap a caller transport. The write half is claimed by a writer task
    /// immediately; call [`serve`](Self::serve) to start relaying.
    pub fn new(cluster: &str, caller: Transport, target: TargetDialer) -> Arc<Self> {
        let (sink, source) = caller;
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let proxy = Arc::new(Self {
            id: NEXT_PROXY_ID.fetch_add(1, Ordering::Relaxed),
            cluster: cluster.to_string(),
            target,
            out_tx,
            conn_map: StdMutex::new(HashMap::new()),
            pumps: StdMutex::new(HashMap::new()),
            cancel: cancel.clone(),
            source: Mutex::new(Some(source)),
        });

        tokio::spawn(write_caller(sink, out_rx, cancel));
        proxy
    }

    /// Target cluster this proxy relays toward
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Per-process unique proxy id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Target conn id currently mapped for a caller-hop conn id
    pub fn translate(&self, local_conn_id: u64) -> Option<u64> {
        self.conn_map
            .lock()
            .expect("conn map poisoned")
            .get(&local_conn_id)
            .copied()
    }

    /// Relay caller-hop frames until the transport ends or the proxy is
    /// closed. Always tears the proxy down on return.
    pub async fn serve(self: &Arc<Self>) -> Result<(), RelayError> {
        let mut source = {
            let mut slot = self.source.lock().await;
            slot.take().ok_or(RelayError::AlreadyServing)?
        };
        let result = self.serve_frames(&mut source).await;
        self.close();
        result
    }

    async fn serve_frames(
        self: &Arc<Self>,
        source: &mut Box<dyn FrameSource>,
    ) -> Result<(), RelayError> {
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return Ok(()),

                message = source.recv() => match message {
                    None => return Ok(()),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(raw)) => {
                        let frame = Frame::decode(raw)?;
                        self.relay(frame);
                    }
                }
            }
        }
    }

    fn relay(self: &Arc<Self>, frame: Frame) {
        let local_id = frame.conn_id;
        match frame.body {
            FrameBody::Connect(request) => {
                let deadline = Duration::from_millis(request.deadline_ms);
                match (self.target)(&request.proto, &request.address, deadline) {
                    Ok(stream) => {
                        let (tx, rx) = mpsc::unbounded_channel();
                        {
                            let mut conn_map =
                                self.conn_map.lock().expect("conn map poisoned");
                            let mut pumps = self.pumps.lock().expect("pump map poisoned");
                            conn_map.insert(local_id, stream.conn_id());
                            pumps.insert(local_id, tx);
                        }
                        debug!(
                            cluster = %self.cluster,
                            local_id,
                            target_id = stream.conn_id(),
                            "relay connect"
                        );
                        tokio::spawn(pump_target(self.clone(), local_id, stream, rx));
                    }
                    Err(e) => {
                        warn!(cluster = %self.cluster, local_id, error = %e, "relay dial failed");
                        let _ = self.out_tx.send(Frame::error(local_id, &e.to_string()));
                    }
                }
            }
            FrameBody::Data(payload) => {
                let delivered = {
                    let pumps = self.pumps.lock().expect("pump map poisoned");
                    match pumps.get(&local_id) {
                        Some(tx) => tx.send(PumpEvent::Data(payload)).is_ok(),
                        None => false,
                    }
                };
                if !delivered {
                    let _ = self
                        .out_tx
                        .send(Frame::error(local_id, "connection not found"));
                }
            }
            FrameBody::Error(message) => {
                debug!(cluster = %self.cluster, local_id, %message, "relay close from caller");
                if let Some(tx) = self
                    .pumps
                    .lock()
                    .expect("pump map poisoned")
                    .remove(&local_id)
                {
                    let _ = tx.send(PumpEvent::Close);
                }
                self.conn_map
                    .lock()
                    .expect("conn map poisoned")
                    .remove(&local_id);
            }
            FrameBody::Ping => {
                let _ = self.out_tx.send(Frame::pong());
            }
            FrameBody::Pong => {}
        }
    }

    fn detach(&self, local_id: u64) {
        self.conn_map
            .lock()
            .expect("conn map poisoned")
            .remove(&local_id);
        self.pumps
            .lock()
            .expect("pump map poisoned")
            .remove(&local_id);
    }

    /// Stop the relay: every forwarded connection is closed on both hops.
    pub fn close(&self) {
        self.cancel.cancel();
        let drained: Vec<_> = {
            let mut pumps = self.pumps.lock().expect("pump map poisoned");
            pumps.drain().collect()
        };
        self.conn_map.lock().expect("conn map poisoned").clear();
        for (local_id, tx) in drained {
            debug!(cluster = %self.cluster, local_id, "closing with proxy");
            let _ = tx.send(PumpEvent::Close);
        }
    }
}

impl std::fmt::Debug for ProxySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySession")
            .field("id", &self.id)
            .field("cluster", &self.cluster)
            .finish()
    }
}

/// Drain relayed frames onto the caller hop, serialized
async fn write_caller(
    mut sink: Box<dyn FrameSink>,
    mut out_rx: mpsc::UnboundedReceiver<Frame>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = out_rx.recv() => {
                let Some(frame) = frame else { break };
                let encoded = match frame.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        error!(error = %e, "unencodable relay frame dropped");
                        continue;
                    }
                };
                if let Err(e) = sink.send(encoded).await {
                    error!(error = %e, "caller hop write failed");
                    cancel.cancel();
                    break;
                }
            }
        }
    }
    sink.close().await;
}

/// Shovel one forwarded connection between its target-hop stream and the
/// caller hop, translating conn ids both ways
async fn pump_target(
    proxy: Arc<ProxySession>,
    local_id: u64,
    mut stream: TunnelStream,
    mut events: mpsc::UnboundedReceiver<PumpEvent>,
) {
    let mut chunk = vec![0u8; 32 * 1024];
    loop {
        tokio::select! {
            _ = proxy.cancel.cancelled() => break,

            event = events.recv() => match event {
                Some(PumpEvent::Data(payload)) => {
                    if let Err(e) = stream.write_all(&payload).await {
                        let _ = proxy.out_tx.send(Frame::error(local_id, &e.to_string()));
                        break;
                    }
                }
                Some(PumpEvent::Close) | None => {
                    let _ = stream.shutdown().await;
                    break;
                }
            },

            read = stream.read(&mut chunk) => match read {
                Ok(0) => {
                    let _ = proxy.out_tx.send(Frame::error(local_id, "EOF"));
                    break;
                }
                Ok(n) => {
                    let _ = proxy
                        .out_tx
                        .send(Frame::data(local_id, Bytes::copy_from_slice(&chunk[..n])));
                }
                Err(e) => {
                    let _ = proxy.out_tx.send(Frame::error(local_id, &e.to_string()));
                    break;
                }
            },
        }
    }
    proxy.detach(local_id);
}

/// Live proxy sessions, keyed by target cluster
#[derive(Default)]
pub struct ProxyRegistry {
    proxies: StdMutex<HashMap<String, Vec<Arc<ProxySession>>>>,
}

impl ProxyRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a proxy session
    pub fn add(&self, proxy: Arc<ProxySession>) {
        self.proxies
            .lock()
            .expect("proxy map poisoned")
            .entry(proxy.cluster().to_string())
            .or_default()
            .push(proxy);
    }

    /// Stop tracking a proxy session (it is not closed)
    pub fn remove(&self, proxy: &Arc<ProxySession>) {
        let mut proxies = self.proxies.lock().expect("proxy map poisoned");
        if let Some(entries) = proxies.get_mut(proxy.cluster()) {
            entries.retain(|p| p.id() != proxy.id());
            if entries.is_empty() {
                proxies.remove(proxy.cluster());
            }
        }
    }

    /// Close and drop every proxy relaying toward `cluster`. Wired to the
    /// session registry's removal hook so a vanished agent session never
    /// leaves orphaned relays behind.
    pub fn close_client(&self, cluster: &str) {
        let removed = self
            .proxies
            .lock()
            .expect("proxy map poisoned")
            .remove(cluster)
            .unwrap_or_default();
        if !removed.is_empty() {
            info!(cluster, count = removed.len(), "closing relays for departed session");
        }
        for proxy in removed {
            proxy.close();
        }
    }

    /// Close and drop every proxy session
    pub fn close_all(&self) {
        let drained: Vec<_> = {
            let mut proxies = self.proxies.lock().expect("proxy map poisoned");
            proxies.drain().flat_map(|(_, entries)| entries).collect()
        };
        for proxy in drained {
            proxy.close();
        }
    }

    /// Number of tracked proxy sessions
    pub fn len(&self) -> usize {
        self.proxies
            .lock()
            .expect("proxy map poisoned")
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Whether no proxy sessions are tracked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redial_session::transport;
    use redial_session::{Session, SessionConfig};

    /// Target session plus its raw transport peer, and a dialer closure
    fn target_fixture() -> (
        Arc<Session>,
        Box<dyn FrameSink>,
        Box<dyn FrameSource>,
        TargetDialer,
    ) {
        let (session_side, (t_sink, t_source)) = transport::memory(64);
        let session = Session::new(SessionConfig::acceptor("cluster-a"), session_side);
        tokio::spawn({
            let session = session.clone();
            async move { session.serve().await }
        });
        let dialer: TargetDialer = {
            let session = session.clone();
            Arc::new(move |proto, address, deadline| {
                Ok(session.dial(proto, address, deadline)?)
            })
        };
        (session, t_sink, t_source, dialer)
    }

    async fn next_frame(source: &mut Box<dyn FrameSource>) -> Frame {
        Frame::decode(source.recv().await.unwrap().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_conn_map_translates_both_directions() {
        let (session, mut t_sink, mut t_source, dialer) = target_fixture();

        // burn target conn ids so the mapping is visibly non-identity
        let warmup: Vec<_> = (0..41)
            .map(|_| session.dial("tcp", "warmup", Duration::from_secs(1)).unwrap())
            .collect();

        let ((mut c_sink, mut c_source), proxy_side) = transport::memory(64);
        let proxy = ProxySession::new("cluster-a", proxy_side, dialer);
        tokio::spawn({
            let proxy = proxy.clone();
            async move { proxy.serve().await }
        });

        // drain the warmup Connect frames off the target hop
        for _ in 0..41 {
            let frame = next_frame(&mut t_source).await;
            assert!(matches!(frame.body, FrameBody::Connect(_)));
        }

        let connect = Frame::connect(5, "tcp", "10.0.0.5:80", 0).encode().unwrap();
        c_sink.send(connect).await.unwrap();

        let forwarded = next_frame(&mut t_source).await;
        assert_eq!(forwarded.conn_id, 42);
        assert!(matches!(
            forwarded.body,
            FrameBody::Connect(ref r) if r.address == "10.0.0.5:80"
        ));
        assert_eq!(proxy.translate(5), Some(42));

        // caller -> target: Data conn 5 leaves as conn 42
        let data = Frame::data(5, Bytes::from_static(b"ping")).encode().unwrap();
        c_sink.send(data).await.unwrap();
        let forwarded = next_frame(&mut t_source).await;
        assert_eq!(forwarded.conn_id, 42);
        assert!(matches!(forwarded.body, FrameBody::Data(ref b) if &b[..] == b"ping"));

        // target -> caller: Data conn 42 comes back as conn 5
        let reply = Frame::data(42, Bytes::from_static(b"pong")).encode().unwrap();
        t_sink.send(reply).await.unwrap();
        let returned = next_frame(&mut c_source).await;
        assert_eq!(returned.conn_id, 5);
        assert!(matches!(returned.body, FrameBody::Data(ref b) if &b[..] == b"pong"));

        drop(warmup);
    }

    #[tokio::test]
    async fn test_failed_target_dial_answers_error_on_caller_hop() {
        let dialer: TargetDialer =
            Arc::new(|_, _, _| Err(RegistryError::NoSession("cluster-a".to_string())));

        let ((mut c_sink, mut c_source), proxy_side) = transport::memory(16);
        let proxy = ProxySession::new("cluster-a", proxy_side, dialer);
        tokio::spawn({
            let proxy = proxy.clone();
            async move { proxy.serve().await }
        });

        let connect = Frame::connect(7, "tcp", "10.0.0.5:80", 0).encode().unwrap();
        c_sink.send(connect).await.unwrap();

        let answer = next_frame(&mut c_source).await;
        assert_eq!(answer.conn_id, 7);
        assert!(matches!(
            answer.body,
            FrameBody::Error(ref msg) if msg.contains("no session found")
        ));
        assert_eq!(proxy.translate(7), None);
    }

    #[tokio::test]
    async fn test_ping_on_caller_hop_is_answered_locally() {
        let (_session, _t_sink, _t_source, dialer) = target_fixture();
        let ((mut c_sink, mut c_source), proxy_side) = transport::memory(16);
        let proxy = ProxySession::new("cluster-a", proxy_side, dialer);
        tokio::spawn({
            let proxy = proxy.clone();
            async move { proxy.serve().await }
        });

        c_sink.send(Frame::ping().encode().unwrap()).await.unwrap();
        let answer = next_frame(&mut c_source).await;
        assert!(matches!(answer.body, FrameBody::Pong));
    }

    #[tokio::test]
    async fn test_close_client_tears_down_cluster_proxies_only() {
        let (_s1, _ts1, _tr1, dialer_a) = target_fixture();
        let (_s2, _ts2, _tr2, dialer_b) = target_fixture();

        let (_caller_a, side_a) = transport::memory(16);
        let (_caller_b, side_b) = transport::memory(16);
        let proxy_a = ProxySession::new("cluster-a", side_a, dialer_a);
        let proxy_b = ProxySession::new("cluster-b", side_b, dialer_b);

        let registry = ProxyRegistry::new();
        registry.add(proxy_a.clone());
        registry.add(proxy_b.clone());
        assert_eq!(registry.len(), 2);

        registry.close_client("cluster-a");
        assert_eq!(registry.len(), 1);
        assert!(proxy_a.cancel.is_cancelled());
        assert!(!proxy_b.cancel.is_cancelled());
    }
}
