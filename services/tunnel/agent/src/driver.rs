//! The reconnection driver.
//!
//! `Connecting -> Serving -> {Retry, Stopped, Fatal, IdentityLost}`: open
//! the WebSocket with the two tunnel headers, serve the initiator session
//! until the transport ends, then reconnect after a fixed delay. Transient
//! connect failures draw down the bounded retry budget; a served session
//! refreshes it. Authorization rejection and a lost identity never retry.

use std::sync::Arc;
use std::time::Duration;

use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classify::{classify_ws, FailureCause};
use redial_session::{transport, ConnectAuthorizer, Role, Session, SessionConfig};
use redial_wire::handshake::{encode_params, RegistrationParams, PARAMS_HEADER, TOKEN_HEADER};

/// How connect failures are retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Retry transient failures indefinitely
    Forever,
    /// Give up after this many consecutive transient failures
    Bounded(u32),
}

/// Terminal driver outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverOutcome {
    /// Cancelled, or the bounded retry budget ran out
    Stopped,
    /// Non-retryable failure
    Fatal(FailureCause),
    /// The control plane no longer knows this agent; re-registration is
    /// required before reconnecting
    IdentityLost,
}

/// Periodic "fetch latest work" poll, independent of frame traffic.
/// Returning a duration adjusts the interval for subsequent polls.
#[async_trait::async_trait]
pub trait WorkPoller: Send + Sync {
    /// One poll round; `Ok(Some(d))` reschedules at interval `d`
    async fn poll(&self) -> anyhow::Result<Option<Duration>>;
}

/// Driver configuration
#[derive(Clone)]
pub struct AgentConfig {
    /// Tunnel endpoint, e.g. `wss://control-plane/connect`
    pub server_url: String,
    /// Credential for `X-API-Tunnel-Token`
    pub token: String,
    /// Registration payload for `X-API-Tunnel-Params`
    pub params: RegistrationParams,
    /// Keepalive ping interval
    pub ping_interval: Duration,
    /// Fixed delay between connect attempts
    pub reconnect_delay: Duration,
    /// Initial work poll interval
    pub poll_interval: Duration,
    /// Retry policy for transient connect failures
    pub retry: RetryPolicy,
    /// Unix socket paths the control plane may ask this agent to dial;
    /// tcp is always allowed
    pub allowed_unix_paths: Vec<String>,
}

impl AgentConfig {
    /// Config with production defaults
    pub fn new(server_url: &str, token: &str) -> Self {
        Self {
            server_url: server_url.to_string(),
            token: token.to_string(),
            params: RegistrationParams::default(),
            ping_interval: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(5),
            poll_interval: Duration::from_secs(30),
            retry: RetryPolicy::Forever,
            allowed_unix_paths: Vec::new(),
        }
    }
}

/// Authorizer enforcing the agent dial policy: tcp unconditionally, unix
/// only for the listed socket paths
pub fn connect_authorizer(allowed_unix_paths: &[String]) -> ConnectAuthorizer {
    let allowed: Vec<String> = allowed_unix_paths.to_vec();
    Arc::new(move |proto, address| match proto {
        "tcp" => true,
        "unix" => allowed.iter().any(|path| path == address),
        _ => false,
    })
}

/// The agent-side reconnection driver
pub struct Driver {
    config: AgentConfig,
    cancel: CancellationToken,
    on_connect: Option<Arc<dyn Fn() + Send + Sync>>,
    poller: Option<Arc<dyn WorkPoller>>,
}

impl Driver {
    /// New driver; does nothing until [`run`](Self::run)
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
            on_connect: None,
            poller: None,
        }
    }

    /// Callback fired exactly once per successful connect, before serving
    pub fn on_connect(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(callback));
        self
    }

    /// Attach the periodic work poller
    pub fn with_poller(mut self, poller: Arc<dyn WorkPoller>) -> Self {
        self.poller = Some(poller);
        self
    }

    /// Token that stops the driver at the next suspension point
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until cancelled or a terminal outcome
    pub async fn run(&self) -> DriverOutcome {
        let mut retries_left = match self.config.retry {
            RetryPolicy::Bounded(n) => Some(n),
            RetryPolicy::Forever => None,
        };

        loop {
            if self.cancel.is_cancelled() {
                return DriverOutcome::Stopped;
            }

            match self.connect_and_serve().await {
                Ok(()) => {
                    // a served session refreshes the retry budget
                    if let RetryPolicy::Bounded(n) = self.config.retry {
                        retries_left = Some(n);
                    }
                }
                Err(FailureCause::HandshakeRejected) => {
                    return DriverOutcome::Fatal(FailureCause::HandshakeRejected);
                }
                Err(FailureCause::IdentityLost) => {
                    return DriverOutcome::IdentityLost;
                }
                Err(cause) if cause.transient() => {
                    if let Some(left) = retries_left.as_mut() {
                        if *left == 0 {
                            info!("retry budget exhausted");
                            return DriverOutcome::Stopped;
                        }
                        *left -= 1;
                    }
                    warn!(?cause, "connect failed, retrying");
                }
                Err(cause) => {
                    return DriverOutcome::Fatal(cause);
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return DriverOutcome::Stopped,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
    }

    /// One connect attempt. `Err` means the transport never opened; an
    /// established session that later ends is `Ok` and retried with a fresh
    /// budget.
    async fn connect_and_serve(&self) -> Result<(), FailureCause> {
        let mut request = self
            .config
            .server_url
            .as_str()
            .into_client_request()
            .map_err(|e| {
                warn!(url = %self.config.server_url, error = %e, "bad endpoint url");
                FailureCause::Unknown
            })?;
        let headers = request.headers_mut();
        headers.insert(
            TOKEN_HEADER,
            self.config.token.parse().map_err(|_| {
                warn!("credential is not a valid header value");
                FailureCause::Unknown
            })?,
        );
        headers.insert(
            PARAMS_HEADER,
            encode_params(&self.config.params)
                .parse()
                .expect("base64 is always a valid header value"),
        );

        let (ws, _response) = connect_async(request).await.map_err(|e| {
            let cause = classify_ws(&e);
            warn!(url = %self.config.server_url, error = %e, ?cause, "connect failed");
            cause
        })?;
        info!(url = %self.config.server_url, "tunnel connected");

        let client_key = self
            .config
            .params
            .node
            .as_ref()
            .map(|n| n.requested_hostname.clone())
            .unwrap_or_else(|| "agent".to_string());
        let session = Session::new(
            SessionConfig {
                client_key,
                role: Role::Initiator,
                ping_interval: self.config.ping_interval,
                authorizer: Some(connect_authorizer(&self.config.allowed_unix_paths)),
            },
            transport::websocket(ws),
        );

        if let Some(callback) = &self.on_connect {
            callback();
        }

        let poll_cancel = self.cancel.child_token();
        if let Some(poller) = &self.poller {
            tokio::spawn(run_poller(
                poller.clone(),
                self.config.poll_interval,
                poll_cancel.clone(),
            ));
        }

        let served = tokio::select! {
            _ = self.cancel.cancelled() => {
                session.close();
                Ok(())
            }
            result = session.serve() => result,
        };
        poll_cancel.cancel();

        if let Err(e) = served {
            warn!(error = %e, "tunnel session ended");
        }
        Ok(())
    }
}

/// The work poll loop; interval adjustable by each response
async fn run_poller(
    poller: Arc<dyn WorkPoller>,
    initial: Duration,
    cancel: CancellationToken,
) {
    let mut interval = initial;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {
                match poller.poll().await {
                    Ok(Some(next)) => {
                        if next != interval {
                            debug!(?next, "poll interval adjusted");
                            interval = next;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "work poll failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answers every connection with a canned HTTP status and closes
    async fn http_responder(status_line: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = sock.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 {status_line}\r\nconnection: close\r\ncontent-length: 0\r\n\r\n"
                    );
                    let _ = sock.write_all(response.as_bytes()).await;
                });
            }
        });
        addr
    }

    async fn refused_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    fn quick_config(url: String) -> AgentConfig {
        let mut config = AgentConfig::new(&url, "tok1");
        config.reconnect_delay = Duration::from_millis(10);
        config
    }

    #[tokio::test]
    async fn test_bounded_retry_budget_exhausts_to_stopped() {
        let addr = refused_addr().await;
        let mut config = quick_config(format!("ws://{addr}/connect"));
        config.retry = RetryPolicy::Bounded(2);

        let outcome = Driver::new(config).run().await;
        assert_eq!(outcome, DriverOutcome::Stopped);
    }

    #[tokio::test]
    async fn test_rejected_handshake_is_fatal() {
        let addr = http_responder("401 Unauthorized").await;
        let config = quick_config(format!("ws://{addr}/connect"));

        let outcome = Driver::new(config).run().await;
        assert_eq!(
            outcome,
            DriverOutcome::Fatal(FailureCause::HandshakeRejected)
        );
    }

    #[tokio::test]
    async fn test_unhealthy_endpoint_keeps_retrying() {
        let addr = http_responder("503 Service Unavailable").await;
        let config = quick_config(format!("ws://{addr}/connect"));

        let driver = Driver::new(config);
        let cancel = driver.cancel_token();
        let run = tokio::spawn(async move { driver.run().await });

        // a restarting control plane must keep the agent in the retry loop
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!run.is_finished(), "503 was treated as terminal");

        cancel.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, DriverOutcome::Stopped);
    }

    #[tokio::test]
    async fn test_gone_identity_surfaces_identity_lost() {
        let addr = http_responder("410 Gone").await;
        let config = quick_config(format!("ws://{addr}/connect"));

        let outcome = Driver::new(config).run().await;
        assert_eq!(outcome, DriverOutcome::IdentityLost);
    }

    #[tokio::test]
    async fn test_cancel_stops_forever_retry() {
        let addr = refused_addr().await;
        let mut config = quick_config(format!("ws://{addr}/connect"));
        config.reconnect_delay = Duration::from_millis(50);

        let driver = Driver::new(config);
        let cancel = driver.cancel_token();
        let run = tokio::spawn(async move { driver.run().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, DriverOutcome::Stopped);
    }

    #[test]
    fn test_connect_authorizer_policy() {
        let auth = connect_authorizer(&["/run/docker.sock".to_string()]);
        assert!(auth("tcp", "10.0.0.5:80"));
        assert!(auth("tcp", "anything"));
        assert!(auth("unix", "/run/docker.sock"));
        assert!(!auth("unix", "/etc/passwd"));
        assert!(!auth("udp", "10.0.0.5:53"));
    }

    struct CountingPoller {
        calls: AtomicUsize,
        adjust_to: Duration,
    }

    #[async_trait::async_trait]
    impl WorkPoller for CountingPoller {
        async fn poll(&self) -> anyhow::Result<Option<Duration>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            // first response shortens the interval, later ones keep it
            Ok((n == 0).then_some(self.adjust_to))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_interval_adjusts_from_response() {
        let poller = Arc::new(CountingPoller {
            calls: AtomicUsize::new(0),
            adjust_to: Duration::from_secs(2),
        });
        let cancel = CancellationToken::new();
        tokio::spawn(run_poller(
            poller.clone(),
            Duration::from_secs(10),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(poller.calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(poller.calls.load(Ordering::SeqCst), 1);

        // rescheduled at the adjusted 2s cadence
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(poller.calls.load(Ordering::SeqCst) >= 3);

        cancel.cancel();
    }
}
