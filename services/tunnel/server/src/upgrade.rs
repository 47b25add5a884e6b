//! The transport upgrade endpoint.
//!
//! One http1 listener serves two routes: `GET /connect` upgrades an agent
//! handshake into a registered acceptor session, and `GET /connect/proxy`
//! upgrades a peer replica's relay handshake into a proxy session targeting
//! the local registry. Everything else is 404. The response code carries the
//! authorization outcome: 401 refused, 400 malformed or not an upgrade.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::authorizer::{AuthDecision, AuthError, TokenAuthorizer, PARAMS_HEADER, TOKEN_HEADER};
use crate::error::ServerError;
use crate::peer_auth::{PeerAuthorizer, PeerIdentity};
use crate::server::TunnelServer;
use redial_relay::{ProxySession, TargetDialer};
use redial_session::transport;

/// Deadline applied to relayed dials that did not carry one
const RELAY_DIAL_DEADLINE: Duration = Duration::from_secs(15);

/// Endpoint state shared across connections
pub struct Endpoint {
    server: Arc<TunnelServer>,
    agent_auth: Arc<TokenAuthorizer>,
    peer_auth: Arc<PeerAuthorizer>,
}

impl Endpoint {
    /// Bundle the endpoint dependencies
    pub fn new(
        server: Arc<TunnelServer>,
        agent_auth: Arc<TokenAuthorizer>,
        peer_auth: Arc<PeerAuthorizer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            server,
            agent_auth,
            peer_auth,
        })
    }
}

/// Bind the endpoint listener
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    Ok(TcpListener::bind(addr).await?)
}

/// Serve the upgrade endpoint until cancelled
pub async fn run(
    listener: TcpListener,
    endpoint: Arc<Endpoint>,
    cancel: CancellationToken,
) -> Result<(), ServerError> {
    let local = listener.local_addr()?;
    info!(listen = %local, "tunnel endpoint listening");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let endpoint = endpoint.clone();
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let service = service_fn(move |req| {
                            let endpoint = endpoint.clone();
                            async move { handle_request(endpoint, addr, req).await }
                        });
                        if let Err(e) = http1::Builder::new()
                            .serve_connection(io, service)
                            .with_upgrades()
                            .await
                        {
                            debug!(peer = %addr, error = %e, "connection ended");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                }
            }
        }
    }
}

fn status(code: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message.to_string())));
    *response.status_mut() = code;
    response
}

fn header_str<'a>(req: &'a Request<Incoming>, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

async fn handle_request(
    endpoint: Arc<Endpoint>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/connect") => Ok(handle_agent(endpoint, addr, req).await),
        (&Method::GET, "/connect/proxy") => Ok(handle_peer(endpoint, addr, req).await),
        _ => Ok(status(StatusCode::NOT_FOUND, "not found")),
    }
}

async fn handle_agent(
    endpoint: Arc<Endpoint>,
    addr: SocketAddr,
    mut req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let token = header_str(&req, TOKEN_HEADER).unwrap_or("").to_string();
    let params = header_str(&req, PARAMS_HEADER).map(str::to_string);

    let client_key = match endpoint
        .agent_auth
        .authorize(&token, params.as_deref())
        .await
    {
        Ok(AuthDecision::Authorized { client_key }) => client_key,
        Ok(AuthDecision::Unauthorized) => {
            debug!(peer = %addr, "agent handshake refused");
            return status(StatusCode::UNAUTHORIZED, "unauthorized");
        }
        Err(AuthError::MalformedParams(detail)) => {
            warn!(peer = %addr, %detail, "malformed tunnel params");
            return status(StatusCode::BAD_REQUEST, "malformed tunnel params");
        }
        Err(e) => {
            error!(peer = %addr, error = %e, "authorizer failure");
            return status(StatusCode::INTERNAL_SERVER_ERROR, "authorization failed");
        }
    };

    if !hyper_tungstenite::is_upgrade_request(&req) {
        return status(StatusCode::BAD_REQUEST, "websocket upgrade required");
    }
    match hyper_tungstenite::upgrade(&mut req, None) {
        Ok((response, websocket)) => {
            tokio::spawn(serve_agent(endpoint, client_key, websocket));
            response
        }
        Err(e) => {
            warn!(peer = %addr, error = %e, "upgrade failed");
            status(StatusCode::BAD_REQUEST, "upgrade failed")
        }
    }
}

async fn serve_agent(
    endpoint: Arc<Endpoint>,
    client_key: String,
    websocket: hyper_tungstenite::HyperWebsocket,
) {
    let ws = match websocket.await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(client = %client_key, error = %e, "upgrade never completed");
            return;
        }
    };
    let registry = endpoint.server.registry();
    let session = registry.add(&client_key, transport::websocket(ws));
    match session.serve().await {
        Ok(()) => info!(client = %client_key, "agent session closed"),
        Err(e) => warn!(client = %client_key, error = %e, "agent session ended"),
    }
    registry.remove(&session);
}

async fn handle_peer(
    endpoint: Arc<Endpoint>,
    addr: SocketAddr,
    mut req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let Some(identity) = endpoint.peer_auth.authorize(req.headers()).await else {
        debug!(peer = %addr, "relay handshake refused");
        return status(StatusCode::UNAUTHORIZED, "unauthorized");
    };

    if !hyper_tungstenite::is_upgrade_request(&req) {
        return status(StatusCode::BAD_REQUEST, "websocket upgrade required");
    }
    match hyper_tungstenite::upgrade(&mut req, None) {
        Ok((response, websocket)) => {
            tokio::spawn(serve_peer(endpoint, identity, websocket));
            response
        }
        Err(e) => {
            warn!(peer = %addr, error = %e, "upgrade failed");
            status(StatusCode::BAD_REQUEST, "upgrade failed")
        }
    }
}

async fn serve_peer(
    endpoint: Arc<Endpoint>,
    identity: PeerIdentity,
    websocket: hyper_tungstenite::HyperWebsocket,
) {
    let ws = match websocket.await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(peer = %identity.proxy_id, error = %e, "upgrade never completed");
            return;
        }
    };

    let target: TargetDialer = {
        let registry = endpoint.server.registry().clone();
        let cluster = identity.cluster.clone();
        Arc::new(move |proto, address, deadline| {
            let deadline = if deadline.is_zero() {
                RELAY_DIAL_DEADLINE
            } else {
                deadline
            };
            registry.dial(&cluster, deadline, proto, address)
        })
    };

    let proxy = ProxySession::new(&identity.cluster, transport::websocket(ws), target);
    let proxies = endpoint.server.proxies();
    proxies.add(proxy.clone());
    info!(
        peer = %identity.proxy_id,
        cluster = %identity.cluster,
        "relay session open"
    );
    if let Err(e) = proxy.serve().await {
        warn!(peer = %identity.proxy_id, error = %e, "relay session ended");
    }
    proxies.remove(&proxy);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorizer::{
        encode_params, ClusterLookup, ClusterRef, NodeParams, NodeRecord, NodeStore,
        RegistrationParams,
    };
    use crate::peer_auth::PeerTokenIndex;
    use async_trait::async_trait;
    use redial_relay::{ProxyRegistry, RelayClient};
    use redial_session::{ConnectAuthorizer, Session, SessionConfig, SessionRegistry};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::Error as WsError;

    struct Clusters;

    #[async_trait]
    impl ClusterLookup for Clusters {
        async fn cluster_by_token(&self, token: &str) -> Result<Option<ClusterRef>, AuthError> {
            Ok((token == "tok1").then(|| ClusterRef {
                name: "c1".to_string(),
            }))
        }
    }

    struct Nodes;

    #[async_trait]
    impl NodeStore for Nodes {
        async fn get_or_create(
            &self,
            cluster: &ClusterRef,
            node: &NodeParams,
        ) -> Result<NodeRecord, AuthError> {
            Ok(NodeRecord {
                name: format!("{}/{}", cluster.name, node.requested_hostname),
            })
        }
    }

    struct NoPeers;

    #[async_trait]
    impl PeerTokenIndex for NoPeers {
        async fn token_exists(&self, _id: &str, _token: &str) -> bool {
            false
        }
    }

    struct NoConnector;

    #[async_trait]
    impl redial_relay::PeerConnector for NoConnector {
        async fn connect(
            &self,
            url: &str,
            _cluster: &str,
        ) -> Result<redial_session::Transport, redial_relay::RelayError> {
            Err(redial_relay::RelayError::PeerConnect {
                url: url.to_string(),
                reason: "unavailable".to_string(),
            })
        }
    }

    async fn start_endpoint() -> (SocketAddr, Arc<SessionRegistry>) {
        let registry = Arc::new(SessionRegistry::new());
        let proxies = Arc::new(ProxyRegistry::new());
        let relay = RelayClient::new(Arc::new(NoConnector), proxies.clone(), Duration::from_secs(5));
        let server = TunnelServer::new(registry.clone(), proxies, relay);
        let endpoint = Endpoint::new(
            server,
            Arc::new(TokenAuthorizer::new(Arc::new(Clusters), Arc::new(Nodes))),
            Arc::new(PeerAuthorizer::new(Arc::new(NoPeers))),
        );

        let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(run(listener, endpoint, CancellationToken::new()));
        (addr, registry)
    }

    fn agent_request(addr: SocketAddr, token: &str) -> hyper::Request<()> {
        let mut request = format!("ws://{addr}/connect").into_client_request().unwrap();
        if !token.is_empty() {
            request
                .headers_mut()
                .insert(TOKEN_HEADER, token.parse().unwrap());
        }
        let params = encode_params(&RegistrationParams {
            node: Some(NodeParams {
                requested_hostname: "h1".to_string(),
                address: None,
            }),
            cluster: None,
        });
        request
            .headers_mut()
            .insert(PARAMS_HEADER, params.parse().unwrap());
        request
    }

    async fn spawn_echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = sock.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_agent_connect_register_dial_roundtrip() {
        let (addr, registry) = start_endpoint().await;
        let echo = spawn_echo().await;

        let (ws, _response) = connect_async(agent_request(addr, "tok1")).await.unwrap();
        let allow: ConnectAuthorizer = Arc::new(|proto, _| proto == "tcp");
        let agent = Session::new(
            SessionConfig::initiator("c1/h1", allow),
            transport::websocket(ws),
        );
        tokio::spawn({
            let agent = agent.clone();
            async move { agent.serve().await }
        });

        let mut waited = 0;
        while !registry.has_session("c1/h1") {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += 1;
            assert!(waited < 200, "session never registered");
        }

        let mut stream = registry
            .dial("c1/h1", Duration::from_secs(10), "tcp", &echo.to_string())
            .unwrap();
        stream.write_all(b"through the tunnel").await.unwrap();
        let mut echoed = [0u8; 18];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"through the tunnel");
    }

    #[tokio::test]
    async fn test_agent_connect_without_token_is_401() {
        let (addr, _registry) = start_endpoint().await;

        let err = connect_async(agent_request(addr, "")).await.unwrap_err();
        match err {
            WsError::Http(response) => {
                assert_eq!(response.status(), StatusCode::UNAUTHORIZED)
            }
            other => panic!("expected http error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_agent_connect_with_garbage_params_is_400() {
        let (addr, _registry) = start_endpoint().await;

        let mut request = format!("ws://{addr}/connect").into_client_request().unwrap();
        request
            .headers_mut()
            .insert(TOKEN_HEADER, "tok1".parse().unwrap());
        request
            .headers_mut()
            .insert(PARAMS_HEADER, "%%%not-base64%%%".parse().unwrap());

        let err = connect_async(request).await.unwrap_err();
        match err {
            WsError::Http(response) => {
                assert_eq!(response.status(), StatusCode::BAD_REQUEST)
            }
            other => panic!("expected http error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_peer_route_refuses_unknown_replica() {
        let (addr, _registry) = start_endpoint().await;

        let mut request = format!("ws://{addr}/connect/proxy")
            .into_client_request()
            .unwrap();
        request
            .headers_mut()
            .insert(crate::peer_auth::PEER_TOKEN_HEADER, "tok".parse().unwrap());
        request
            .headers_mut()
            .insert(crate::peer_auth::CLUSTER_HEADER, "c1".parse().unwrap());
        request
            .headers_mut()
            .insert(crate::peer_auth::ID_HEADER, "replica-2".parse().unwrap());

        let err = connect_async(request).await.unwrap_err();
        match err {
            WsError::Http(response) => {
                assert_eq!(response.status(), StatusCode::UNAUTHORIZED)
            }
            other => panic!("expected http error, got {other}"),
        }
    }
}
