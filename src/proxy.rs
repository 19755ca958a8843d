//! Listeners and the request handling pipeline
//!
//! The plain and TLS listeners run the same routine parameterized by which
//! socket the connection arrived on: look the service up by host, enforce its
//! TLS posture, run its middleware chain, resolve the backend's target, and
//! reverse-proxy to it with the Host header rewritten.

use crate::error::{status_response, ProxyBody};
use crate::service::{Reply, Service};
use crate::tls::Http01Challenges;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONNECTION, CONTENT_TYPE, HOST, LOCATION, SET_COOKIE};
use hyper::http::uri::PathAndQuery;
use hyper::service::service_fn;
use hyper::{HeaderMap, Request, Response, StatusCode, Uri, Version};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Headers that belong to a single connection and must not be forwarded.
const HOP_HEADERS: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

type UpstreamClient = Client<HttpsConnector<HttpConnector>, Incoming>;

/// The host-keyed routing table, constructed once at startup and read-only
/// afterwards.
pub type RoutingTable = HashMap<String, Arc<Service>>;

struct ProxyState {
    table: Arc<RoutingTable>,
    client: UpstreamClient,
    challenges: Option<Http01Challenges>,
}

/// One listener: plain on port 80, or TLS on port 443 when built
/// `with_tls`.
pub struct ProxyServer {
    bind_addr: SocketAddr,
    state: Arc<ProxyState>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
    read_timeout: Option<Duration>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        table: Arc<RoutingTable>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            state: Arc::new(ProxyState {
                table,
                client: upstream_client(),
                challenges: None,
            }),
            shutdown_rx,
            tls_acceptor: None,
            read_timeout: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    /// Serve ACME HTTP-01 challenges from this store before any routing.
    /// Only meaningful on the plain listener.
    pub fn with_challenges(mut self, challenges: Http01Challenges) -> Self {
        let state = Arc::get_mut(&mut self.state).expect("state not shared before run");
        state.challenges = Some(challenges);
        self
    }

    /// A zero or absent timeout means no read deadline.
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %self.bind_addr, protocol, "Proxy server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let tls_acceptor = self.tls_acceptor.clone();
        let read_timeout = self.read_timeout;

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            let tls_acceptor = tls_acceptor.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = serve_connection(tls_stream, addr, state, true, read_timeout).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = serve_connection(stream, addr, state, false, read_timeout).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(addr = %self.bind_addr, "Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

fn upstream_client() -> UpstreamClient {
    crate::tls::install_crypto_provider();
    let https = HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .build();
    Client::builder(TokioExecutor::new()).build(https)
}

async fn serve_connection<S>(
    stream: S,
    addr: SocketAddr,
    state: Arc<ProxyState>,
    is_tls: bool,
    read_timeout: Option<Duration>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state, addr, is_tls).await }
    });

    let mut builder = AutoBuilder::new(TokioExecutor::new());
    let served = if let Some(timeout) = read_timeout {
        builder
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(timeout)
            .serve_connection_with_upgrades(io, service)
            .await
    } else {
        builder.serve_connection_with_upgrades(io, service).await
    };
    served.map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// What the routing table says should happen to a request.
enum Decision {
    NotFound,
    /// Send a 301 upgrading the request to the TLS listener.
    RedirectToTls(String),
    Serve(Arc<Service>),
}

/// Host lookup and TLS gating. A service marked `tls` reached on the plain
/// listener is upgraded; a plain service reached over TLS does not exist as
/// far as that listener is concerned.
fn decide(table: &RoutingTable, host_header: &str, path_and_query: &str, is_tls: bool) -> Decision {
    let Some(hostname) = normalize_host(host_header) else {
        return Decision::NotFound;
    };
    let Some(service) = table.get(&hostname) else {
        return Decision::NotFound;
    };

    if service.tls && !is_tls {
        return Decision::RedirectToTls(format!("https://{}{}", host_header, path_and_query));
    }
    if !service.tls && is_tls {
        return Decision::NotFound;
    }
    Decision::Serve(Arc::clone(service))
}

async fn handle_request(
    mut req: Request<Incoming>,
    state: Arc<ProxyState>,
    client_addr: SocketAddr,
    is_tls: bool,
) -> Result<Response<ProxyBody>, hyper::Error> {
    // ACME challenges are answered before any routing so certificate
    // issuance works for hosts that are not (yet) in the table.
    if !is_tls {
        if let Some(challenges) = &state.challenges {
            if let Some(token) = req.uri().path().strip_prefix(ACME_CHALLENGE_PREFIX) {
                if let Some(key_auth) = challenges.get(token).await {
                    debug!(token, "Responding to ACME HTTP-01 challenge");
                    return Ok(challenge_response(key_auth));
                }
            }
        }
    }

    let host_header = crate::middleware::host_of(&req);
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_string());

    let service = match decide(&state.table, &host_header, &path_and_query, is_tls) {
        Decision::NotFound => {
            debug!(host = host_header, is_tls, "No matching service");
            return Ok(status_response(StatusCode::NOT_FOUND));
        }
        Decision::RedirectToTls(location) => {
            debug!(host = host_header, location, "Upgrading request to TLS");
            return Ok(redirect_response(&location));
        }
        Decision::Serve(service) => service,
    };

    debug!(host = host_header, method = %req.method(), uri = %req.uri(), "Incoming request");

    // First-listed middleware sees the request first.
    for middleware in &service.middlewares {
        match middleware.apply(&mut req, client_addr, is_tls).await {
            crate::middleware::Outcome::Next => {}
            crate::middleware::Outcome::Respond(response) => return Ok(response),
        }
    }

    let mut reply = Reply::default();
    let target = match service.backend.route(req.headers(), &mut reply).await {
        Ok(target) => target,
        Err(err) => {
            warn!(host = host_header, error = %err, "Failed to route request");
            return Ok(status_response(err.status_code()));
        }
    };

    match forward(req, &target, &state.client).await {
        Ok(mut response) => {
            for cookie in &reply.set_cookies {
                if let Ok(value) = HeaderValue::from_str(cookie) {
                    response.headers_mut().append(SET_COOKIE, value);
                }
            }
            Ok(response)
        }
        Err(err) => {
            warn!(host = host_header, target = %target, error = %err, "Failed to forward request");
            Ok(status_response(StatusCode::INTERNAL_SERVER_ERROR))
        }
    }
}

/// Dispatch the request to the target as a single-host reverse proxy: the
/// URI is rebuilt from the target's scheme and authority, the Host header is
/// rewritten to the target's, and hop-by-hop headers are dropped.
async fn forward(
    mut req: Request<Incoming>,
    target: &Uri,
    client: &UpstreamClient,
) -> Result<Response<ProxyBody>, crate::error::Error> {
    use crate::error::Error;

    let scheme = target
        .scheme()
        .cloned()
        .ok_or_else(|| Error::Transport(format!("target {} has no scheme", target)))?;
    let authority = target
        .authority()
        .cloned()
        .ok_or_else(|| Error::Transport(format!("target {} has no authority", target)))?;

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let joined = join_paths(target.path(), path_and_query)
        .parse::<PathAndQuery>()
        .map_err(|e| Error::Transport(e.to_string()))?;

    *req.uri_mut() = Uri::builder()
        .scheme(scheme)
        .authority(authority.clone())
        .path_and_query(joined)
        .build()?;
    *req.version_mut() = Version::HTTP_11;

    remove_hop_headers(req.headers_mut());
    req.headers_mut().insert(
        HOST,
        HeaderValue::from_str(authority.as_str()).map_err(|e| Error::Transport(e.to_string()))?,
    );

    let mut response = client.request(req).await?;
    remove_hop_headers(response.headers_mut());
    Ok(response.map(|body| body.boxed()))
}

/// Join the target's base path with the request path. Single-host proxies
/// usually have a bare authority target, in which case the request path
/// passes through unchanged.
fn join_paths(base: &str, request_path: &str) -> String {
    if base.is_empty() || base == "/" {
        return request_path.to_string();
    }
    format!("{}{}", base.trim_end_matches('/'), request_path)
}

fn remove_hop_headers(headers: &mut HeaderMap) {
    let named: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_lowercase())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_HEADERS {
        headers.remove(name);
    }
}

/// The Host header without port, lowercased, validated against DNS naming.
fn normalize_host(host: &str) -> Option<String> {
    let hostname = host.split(':').next()?;

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return None;
    }

    Some(hostname.to_lowercase())
}

fn redirect_response(location: &str) -> Response<ProxyBody> {
    let mut response = status_response(StatusCode::MOVED_PERMANENTLY);
    if let Ok(value) = HeaderValue::from_str(location) {
        response.headers_mut().insert(LOCATION, value);
    }
    response
}

fn challenge_response(key_authorization: String) -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/plain")
        .body(
            Full::new(Bytes::from(key_authorization))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response builder")
}
