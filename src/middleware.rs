//! Request middlewares
//!
//! Middlewares wrap a service's terminal proxy handler in configuration
//! order: the first-listed middleware sees the request first. Each one either
//! lets the request continue (possibly after mutating its headers) or
//! short-circuits with a response of its own.

use crate::error::{status_response, ProxyBody};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, HOST, LOCATION};
use hyper::{Request, Response, StatusCode};
use serde::Deserialize;
use std::net::SocketAddr;
use tracing::{debug, warn};

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_METHOD: &str = "x-forwarded-method";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_URI: &str = "x-forwarded-uri";

const X_FORWARDED_HEADERS: [&str; 5] = [
    X_FORWARDED_FOR,
    X_FORWARDED_METHOD,
    X_FORWARDED_PROTO,
    X_FORWARDED_HOST,
    X_FORWARDED_URI,
];

/// The `middlewares:` block of a service. `list` yields the configured
/// middlewares in a fixed declaration order so that YAML map order does not
/// affect chain order.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Middlewares {
    #[serde(default, rename = "authForward")]
    pub auth_forward: Option<AuthForward>,
    #[serde(default, rename = "ipAllow")]
    pub ip_allow: Option<Vec<String>>,
    #[serde(default, rename = "xForward")]
    pub x_forward: Option<XForward>,
}

impl Middlewares {
    pub fn list(&self) -> Vec<Middleware> {
        let mut middlewares = Vec::new();
        if let Some(auth) = &self.auth_forward {
            middlewares.push(Middleware::AuthForward(auth.clone()));
        }
        if let Some(ips) = &self.ip_allow {
            middlewares.push(Middleware::IpAllow(ips.clone()));
        }
        if let Some(xf) = &self.x_forward {
            middlewares.push(Middleware::XForward(xf.clone()));
        }
        middlewares
    }
}

pub enum Middleware {
    AuthForward(AuthForward),
    IpAllow(Vec<String>),
    XForward(XForward),
}

/// What a middleware decided about the request.
pub enum Outcome {
    /// Keep going down the chain.
    Next,
    /// Stop and send this response.
    Respond(Response<ProxyBody>),
}

impl Middleware {
    pub async fn apply<B>(
        &self,
        req: &mut Request<B>,
        client_addr: SocketAddr,
        is_tls: bool,
    ) -> Outcome {
        match self {
            Middleware::AuthForward(auth) => auth.apply(req, client_addr, is_tls).await,
            Middleware::IpAllow(ips) => ip_allow(ips, req, client_addr),
            Middleware::XForward(xf) => {
                if xf.enable {
                    let forwarded = x_forwarded_values(req, client_addr, is_tls);
                    forwarded.set(req.headers_mut());
                    debug!(host = %host_of(req), "Added X-Forwarded headers");
                }
                Outcome::Next
            }
        }
    }
}

/// Forwards the request to an authentication server and only lets it
/// continue when the server answers 2xx.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthForward {
    /// The address of the authentication server.
    pub address: String,
    /// Request headers to forward to the authentication server.
    /// Absent means all headers are forwarded.
    #[serde(default, rename = "requestHeaders")]
    pub request_headers: Option<Vec<String>>,
    /// Headers to copy from the authentication response onto the request.
    #[serde(default, rename = "responseHeaders")]
    pub response_headers: Vec<String>,
    /// Whether to send X-Forwarded-* headers to the authentication server.
    #[serde(default, rename = "xForwarded")]
    pub x_forwarded: bool,
}

impl AuthForward {
    async fn apply<B>(&self, req: &mut Request<B>, client_addr: SocketAddr, is_tls: bool) -> Outcome {
        let host = host_of(req);
        debug!(host, address = %self.address, "Forwarding request to authentication server");

        let mut auth_headers = HeaderMap::new();
        match &self.request_headers {
            None => {
                // The inbound Host must not be copied: the auth request's
                // Host is the auth server's own authority, and the client
                // keeps a pre-set Host header verbatim.
                for name in req.headers().keys() {
                    if name == &HOST {
                        continue;
                    }
                    if let Some(value) = req.headers().get(name) {
                        auth_headers.insert(name.clone(), value.clone());
                    }
                }
            }
            Some(names) => {
                for name in names {
                    let Ok(header) = HeaderName::from_bytes(name.as_bytes()) else {
                        continue;
                    };
                    let value = req
                        .headers()
                        .get(&header)
                        .cloned()
                        .unwrap_or_else(|| HeaderValue::from_static(""));
                    auth_headers.insert(header, value);
                }
            }
        }

        if self.x_forwarded {
            let forwarded = x_forwarded_values(req, client_addr, is_tls);
            forwarded.set(&mut auth_headers);
        } else {
            for name in X_FORWARDED_HEADERS {
                auth_headers.remove(name);
            }
        }

        // The auth request never follows redirects and carries no body.
        let client = match reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
        {
            Ok(client) => client,
            Err(err) => {
                warn!(host, error = %err, "Failed to build authentication client");
                return Outcome::Respond(status_response(StatusCode::INTERNAL_SERVER_ERROR));
            }
        };

        let response = match client.get(&self.address).headers(auth_headers).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(host, error = %err, "Failed to send authentication request");
                return Outcome::Respond(status_response(StatusCode::INTERNAL_SERVER_ERROR));
            }
        };

        let status = response.status();
        if !status.is_success() {
            debug!(host, %status, "Authentication failed, replaying auth server response");
            let mut reply = status_response(status);
            if let Some(location) = resolve_location(&self.address, response.headers().get(LOCATION))
            {
                if let Ok(value) = HeaderValue::from_str(location.as_str()) {
                    reply.headers_mut().insert(LOCATION, value);
                }
            }
            return Outcome::Respond(reply);
        }

        for name in &self.response_headers {
            let Ok(header) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            let value = response
                .headers()
                .get(&header)
                .cloned()
                .unwrap_or_else(|| HeaderValue::from_static(""));
            req.headers_mut().insert(header, value);
        }

        Outcome::Next
    }
}

/// A failure Location is resolved against the auth server's URL, so a
/// relative redirect points at the auth server rather than the proxied
/// service. A value that does not resolve counts as no Location at all.
fn resolve_location(auth_address: &str, location: Option<&HeaderValue>) -> Option<reqwest::Url> {
    let location = location?.to_str().ok()?;
    if location.is_empty() {
        return None;
    }
    reqwest::Url::parse(auth_address).ok()?.join(location).ok()
}

/// Injects the X-Forwarded-* headers into the proxied request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct XForward {
    #[serde(default)]
    pub enable: bool,
}

/// Only allows requests whose remote address matches a literal entry or is
/// contained in a CIDR entry.
fn ip_allow<B>(allowed: &[String], req: &Request<B>, client_addr: SocketAddr) -> Outcome {
    let host = client_addr.ip();
    let host_text = host.to_string();
    for entry in allowed {
        if host_text == *entry || in_cidr(host, entry) {
            debug!(remote = %host_text, "Remote address is allowed");
            return Outcome::Next;
        }
    }
    debug!(host = %host_of(req), remote = %host_text, "Remote address is not allowed");
    Outcome::Respond(status_response(StatusCode::FORBIDDEN))
}

/// CIDR containment. Entries that do not parse as CIDR blocks never match.
fn in_cidr(ip: std::net::IpAddr, cidr: &str) -> bool {
    use std::net::IpAddr;

    let Some((network, prefix)) = cidr.split_once('/') else {
        return false;
    };
    let Ok(prefix) = prefix.parse::<u8>() else {
        return false;
    };
    let Ok(network) = network.parse::<IpAddr>() else {
        return false;
    };
    match (ip, network) {
        (IpAddr::V4(ip), IpAddr::V4(network)) if prefix <= 32 => {
            let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
            u32::from(ip) & mask == u32::from(network) & mask
        }
        (IpAddr::V6(ip), IpAddr::V6(network)) if prefix <= 128 => {
            let mask = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix) };
            u128::from(ip) & mask == u128::from(network) & mask
        }
        _ => false,
    }
}

/// The five X-Forwarded-* values derived from a request and its connection.
struct XForwardedValues {
    client_ip: String,
    method: String,
    proto: &'static str,
    host: String,
    uri: String,
}

impl XForwardedValues {
    fn set(&self, headers: &mut HeaderMap) {
        if let Ok(value) = HeaderValue::from_str(&self.client_ip) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        if let Ok(value) = HeaderValue::from_str(&self.method) {
            headers.insert(X_FORWARDED_METHOD, value);
        }
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(self.proto));
        if let Ok(value) = HeaderValue::from_str(&self.host) {
            headers.insert(X_FORWARDED_HOST, value);
        }
        if let Ok(value) = HeaderValue::from_str(&self.uri) {
            headers.insert(X_FORWARDED_URI, value);
        }
    }
}

fn x_forwarded_values<B>(req: &Request<B>, client_addr: SocketAddr, is_tls: bool) -> XForwardedValues {
    XForwardedValues {
        client_ip: client_addr.ip().to_string(),
        method: req.method().to_string(),
        proto: if is_tls { "https" } else { "http" },
        host: host_of(req),
        uri: req
            .uri()
            .path_and_query()
            .map(|pq| pq.to_string())
            .unwrap_or_else(|| "/".to_string()),
    }
}

/// The request's Host, as sent: the Host header for HTTP/1, the URI
/// authority for HTTP/2.
pub fn host_of<B>(req: &Request<B>) -> String {
    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.to_string())
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default()
}
