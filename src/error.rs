//! Error categories shared across the proxy
//!
//! Routing failures carry a category so the outer handler can decide between
//! a 404 (the request named something that does not exist) and a 500
//! (something on our side broke while resolving it).

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};

/// Body type every handler path produces: upstream bodies are boxed
/// streaming bodies, locally built responses are boxed empty ones.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// A response carrying only a status. Every failure mode that reaches the
/// outer handler answers with one of these.
pub fn status_response(status: StatusCode) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response with static status")
}

/// Error raised while validating configuration or routing a request.
#[derive(Debug)]
pub enum Error {
    /// The configuration document is invalid. Startup-fatal.
    Config(String),
    /// No running container matches the configured name.
    NoContainer(String),
    /// A container matched by name but is not attached to the requested network.
    NotInNetwork { container: String, network: String },
    /// A load balancer has no members to select from.
    NoServices,
    /// An upstream, the Docker daemon, or request construction failed.
    Transport(String),
}

impl Error {
    /// Whether this error means the requested backend does not exist,
    /// as opposed to an internal failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NoContainer(_) | Error::NotInNetwork { .. })
    }

    /// The status the outer handler responds with when a route fails.
    pub fn status_code(&self) -> StatusCode {
        if self.is_not_found() {
            StatusCode::NOT_FOUND
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "invalid config: {}", msg),
            Error::NoContainer(name) => write!(f, "no matching container with name {}", name),
            Error::NotInNetwork { container, network } => {
                write!(f, "container {} is not in network {}", container, network)
            }
            Error::NoServices => write!(f, "no services specified"),
            Error::Transport(msg) => write!(f, "transport failure: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<bollard::errors::Error> for Error {
    fn from(err: bollard::errors::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<hyper::http::Error> for Error {
    fn from(err: hyper::http::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<hyper_util::client::legacy::Error> for Error {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        Error::Transport(err.to_string())
    }
}
