//! Services and their backends
//!
//! A service is the unit keyed by external host: a TLS posture, an ordered
//! middleware chain, a health checker, and exactly one backend. Backends
//! share a single contract: given the request headers, produce the URL to
//! proxy to. The request headers are passed in (and reply headers collected
//! out) because load balancers read and set the sticky-session cookie.

use crate::docker::Docker;
use crate::error::Error;
use crate::health::Checker;
use crate::loadbalancer::LoadBalancer;
use crate::middleware::Middleware;
use hyper::header::HeaderMap;
use hyper::Uri;
use std::sync::Arc;

/// Response headers a backend wants applied to whatever response is
/// eventually written. Load balancers use this to emit sticky cookies.
#[derive(Debug, Default)]
pub struct Reply {
    pub set_cookies: Vec<String>,
}

/// The externally addressable unit, keyed by host.
pub struct Service {
    /// Lowercased external host. Empty only for pool-member-only services.
    pub host: String,
    /// Whether requests must arrive on the TLS listener.
    pub tls: bool,
    /// Outermost first.
    pub middlewares: Vec<Middleware>,
    pub health: Checker,
    pub backend: Backend,
}

/// The target-resolving component of a service.
pub enum Backend {
    /// A fixed upstream URL.
    Redirect(Uri),
    /// A Docker container resolved by name and network on every request.
    Container(ContainerBackend),
    /// A pool of other services behind a selection strategy.
    LoadBalancer(LoadBalancer),
}

impl Backend {
    /// Resolve the URL this request should be proxied to.
    pub async fn route(&self, headers: &HeaderMap, reply: &mut Reply) -> Result<Uri, Error> {
        match self {
            Backend::Redirect(target) => Ok(target.clone()),
            Backend::Container(container) => container.resolve().await,
            Backend::LoadBalancer(lb) => lb.route(headers, reply).await,
        }
    }
}

/// A service running in a Docker container. The address is never cached:
/// each call walks the current container listing so container restarts and
/// IP changes are observed immediately.
pub struct ContainerBackend {
    pub name: String,
    pub network: String,
    pub port: u16,
    docker: Arc<dyn Docker>,
}

impl ContainerBackend {
    pub fn new(name: String, network: String, port: u16, docker: Arc<dyn Docker>) -> Self {
        Self {
            name,
            network,
            port,
            docker,
        }
    }

    /// Find the first container whose name list contains an exact match and
    /// return `http://{ip}:{port}` for its address on the requested network.
    pub async fn resolve(&self) -> Result<Uri, Error> {
        let containers = self.docker.container_list().await?;
        for container in &containers {
            if !container.names.iter().any(|name| *name == self.name) {
                continue;
            }
            let Some(ip) = container.networks.get(&self.network) else {
                return Err(Error::NotInNetwork {
                    container: self.name.clone(),
                    network: self.network.clone(),
                });
            };
            let raw = if ip.contains(':') {
                format!("http://[{}]:{}", ip, self.port)
            } else {
                format!("http://{}:{}", ip, self.port)
            };
            return raw
                .parse()
                .map_err(|e: hyper::http::uri::InvalidUri| Error::Transport(e.to_string()));
        }
        Err(Error::NoContainer(self.name.clone()))
    }
}
