//! Docker container listing for container-backed services
//!
//! The proxy only needs one thing from the Docker daemon: the current set of
//! containers with their names and per-network IP addresses. That listing is
//! behind the [`Docker`] trait so request handlers and health checks can be
//! exercised against a mock without a daemon.

use crate::error::Error;
use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// A running container as seen by the proxy: its name list and the IP
/// address it holds on each attached network.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSummary {
    pub names: Vec<String>,
    pub networks: HashMap<String, String>,
}

/// Interface to the container host. Implementations must be safe for
/// concurrent use: request tasks and health loops list containers in
/// parallel.
#[async_trait]
pub trait Docker: Send + Sync {
    async fn container_list(&self) -> Result<Vec<ContainerSummary>, Error>;
}

/// Docker daemon client.
///
/// Connection priority follows the daemon conventions: `DOCKER_HOST` if set,
/// otherwise the platform's default socket.
pub struct DockerClient {
    client: bollard::Docker,
}

impl DockerClient {
    pub fn connect() -> anyhow::Result<Self> {
        let client = if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host)?
        } else {
            bollard::Docker::connect_with_socket_defaults().map_err(|e| {
                anyhow::anyhow!(
                    "Cannot connect to Docker daemon: {}. \
                     Start dockerd or set the DOCKER_HOST environment variable.",
                    e
                )
            })?
        };

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<bollard::Docker> {
        if host.starts_with("unix://") {
            let socket_path = host.trim_start_matches("unix://");
            bollard::Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            bollard::Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid DOCKER_HOST format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }
}

#[async_trait]
impl Docker for DockerClient {
    async fn container_list(&self) -> Result<Vec<ContainerSummary>, Error> {
        let containers = self
            .client
            .list_containers(None::<ListContainersOptions<String>>)
            .await?;

        Ok(containers
            .into_iter()
            .map(|container| {
                let names = container.names.unwrap_or_default();
                let networks = container
                    .network_settings
                    .and_then(|settings| settings.networks)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(network, endpoint)| (network, endpoint.ip_address.unwrap_or_default()))
                    .collect();
                ContainerSummary { names, networks }
            })
            .collect())
    }
}

/// Mock implementation returning scripted listings, one per call. The last
/// listing repeats once the script is exhausted so long-running health loops
/// keep observing a stable world.
pub struct MockDocker {
    outputs: Mutex<Vec<Vec<ContainerSummary>>>,
}

impl MockDocker {
    pub fn new(outputs: Vec<Vec<ContainerSummary>>) -> Self {
        Self {
            outputs: Mutex::new(outputs),
        }
    }
}

#[async_trait]
impl Docker for MockDocker {
    async fn container_list(&self) -> Result<Vec<ContainerSummary>, Error> {
        let mut outputs = self.outputs.lock().unwrap();
        if outputs.len() > 1 {
            Ok(outputs.remove(0))
        } else {
            Ok(outputs.first().cloned().unwrap_or_default())
        }
    }
}
