//! Periodic health checking for services
//!
//! Every service owns a checker. Services with a `health:` block get a
//! [`Health`] that probes the backend's current route on an interval and
//! keeps a snapshot readable by request tasks without blocking; services
//! without one get [`Checker::Always`], which reports a constant value and
//! launches nothing.

use crate::error::Error;
use crate::service::{Reply, Service};
use hyper::header::HeaderMap;
use hyper::http::uri::PathAndQuery;
use hyper::{Method, StatusCode, Uri};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const DEFAULT_PATH: &str = "/";
const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

fn default_path() -> String {
    DEFAULT_PATH.to_string()
}

fn default_interval() -> Duration {
    DEFAULT_INTERVAL
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn default_method() -> String {
    Method::GET.to_string()
}

/// The `health:` block of a service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthInfo {
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub tls: bool,
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "default_method")]
    pub method: String,
}

impl Default for HealthInfo {
    fn default() -> Self {
        Self {
            path: default_path(),
            tls: false,
            interval: default_interval(),
            timeout: default_timeout(),
            method: default_method(),
        }
    }
}

/// The outcome of one probe.
#[derive(Debug, Clone, Default)]
pub struct HealthResult {
    pub up: bool,
    pub endpoint: String,
    pub err: Option<String>,
}

/// Periodically probes one service and publishes a rolling up/down snapshot.
pub struct Health {
    info: HealthInfo,
    up: AtomicBool,
    last: Mutex<HealthResult>,
    client: reqwest::Client,
}

impl Health {
    pub fn new(info: HealthInfo) -> Self {
        Self {
            info,
            up: AtomicBool::new(false),
            last: Mutex::new(HealthResult::default()),
            client: reqwest::Client::new(),
        }
    }

    /// Snapshot read. Never blocks on an in-flight probe.
    pub fn up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    /// The most recent full probe result.
    pub fn last(&self) -> HealthResult {
        self.last.lock().unwrap().clone()
    }

    fn store(&self, result: &HealthResult) {
        *self.last.lock().unwrap() = result.clone();
        self.up.store(result.up, Ordering::Release);
    }

    /// Resolve the service's current route and probe it once. A route
    /// resolution failure marks the service down without an HTTP call.
    pub async fn check(&self, service: &Service) -> HealthResult {
        let mut reply = Reply::default();
        let target = match service.backend.route(&HeaderMap::new(), &mut reply).await {
            Ok(target) => target,
            Err(err) => {
                return HealthResult {
                    up: false,
                    endpoint: String::new(),
                    err: Some(err.to_string()),
                }
            }
        };

        let endpoint = match probe_uri(&target, &self.info.path, self.info.tls) {
            Ok(uri) => uri.to_string(),
            Err(err) => {
                return HealthResult {
                    up: false,
                    endpoint: String::new(),
                    err: Some(err.to_string()),
                }
            }
        };

        let method = match Method::from_bytes(self.info.method.as_bytes()) {
            Ok(method) => method,
            Err(err) => {
                return HealthResult {
                    up: false,
                    endpoint,
                    err: Some(err.to_string()),
                }
            }
        };

        match self
            .client
            .request(method, &endpoint)
            .timeout(self.info.timeout)
            .send()
            .await
        {
            Ok(response) => {
                let status = response.status();
                HealthResult {
                    up: status >= StatusCode::OK && status < StatusCode::BAD_REQUEST,
                    endpoint,
                    err: None,
                }
            }
            Err(err) => HealthResult {
                up: false,
                endpoint,
                err: Some(err.to_string()),
            },
        }
    }
}

/// The probe URL is the route URL with the scheme forced by `health.tls`
/// and the path replaced by `health.path`.
fn probe_uri(target: &Uri, path: &str, tls: bool) -> Result<Uri, Error> {
    let authority = target
        .authority()
        .ok_or_else(|| Error::Transport(format!("route target {} has no authority", target)))?
        .clone();
    let path_and_query = path
        .parse::<PathAndQuery>()
        .map_err(|e| Error::Transport(e.to_string()))?;
    Ok(Uri::builder()
        .scheme(if tls { "https" } else { "http" })
        .authority(authority)
        .path_and_query(path_and_query)
        .build()?)
}

/// A service's health capability: a real periodic checker, or a constant.
pub enum Checker {
    /// Constant health, used when no `health:` block is configured.
    Always(bool),
    Periodic(Arc<Health>),
}

impl Checker {
    pub fn up(&self) -> bool {
        match self {
            Checker::Always(up) => *up,
            Checker::Periodic(health) => health.up(),
        }
    }
}

/// Launch one probe loop per service with a periodic checker, plus a single
/// consumer that logs every result from the shared channel. The first probe
/// runs immediately so services become usable quickly; afterwards the loop
/// sleeps the configured interval. Tasks live for the process lifetime.
pub fn launch_health_checks(services: &[(String, Arc<Service>)]) {
    let (tx, mut rx) = mpsc::unbounded_channel::<(String, HealthResult)>();

    for (name, service) in services {
        let Checker::Periodic(health) = &service.health else {
            continue;
        };
        let health = Arc::clone(health);
        let service = Arc::clone(service);
        let name = name.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let interval = health.info.interval;
            loop {
                let result = health.check(&service).await;
                health.store(&result);
                if tx.send((name.clone(), result)).is_err() {
                    return;
                }
                tokio::time::sleep(interval).await;
            }
        });
    }
    drop(tx);

    tokio::spawn(async move {
        while let Some((service, result)) = rx.recv().await {
            if result.up {
                debug!(service, endpoint = %result.endpoint, "Health check passed");
            } else {
                warn!(
                    service,
                    endpoint = %result.endpoint,
                    error = result.err.as_deref().unwrap_or("status outside 200-399"),
                    "Health check failed"
                );
            }
        }
    });
}
