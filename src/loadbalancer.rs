//! Load balancing across member services
//!
//! A load balancer composes other services under a selection strategy and
//! skips members whose health snapshot is down. With `persistent` enabled it
//! pins clients to a member through an HttpOnly cookie whose name is derived
//! from the host and whose value is the member index.

use crate::error::Error;
use crate::service::{Reply, Service};
use hyper::header::{HeaderMap, COOKIE};
use hyper::Uri;
use rand::Rng;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use tracing::debug;

const COOKIE_KEY_PREFIX: &str = "voltproxy-lb-";

/// Selection strategy names recognized in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum Strategy {
    #[default]
    #[serde(rename = "roundRobin")]
    RoundRobin,
    #[serde(rename = "failover")]
    Failover,
    #[serde(rename = "random")]
    Random,
}

impl Strategy {
    fn selector(self) -> Selector {
        match self {
            Strategy::RoundRobin => Selector::RoundRobin { next: 0 },
            Strategy::Failover => Selector::Failover,
            Strategy::Random => Selector::Random,
        }
    }
}

/// Index selection over the member pool. Selection is pure: it reads health
/// snapshots and internal state, never performs I/O, and is always called
/// under the load balancer's lock.
pub enum Selector {
    RoundRobin { next: usize },
    Failover,
    Random,
}

impl Selector {
    pub fn select(&mut self, pool: &[Arc<Service>]) -> usize {
        if pool.is_empty() {
            return 0;
        }
        match self {
            Selector::RoundRobin { next } => {
                for i in *next..*next + pool.len() {
                    let index = i % pool.len();
                    if pool[index].health.up() {
                        *next = (i + 1) % pool.len();
                        return index;
                    }
                }
                0
            }
            Selector::Failover => pool.iter().position(|s| s.health.up()).unwrap_or(0),
            Selector::Random => {
                let healthy: Vec<usize> = pool
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.health.up())
                    .map(|(i, _)| i)
                    .collect();
                if healthy.is_empty() {
                    0
                } else {
                    healthy[rand::thread_rng().gen_range(0..healthy.len())]
                }
            }
        }
    }
}

/// The sticky-session cookie name for a host: the first 8 bytes of
/// SHA-256("voltproxy-lb-" + host) as lowercase hex. Stable across restarts.
pub fn cookie_name(host: &str) -> String {
    let digest = Sha256::digest(format!("{}{}", COOKIE_KEY_PREFIX, host).as_bytes());
    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

pub struct LoadBalancer {
    host: String,
    persistent: bool,
    members: Vec<Arc<Service>>,
    cookie_name: String,
    selector: Mutex<Selector>,
}

impl LoadBalancer {
    pub fn new(host: &str, strategy: Strategy, persistent: bool, members: Vec<Arc<Service>>) -> Self {
        Self {
            host: host.to_string(),
            persistent,
            members,
            cookie_name: cookie_name(host),
            selector: Mutex::new(strategy.selector()),
        }
    }

    pub fn members(&self) -> &[Arc<Service>] {
        &self.members
    }

    /// Resolve the URL of the member this request should go to.
    ///
    /// On the persistent path a cookie naming an in-range healthy member wins
    /// and no new cookie is emitted; otherwise the strategy selects and a
    /// replacement cookie is pushed onto the reply. The selector lock is
    /// released before the member's own route runs.
    pub async fn route(&self, headers: &HeaderMap, reply: &mut Reply) -> Result<Uri, Error> {
        if self.members.is_empty() {
            return Err(Error::NoServices);
        }

        if self.persistent {
            if let Some(index) = self.cookie_index(headers) {
                if index < self.members.len() && self.members[index].health.up() {
                    debug!(host = %self.host, index, "Sticky session cookie honored");
                    return self.member_target(index).await;
                }
            }
        }

        let next = self.selector.lock().unwrap().select(&self.members);
        if self.persistent {
            reply
                .set_cookies
                .push(format!("{}={}; HttpOnly", self.cookie_name, next));
        }
        debug!(host = %self.host, index = next, "Selected load balancer member");
        self.member_target(next).await
    }

    /// Members are non-load-balancer services by construction, so their
    /// routes are dispatched directly here.
    async fn member_target(&self, index: usize) -> Result<Uri, Error> {
        match &self.members[index].backend {
            crate::service::Backend::Redirect(target) => Ok(target.clone()),
            crate::service::Backend::Container(container) => container.resolve().await,
            crate::service::Backend::LoadBalancer(_) => Err(Error::Transport(
                "load balancer member is itself a load balancer".to_string(),
            )),
        }
    }

    /// The member index carried by this request's sticky cookie, if any.
    fn cookie_index(&self, headers: &HeaderMap) -> Option<usize> {
        for value in headers.get_all(COOKIE) {
            let Ok(value) = value.to_str() else { continue };
            for pair in value.split(';') {
                let Some((name, index)) = pair.trim().split_once('=') else {
                    continue;
                };
                if name == self.cookie_name {
                    return index.parse::<usize>().ok();
                }
            }
        }
        None
    }
}
