//! Configuration parsing and service materialization
//!
//! The YAML document is decoded strictly (unknown fields are errors) and then
//! materialized into the host-keyed routing table. Load balancers are built
//! in a second stage against the name map of already-built services, which is
//! what rejects nested and self-referencing pools.

use crate::docker::Docker;
use crate::error::Error;
use crate::health::{Checker, Health, HealthInfo};
use crate::loadbalancer::{LoadBalancer, Strategy};
use crate::middleware::Middlewares;
use crate::service::{Backend, ContainerBackend, Service};
use hyper::Uri;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub services: HashMap<String, ServiceEntry>,

    #[serde(default)]
    pub log: LogConfig,

    /// Read deadline for accepting request headers and body.
    /// Absent or zero means no deadline.
    #[serde(default, rename = "readTimeout", with = "humantime_serde")]
    pub read_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub handler: LogHandler,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogHandler {
    #[default]
    Text,
    Json,
}

/// One entry under `services:`. Exactly one of `container`, `redirect`, and
/// `loadBalancer` must be set.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceEntry {
    /// External host. May be empty only for services that are reached
    /// exclusively as load balancer members.
    #[serde(default)]
    pub host: String,

    /// Whether the service only accepts requests on the TLS listener.
    #[serde(default)]
    pub tls: bool,

    #[serde(default)]
    pub middlewares: Option<Middlewares>,

    #[serde(default)]
    pub health: Option<HealthInfo>,

    #[serde(default)]
    pub container: Option<ContainerInfo>,

    #[serde(default)]
    pub redirect: Option<String>,

    #[serde(default, rename = "loadBalancer")]
    pub load_balancer: Option<LoadBalancerInfo>,
}

impl ServiceEntry {
    fn backend_count(&self) -> usize {
        [
            self.container.is_some(),
            self.redirect.is_some(),
            self.load_balancer.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerInfo {
    pub name: String,
    pub network: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoadBalancerInfo {
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub persistent: bool,
    #[serde(default, rename = "serviceNames")]
    pub service_names: Vec<String>,
}

/// The materialized runtime: the host-keyed routing table, every service
/// with its config name (for health launching and logging), and the hosts
/// that need certificates.
pub struct Registry {
    pub table: HashMap<String, Arc<Service>>,
    pub services: Vec<(String, Arc<Service>)>,
    pub tls_hosts: Vec<String>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("table_hosts", &self.table.keys().collect::<Vec<_>>())
            .field("services", &self.services.iter().map(|(name, _)| name).collect::<Vec<_>>())
            .field("tls_hosts", &self.tls_hosts)
            .finish()
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::parse(&content)?)
    }

    /// Decode and validate a YAML document. An empty document is an empty
    /// configuration.
    pub fn parse(data: &str) -> Result<Self, Error> {
        if data.trim().is_empty() {
            return Ok(Config::default());
        }
        let config: Config =
            serde_yaml::from_str(data).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation: every service has exactly one backend and
    /// non-empty hosts are unique.
    fn validate(&self) -> Result<(), Error> {
        let mut hosts = HashSet::new();
        for (name, entry) in &self.services {
            if entry.backend_count() != 1 {
                return Err(Error::Config(format!(
                    "{}: must have exactly one of container, redirect, loadBalancer",
                    name
                )));
            }
            if entry.host.is_empty() {
                continue;
            }
            if !hosts.insert(entry.host.to_lowercase()) {
                return Err(Error::Config(format!("duplicate host {}", entry.host)));
            }
        }
        Ok(())
    }

    /// Materialize services into the routing table. Non-load-balancer
    /// services are built first so load balancers can resolve their members
    /// by name; a member naming a load balancer (itself included) is
    /// rejected.
    pub fn services(&self, docker: Arc<dyn Docker>) -> Result<Registry, Error> {
        self.validate()?;

        let lb_names: HashSet<&str> = self
            .services
            .iter()
            .filter(|(_, entry)| entry.load_balancer.is_some())
            .map(|(name, _)| name.as_str())
            .collect();

        let mut by_name: HashMap<String, Arc<Service>> = HashMap::new();
        for (name, entry) in &self.services {
            if entry.load_balancer.is_some() {
                continue;
            }

            let backend = if let Some(container) = &entry.container {
                Backend::Container(ContainerBackend::new(
                    container.name.clone(),
                    container.network.clone(),
                    container.port,
                    Arc::clone(&docker),
                ))
            } else if let Some(redirect) = &entry.redirect {
                Backend::Redirect(parse_redirect(name, redirect)?)
            } else {
                return Err(Error::Config(format!("{}: no backend", name)));
            };

            by_name.insert(name.clone(), Arc::new(build_service(entry, backend)));
        }

        for (name, entry) in &self.services {
            let Some(lb) = &entry.load_balancer else {
                continue;
            };

            let mut members = Vec::with_capacity(lb.service_names.len());
            for member_name in &lb.service_names {
                if lb_names.contains(member_name.as_str()) {
                    return Err(Error::Config(format!(
                        "{}: member {} is a load balancer",
                        name, member_name
                    )));
                }
                let Some(member) = by_name.get(member_name) else {
                    return Err(Error::Config(format!(
                        "{}: no service with name {}",
                        name, member_name
                    )));
                };
                members.push(Arc::clone(member));
            }

            let host = entry.host.to_lowercase();
            let backend = Backend::LoadBalancer(LoadBalancer::new(
                &host,
                lb.strategy,
                lb.persistent,
                members,
            ));
            by_name.insert(name.clone(), Arc::new(build_service(entry, backend)));
        }

        let mut table = HashMap::new();
        let mut services = Vec::with_capacity(by_name.len());
        for (name, service) in by_name {
            if !service.host.is_empty() {
                table.insert(service.host.clone(), Arc::clone(&service));
            }
            services.push((name, service));
        }

        let tls_hosts = self
            .services
            .values()
            .filter(|entry| entry.tls && !entry.host.is_empty())
            .map(|entry| entry.host.to_lowercase())
            .collect();

        Ok(Registry {
            table,
            services,
            tls_hosts,
        })
    }
}

fn build_service(entry: &ServiceEntry, backend: Backend) -> Service {
    Service {
        host: entry.host.to_lowercase(),
        tls: entry.tls,
        middlewares: entry
            .middlewares
            .as_ref()
            .map(|m| m.list())
            .unwrap_or_default(),
        health: match &entry.health {
            Some(info) => Checker::Periodic(Arc::new(Health::new(info.clone()))),
            None => Checker::Always(true),
        },
        backend,
    }
}

fn parse_redirect(name: &str, redirect: &str) -> Result<Uri, Error> {
    let target: Uri = redirect
        .parse()
        .map_err(|e| Error::Config(format!("{}: invalid redirect {}: {}", name, redirect, e)))?;
    if target.scheme().is_none() || target.authority().is_none() {
        return Err(Error::Config(format!(
            "{}: redirect {} must be an absolute URL",
            name, redirect
        )));
    }
    Ok(target)
}
