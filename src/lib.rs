//! voltproxy - a host-routing reverse proxy
//!
//! This library provides a reverse proxy that:
//! - Routes HTTP and HTTPS traffic based on the Host header to configured services
//! - Resolves Docker containers to live addresses by name and network, per request
//! - Load-balances across member services with round-robin, failover, or random
//!   selection and optional persistent sticky sessions
//! - Monitors per-service health on an interval and steers traffic away from
//!   unhealthy members
//! - Filters and mutates requests through an ordered middleware chain
//!   (IP allow-list, external auth forwarding, X-Forwarded header injection)
//! - Serves ACME HTTP-01 challenges on the plain listener for an external
//!   certificate manager

pub mod config;
pub mod docker;
pub mod error;
pub mod health;
pub mod loadbalancer;
pub mod logging;
pub mod middleware;
pub mod proxy;
pub mod service;
pub mod tls;
