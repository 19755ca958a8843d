use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use voltproxy::config::Config;
use voltproxy::docker::{Docker, DockerClient};
use voltproxy::health::launch_health_checks;
use voltproxy::logging;
use voltproxy::proxy::ProxyServer;
use voltproxy::tls::CertSource;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.yml"));

    let config = Config::load(&config_path)?;
    logging::init(&config.log)?;
    info!(path = %config_path.display(), "Configuration loaded");

    let docker: Arc<dyn Docker> = Arc::new(DockerClient::connect()?);
    let registry = config.services(docker)?;
    info!(
        services = registry.services.len(),
        hosts = registry.table.len(),
        "Services materialized"
    );

    launch_health_checks(&registry.services);

    info!(hosts = ?registry.tls_hosts, "Managing certificates");
    let cert_source = match (
        std::env::var("VOLTPROXY_TLS_CERT"),
        std::env::var("VOLTPROXY_TLS_KEY"),
    ) {
        (Ok(cert_path), Ok(key_path)) => {
            info!(cert = %cert_path, key = %key_path, "TLS enabled with provided certificates");
            CertSource::from_files(&cert_path, &key_path)?
        }
        _ => {
            warn!("No certificates provided, generating a self-signed certificate");
            CertSource::self_signed(&registry.tls_hosts)?
        }
    };

    let table = Arc::new(registry.table);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_server = ProxyServer::new(
        "0.0.0.0:80".parse().expect("valid listen address"),
        Arc::clone(&table),
        shutdown_rx.clone(),
    )
    .with_challenges(cert_source.challenges())
    .with_read_timeout(config.read_timeout);

    let https_server = ProxyServer::new(
        "0.0.0.0:443".parse().expect("valid listen address"),
        Arc::clone(&table),
        shutdown_rx.clone(),
    )
    .with_tls(cert_source.acceptor())
    .with_read_timeout(config.read_timeout);

    info!("Accepting connections on :80 and :443");
    let http_handle = tokio::spawn(http_server.run());
    let https_handle = tokio::spawn(https_server.run());

    tokio::select! {
        result = http_handle => {
            result.map_err(|e| anyhow::anyhow!("HTTP listener task failed: {}", e))??;
            anyhow::bail!("HTTP listener exited unexpectedly");
        }
        result = https_handle => {
            result.map_err(|e| anyhow::anyhow!("HTTPS listener task failed: {}", e))??;
            anyhow::bail!("HTTPS listener exited unexpectedly");
        }
        _ = shutdown_signal() => {}
    }

    let _ = shutdown_tx.send(true);
    info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C), shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for Ctrl+C");
    info!("Received Ctrl+C, shutting down...");
}
