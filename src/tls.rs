//! Certificate source for the TLS listener
//!
//! Certificates are consumed, not acquired: the source either loads PEM
//! files handed to it or generates a self-signed certificate for the
//! configured TLS hosts. It also owns the ACME HTTP-01 challenge store that
//! the plain listener serves under `/.well-known/acme-challenge/`, so an
//! external ACME manager can publish key authorizations through it.

use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_rustls::TlsAcceptor;

/// Pending ACME HTTP-01 challenges: token to key authorization.
#[derive(Clone, Default)]
pub struct Http01Challenges {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl Http01Challenges {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, token: String, key_authorization: String) {
        self.inner.write().await.insert(token, key_authorization);
    }

    pub async fn get(&self, token: &str) -> Option<String> {
        self.inner.read().await.get(token).cloned()
    }

    pub async fn remove(&self, token: &str) {
        self.inner.write().await.remove(token);
    }
}

/// Provides the TLS acceptor for the TLS listener and the challenge store
/// the plain listener consults.
pub struct CertSource {
    acceptor: TlsAcceptor,
    challenges: Http01Challenges,
}

impl CertSource {
    /// Build from PEM certificate and key files.
    pub fn from_files(cert_path: &str, key_path: &str) -> anyhow::Result<Self> {
        let certs = load_certs(cert_path)?;
        let key = load_key(key_path)?;
        Self::from_parts(certs, key)
    }

    /// Build with a generated self-signed certificate covering the given
    /// hosts. Not for production traffic, but keeps the TLS listener up when
    /// no certificates have been provisioned yet.
    pub fn self_signed(hosts: &[String]) -> anyhow::Result<Self> {
        let subject_alt_names = if hosts.is_empty() {
            vec!["localhost".to_string()]
        } else {
            hosts.to_vec()
        };

        let CertifiedKey { cert, key_pair } = generate_simple_self_signed(subject_alt_names)
            .map_err(|e| anyhow::anyhow!("Failed to generate self-signed certificate: {}", e))?;

        let cert_der = CertificateDer::from(cert.der().to_vec());
        let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
            .map_err(|e| anyhow::anyhow!("Failed to serialize private key: {}", e))?;

        Self::from_parts(vec![cert_der], key_der)
    }

    fn from_parts(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> anyhow::Result<Self> {
        install_crypto_provider();
        let tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(tls_config)),
            challenges: Http01Challenges::new(),
        })
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        self.acceptor.clone()
    }

    pub fn challenges(&self) -> Http01Challenges {
        self.challenges.clone()
    }
}

/// Idempotently selects the ring crypto provider for every rustls config
/// built in this process.
pub(crate) fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificates from {}: {}", path, e))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }

    Ok(certs)
}

fn load_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| anyhow::anyhow!("Failed to parse key from {}: {}", path, e))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    anyhow::bail!("No private key found in {}", path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_challenge_store() {
        let challenges = Http01Challenges::new();
        assert_eq!(challenges.get("token").await, None);

        challenges
            .set("token".to_string(), "token.thumbprint".to_string())
            .await;
        assert_eq!(
            challenges.get("token").await,
            Some("token.thumbprint".to_string())
        );

        challenges.remove("token").await;
        assert_eq!(challenges.get("token").await, None);
    }

    #[test]
    fn test_self_signed_builds() {
        let source = CertSource::self_signed(&["secure.example.com".to_string()]);
        assert!(source.is_ok());
    }

    #[test]
    fn test_self_signed_without_hosts() {
        assert!(CertSource::self_signed(&[]).is_ok());
    }

    #[test]
    fn test_from_files_missing_paths() {
        assert!(CertSource::from_files("/nonexistent/cert.pem", "/nonexistent/key.pem").is_err());
    }

    #[test]
    fn test_from_files_round_trip() {
        let CertifiedKey { cert, key_pair } =
            generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();

        let dir = std::env::temp_dir().join(format!("voltproxy-tls-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();

        let source = CertSource::from_files(
            cert_path.to_str().unwrap(),
            key_path.to_str().unwrap(),
        );
        assert!(source.is_ok());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
