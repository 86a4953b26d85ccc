//! TLS impersonation for the outbound gateway.
//!
//! This module provides:
//! - Certificate caching with at most one issuance per hostname
//! - Server-side TLS contexts presenting an issued leaf plus the root
//! - The client TLS configuration used for the real destinations
//!
//! # Critical ALPN Note
//!
//! We **must** force HTTP/1.1 via ALPN. The terminated stream is served by an
//! HTTP/1.1 connection; a client negotiating h2 would send frames it cannot
//! parse.
//!
//! # Example
//!
//! ```ignore
//! use tim_gateway::proxy::{CertificateAuthority, CertificateCache};
//! use std::sync::Arc;
//!
//! let ca = Arc::new(CertificateAuthority::generate("Dev Root")?);
//! let cache = CertificateCache::new(ca, audit);
//!
//! let config = cache.impersonating_tls_config("matrix.example.org").await?;
//! let acceptor = tokio_rustls::TlsAcceptor::from(config);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::CertificateDer;
use time::OffsetDateTime;
use tokio::sync::OnceCell;
use tracing::{debug, info, trace, warn};

use super::ca::{CertificateIssuer, IssuedCertificate};
use super::error::{CaError, ProxyError};
use crate::telemetry::{AuditEvent, AuditLogger};

type Slot = Arc<OnceCell<Arc<IssuedCertificate>>>;

/// Per-hostname memo of issued certificates.
///
/// Hostnames match exactly and case-sensitively. Concurrent callers for the
/// same unseen hostname share a single issuance; a failed issuance caches
/// nothing. Entries live until the process exits.
pub struct CertificateCache<I: CertificateIssuer> {
    issuer: Arc<I>,
    slots: Mutex<HashMap<String, Slot>>,
    audit: Arc<AuditLogger>,
}

impl<I: CertificateIssuer> CertificateCache<I> {
    /// Create an empty cache over `issuer`.
    pub fn new(issuer: Arc<I>, audit: Arc<AuditLogger>) -> Self {
        Self {
            issuer,
            slots: Mutex::new(HashMap::new()),
            audit,
        }
    }

    /// The certificate for `hostname`, issuing it on first use.
    pub async fn get(&self, hostname: &str) -> Result<Arc<IssuedCertificate>, CaError> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.entry(hostname.to_string()).or_default().clone()
        };

        if let Some(issued) = slot.get() {
            trace!("Certificate cache hit for {}", hostname);
            return Ok(issued.clone());
        }

        slot.get_or_try_init(|| self.issue(hostname))
            .await
            .cloned()
    }

    async fn issue(&self, hostname: &str) -> Result<Arc<IssuedCertificate>, CaError> {
        let issuer = self.issuer.clone();
        let host = hostname.to_string();
        let issued = tokio::task::spawn_blocking(move || {
            issuer.issue(&host, OffsetDateTime::now_utc())
        })
        .await
        .map_err(|e| CaError::Signing(format!("issuance task failed: {}", e)))??;

        info!("Issued certificate for {}", hostname);
        self.audit.log(AuditEvent::CertificateIssued {
            hostname: hostname.to_string(),
        });
        Ok(Arc::new(issued))
    }

    /// A server-side TLS context impersonating `hostname`.
    ///
    /// Presents `[leaf, root]`, requires no client certificate, negotiates
    /// TLS 1.2 or 1.3 with the provider's default cipher suites and offers
    /// only `http/1.1` via ALPN.
    pub async fn impersonating_tls_config(
        &self,
        hostname: &str,
    ) -> Result<Arc<ServerConfig>, ProxyError> {
        let issued = self.get(hostname).await?;
        let chain = vec![
            issued.certificate.clone(),
            self.issuer.root_certificate().clone(),
        ];

        let mut config =
            ServerConfig::builder_with_provider(Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
                .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])?
                .with_no_client_auth()
                .with_single_cert(chain, issued.key_der())?;

        // CRITICAL: Force HTTP/1.1 to prevent HTTP/2 negotiation.
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Arc::new(config))
    }

    /// Number of hostnames with an issued certificate.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    /// Check if no certificate has been issued yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Create the TLS configuration for connections to real destinations.
///
/// Trusts the system root certificates plus `extra_roots`. Destinations
/// are verified normally; interception only happens towards our own
/// clients.
pub fn create_tls_connector(
    extra_roots: &[CertificateDer<'static>],
) -> Result<ClientConfig, ProxyError> {
    let mut root_store = RootCertStore::empty();

    let native_certs = rustls_native_certs::load_native_certs();

    // Log any errors but continue with successfully loaded certs
    for err in native_certs.errors {
        debug!("Warning loading native cert: {}", err);
    }

    for cert in native_certs.certs.into_iter().chain(extra_roots.iter().cloned()) {
        if let Err(e) = root_store.add(cert) {
            debug!("Warning adding cert to store: {}", e);
        }
    }

    if root_store.is_empty() {
        warn!("No root certificates available; HTTPS destinations will fail verification");
    } else {
        debug!("Loaded {} root certificates", root_store.len());
    }

    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])?
    .with_root_certificates(root_store)
    .with_no_client_auth();

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ca::CertificateAuthority;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts signing operations and can be told to fail.
    struct CountingIssuer {
        inner: CertificateAuthority,
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingIssuer {
        fn new(fail: bool) -> Self {
            Self {
                inner: CertificateAuthority::generate("Test Root").unwrap(),
                calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    impl CertificateIssuer for CountingIssuer {
        fn issue(
            &self,
            hostname: &str,
            now: OffsetDateTime,
        ) -> Result<IssuedCertificate, CaError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Widen the race window.
            std::thread::sleep(std::time::Duration::from_millis(50));
            if self.fail {
                return Err(CaError::Signing("signer offline".into()));
            }
            self.inner.issue(hostname, now)
        }

        fn root_certificate(&self) -> &CertificateDer<'static> {
            self.inner.root_der()
        }
    }

    fn cache(fail: bool) -> (Arc<CountingIssuer>, Arc<CertificateCache<CountingIssuer>>) {
        let issuer = Arc::new(CountingIssuer::new(fail));
        let cache = Arc::new(CertificateCache::new(
            issuer.clone(),
            Arc::new(AuditLogger::new_null()),
        ));
        (issuer, cache)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_gets_issue_once() {
        let (issuer, cache) = cache(false);

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get("matrix.example.org").await.unwrap() })
            })
            .collect();

        let mut certs = Vec::new();
        for task in tasks {
            certs.push(task.await.unwrap());
        }

        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
        assert!(certs.iter().all(|c| c.certificate == certs[0].certificate));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_hostnames_are_case_sensitive() {
        let (issuer, cache) = cache(false);

        let lower = cache.get("example.org").await.unwrap();
        let upper = cache.get("EXAMPLE.org").await.unwrap();
        let again = cache.get("example.org").await.unwrap();

        assert_ne!(lower.certificate, upper.certificate);
        assert!(Arc::ptr_eq(&lower, &again));
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_issuance_is_not_cached() {
        let (issuer, cache) = cache(true);

        assert!(cache.get("example.org").await.is_err());
        assert!(cache.get("example.org").await.is_err());

        assert_eq!(issuer.calls.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_impersonating_config() {
        let (_issuer, cache) = cache(false);

        let config = cache.impersonating_tls_config("example.org").await.unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_tls_connector_creation() {
        // Works without system roots too; only logs a warning.
        let ca = CertificateAuthority::generate("Extra Root").unwrap();
        assert!(create_tls_connector(&[ca.root_der().clone()]).is_ok());
    }
}
