//! Root certificate stores and crypto provider for TLS connections.
//!
//! Native roots are loaded from the OS once and cached, since the lookup can be
//! slow on some platforms.

use crate::config::TlsRootConfig;
use rustls::RootCertStore;
use rustls_pki_types::CertificateDer;
use std::sync::{Arc, OnceLock};

/// Cached native root certificates.
/// Always stores Ok; empty vec means no certs found (warned, not errored).
static NATIVE_ROOTS_CACHE: OnceLock<Vec<CertificateDer<'static>>> = OnceLock::new();

#[cfg(test)]
static LOAD_COUNT: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

fn load_native_certs_inner() -> Vec<CertificateDer<'static>> {
    #[cfg(test)]
    LOAD_COUNT.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

    let result = rustls_native_certs::load_native_certs();

    for err in &result.errors {
        tracing::warn!(error = %err, "error loading native root certificate");
    }

    if result.certs.is_empty() {
        tracing::warn!("no native root CA certificates found");
    } else {
        tracing::debug!(count = result.certs.len(), "loaded native root certificates");
    }

    result.certs
}

/// Native root certificates, loaded lazily on first call (may be empty).
pub fn native_root_certs() -> &'static [CertificateDer<'static>] {
    NATIVE_ROOTS_CACHE
        .get_or_init(load_native_certs_inner)
        .as_slice()
}

/// Crypto provider for TLS connections.
///
/// Uses the process-wide default if one is installed, otherwise an aws-lc-rs
/// provider that is not installed globally.
pub fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

/// Trust anchors for one connection plus the DER issuers they came from.
#[derive(Debug, Clone)]
pub struct RootStore {
    pub store: Arc<RootCertStore>,
    pub issuers: Vec<CertificateDer<'static>>,
}

/// Build the root store for a connection.
///
/// `trusted_certs`, when given, replaces the configured roots entirely.
///
/// # Errors
///
/// Returns an error if the resulting store would be empty.
pub fn root_store(
    roots: TlsRootConfig,
    trusted_certs: Option<&[CertificateDer<'static>]>,
) -> Result<RootStore, String> {
    let mut store = RootCertStore::empty();

    let issuers = match (trusted_certs, roots) {
        (Some(certs), _) => {
            add_parsable(&mut store, certs, "trusted");
            certs.to_vec()
        }
        (None, TlsRootConfig::Native) => {
            let certs = native_root_certs();
            add_parsable(&mut store, certs, "native");
            certs.to_vec()
        }
        (None, TlsRootConfig::WebPki) => {
            store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            Vec::new()
        }
    };

    if store.is_empty() {
        return Err(format!("no usable {roots:?} root certificates"));
    }

    Ok(RootStore {
        store: Arc::new(store),
        issuers,
    })
}

fn add_parsable(store: &mut RootCertStore, certs: &[CertificateDer<'static>], origin: &str) {
    let (added, ignored) = store.add_parsable_certificates(certs.iter().cloned());
    if ignored > 0 {
        tracing::warn!(
            origin,
            added = added,
            ignored = ignored,
            "some root certificates could not be parsed"
        );
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    /// Verifies "at most one load": `LOAD_COUNT` is shared with any other test
    /// that touched the cache first.
    #[test]
    fn test_native_roots_cached() {
        let initial_count = LOAD_COUNT.load(Ordering::SeqCst);

        let result1 = native_root_certs();
        let result2 = native_root_certs();

        let final_count = LOAD_COUNT.load(Ordering::SeqCst);
        assert!(final_count <= initial_count + 1);
        assert!(std::ptr::eq(result1, result2), "should return same slice");
    }

    #[test]
    fn test_webpki_root_store_is_populated() {
        let roots = root_store(TlsRootConfig::WebPki, None).unwrap();
        assert!(!roots.store.is_empty());
        assert!(roots.issuers.is_empty());
    }

    #[test]
    fn test_unparsable_trusted_certs_are_rejected() {
        let garbage = [CertificateDer::from(vec![0u8, 1, 2])];
        let result = root_store(TlsRootConfig::WebPki, Some(&garbage));
        assert!(result.is_err());
    }
}
