//! rustls bindings for the trust abstractions.

use super::{HostnameVerifier, SslSession, TrustError, TrustManager, X509TrustVerifier};
use crate::tls::RootStore;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::server::ParsedCertificate;
use rustls::{CertificateError, DigitallySignedStruct, OtherError, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Chain verification against a webpki root store. Host names are not
/// checked here; that is the [`HostnameVerifier`]'s job.
#[derive(Debug, Clone)]
pub struct WebPkiTrustVerifier {
    roots: RootStore,
    provider: Arc<CryptoProvider>,
}

impl WebPkiTrustVerifier {
    #[must_use]
    pub fn new(roots: RootStore, provider: Arc<CryptoProvider>) -> Self {
        Self { roots, provider }
    }
}

impl X509TrustVerifier for WebPkiTrustVerifier {
    fn check_client_trusted(
        &self,
        _chain: &[CertificateDer<'static>],
        _auth_type: &str,
    ) -> Result<(), TrustError> {
        Err(TrustError::NotSupported("client certificate verification"))
    }

    fn check_server_trusted(
        &self,
        chain: &[CertificateDer<'static>],
        _auth_type: &str,
    ) -> Result<(), TrustError> {
        let (end_entity, intermediates) = chain
            .split_first()
            .ok_or_else(|| TrustError::Rejected("empty certificate chain".to_owned()))?;

        let parsed = ParsedCertificate::try_from(end_entity)
            .map_err(|e| TrustError::Rejected(e.to_string()))?;

        rustls::client::verify_server_cert_signed_by_trust_anchor(
            &parsed,
            &self.roots.store,
            intermediates,
            UnixTime::now(),
            self.provider.signature_verification_algorithms.all,
        )
        .map_err(|e| TrustError::Rejected(e.to_string()))
    }

    fn accepted_issuers(&self) -> Vec<CertificateDer<'static>> {
        self.roots.issuers.clone()
    }
}

/// RFC 6125 name matching on the leaf certificate of the session.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebPkiHostnameVerifier;

impl HostnameVerifier for WebPkiHostnameVerifier {
    fn verify(&self, hostname: &str, session: &dyn SslSession) -> bool {
        let Ok(chain) = session.peer_certificates() else {
            return false;
        };
        let Some(leaf) = chain.first() else {
            return false;
        };
        let Ok(parsed) = ParsedCertificate::try_from(leaf) else {
            return false;
        };
        let Ok(name) = ServerName::try_from(hostname) else {
            return false;
        };
        rustls::client::verify_server_name(&parsed, &name).is_ok()
    }
}

/// rustls verifier driven by a trust-manager set.
///
/// Only the chain is checked during the handshake; the connection runs its
/// [`HostnameVerifier`] once the handshake completes.
#[derive(Debug)]
pub struct TrustManagerCertVerifier {
    verifier: Arc<dyn X509TrustVerifier>,
    provider: Arc<CryptoProvider>,
    rejected: AtomicBool,
}

impl TrustManagerCertVerifier {
    /// Build a verifier from the first X.509 manager in `managers`.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::NoX509TrustManager`] if the set has none.
    pub fn from_managers(
        managers: &[TrustManager],
        provider: Arc<CryptoProvider>,
    ) -> Result<Self, TrustError> {
        let verifier = managers
            .iter()
            .find_map(TrustManager::as_x509)
            .cloned()
            .ok_or(TrustError::NoX509TrustManager)?;

        Ok(Self {
            verifier,
            provider,
            rejected: AtomicBool::new(false),
        })
    }

    /// `true` once the validation callback has declined a chain.
    #[must_use]
    pub fn was_rejected_by_callback(&self) -> bool {
        self.rejected.load(Ordering::Acquire)
    }
}

impl ServerCertVerifier for TrustManagerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let chain: Vec<CertificateDer<'static>> = std::iter::once(end_entity)
            .chain(intermediates)
            .map(|c| c.clone().into_owned())
            .collect();

        match self.verifier.check_server_trusted(&chain, "UNKNOWN") {
            Ok(()) => Ok(ServerCertVerified::assertion()),
            Err(TrustError::ChainRejected(marker)) => {
                self.rejected.store(true, Ordering::Release);
                Err(rustls::Error::InvalidCertificate(CertificateError::Other(
                    OtherError(Arc::new(marker)),
                )))
            }
            Err(e) => {
                tracing::debug!(error = %e, "server chain not trusted");
                Err(rustls::Error::InvalidCertificate(
                    CertificateError::UnknownIssuer,
                ))
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
