use super::{
    AcceptAllHostnames, ChainRejectedError, HostnameVerifier, PeerChainSession,
    ServerCertificateValidationCallback, SslPolicyErrors, TrustError, TrustManager,
    X509TrustVerifier,
};
use crate::request::RequestHead;
use rustls_pki_types::CertificateDer;
use std::fmt;
use std::sync::Arc;

/// Installs a [`ServerCertificateValidationCallback`] on a connection's trust
/// configuration.
#[derive(Clone)]
pub struct ServerCertificateCustomValidator {
    callback: ServerCertificateValidationCallback,
}

impl fmt::Debug for ServerCertificateCustomValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCertificateCustomValidator")
            .field("callback", &"<fn>")
            .finish()
    }
}

impl ServerCertificateCustomValidator {
    #[must_use]
    pub fn new(callback: ServerCertificateValidationCallback) -> Self {
        Self { callback }
    }

    /// Host name verifier to install on the connection.
    ///
    /// Name checks are folded into the callback's policy errors, so the
    /// connection itself must not reject on them a second time.
    #[must_use]
    pub fn hostname_verifier(&self) -> Arc<dyn HostnameVerifier> {
        Arc::new(AcceptAllHostnames)
    }

    /// Replace the first X.509 manager of `managers` with a callback-aware
    /// wrapper. Every other entry is returned untouched and in order.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::NoX509TrustManager`] if the set has no X.509 manager.
    pub fn replace_x509_trust_manager(
        &self,
        mut managers: Vec<TrustManager>,
        request: Arc<RequestHead>,
        default_hostname_verifier: Arc<dyn HostnameVerifier>,
    ) -> Result<Vec<TrustManager>, TrustError> {
        let slot = managers
            .iter()
            .position(|m| m.as_x509().is_some())
            .ok_or(TrustError::NoX509TrustManager)?;

        let TrustManager::X509(inner) = managers[slot].clone() else {
            return Err(TrustError::NoX509TrustManager);
        };

        managers[slot] = TrustManager::X509(Arc::new(CallbackTrustVerifier {
            inner,
            callback: Arc::clone(&self.callback),
            request,
            hostname_verifier: default_hostname_verifier,
        }));

        Ok(managers)
    }
}

/// X.509 verifier that turns default-verification failures into policy errors
/// and defers the final decision to the callback.
struct CallbackTrustVerifier {
    inner: Arc<dyn X509TrustVerifier>,
    callback: ServerCertificateValidationCallback,
    request: Arc<RequestHead>,
    hostname_verifier: Arc<dyn HostnameVerifier>,
}

impl fmt::Debug for CallbackTrustVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackTrustVerifier")
            .field("inner", &self.inner)
            .field("callback", &"<fn>")
            .field("request", &self.request.uri.as_str())
            .field("hostname_verifier", &self.hostname_verifier)
            .finish()
    }
}

impl X509TrustVerifier for CallbackTrustVerifier {
    fn check_client_trusted(
        &self,
        chain: &[CertificateDer<'static>],
        auth_type: &str,
    ) -> Result<(), TrustError> {
        self.inner.check_client_trusted(chain, auth_type)
    }

    fn check_server_trusted(
        &self,
        chain: &[CertificateDer<'static>],
        auth_type: &str,
    ) -> Result<(), TrustError> {
        let mut errors = SslPolicyErrors::empty();

        if let Err(e) = self.inner.check_server_trusted(chain, auth_type) {
            tracing::debug!(error = %e, "default verifier rejected server chain");
            errors |= SslPolicyErrors::REMOTE_CERTIFICATE_CHAIN_ERRORS;
        }

        if chain.is_empty() {
            errors |= SslPolicyErrors::REMOTE_CERTIFICATE_NOT_AVAILABLE;
        } else {
            let host = self.request.uri.host_str().unwrap_or_default();
            let session = PeerChainSession::new(chain.to_vec());
            if !self.hostname_verifier.verify(host, &session) {
                errors |= SslPolicyErrors::REMOTE_CERTIFICATE_NAME_MISMATCH;
            }
        }

        if (self.callback)(&self.request, chain.first(), chain, errors) {
            Ok(())
        } else {
            tracing::debug!(
                url = %self.request.uri,
                errors = ?errors,
                "validation callback rejected server chain"
            );
            Err(ChainRejectedError.into())
        }
    }

    fn accepted_issuers(&self) -> Vec<CertificateDer<'static>> {
        self.inner.accepted_issuers()
    }
}
