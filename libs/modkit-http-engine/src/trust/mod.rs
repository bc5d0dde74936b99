//! Server certificate trust override.
//!
//! A connection trusts servers through a set of [`TrustManager`]s plus a
//! [`HostnameVerifier`] applied after the handshake. Installing a
//! [`ServerCertificateValidationCallback`] swaps the X.509 manager in that set
//! for one that records default-verification failures as [`SslPolicyErrors`]
//! and lets the callback make the final decision.

mod validator;
mod webpki;

pub use validator::ServerCertificateCustomValidator;
pub use webpki::{TrustManagerCertVerifier, WebPkiHostnameVerifier, WebPkiTrustVerifier};

use crate::request::RequestHead;
use bitflags::bitflags;
use rustls_pki_types::CertificateDer;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;

bitflags! {
    /// Problems found while validating the server certificate.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SslPolicyErrors: u8 {
        /// The server presented no certificate
        const REMOTE_CERTIFICATE_NOT_AVAILABLE = 0b0001;
        /// The certificate does not match the requested host
        const REMOTE_CERTIFICATE_NAME_MISMATCH = 0b0010;
        /// The default verifier rejected the chain
        const REMOTE_CERTIFICATE_CHAIN_ERRORS = 0b0100;
    }
}

/// Caller-supplied certificate decision.
///
/// Receives the request being sent, the leaf certificate (if any), the full
/// chain as presented by the server and the accumulated policy errors. Returning
/// `false` aborts the handshake with [`HttpError::ChainRejected`](crate::HttpError::ChainRejected).
pub type ServerCertificateValidationCallback = Arc<
    dyn Fn(&RequestHead, Option<&CertificateDer<'static>>, &[CertificateDer<'static>], SslPolicyErrors) -> bool
        + Send
        + Sync,
>;

/// Marker error raised when the validation callback declines a chain.
#[derive(Error, Debug, Clone, Copy, Default)]
#[error("server certificate chain rejected by validation callback")]
pub struct ChainRejectedError;

/// Failures reported by trust managers and synthetic TLS sessions.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TrustError {
    /// Chain did not validate
    #[error("certificate rejected: {0}")]
    Rejected(String),

    /// The validation callback declined the chain
    #[error(transparent)]
    ChainRejected(#[from] ChainRejectedError),

    /// The trust-manager set has no X.509 manager to wrap
    #[error("no X.509 trust manager available in the trust manager set")]
    NoX509TrustManager,

    /// Accessor not available on this session
    #[error("{0} is not supported by this session")]
    NotSupported(&'static str),

    /// Root store could not be assembled
    #[error("trust store unavailable: {0}")]
    Store(String),
}

/// Chain verification capability of an X.509 trust manager.
pub trait X509TrustVerifier: Send + Sync + fmt::Debug {
    /// Validate a client certificate chain.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError`] if the chain is not trusted.
    fn check_client_trusted(
        &self,
        chain: &[CertificateDer<'static>],
        auth_type: &str,
    ) -> Result<(), TrustError>;

    /// Validate a server certificate chain (leaf first).
    ///
    /// # Errors
    ///
    /// Returns [`TrustError`] if the chain is not trusted.
    fn check_server_trusted(
        &self,
        chain: &[CertificateDer<'static>],
        auth_type: &str,
    ) -> Result<(), TrustError>;

    /// Issuers this manager accepts.
    fn accepted_issuers(&self) -> Vec<CertificateDer<'static>>;
}

/// One entry in a connection's trust-manager set.
#[derive(Debug, Clone)]
pub enum TrustManager {
    /// X.509 chain verifier
    X509(Arc<dyn X509TrustVerifier>),
    /// Any other manager kind; carried through untouched
    Other(Arc<dyn Any + Send + Sync>),
}

impl TrustManager {
    /// The X.509 verifier, if this entry is one.
    #[must_use]
    pub fn as_x509(&self) -> Option<&Arc<dyn X509TrustVerifier>> {
        match self {
            TrustManager::X509(verifier) => Some(verifier),
            TrustManager::Other(_) => None,
        }
    }
}

/// View of a TLS session as seen by a [`HostnameVerifier`].
pub trait SslSession {
    /// Certificates presented by the peer, leaf first.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::NotSupported`] if the session cannot provide them.
    fn peer_certificates(&self) -> Result<Vec<CertificateDer<'static>>, TrustError>;

    /// Host name of the peer.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::NotSupported`] if unknown to the session.
    fn peer_host(&self) -> Result<String, TrustError>;

    /// Port of the peer.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::NotSupported`] if unknown to the session.
    fn peer_port(&self) -> Result<u16, TrustError>;

    /// Negotiated cipher suite.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::NotSupported`] if unknown to the session.
    fn cipher_suite(&self) -> Result<String, TrustError>;

    /// Negotiated protocol version.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::NotSupported`] if unknown to the session.
    fn protocol(&self) -> Result<String, TrustError>;

    /// Certificates sent to the peer.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::NotSupported`] if unknown to the session.
    fn local_certificates(&self) -> Result<Vec<CertificateDer<'static>>, TrustError>;

    /// When the session was established.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::NotSupported`] if unknown to the session.
    fn creation_time(&self) -> Result<SystemTime, TrustError>;
}

/// Decides whether a certificate is acceptable for a host name.
pub trait HostnameVerifier: Send + Sync + fmt::Debug {
    /// `true` if `hostname` matches the session's peer.
    fn verify(&self, hostname: &str, session: &dyn SslSession) -> bool;
}

/// Host name verifier that accepts everything.
///
/// Installed on the connection when a validation callback is active, because
/// the callback already saw the name check result.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAllHostnames;

impl HostnameVerifier for AcceptAllHostnames {
    fn verify(&self, _hostname: &str, _session: &dyn SslSession) -> bool {
        true
    }
}

/// Session that only knows the peer chain.
///
/// Used to run a [`HostnameVerifier`] from inside chain validation, where no
/// real session exists yet.
#[derive(Debug, Clone)]
pub struct PeerChainSession {
    chain: Vec<CertificateDer<'static>>,
}

impl PeerChainSession {
    #[must_use]
    pub fn new(chain: Vec<CertificateDer<'static>>) -> Self {
        Self { chain }
    }
}

impl SslSession for PeerChainSession {
    fn peer_certificates(&self) -> Result<Vec<CertificateDer<'static>>, TrustError> {
        Ok(self.chain.clone())
    }

    fn peer_host(&self) -> Result<String, TrustError> {
        Err(TrustError::NotSupported("peer_host"))
    }

    fn peer_port(&self) -> Result<u16, TrustError> {
        Err(TrustError::NotSupported("peer_port"))
    }

    fn cipher_suite(&self) -> Result<String, TrustError> {
        Err(TrustError::NotSupported("cipher_suite"))
    }

    fn protocol(&self) -> Result<String, TrustError> {
        Err(TrustError::NotSupported("protocol"))
    }

    fn local_certificates(&self) -> Result<Vec<CertificateDer<'static>>, TrustError> {
        Err(TrustError::NotSupported("local_certificates"))
    }

    fn creation_time(&self) -> Result<SystemTime, TrustError> {
        Err(TrustError::NotSupported("creation_time"))
    }
}
