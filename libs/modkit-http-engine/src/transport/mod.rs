//! Connection boundary between the engine and the platform transport.
//!
//! The engine never opens sockets itself. It asks a [`Transport`] for a
//! [`Connection`] bound to one URI, configures it (method, headers, timeouts,
//! TLS trust), streams the request body into it and then reads the status,
//! headers and body back. [`HyperTransport`] is the reference implementation.

mod hyper_client;
mod proxy;

pub use hyper_client::HyperTransport;
pub use proxy::{Proxy, StaticProxy, system_proxy_for};

use crate::error::BoxError;
use crate::response::ResponseBody;
use crate::trust::{HostnameVerifier, TrustManager};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use rustls_pki_types::CertificateDer;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Transport-native failure reported by a [`Connection`].
///
/// The engine converts these into [`HttpError`](crate::HttpError) before they
/// reach the caller.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConnectionError {
    /// Socket could not be connected (refused, unreachable, DNS failure)
    #[error("connect failed: {0}")]
    Connect(#[source] BoxError),

    /// Connect or read deadline elapsed
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// I/O failure on an established connection
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure while streaming a request or response body
    #[error("body error: {0}")]
    Body(#[source] BoxError),

    /// TLS handshake or record failure
    #[error("TLS error: {0}")]
    Tls(#[source] BoxError),

    /// Malformed response or a request the transport refuses to send
    #[error("protocol error: {0}")]
    Protocol(String),

    /// URI scheme the transport has no handler for
    #[error("unknown service: {0}")]
    UnknownService(String),
}

/// Proxy decision for a single connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ProxySelection {
    /// Let the transport apply the platform's proxy settings
    #[default]
    SystemDefault,
    /// Connect to the origin directly
    Direct,
    /// Route through the given HTTP proxy
    Via(Url),
}

/// How the request body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    /// `Content-Length` framing with the given size
    Fixed(u64),
    /// `Transfer-Encoding: chunked`
    Chunked,
}

/// The request line a connection is bound to.
///
/// Authentication modules only need the method and target, so they take this
/// narrower view instead of a whole [`Connection`].
pub trait RequestTarget {
    /// Target URI of the request
    fn url(&self) -> &Url;

    /// HTTP method of the request
    fn method(&self) -> &Method;
}

/// TLS knobs of a connection to an `https` origin.
pub trait TlsSettings: Send {
    /// Default trust managers of the platform, optionally rooted in
    /// `trusted_certs` instead of the system store.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Tls`] if no usable root store can be built.
    fn default_trust_managers(
        &self,
        trusted_certs: Option<&[CertificateDer<'static>]>,
    ) -> Result<Vec<TrustManager>, ConnectionError>;

    /// Replace the trust managers used for the handshake.
    fn set_trust_managers(&mut self, managers: Vec<TrustManager>);

    /// Host name verifier the platform applies by default.
    fn default_hostname_verifier(&self) -> Arc<dyn HostnameVerifier>;

    /// Replace the host name verifier run after the handshake.
    fn set_hostname_verifier(&mut self, verifier: Arc<dyn HostnameVerifier>);
}

/// One physical request/response exchange.
///
/// Headers, method and timeouts may only be changed before [`connect`] is
/// called. The request is sent at the latest when [`status_code`] is first
/// awaited.
///
/// [`connect`]: Connection::connect
/// [`status_code`]: Connection::status_code
#[async_trait]
pub trait Connection: RequestTarget + Send {
    /// Set the request method.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Protocol`] if the request line is already fixed.
    fn set_method(&mut self, method: Method) -> Result<(), ConnectionError>;

    /// Set a request header, replacing any previous value.
    fn set_header(&mut self, name: HeaderName, value: HeaderValue);

    /// Connect and read timeouts; `None` keeps the transport default.
    fn set_timeouts(&mut self, connect: Option<Duration>, read: Option<Duration>);

    /// Body framing for requests that carry content.
    fn set_body_length(&mut self, length: BodyLength);

    /// TLS settings, present only for `https` targets.
    fn tls_settings(&mut self) -> Option<&mut dyn TlsSettings>;

    /// Open the underlying connection.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Connect`], [`ConnectionError::Timeout`] or
    /// [`ConnectionError::Tls`] when the peer cannot be reached.
    async fn connect(&mut self) -> Result<(), ConnectionError>;

    /// Append a chunk to the request body.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the body cannot be written.
    async fn write_body(&mut self, chunk: Bytes) -> Result<(), ConnectionError>;

    /// Send the request if needed and return the response status.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the exchange fails.
    async fn status_code(&mut self) -> Result<StatusCode, ConnectionError>;

    /// Reason phrase of the status line, once the status is known.
    fn response_message(&self) -> Option<String>;

    /// Response headers, once the status is known.
    fn header_fields(&self) -> HeaderMap;

    /// Response body for successful statuses.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Protocol`] if the body was already taken or
    /// the status has not been read.
    fn input_stream(&mut self) -> Result<ResponseBody, ConnectionError>;

    /// Response body for 4xx/5xx statuses, if the transport exposes one.
    fn error_stream(&mut self) -> Option<ResponseBody>;

    /// Tear the connection down. Safe to call more than once.
    async fn disconnect(&mut self);
}

/// Factory for connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Create an unconnected [`Connection`] for `url`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::UnknownService`] for schemes the transport
    /// cannot handle.
    async fn open(
        &self,
        url: &Url,
        proxy: &ProxySelection,
    ) -> Result<Box<dyn Connection>, ConnectionError>;
}
