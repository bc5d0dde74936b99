use crate::transport::ConnectionError;
use crate::trust::ChainRejectedError;
use http::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Boxed error type used for transport and body failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Request execution error types
///
/// Transport-specific failures are translated into these variants at the
/// connection boundary and never surface raw. Authentication failures for
/// Basic and Digest are not errors: they are reported through
/// [`HttpResponse::requested_authentication`](crate::HttpResponse::requested_authentication).
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpError {
    /// The request cannot be executed as given (relative URI, unsupported
    /// scheme, one-shot body that would have to be replayed)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A configuration value is outside its permitted range
    #[error("Argument '{name}' out of range: {reason}")]
    ArgumentOutOfRange {
        /// Name of the rejected setting
        name: &'static str,
        /// Why the value was rejected
        reason: String,
    },

    /// Invalid header name
    #[error("Invalid header name: {0}")]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    /// Invalid header value
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    /// The connection could not be established
    #[error("Connect failed: {0}")]
    ConnectFailed(#[source] BoxError),

    /// Connect or read timed out
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// I/O failure while writing the request or reading the response
    #[error("Transport error: {0}")]
    Transport(#[source] BoxError),

    /// TLS failure other than a rejection by the validation callback
    #[error("TLS error: {0}")]
    Tls(#[source] BoxError),

    /// Redirect limit exceeded
    #[error("Too many redirects (maximum {max})")]
    TooManyRedirects {
        /// Configured maximum number of automatic redirections
        max: u32,
    },

    /// The server answered with a 3xx status the engine does not follow
    #[error("Unsupported redirect status: {0}")]
    UnsupportedRedirectStatus(StatusCode),

    /// The caller cancelled the request
    #[error("Request cancelled")]
    Cancelled,

    /// The server certificate validation callback declined the chain
    #[error("Server certificate chain rejected by validation callback")]
    ChainRejected,

    /// The peer or the transport violated the protocol (malformed challenge,
    /// unusable redirect target, method rejected by the transport)
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl HttpError {
    pub(crate) fn invalid_request(reason: impl Into<String>) -> Self {
        HttpError::InvalidRequest(reason.into())
    }

    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        HttpError::Protocol(reason.into())
    }
}

impl From<ConnectionError> for HttpError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::Connect(source) => HttpError::ConnectFailed(source),
            ConnectionError::Timeout(after) => HttpError::Timeout(after),
            ConnectionError::Io(source) => HttpError::Transport(Box::new(source)),
            ConnectionError::Body(source) => HttpError::Transport(source),
            ConnectionError::Protocol(reason) => HttpError::Protocol(reason),
            ConnectionError::UnknownService(reason) => {
                HttpError::Protocol(format!("unknown service: {reason}"))
            }
            ConnectionError::Tls(source) => {
                if is_chain_rejection(source.as_ref()) {
                    HttpError::ChainRejected
                } else {
                    HttpError::Tls(source)
                }
            }
        }
    }
}

fn is_chain_rejection(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.is::<ChainRejectedError>() {
            return true;
        }
        current = e.source();
    }
    false
}
