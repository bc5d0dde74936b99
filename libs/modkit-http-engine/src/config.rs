use rustls_pki_types::CertificateDer;
use std::time::Duration;

pub use crate::content_coding::DecompressionMethods;

/// Default cap on automatically followed redirects
pub const DEFAULT_MAX_AUTOMATIC_REDIRECTIONS: u32 = 50;

/// Default connect and read timeout (one day)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// TLS root certificate source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum TlsRootConfig {
    /// Use Mozilla's root certificates (webpki-roots, no OS dependency)
    #[default]
    WebPki,
    /// Use OS native root certificate store
    Native,
}

/// Engine configuration
///
/// Plain data; validation happens in [`HttpEngineBuilder`](crate::HttpEngineBuilder).
#[derive(Debug, Clone)]
#[allow(clippy::struct_excessive_bools)]
pub struct HttpEngineConfig {
    /// Follow 300/301/302/303/307 responses (default: true)
    pub allow_auto_redirect: bool,

    /// Maximum number of redirects followed for one request (default: 50)
    ///
    /// Must be greater than zero.
    pub max_automatic_redirections: u32,

    /// Codings advertised in `Accept-Encoding` and decoded locally
    /// (default: none, which advertises `identity`)
    pub automatic_decompression: DecompressionMethods,

    /// Send and store cookies through the cookie jar (default: true)
    pub use_cookies: bool,

    /// Route requests through a proxy (default: true)
    ///
    /// With no explicit proxy configured the environment decides.
    pub use_proxy: bool,

    /// Attach `Authorization` before any challenge is seen (default: false)
    pub pre_authenticate: bool,

    /// Answer NTLM/Negotiate challenges with a security context (default: false)
    pub use_negotiate_authentication: bool,

    /// Connect timeout (default: 24 hours). Zero keeps the transport default.
    pub connect_timeout: Duration,

    /// Read timeout (default: 24 hours). Zero keeps the transport default.
    pub read_timeout: Duration,

    /// DER certificates that replace the default root store (default: none)
    pub trusted_certs: Option<Vec<CertificateDer<'static>>>,

    /// Root store used when `trusted_certs` is not set (default: `WebPki`)
    pub tls_roots: TlsRootConfig,
}

impl Default for HttpEngineConfig {
    fn default() -> Self {
        Self {
            allow_auto_redirect: true,
            max_automatic_redirections: DEFAULT_MAX_AUTOMATIC_REDIRECTIONS,
            automatic_decompression: DecompressionMethods::NONE,
            use_cookies: true,
            use_proxy: true,
            pre_authenticate: false,
            use_negotiate_authentication: false,
            connect_timeout: DEFAULT_TIMEOUT,
            read_timeout: DEFAULT_TIMEOUT,
            trusted_certs: None,
            tls_roots: TlsRootConfig::default(),
        }
    }
}

impl HttpEngineConfig {
    /// Create configuration for testing (short timeouts, no proxy, no cookies)
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            use_cookies: false,
            use_proxy: false,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
            ..Default::default()
        }
    }

    /// Create configuration that returns 3xx responses as-is
    #[must_use]
    pub fn no_redirects() -> Self {
        Self {
            allow_auto_redirect: false,
            ..Default::default()
        }
    }

    /// Connect timeout for the transport, `None` if zero.
    pub(crate) fn effective_connect_timeout(&self) -> Option<Duration> {
        Some(self.connect_timeout).filter(|t| !t.is_zero())
    }

    /// Read timeout for the transport, `None` if zero.
    pub(crate) fn effective_read_timeout(&self) -> Option<Duration> {
        Some(self.read_timeout).filter(|t| !t.is_zero())
    }
}
