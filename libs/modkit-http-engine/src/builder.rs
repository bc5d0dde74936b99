use crate::auth::{AuthModule, AuthModuleRegistry, AuthenticationData, AuthenticationScheme};
use crate::config::{HttpEngineConfig, TlsRootConfig};
use crate::content_coding::DecompressionMethods;
use crate::cookies::{CookieJar, MemoryCookieJar};
use crate::credentials::Credentials;
use crate::engine::{EngineInner, HttpEngine};
use crate::error::HttpError;
use crate::negotiate::{HostResolver, SecurityContextFactory, SystemResolver};
use crate::transport::{HyperTransport, Proxy, Transport};
use crate::trust::{ServerCertificateCustomValidator, ServerCertificateValidationCallback};
use rustls_pki_types::CertificateDer;
use std::sync::Arc;
use std::time::Duration;

/// Builder for an [`HttpEngine`].
///
/// Configuration is validated once, in [`build`](Self::build). The built
/// engine cannot be reconfigured.
#[must_use]
pub struct HttpEngineBuilder {
    config: HttpEngineConfig,
    transport: Option<Arc<dyn Transport>>,
    cookie_jar: Option<Arc<dyn CookieJar>>,
    proxy: Option<Arc<dyn Proxy>>,
    credentials: Option<Arc<dyn Credentials>>,
    default_proxy_credentials: Option<Arc<dyn Credentials>>,
    pre_authentication_data: Option<AuthenticationData>,
    validation_callback: Option<ServerCertificateValidationCallback>,
    security_contexts: Option<Arc<dyn SecurityContextFactory>>,
    host_resolver: Option<Arc<dyn HostResolver>>,
    custom_auth_module: Option<Arc<dyn AuthModule>>,
}

impl HttpEngineBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self::with_config(HttpEngineConfig::default())
    }

    /// Create a builder with a specific configuration
    pub fn with_config(config: HttpEngineConfig) -> Self {
        Self {
            config,
            transport: None,
            cookie_jar: None,
            proxy: None,
            credentials: None,
            default_proxy_credentials: None,
            pre_authentication_data: None,
            validation_callback: None,
            security_contexts: None,
            host_resolver: None,
            custom_auth_module: None,
        }
    }

    /// Follow 300/301/302/303/307 responses automatically. Default: `true`
    pub fn allow_auto_redirect(mut self, allow: bool) -> Self {
        self.config.allow_auto_redirect = allow;
        self
    }

    /// Set the maximum number of redirects followed per request
    ///
    /// Must be greater than zero; `build` rejects `0`. Default: 50
    pub fn max_automatic_redirections(mut self, max: u32) -> Self {
        self.config.max_automatic_redirections = max;
        self
    }

    /// Set the content codings the engine advertises and decodes
    pub fn automatic_decompression(mut self, methods: DecompressionMethods) -> Self {
        self.config.automatic_decompression = methods;
        self
    }

    /// Send and store cookies. Default: `true`
    ///
    /// Without an explicit [`cookie_jar`](Self::cookie_jar), an in-memory jar
    /// is created per engine.
    pub fn use_cookies(mut self, enabled: bool) -> Self {
        self.config.use_cookies = enabled;
        self
    }

    /// Route requests through a proxy. Default: `true`
    pub fn use_proxy(mut self, enabled: bool) -> Self {
        self.config.use_proxy = enabled;
        self
    }

    /// Attach the pre-authentication data to every request. Default: `false`
    pub fn pre_authenticate(mut self, enabled: bool) -> Self {
        self.config.pre_authenticate = enabled;
        self
    }

    /// Answer NTLM/Negotiate challenges with the registered
    /// [`security_contexts`](Self::security_contexts). Default: `false`
    pub fn use_negotiate_authentication(mut self, enabled: bool) -> Self {
        self.config.use_negotiate_authentication = enabled;
        self
    }

    /// Set the connect timeout; zero keeps the transport default
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the read timeout; zero keeps the transport default
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    /// Trust only these DER certificates as roots instead of the configured
    /// root store
    pub fn trusted_certs(mut self, certs: Vec<CertificateDer<'static>>) -> Self {
        self.config.trusted_certs = Some(certs);
        self
    }

    /// Set the root store used by the default transport
    pub fn tls_roots(mut self, roots: TlsRootConfig) -> Self {
        self.config.tls_roots = roots;
        self
    }

    /// Replace the default [`HyperTransport`]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn cookie_jar(mut self, jar: Arc<dyn CookieJar>) -> Self {
        self.cookie_jar = Some(jar);
        self
    }

    /// Set the proxy. Without one, the environment proxy settings apply.
    pub fn proxy(mut self, proxy: Arc<dyn Proxy>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Credentials for origin authentication
    pub fn credentials(mut self, credentials: Arc<dyn Credentials>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Credentials for proxies that do not carry their own
    pub fn default_proxy_credentials(mut self, credentials: Arc<dyn Credentials>) -> Self {
        self.default_proxy_credentials = Some(credentials);
        self
    }

    /// Challenge to answer up front when
    /// [`pre_authenticate`](Self::pre_authenticate) is on
    pub fn pre_authentication_data(mut self, data: AuthenticationData) -> Self {
        self.pre_authentication_data = Some(data);
        self
    }

    /// Decide server certificate trust with `callback`
    ///
    /// The callback sees the default verification result as
    /// [`SslPolicyErrors`](crate::trust::SslPolicyErrors) and has the final
    /// word; returning `false` fails the request with
    /// [`HttpError::ChainRejected`].
    pub fn server_certificate_validation_callback(
        mut self,
        callback: ServerCertificateValidationCallback,
    ) -> Self {
        self.validation_callback = Some(callback);
        self
    }

    /// Register the security package used for NTLM/Negotiate
    pub fn security_contexts(mut self, factory: Arc<dyn SecurityContextFactory>) -> Self {
        self.security_contexts = Some(factory);
        self
    }

    /// Replace the resolver used to canonicalize SPN host names
    pub fn host_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.host_resolver = Some(resolver);
        self
    }

    /// Module for pre-authentication data with an unsupported scheme
    pub fn custom_auth_module(mut self, module: Arc<dyn AuthModule>) -> Self {
        self.custom_auth_module = Some(module);
        self
    }

    /// Build the engine
    ///
    /// # Errors
    /// Returns [`HttpError::ArgumentOutOfRange`] if `max_automatic_redirections`
    /// is zero
    pub fn build(self) -> Result<HttpEngine, HttpError> {
        if self.config.max_automatic_redirections == 0 {
            return Err(HttpError::ArgumentOutOfRange {
                name: "max_automatic_redirections",
                reason: "must be greater than zero".to_owned(),
            });
        }

        let transport = self.transport.unwrap_or_else(|| {
            Arc::new(HyperTransport::new(self.config.tls_roots)) as Arc<dyn Transport>
        });
        let cookie_jar = match self.cookie_jar {
            Some(jar) => Some(jar),
            None if self.config.use_cookies => {
                Some(Arc::new(MemoryCookieJar::new()) as Arc<dyn CookieJar>)
            }
            None => None,
        };

        let custom_auth_module = self.custom_auth_module;
        let pre_authentication_data = self.pre_authentication_data.map(|data| {
            let needs_module =
                data.scheme == AuthenticationScheme::Unsupported && data.auth_module.is_none();
            match &custom_auth_module {
                Some(module) if needs_module => data.with_auth_module(Arc::clone(module)),
                _ => data,
            }
        });

        tracing::debug!(
            auto_redirect = self.config.allow_auto_redirect,
            max_redirections = self.config.max_automatic_redirections,
            decompression = ?self.config.automatic_decompression,
            negotiate = self.config.use_negotiate_authentication,
            "building HTTP engine"
        );

        Ok(HttpEngine {
            inner: Arc::new(EngineInner {
                config: self.config,
                transport,
                cookie_jar,
                proxy: self.proxy,
                credentials: self.credentials,
                default_proxy_credentials: self.default_proxy_credentials,
                pre_authentication_data,
                validator: self
                    .validation_callback
                    .map(ServerCertificateCustomValidator::new),
                security_contexts: self.security_contexts,
                host_resolver: self
                    .host_resolver
                    .unwrap_or_else(|| Arc::new(SystemResolver::new())),
                auth_modules: AuthModuleRegistry::new(),
            }),
        })
    }
}

impl Default for HttpEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::auth::Authorization;
    use crate::credentials::NetworkCredential;
    use crate::transport::RequestTarget;

    struct Token;

    impl AuthModule for Token {
        fn scheme(&self) -> AuthenticationScheme {
            AuthenticationScheme::Unsupported
        }

        fn authentication_type(&self) -> &str {
            "Token"
        }

        fn can_pre_authenticate(&self) -> bool {
            true
        }

        fn authenticate(
            &self,
            _challenge: &str,
            _target: &dyn RequestTarget,
            _credentials: &dyn Credentials,
        ) -> Option<Authorization> {
            None
        }

        fn pre_authenticate(
            &self,
            _target: &dyn RequestTarget,
            _credentials: &dyn Credentials,
        ) -> Option<Authorization> {
            Some(Authorization::new("Token abc"))
        }
    }

    #[test]
    fn test_builder_default() {
        let engine = HttpEngineBuilder::new().build().unwrap();
        assert_eq!(engine.config().max_automatic_redirections, 50);
        assert!(engine.inner.cookie_jar.is_some());
        assert!(engine.inner.validator.is_none());
    }

    #[test]
    fn test_builder_rejects_zero_redirections() {
        let err = HttpEngine::builder()
            .max_automatic_redirections(0)
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            HttpError::ArgumentOutOfRange {
                name: "max_automatic_redirections",
                ..
            }
        ));
    }

    #[test]
    fn test_builder_zero_timeouts_mean_default() {
        let engine = HttpEngine::builder()
            .connect_timeout(Duration::ZERO)
            .read_timeout(Duration::ZERO)
            .build()
            .unwrap();
        assert!(engine.config().effective_connect_timeout().is_none());
        assert!(engine.config().effective_read_timeout().is_none());
    }

    #[test]
    fn test_builder_without_cookies_has_no_jar() {
        let engine = HttpEngine::builder().use_cookies(false).build().unwrap();
        assert!(engine.inner.cookie_jar.is_none());
    }

    #[test]
    fn test_builder_attaches_custom_module_to_unsupported_scheme() {
        let engine = HttpEngine::builder()
            .pre_authenticate(true)
            .credentials(Arc::new(NetworkCredential::new("u", "p")))
            .pre_authentication_data(AuthenticationData::new(
                AuthenticationScheme::Unsupported,
                "Token",
            ))
            .custom_auth_module(Arc::new(Token))
            .build()
            .unwrap();

        let data = engine.inner.pre_authentication_data.as_ref().unwrap();
        let module = engine.inner.auth_modules.resolve(data).unwrap();
        assert_eq!(module.authentication_type(), "Token");
    }

    #[test]
    fn test_builder_leaves_builtin_schemes_alone() {
        let engine = HttpEngine::builder()
            .pre_authentication_data(AuthenticationData::new(AuthenticationScheme::Basic, "Basic"))
            .custom_auth_module(Arc::new(Token))
            .build()
            .unwrap();
        let data = engine.inner.pre_authentication_data.as_ref().unwrap();
        assert!(data.auth_module.is_none());
    }
}
