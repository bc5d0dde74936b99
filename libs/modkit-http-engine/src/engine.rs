use crate::auth::{AuthModuleRegistry, AuthenticationData, collect_auth_info};
use crate::builder::HttpEngineBuilder;
use crate::config::HttpEngineConfig;
use crate::content_coding::{accept_encoding, decode_body};
use crate::cookies::CookieJar;
use crate::credentials::Credentials;
use crate::error::HttpError;
use crate::headers::{joined_value, split_content_headers};
use crate::negotiate::{
    HostResolver, NegotiateChallenge, Negotiator, Resend, SecurityContextFactory,
};
use crate::redirect::{self, RedirectState, RedirectVerdict};
use crate::request::{HttpRequest, OutgoingBody};
use crate::response::{HttpResponse, ResponseBody, ResponseContent, empty_body, full_body};
use crate::transport::{
    BodyLength, Connection, Proxy, ProxySelection, Transport, system_proxy_for,
};
use crate::trust::ServerCertificateCustomValidator;
use async_trait::async_trait;
use futures::future::BoxFuture;
use http::header::{
    ACCEPT_ENCODING, AUTHORIZATION, COOKIE, HeaderValue, PROXY_AUTHORIZATION, SET_COOKIE,
};
use http::{HeaderMap, Method, StatusCode};
use http_body_util::BodyExt;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio_util::sync::CancellationToken;
use tower::Service;
use url::Url;

/// Executes [`HttpRequest`]s over a [`Transport`].
///
/// One `execute` call may open several connections: one per redirect hop and
/// one per NTLM/Negotiate round. Everything except the digest session cache
/// and the cookie jar is per call, so concurrent calls never block each other.
///
/// `HttpEngine` is `Clone + Send + Sync`; clones share configuration and
/// caches.
///
/// # Example
///
/// ```ignore
/// use modkit_http_engine::{HttpEngine, HttpRequest};
/// use tokio_util::sync::CancellationToken;
///
/// let engine = HttpEngine::builder().max_automatic_redirections(5).build()?;
/// let response = engine
///     .execute(HttpRequest::get("https://example.com/")?, CancellationToken::new())
///     .await?;
/// println!("{}", response.text().await?);
/// ```
#[derive(Clone)]
pub struct HttpEngine {
    pub(crate) inner: Arc<EngineInner>,
}

/// Immutable state shared by all clones of an engine.
pub struct EngineInner {
    pub(crate) config: HttpEngineConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) cookie_jar: Option<Arc<dyn CookieJar>>,
    pub(crate) proxy: Option<Arc<dyn Proxy>>,
    pub(crate) credentials: Option<Arc<dyn Credentials>>,
    pub(crate) default_proxy_credentials: Option<Arc<dyn Credentials>>,
    pub(crate) pre_authentication_data: Option<AuthenticationData>,
    pub(crate) validator: Option<ServerCertificateCustomValidator>,
    pub(crate) security_contexts: Option<Arc<dyn SecurityContextFactory>>,
    pub(crate) host_resolver: Arc<dyn HostResolver>,
    pub(crate) auth_modules: AuthModuleRegistry,
}

impl std::fmt::Debug for HttpEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = &self.inner;
        f.debug_struct("HttpEngine")
            .field("config", &inner.config)
            .field("cookie_jar", &inner.cookie_jar.is_some())
            .field("proxy", &inner.proxy.is_some())
            .field("credentials", &inner.credentials.is_some())
            .field(
                "default_proxy_credentials",
                &inner.default_proxy_credentials.is_some(),
            )
            .field("pre_authentication_data", &inner.pre_authentication_data)
            .field("validator", &inner.validator)
            .field("security_contexts", &inner.security_contexts.is_some())
            .field("digest_sessions", &inner.auth_modules.digest_sessions().len())
            .finish_non_exhaustive()
    }
}

impl HttpEngine {
    /// Create an engine with default configuration
    ///
    /// # Errors
    /// Returns an error if the default configuration is rejected
    pub fn new() -> Result<Self, HttpError> {
        HttpEngineBuilder::new().build()
    }

    /// Create a builder for configuring the engine
    #[must_use]
    pub fn builder() -> HttpEngineBuilder {
        HttpEngineBuilder::new()
    }

    #[must_use]
    pub fn config(&self) -> &HttpEngineConfig {
        &self.inner.config
    }

    /// Digest sessions cached by this engine.
    #[must_use]
    pub fn digest_sessions(&self) -> &Arc<crate::auth::DigestSessionCache> {
        self.inner.auth_modules.digest_sessions()
    }

    /// Execute `request`, following redirects and running NTLM/Negotiate
    /// handshakes as configured.
    ///
    /// A 401/407 that the engine does not answer itself is returned as a
    /// normal response whose
    /// [`requested_authentication`](HttpResponse::requested_authentication)
    /// lists the offered challenges.
    ///
    /// # Errors
    ///
    /// - [`HttpError::InvalidRequest`] for a target that is not an absolute
    ///   `http`/`https` URL, or a one-shot body that would have to be resent
    /// - [`HttpError::Cancelled`] once `cancel` fires; the connection in
    ///   flight is disconnected first
    /// - [`HttpError::TooManyRedirects`] / [`HttpError::UnsupportedRedirectStatus`]
    /// - connection failures mapped from the transport
    pub async fn execute(
        &self,
        mut request: HttpRequest,
        cancel: CancellationToken,
    ) -> Result<HttpResponse, HttpError> {
        let uri = request.uri();
        if !matches!(uri.scheme(), "http" | "https") || uri.host_str().is_none() {
            return Err(HttpError::invalid_request(format!(
                "'{uri}' is not an absolute http or https URI"
            )));
        }

        let mut response = self.send(&mut request, &cancel, true).await?;
        if let Some(negotiated) = self.negotiate(&mut request, &mut response, &cancel).await? {
            response = negotiated;
        }
        Ok(response)
    }

    /// Answer an NTLM/Negotiate challenge in `response` if the engine is set
    /// up for it. `None` keeps the original response.
    async fn negotiate(
        &self,
        request: &mut HttpRequest,
        response: &mut HttpResponse,
        cancel: &CancellationToken,
    ) -> Result<Option<HttpResponse>, HttpError> {
        let inner = &self.inner;
        if !inner.config.use_negotiate_authentication
            || !matches!(
                response.status(),
                StatusCode::UNAUTHORIZED | StatusCode::PROXY_AUTHENTICATION_REQUIRED
            )
        {
            return Ok(None);
        }
        let Some(factory) = inner.security_contexts.as_deref() else {
            return Ok(None);
        };

        let proxy_credentials = self.proxy_credentials();
        let Some(challenge) = NegotiateChallenge::find(
            response.requested_authentication(),
            request.uri(),
            inner.credentials.as_deref(),
            proxy_credentials.as_deref(),
        ) else {
            return Ok(None);
        };

        // Later rounds may fall back to this response, so it must not hold the
        // connection.
        response.content_mut().load_into_buffer().await?;

        let auth_uri = if challenge.is_proxy {
            self.proxy_address(request.uri())
                .unwrap_or_else(|| request.uri().clone())
        } else {
            request.uri().clone()
        };
        tracing::debug!(
            scheme = %challenge.auth_type,
            proxy = challenge.is_proxy,
            "answering challenge with security context"
        );

        let negotiator = Negotiator {
            factory,
            resolver: inner.host_resolver.as_ref(),
        };
        negotiator
            .send_with_auth(self, request, &challenge, &auth_uri, cancel)
            .await
    }

    /// One logical send: connect, write, read, following redirects.
    async fn send(
        &self,
        request: &mut HttpRequest,
        cancel: &CancellationToken,
        pre_authenticate: bool,
    ) -> Result<HttpResponse, HttpError> {
        let config = &self.inner.config;
        let mut state = RedirectState::new(request.uri().clone(), request.method().clone());

        loop {
            let (mut conn, status) = self.exchange(request, pre_authenticate, cancel).await?;
            let headers = conn.header_fields();

            let verdict = match redirect::decide(
                status,
                &headers,
                &state,
                config.allow_auto_redirect,
                config.max_automatic_redirections,
            ) {
                Ok(verdict) => verdict,
                Err(e) => {
                    conn.disconnect().await;
                    return Err(e);
                }
            };

            match verdict {
                RedirectVerdict::NotARedirect | RedirectVerdict::StopNoLocation => {
                    return self.finish(conn, status, headers, request);
                }
                RedirectVerdict::LimitExceeded => {
                    conn.disconnect().await;
                    return Err(HttpError::TooManyRedirects {
                        max: config.max_automatic_redirections,
                    });
                }
                RedirectVerdict::Redirect {
                    new_uri,
                    new_method,
                    method_changed,
                } => {
                    conn.disconnect().await;
                    self.store_cookies(request.uri(), &headers);
                    state.follow(new_uri.clone(), new_method.clone(), method_changed);
                    request.set_uri(new_uri);
                    request.set_method(new_method);
                    if method_changed {
                        request.set_content(None);
                    }
                    request.headers_mut().remove(AUTHORIZATION);
                }
            }
        }
    }

    /// Open a connection for the current target and run it up to the status
    /// line. The connection is disconnected on every error.
    async fn exchange(
        &self,
        request: &mut HttpRequest,
        pre_authenticate: bool,
        cancel: &CancellationToken,
    ) -> Result<(Box<dyn Connection>, StatusCode), HttpError> {
        let selection = self.proxy_selection(request.uri());
        tracing::debug!(
            method = %request.method(),
            uri = %request.uri(),
            "sending request"
        );
        let mut conn = self
            .inner
            .transport
            .open(request.uri(), &selection)
            .await?;

        match self
            .drive(conn.as_mut(), request, pre_authenticate, cancel)
            .await
        {
            Ok(status) => Ok((conn, status)),
            Err(e) => {
                conn.disconnect().await;
                if matches!(e, HttpError::Cancelled) {
                    tracing::debug!(uri = %request.uri(), "request cancelled, connection closed");
                }
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        conn: &mut dyn Connection,
        request: &mut HttpRequest,
        pre_authenticate: bool,
        cancel: &CancellationToken,
    ) -> Result<StatusCode, HttpError> {
        let config = &self.inner.config;
        conn.set_timeouts(
            config.effective_connect_timeout(),
            config.effective_read_timeout(),
        );
        self.configure_trust(conn, request)?;
        conn.set_method(request.method().clone())?;
        self.apply_headers(conn, request)?;
        if pre_authenticate {
            self.pre_authenticate(conn)?;
        }

        if let Some(body) = prepare_body(conn, request)? {
            write_body(conn, body, cancel).await?;
        }
        until_cancelled(cancel, conn.connect()).await??;
        Ok(until_cancelled(cancel, conn.status_code()).await??)
    }

    /// Content headers first, then request headers, `Accept-Encoding` and
    /// `Cookie`.
    fn apply_headers(
        &self,
        conn: &mut dyn Connection,
        request: &HttpRequest,
    ) -> Result<(), HttpError> {
        if let Some(content) = request.content() {
            copy_headers(conn, content.headers())?;
        }
        copy_headers(conn, request.headers())?;

        let inner = &self.inner;
        let encoding = accept_encoding(inner.config.automatic_decompression);
        conn.set_header(ACCEPT_ENCODING, encoding.header);

        if inner.config.use_cookies
            && let Some(jar) = &inner.cookie_jar
            && let Some(cookie) = jar.cookie_header(request.uri())
        {
            conn.set_header(COOKIE, HeaderValue::try_from(cookie)?);
        }
        Ok(())
    }

    fn configure_trust(
        &self,
        conn: &mut dyn Connection,
        request: &HttpRequest,
    ) -> Result<(), HttpError> {
        let inner = &self.inner;
        let trusted = inner.config.trusted_certs.as_deref();
        let validator = inner.validator.as_ref();
        if trusted.is_none() && validator.is_none() {
            return Ok(());
        }
        let Some(tls) = conn.tls_settings() else {
            return Ok(());
        };

        let mut managers = tls.default_trust_managers(trusted)?;
        if let Some(validator) = validator {
            managers = validator
                .replace_x509_trust_manager(
                    managers,
                    Arc::new(request.head()),
                    tls.default_hostname_verifier(),
                )
                .map_err(|e| HttpError::Tls(Box::new(e)))?;
            tls.set_hostname_verifier(validator.hostname_verifier());
        }
        tls.set_trust_managers(managers);
        Ok(())
    }

    fn pre_authenticate(&self, conn: &mut dyn Connection) -> Result<(), HttpError> {
        let inner = &self.inner;
        if !inner.config.pre_authenticate {
            return Ok(());
        }
        let Some(data) = &inner.pre_authentication_data else {
            return Ok(());
        };
        let Some(module) = inner.auth_modules.resolve(data) else {
            tracing::debug!(scheme = data.scheme_name(), "no module for pre-authentication");
            return Ok(());
        };

        let (credentials, header) = if data.use_proxy_authentication {
            (self.proxy_credentials(), PROXY_AUTHORIZATION)
        } else {
            (inner.credentials.clone(), AUTHORIZATION)
        };
        let Some(credentials) = credentials else {
            return Ok(());
        };

        let authorization = if module.can_pre_authenticate() {
            module.pre_authenticate(&*conn, credentials.as_ref())
        } else {
            module.authenticate(&data.challenge, &*conn, credentials.as_ref())
        };
        if let Some(authorization) = authorization {
            let mut value = HeaderValue::try_from(authorization.message)?;
            value.set_sensitive(true);
            conn.set_header(header, value);
        }
        Ok(())
    }

    /// Turn the connection's response into an [`HttpResponse`].
    fn finish(
        &self,
        mut conn: Box<dyn Connection>,
        status: StatusCode,
        headers: HeaderMap,
        request: &HttpRequest,
    ) -> Result<HttpResponse, HttpError> {
        let inner = &self.inner;
        let body = if status.is_client_error() || status.is_server_error() {
            conn.error_stream()
                .unwrap_or_else(|| fallback_error_body(status))
        } else {
            conn.input_stream()?
        };
        let reason = conn.response_message();

        let auth_required = matches!(
            status,
            StatusCode::UNAUTHORIZED | StatusCode::PROXY_AUTHENTICATION_REQUIRED
        );
        let requested_authentication = if auth_required {
            let offered = collect_auth_info(&headers);
            tracing::debug!(
                status = status.as_u16(),
                challenges = offered.len(),
                "authentication required"
            );
            offered
        } else {
            Vec::new()
        };

        // Cookies from a challenge are not kept; the retry with credentials
        // sets its own.
        if !auth_required {
            self.store_cookies(request.uri(), &headers);
        }

        let (message_headers, mut content_headers) = split_content_headers(headers);
        let (body, content_state) =
            decode_body(inner.config.automatic_decompression, &content_headers, body);
        content_state.apply(&mut content_headers);

        let mut content = ResponseContent::new(body);
        *content.headers_mut() = content_headers;

        Ok(HttpResponse {
            status,
            reason,
            headers: message_headers,
            content,
            request: request.head(),
            requested_authentication,
        })
    }

    fn store_cookies(&self, uri: &Url, headers: &HeaderMap) {
        let inner = &self.inner;
        if inner.config.use_cookies
            && let Some(jar) = &inner.cookie_jar
        {
            store_cookies(jar.as_ref(), uri, headers);
        }
    }

    fn proxy_selection(&self, uri: &Url) -> ProxySelection {
        let inner = &self.inner;
        if !inner.config.use_proxy {
            return ProxySelection::Direct;
        }
        match &inner.proxy {
            Some(proxy) => proxy
                .proxy_for(uri)
                .map_or(ProxySelection::Direct, ProxySelection::Via),
            None => ProxySelection::SystemDefault,
        }
    }

    /// Proxy a request to `uri` goes through, if any.
    fn proxy_address(&self, uri: &Url) -> Option<Url> {
        match self.proxy_selection(uri) {
            ProxySelection::Direct => None,
            ProxySelection::SystemDefault => system_proxy_for(uri),
            ProxySelection::Via(address) => Some(address),
        }
    }

    fn proxy_credentials(&self) -> Option<Arc<dyn Credentials>> {
        let inner = &self.inner;
        inner
            .proxy
            .as_ref()
            .and_then(|proxy| proxy.credentials())
            .or_else(|| inner.default_proxy_credentials.clone())
    }
}

#[async_trait]
impl Resend for HttpEngine {
    async fn resend(
        &self,
        request: &mut HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, HttpError> {
        self.send(request, cancel, false).await
    }
}

impl Service<HttpRequest> for HttpEngine {
    type Response = HttpResponse;
    type Error = HttpError;
    type Future = BoxFuture<'static, Result<HttpResponse, HttpError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: HttpRequest) -> Self::Future {
        let engine = self.clone();
        Box::pin(async move { engine.execute(request, CancellationToken::new()).await })
    }
}

/// `Err(Cancelled)` if `cancel` fires before `fut` completes.
///
/// # Errors
///
/// Returns [`HttpError::Cancelled`] once `cancel` fires.
pub async fn until_cancelled<F: Future>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, HttpError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(HttpError::Cancelled),
        output = fut => Ok(output),
    }
}

fn copy_headers(conn: &mut dyn Connection, headers: &HeaderMap) -> Result<(), HttpError> {
    for name in headers.keys() {
        if let Some(value) = joined_value(headers, name)? {
            conn.set_header(name.clone(), value);
        }
    }
    Ok(())
}

/// Frame the body on the connection and take it from the request.
fn prepare_body(
    conn: &mut dyn Connection,
    request: &mut HttpRequest,
) -> Result<Option<OutgoingBody>, HttpError> {
    let sends_empty_body = matches!(*request.method(), Method::POST | Method::PUT | Method::DELETE);
    let Some(content) = request.content_mut() else {
        if sends_empty_body {
            conn.set_body_length(BodyLength::Fixed(0));
        }
        return Ok(None);
    };

    conn.set_body_length(content.length().map_or(BodyLength::Chunked, BodyLength::Fixed));
    content.outgoing().map(Some)
}

async fn write_body(
    conn: &mut dyn Connection,
    body: OutgoingBody,
    cancel: &CancellationToken,
) -> Result<(), HttpError> {
    match body {
        OutgoingBody::Buffered(data) => {
            until_cancelled(cancel, conn.write_body(data)).await??;
        }
        OutgoingBody::Streaming(mut stream) => {
            while let Some(frame) = until_cancelled(cancel, stream.frame()).await? {
                let frame = frame.map_err(HttpError::Transport)?;
                if let Ok(data) = frame.into_data() {
                    until_cancelled(cancel, conn.write_body(data)).await??;
                }
            }
        }
    }
    Ok(())
}

/// Body used when the transport has no error stream for a 4xx/5xx.
fn fallback_error_body(status: StatusCode) -> ResponseBody {
    if matches!(
        status,
        StatusCode::UNAUTHORIZED | StatusCode::PROXY_AUTHENTICATION_REQUIRED
    ) {
        full_body("Unauthorized")
    } else {
        empty_body()
    }
}

fn store_cookies(jar: &dyn CookieJar, uri: &Url, headers: &HeaderMap) {
    let values: Vec<&str> = headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    if values.is_empty() {
        return;
    }
    if let Err(e) = jar.set_cookies(uri, &values) {
        tracing::warn!(uri = %uri, error = %e, "ignoring invalid Set-Cookie");
    }
}
