use super::{
    ContextFlags, HostResolver, MAX_ROUNDS, SecurityContext, SecurityContextFactory,
    service_principal_name, supported_auth_type,
};
use crate::auth::{AuthenticationData, parse_challenges};
use crate::credentials::{Credentials, NetworkCredential};
use crate::engine::until_cancelled;
use crate::error::HttpError;
use crate::request::HttpRequest;
use crate::response::HttpResponse;
use async_trait::async_trait;
use http::header::{
    AUTHORIZATION, HOST, HeaderName, HeaderValue, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION,
    WWW_AUTHENTICATE,
};
use http::{HeaderMap, StatusCode};
use tokio_util::sync::CancellationToken;
use url::Url;

/// An NTLM/Negotiate challenge the caller holds credentials for.
#[derive(Debug, Clone)]
pub struct NegotiateChallenge {
    /// Scheme as written by the server (`NTLM`, `Negotiate`)
    pub auth_type: String,
    pub is_proxy: bool,
    pub credential: NetworkCredential,
}

impl NegotiateChallenge {
    /// First NTLM/Negotiate entry of `requested` with matching credentials.
    pub(crate) fn find(
        requested: &[AuthenticationData],
        uri: &Url,
        credentials: Option<&dyn Credentials>,
        proxy_credentials: Option<&dyn Credentials>,
    ) -> Option<Self> {
        requested.iter().find_map(|auth| {
            let auth_type = supported_auth_type(&auth.challenge)?;
            let source = if auth.use_proxy_authentication {
                proxy_credentials
            } else {
                credentials
            };
            let credential = source?.credential_for(uri, auth_type)?;
            Some(Self {
                auth_type: auth_type.to_owned(),
                is_proxy: auth.use_proxy_authentication,
                credential,
            })
        })
    }

    fn request_header(&self) -> HeaderName {
        if self.is_proxy {
            PROXY_AUTHORIZATION
        } else {
            AUTHORIZATION
        }
    }

    /// Server token for this scheme in `headers`, if it sent a non-empty one.
    fn server_token(&self, headers: &HeaderMap) -> Option<String> {
        let (name, is_proxy) = if self.is_proxy {
            (PROXY_AUTHENTICATE, true)
        } else {
            (WWW_AUTHENTICATE, false)
        };
        let values = headers.get_all(name).iter().filter_map(|v| v.to_str().ok());
        parse_challenges(values, is_proxy)
            .into_iter()
            .find(|c| c.scheme.eq_ignore_ascii_case(&self.auth_type))
            .map(|c| c.parameters)
            .filter(|token| !token.is_empty())
    }

    fn is_auth_challenge(&self, status: StatusCode) -> bool {
        if self.is_proxy {
            status == StatusCode::PROXY_AUTHENTICATION_REQUIRED
        } else {
            status == StatusCode::UNAUTHORIZED
        }
    }
}

/// One full send of the request (redirects included) with pre-authentication
/// suspended, so the negotiated header is not overwritten.
#[async_trait]
pub trait Resend: Send + Sync {
    async fn resend(
        &self,
        request: &mut HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, HttpError>;
}

/// Closes the context on every exit path, cancellation included.
struct ContextGuard(Box<dyn SecurityContext>);

impl Drop for ContextGuard {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Drives NTLM/Negotiate handshakes.
pub struct Negotiator<'a> {
    pub factory: &'a dyn SecurityContextFactory,
    pub resolver: &'a dyn HostResolver,
}

impl Negotiator<'_> {
    /// Run the handshake for `challenge`, resending `request` once per round.
    ///
    /// `auth_uri` is the proxy for proxy authentication and the request URI
    /// otherwise. Returns the last response received, or `None` when no round
    /// was sent: the SPN host did not resolve, the context could not be
    /// created or it produced no first token.
    pub(crate) async fn send_with_auth(
        &self,
        resend: &dyn Resend,
        request: &mut HttpRequest,
        challenge: &NegotiateChallenge,
        auth_uri: &Url,
        cancel: &CancellationToken,
    ) -> Result<Option<HttpResponse>, HttpError> {
        let host_header = request
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let lookup = service_principal_name(
            host_header.as_deref(),
            auth_uri,
            challenge.is_proxy,
            self.resolver,
        );
        let spn = match until_cancelled(cancel, lookup).await? {
            Ok(spn) => spn,
            Err(e) => {
                tracing::debug!(
                    uri = %auth_uri,
                    error = %e,
                    "cannot resolve service principal name"
                );
                return Ok(None);
            }
        };

        let flags = ContextFlags::for_target(challenge.is_proxy);
        let context = match self
            .factory
            .create(&challenge.auth_type, &challenge.credential, &spn, flags)
        {
            Ok(context) => context,
            Err(e) => {
                tracing::warn!(
                    package = %challenge.auth_type,
                    error = %e,
                    "cannot create security context"
                );
                return Ok(None);
            }
        };
        tracing::debug!(package = %challenge.auth_type, spn = %spn, "starting negotiate handshake");

        let mut guard = ContextGuard(context);
        run_rounds(guard.0.as_mut(), resend, request, challenge, cancel).await
    }
}

async fn run_rounds(
    context: &mut dyn SecurityContext,
    resend: &dyn Resend,
    request: &mut HttpRequest,
    challenge: &NegotiateChallenge,
    cancel: &CancellationToken,
) -> Result<Option<HttpResponse>, HttpError> {
    let header = challenge.request_header();
    let mut incoming: Option<String> = None;
    let mut response: Option<HttpResponse> = None;

    for round in 1..=MAX_ROUNDS {
        let token = match context.outgoing_token(incoming.as_deref()) {
            Ok(Some(token)) => token,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(round, error = %e, "security context stopped the handshake");
                break;
            }
        };

        let mut value = HeaderValue::try_from(format!("{} {token}", challenge.auth_type))?;
        value.set_sensitive(true);
        request.headers_mut().insert(header.clone(), value);

        let mut current = resend.resend(request, cancel).await?;
        current.content_mut().load_into_buffer().await?;
        tracing::trace!(round, status = current.status().as_u16(), "negotiate round");

        let status = current.status();
        let next = challenge.server_token(current.headers());
        response = Some(current);

        let Some(next) = next else {
            break;
        };
        if context.is_complete() {
            break;
        }
        if !challenge.is_auth_challenge(status) {
            // Final token of a successful handshake; let the context verify it.
            if let Err(e) = context.outgoing_token(Some(&next)) {
                tracing::debug!(error = %e, "final negotiate token rejected");
            }
            break;
        }
        incoming = Some(next);
    }

    Ok(response)
}
