//! Redirect decisions.
//!
//! [`decide`] is pure: it looks at one response and the current
//! [`RedirectState`] and says what to do next. The engine applies the verdict,
//! drops the request content when the method changed, clears `Authorization`
//! and opens a new connection.

use crate::error::HttpError;
use http::header::LOCATION;
use http::{HeaderMap, Method, StatusCode};
use url::Url;

/// Per-request redirect bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectState {
    pub uri: Url,
    pub method: Method,
    pub redirect_counter: u32,
    pub method_changed: bool,
}

impl RedirectState {
    #[must_use]
    pub fn new(uri: Url, method: Method) -> Self {
        Self {
            uri,
            method,
            redirect_counter: 0,
            method_changed: false,
        }
    }

    /// Record a followed hop.
    pub fn follow(&mut self, new_uri: Url, new_method: Method, method_changed: bool) {
        self.uri = new_uri;
        self.method = new_method;
        self.method_changed = method_changed;
        self.redirect_counter += 1;
    }
}

/// Outcome of [`decide`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectVerdict {
    /// Not a redirect; continue with auth handling and finalization
    NotARedirect,
    /// Return the current response as-is (auto-redirect off, or no usable
    /// `Location`)
    StopNoLocation,
    /// Resend to `new_uri`
    Redirect {
        new_uri: Url,
        new_method: Method,
        /// The caller must drop the request content
        method_changed: bool,
    },
    /// Following would exceed the configured maximum
    LimitExceeded,
}

/// Decide how to handle `status`.
///
/// # Errors
///
/// Returns [`HttpError::UnsupportedRedirectStatus`] for 3xx codes other than
/// 300, 301, 302, 303, 304 and 307 when auto-redirect is on, and
/// [`HttpError::Protocol`] when `Location` cannot be resolved to a URL.
pub fn decide(
    status: StatusCode,
    headers: &HeaderMap,
    state: &RedirectState,
    allow_auto_redirect: bool,
    max_redirects: u32,
) -> Result<RedirectVerdict, HttpError> {
    if !status.is_redirection() || status == StatusCode::NOT_MODIFIED {
        return Ok(RedirectVerdict::NotARedirect);
    }
    if !allow_auto_redirect {
        return Ok(RedirectVerdict::StopNoLocation);
    }

    let (new_method, method_changed) = match status {
        StatusCode::MULTIPLE_CHOICES | StatusCode::TEMPORARY_REDIRECT => {
            (state.method.clone(), false)
        }
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND | StatusCode::SEE_OTHER => {
            (Method::GET, state.method != Method::GET)
        }
        other => return Err(HttpError::UnsupportedRedirectStatus(other)),
    };

    let Some(location) = first_location(headers) else {
        tracing::debug!(status = status.as_u16(), "redirect without Location, returning response");
        return Ok(RedirectVerdict::StopNoLocation);
    };

    if state.redirect_counter.saturating_add(1) > max_redirects {
        return Ok(RedirectVerdict::LimitExceeded);
    }

    let new_uri = resolve_location(&state.uri, location)?;
    tracing::debug!(
        from = %state.uri,
        to = %new_uri,
        status = status.as_u16(),
        method = %new_method,
        "following redirect"
    );

    Ok(RedirectVerdict::Redirect {
        new_uri,
        new_method,
        method_changed,
    })
}

/// First non-empty `Location` value, trimmed.
fn first_location(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(LOCATION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::trim)
        .find(|v| !v.is_empty())
}

/// Resolve a `Location` value against the URI that produced it.
///
/// `//host/path` takes the base scheme; `scheme:host` is an authority even
/// without slashes. A fragment on the base carries over when the target has
/// none.
fn resolve_location(base: &Url, location: &str) -> Result<Url, HttpError> {
    let invalid = |e: url::ParseError| {
        HttpError::protocol(format!("invalid redirect URI received: {location}: {e}"))
    };

    let mut target = if location.starts_with('/') {
        base.join(location).map_err(invalid)?
    } else {
        match Url::parse(location) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => base.join(location).map_err(invalid)?,
            Err(e) => return Err(invalid(e)),
        }
    };

    if target.cannot_be_a_base() || !target.has_host() {
        return Err(HttpError::protocol(format!(
            "invalid redirect URI received: {location}"
        )));
    }

    if target.fragment().is_none()
        && let Some(fragment) = base.fragment().filter(|f| !f.is_empty())
    {
        target.set_fragment(Some(fragment));
    }

    Ok(target)
}
