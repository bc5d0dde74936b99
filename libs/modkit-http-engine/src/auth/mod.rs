//! Single-header authentication.
//!
//! The engine never guesses credentials. On a 401/407 it reports every
//! challenge as [`AuthenticationData`]; the caller picks one and sends it back
//! as pre-authentication data on the next request, and the matching
//! [`AuthModule`] turns it into an `Authorization` value.

mod basic;
mod challenge;
mod digest;
mod registry;
mod session_cache;

pub use basic::BasicAuthModule;
pub use challenge::{AuthChallenge, collect_auth_info, parse_challenges};
pub use digest::DigestAuthModule;
pub use registry::AuthModuleRegistry;
pub use session_cache::{DigestSession, DigestSessionCache, DigestSessionKey};

use crate::credentials::Credentials;
use crate::transport::RequestTarget;
use std::fmt;
use std::sync::Arc;

/// Authentication schemes with built-in support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthenticationScheme {
    Basic,
    Digest,
    /// Any other scheme; handled by a caller-supplied [`AuthModule`]
    Unsupported,
}

impl AuthenticationScheme {
    /// Classify a challenge scheme name (case-insensitive).
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        if name.eq_ignore_ascii_case("basic") {
            AuthenticationScheme::Basic
        } else if name.eq_ignore_ascii_case("digest") {
            AuthenticationScheme::Digest
        } else {
            AuthenticationScheme::Unsupported
        }
    }
}

/// One challenge offered by the server, or pre-authentication data supplied
/// by the caller.
#[derive(Clone)]
pub struct AuthenticationData {
    pub scheme: AuthenticationScheme,
    /// Full challenge text, scheme name included (`Digest realm="x", ...`)
    pub challenge: String,
    /// `true` when the challenge came from `Proxy-Authenticate`
    pub use_proxy_authentication: bool,
    /// Module for [`AuthenticationScheme::Unsupported`] challenges
    pub auth_module: Option<Arc<dyn AuthModule>>,
}

impl AuthenticationData {
    #[must_use]
    pub fn new(scheme: AuthenticationScheme, challenge: impl Into<String>) -> Self {
        Self {
            scheme,
            challenge: challenge.into(),
            use_proxy_authentication: false,
            auth_module: None,
        }
    }

    #[must_use]
    pub fn for_proxy(mut self) -> Self {
        self.use_proxy_authentication = true;
        self
    }

    #[must_use]
    pub fn with_auth_module(mut self, module: Arc<dyn AuthModule>) -> Self {
        self.auth_module = Some(module);
        self
    }

    /// Scheme name as written in the challenge.
    #[must_use]
    pub fn scheme_name(&self) -> &str {
        self.challenge
            .split_whitespace()
            .next()
            .unwrap_or_default()
    }
}

impl fmt::Debug for AuthenticationData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticationData")
            .field("scheme", &self.scheme)
            .field("challenge", &self.challenge)
            .field("use_proxy_authentication", &self.use_proxy_authentication)
            .field("auth_module", &self.auth_module.is_some())
            .finish()
    }
}

/// `Authorization` / `Proxy-Authorization` header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub message: String,
}

impl Authorization {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Per-scheme authenticator.
pub trait AuthModule: Send + Sync {
    /// Scheme this module handles.
    fn scheme(&self) -> AuthenticationScheme;

    /// Scheme name used to look up credentials (`Basic`, `Digest`, ...).
    fn authentication_type(&self) -> &str;

    /// `true` if [`pre_authenticate`](Self::pre_authenticate) can produce a
    /// value without a challenge.
    fn can_pre_authenticate(&self) -> bool;

    /// Answer `challenge` for the request `target`.
    ///
    /// Returns `None` when the challenge is not for this scheme or no usable
    /// credentials are available.
    fn authenticate(
        &self,
        challenge: &str,
        target: &dyn RequestTarget,
        credentials: &dyn Credentials,
    ) -> Option<Authorization>;

    /// Authorization for `target` before any challenge was seen.
    fn pre_authenticate(
        &self,
        target: &dyn RequestTarget,
        credentials: &dyn Credentials,
    ) -> Option<Authorization>;
}
