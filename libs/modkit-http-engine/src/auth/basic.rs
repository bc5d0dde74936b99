use super::{AuthModule, AuthenticationScheme, Authorization};
use crate::credentials::{Credentials, NetworkCredential};
use crate::transport::RequestTarget;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// RFC 7617 `Basic` authentication.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicAuthModule;

impl BasicAuthModule {
    /// `Basic` header value for `credential`, `None` for an empty user name.
    ///
    /// A non-blank domain is prefixed as `domain\user`.
    #[must_use]
    pub fn authorize(credential: &NetworkCredential) -> Option<Authorization> {
        if credential.user_name.is_empty() {
            return None;
        }

        let user = match credential.effective_domain() {
            Some(domain) => format!("{domain}\\{}", credential.user_name),
            None => credential.user_name.clone(),
        };
        let token = STANDARD.encode(format!("{user}:{}", credential.password.expose()));
        Some(Authorization::new(format!("Basic {token}")))
    }

    fn credential(target: &dyn RequestTarget, credentials: &dyn Credentials) -> Option<NetworkCredential> {
        credentials.credential_for(target.url(), "Basic")
    }
}

impl AuthModule for BasicAuthModule {
    fn scheme(&self) -> AuthenticationScheme {
        AuthenticationScheme::Basic
    }

    fn authentication_type(&self) -> &str {
        "Basic"
    }

    fn can_pre_authenticate(&self) -> bool {
        true
    }

    fn authenticate(
        &self,
        challenge: &str,
        target: &dyn RequestTarget,
        credentials: &dyn Credentials,
    ) -> Option<Authorization> {
        let is_basic = challenge
            .trim_start()
            .get(..5)
            .is_some_and(|s| s.eq_ignore_ascii_case("basic"));
        if !is_basic {
            return None;
        }
        Self::authorize(&Self::credential(target, credentials)?)
    }

    fn pre_authenticate(
        &self,
        target: &dyn RequestTarget,
        credentials: &dyn Credentials,
    ) -> Option<Authorization> {
        Self::authorize(&Self::credential(target, credentials)?)
    }
}
