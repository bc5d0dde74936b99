use std::fmt;
use std::sync::Arc;

use url::Url;
use zeroize::Zeroizing;

/// Password of a [`NetworkCredential`]. Every copy is zeroed on drop.
#[derive(Clone)]
pub struct Password(Zeroizing<String>);

impl Password {
    /// Clear text for building an authorization header.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl From<String> for Password {
    fn from(value: String) -> Self {
        Self(Zeroizing::new(value))
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(***)")
    }
}

/// User name, password and optional Windows domain.
#[derive(Debug, Clone)]
pub struct NetworkCredential {
    pub user_name: String,
    pub password: Password,
    pub domain: Option<String>,
}

impl NetworkCredential {
    pub fn new(user_name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            password: Password::from(password.into()),
            domain: None,
        }
    }

    #[must_use]
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Domain if set and not blank.
    #[must_use]
    pub fn effective_domain(&self) -> Option<&str> {
        self.domain.as_deref().filter(|d| !d.trim().is_empty())
    }
}

/// Source of credentials for a target and authentication scheme.
///
/// `auth_type` is the scheme name as it appears in the challenge (`Basic`,
/// `Digest`, `NTLM`, `Negotiate`, ...).
pub trait Credentials: Send + Sync {
    fn credential_for(&self, uri: &Url, auth_type: &str) -> Option<NetworkCredential>;
}

impl Credentials for NetworkCredential {
    fn credential_for(&self, _uri: &Url, _auth_type: &str) -> Option<NetworkCredential> {
        Some(self.clone())
    }
}

impl<T: Credentials + ?Sized> Credentials for Arc<T> {
    fn credential_for(&self, uri: &Url, auth_type: &str) -> Option<NetworkCredential> {
        (**self).credential_for(uri, auth_type)
    }
}

/// Credentials registered per URI prefix and scheme.
///
/// The longest matching prefix wins. Scheme names compare case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct CredentialCache {
    entries: Vec<CacheEntry>,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    prefix: Url,
    auth_type: String,
    credential: NetworkCredential,
}

impl CredentialCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `credential` for URIs under `prefix` and scheme `auth_type`.
    /// Replaces an existing entry for the same pair.
    pub fn add(&mut self, prefix: Url, auth_type: impl Into<String>, credential: NetworkCredential) {
        let auth_type = auth_type.into();
        self.entries
            .retain(|e| !(e.prefix == prefix && e.auth_type.eq_ignore_ascii_case(&auth_type)));
        self.entries.push(CacheEntry {
            prefix,
            auth_type,
            credential,
        });
    }

    pub fn remove(&mut self, prefix: &Url, auth_type: &str) {
        self.entries
            .retain(|e| !(&e.prefix == prefix && e.auth_type.eq_ignore_ascii_case(auth_type)));
    }

    fn matches(prefix: &Url, uri: &Url) -> bool {
        prefix.scheme() == uri.scheme()
            && prefix.host_str() == uri.host_str()
            && prefix.port_or_known_default() == uri.port_or_known_default()
            && uri.path().starts_with(prefix.path())
    }
}

impl Credentials for CredentialCache {
    fn credential_for(&self, uri: &Url, auth_type: &str) -> Option<NetworkCredential> {
        self.entries
            .iter()
            .filter(|e| e.auth_type.eq_ignore_ascii_case(auth_type))
            .filter(|e| Self::matches(&e.prefix, uri))
            .max_by_key(|e| e.prefix.path().len())
            .map(|e| e.credential.clone())
    }
}
