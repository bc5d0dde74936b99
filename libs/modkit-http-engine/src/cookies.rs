//! Cookie storage seam and an in-memory jar.
//!
//! The engine asks the jar for a `Cookie` header before each send and hands it
//! every `Set-Cookie` value of a finished response. A jar is shared between
//! concurrent requests, so implementations synchronize internally.

use parking_lot::RwLock;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use url::Url;

/// `Set-Cookie` value the jar refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CookieError {
    #[error("malformed Set-Cookie value: {0}")]
    Malformed(String),

    #[error("cookie domain '{domain}' does not match host '{host}'")]
    DomainMismatch { domain: String, host: String },
}

/// Cookie store used by the engine.
pub trait CookieJar: Send + Sync {
    /// `Cookie` request header for `uri`, `None` if nothing matches.
    fn cookie_header(&self, uri: &Url) -> Option<String>;

    /// Store all `Set-Cookie` values received from `uri`.
    ///
    /// Valid values are stored even when others fail.
    ///
    /// # Errors
    ///
    /// Returns the first [`CookieError`] encountered.
    fn set_cookies(&self, uri: &Url, values: &[&str]) -> Result<(), CookieError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StoredCookie {
    name: String,
    value: String,
    domain: String,
    host_only: bool,
    path: String,
    secure: bool,
    expires: Option<SystemTime>,
}

impl StoredCookie {
    fn is_expired(&self, now: SystemTime) -> bool {
        self.expires.is_some_and(|at| at <= now)
    }

    fn matches(&self, uri: &Url) -> bool {
        let Some(host) = uri.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        let domain_ok = if self.host_only {
            host == self.domain
        } else {
            domain_match(&host, &self.domain)
        };
        domain_ok && path_match(uri.path(), &self.path) && (!self.secure || uri.scheme() == "https")
    }
}

fn domain_match(host: &str, domain: &str) -> bool {
    host == domain
        || (host.len() > domain.len()
            && host.ends_with(domain)
            && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
}

fn path_match(request_path: &str, cookie_path: &str) -> bool {
    request_path == cookie_path
        || (request_path.starts_with(cookie_path)
            && (cookie_path.ends_with('/')
                || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/')))
}

fn default_path(uri: &Url) -> String {
    match uri.path().rsplit_once('/') {
        Some((dir, _)) if !dir.is_empty() => dir.to_owned(),
        _ => "/".to_owned(),
    }
}

fn parse_set_cookie(uri: &Url, raw: &str, now: SystemTime) -> Result<StoredCookie, CookieError> {
    let host = uri
        .host_str()
        .ok_or_else(|| CookieError::Malformed(format!("no host in {uri}")))?
        .to_ascii_lowercase();

    let mut parts = raw.split(';');
    let pair = parts.next().unwrap_or_default();
    let (name, value) = pair
        .split_once('=')
        .ok_or_else(|| CookieError::Malformed(raw.to_owned()))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(CookieError::Malformed(raw.to_owned()));
    }

    let mut cookie = StoredCookie {
        name: name.to_owned(),
        value: value.trim().trim_matches('"').to_owned(),
        domain: host.clone(),
        host_only: true,
        path: default_path(uri),
        secure: false,
        expires: None,
    };
    let mut max_age: Option<i64> = None;

    for attr in parts {
        let (key, val) = match attr.split_once('=') {
            Some((k, v)) => (k.trim(), v.trim()),
            None => (attr.trim(), ""),
        };
        match key.to_ascii_lowercase().as_str() {
            "domain" if !val.is_empty() => {
                let domain = val.trim_start_matches('.').to_ascii_lowercase();
                if !domain_match(&host, &domain) {
                    return Err(CookieError::DomainMismatch { domain, host });
                }
                cookie.domain = domain;
                cookie.host_only = false;
            }
            "path" if val.starts_with('/') => cookie.path = val.to_owned(),
            "expires" => {
                // Unparseable dates leave a session cookie.
                if let Ok(at) = httpdate::parse_http_date(val) {
                    cookie.expires = Some(at);
                }
            }
            "max-age" => max_age = val.parse().ok(),
            "secure" => cookie.secure = true,
            _ => {}
        }
    }

    // Max-Age wins over Expires.
    if let Some(seconds) = max_age {
        cookie.expires = Some(match u64::try_from(seconds) {
            Ok(secs) if secs > 0 => now + Duration::from_secs(secs),
            _ => SystemTime::UNIX_EPOCH,
        });
    }

    Ok(cookie)
}

/// In-memory cookie jar with RFC 6265 domain, path and secure matching.
///
/// Expired cookies are dropped on access. Nothing is persisted.
#[derive(Debug, Default)]
pub struct MemoryCookieJar {
    cookies: RwLock<Vec<StoredCookie>>,
}

impl MemoryCookieJar {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live cookies.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = SystemTime::now();
        self.cookies.read().iter().filter(|c| !c.is_expired(now)).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.cookies.write().clear();
    }
}

impl CookieJar for MemoryCookieJar {
    fn cookie_header(&self, uri: &Url) -> Option<String> {
        let now = SystemTime::now();
        let cookies = self.cookies.read();
        let mut matching: Vec<&StoredCookie> = cookies
            .iter()
            .filter(|c| !c.is_expired(now) && c.matches(uri))
            .collect();
        if matching.is_empty() {
            return None;
        }
        // Longer paths first.
        matching.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        Some(
            matching
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    fn set_cookies(&self, uri: &Url, values: &[&str]) -> Result<(), CookieError> {
        let now = SystemTime::now();
        let mut first_error = None;
        let mut cookies = self.cookies.write();

        for raw in values {
            match parse_set_cookie(uri, raw, now) {
                Ok(cookie) => {
                    cookies.retain(|c| {
                        !(c.name == cookie.name && c.domain == cookie.domain && c.path == cookie.path)
                    });
                    if !cookie.is_expired(now) {
                        cookies.push(cookie);
                    }
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        cookies.retain(|c| !c.is_expired(now));

        first_error.map_or(Ok(()), Err)
    }
}
