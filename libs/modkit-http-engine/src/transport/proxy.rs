use crate::credentials::Credentials;
use std::fmt;
use std::sync::Arc;
use url::Url;

/// Chooses the proxy for each destination.
pub trait Proxy: Send + Sync {
    /// Proxy to route `destination` through; `None` connects directly.
    fn proxy_for(&self, destination: &Url) -> Option<Url>;

    /// Credentials for `Proxy-Authorization`, if the proxy has any.
    fn credentials(&self) -> Option<Arc<dyn Credentials>> {
        None
    }
}

/// One fixed proxy with a bypass list.
///
/// Bypass entries are host names; a leading `.` or `*.` matches every
/// subdomain, and `*` matches everything.
#[derive(Clone)]
pub struct StaticProxy {
    address: Url,
    bypass: Vec<String>,
    bypass_on_local: bool,
    credentials: Option<Arc<dyn Credentials>>,
}

impl fmt::Debug for StaticProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticProxy")
            .field("address", &self.address.as_str())
            .field("bypass", &self.bypass)
            .field("bypass_on_local", &self.bypass_on_local)
            .field("credentials", &self.credentials.is_some())
            .finish()
    }
}

impl StaticProxy {
    #[must_use]
    pub fn new(address: Url) -> Self {
        Self {
            address,
            bypass: Vec::new(),
            bypass_on_local: false,
            credentials: None,
        }
    }

    /// Connect directly to hosts matching `pattern`.
    #[must_use]
    pub fn bypass(mut self, pattern: impl Into<String>) -> Self {
        self.bypass.push(pattern.into().to_ascii_lowercase());
        self
    }

    /// Connect directly to loopback addresses and dotless host names.
    #[must_use]
    pub fn bypass_on_local(mut self, enabled: bool) -> Self {
        self.bypass_on_local = enabled;
        self
    }

    #[must_use]
    pub fn credentials(mut self, credentials: Arc<dyn Credentials>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    #[must_use]
    pub fn address(&self) -> &Url {
        &self.address
    }

    fn is_bypassed(&self, destination: &Url) -> bool {
        let Some(host) = destination.host_str() else {
            return true;
        };
        let host = host.trim_matches(['[', ']']).to_ascii_lowercase();

        if self.bypass_on_local && is_local(&host) {
            return true;
        }
        self.bypass.iter().any(|pattern| host_matches(&host, pattern))
    }
}

impl Proxy for StaticProxy {
    fn proxy_for(&self, destination: &Url) -> Option<Url> {
        (!self.is_bypassed(destination)).then(|| self.address.clone())
    }

    fn credentials(&self) -> Option<Arc<dyn Credentials>> {
        self.credentials.clone()
    }
}

fn is_local(host: &str) -> bool {
    host == "localhost"
        || host
            .parse::<std::net::IpAddr>()
            .is_ok_and(|ip| ip.is_loopback())
        || (!host.contains('.') && !host.contains(':'))
}

fn host_matches(host: &str, pattern: &str) -> bool {
    let pattern = pattern.trim();
    if pattern == "*" {
        return true;
    }
    let pattern = pattern.strip_prefix('*').unwrap_or(pattern);
    match pattern.strip_prefix('.') {
        Some(suffix) => host == suffix || host.ends_with(&format!(".{suffix}")),
        None => host == pattern,
    }
}

/// Proxy from the `HTTPS_PROXY` / `HTTP_PROXY` / `NO_PROXY` environment
/// variables (lowercase names take precedence).
#[must_use]
pub fn system_proxy_for(destination: &Url) -> Option<Url> {
    proxy_from_vars(destination, &|name| std::env::var(name).ok())
}

fn proxy_from_vars(destination: &Url, var: &dyn Fn(&str) -> Option<String>) -> Option<Url> {
    let lookup = |name: &str| {
        var(&name.to_ascii_lowercase())
            .or_else(|| var(name))
            .filter(|v| !v.trim().is_empty())
    };

    let configured = match destination.scheme() {
        "https" => lookup("HTTPS_PROXY"),
        "http" => lookup("HTTP_PROXY"),
        _ => None,
    }?;

    if let (Some(no_proxy), Some(host)) = (lookup("NO_PROXY"), destination.host_str()) {
        let host = host.trim_matches(['[', ']']).to_ascii_lowercase();
        let bypassed = no_proxy
            .split(',')
            .map(|p| p.trim().to_ascii_lowercase())
            .filter(|p| !p.is_empty())
            .any(|p| {
                // `host:port` entries match on the host only
                let p = p.rsplit_once(':').map_or(p.as_str(), |(h, _)| h);
                let p = if p.starts_with('.') || p.starts_with('*') || p == host {
                    p.to_owned()
                } else {
                    format!(".{p}")
                };
                host_matches(&host, &p)
            });
        if bypassed {
            return None;
        }
    }

    let configured = configured.trim();
    let parsed = if configured.contains("://") {
        Url::parse(configured)
    } else {
        Url::parse(&format!("http://{configured}"))
    };
    match parsed {
        Ok(url) => Some(url),
        Err(e) => {
            tracing::warn!(proxy = configured, error = %e, "ignoring malformed proxy variable");
            None
        }
    }
}
