use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::proto::rr::{Record, RecordType};
use std::io;
use std::net::IpAddr;
use tokio::sync::OnceCell;
use url::{Host, Url};

/// Forward DNS lookup used to canonicalize SPN host names.
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// Canonical name of `host`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the name does not resolve.
    async fn canonical_name(&self, host: &str) -> io::Result<String>;
}

/// Resolver that follows the CNAME chain of a name through `hickory-resolver`
/// configured from the system (`/etc/resolv.conf`, hosts file).
///
/// The DNS client is created on first use and shared by later lookups.
#[derive(Default)]
pub struct SystemResolver {
    resolver: OnceCell<TokioAsyncResolver>,
}

impl std::fmt::Debug for SystemResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemResolver")
            .field("initialized", &self.resolver.initialized())
            .finish()
    }
}

impl SystemResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn resolver(&self) -> io::Result<&TokioAsyncResolver> {
        self.resolver
            .get_or_try_init(|| async { TokioAsyncResolver::tokio_from_system_conf() })
            .await
            .map_err(io::Error::other)
    }
}

#[async_trait]
impl HostResolver for SystemResolver {
    async fn canonical_name(&self, host: &str) -> io::Result<String> {
        let lookup = self
            .resolver()
            .await?
            .lookup_ip(host)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::NotFound, e))?;
        let canonical = canonical_owner(lookup.as_lookup().records(), host);
        tracing::trace!(host, canonical = %canonical, "resolved canonical name");
        Ok(canonical)
    }
}

/// Owner name of the first address record, which is where the CNAME chain
/// ends. `host` when the answer holds no address record.
fn canonical_owner(records: &[Record], host: &str) -> String {
    records
        .iter()
        .find(|r| matches!(r.record_type(), RecordType::A | RecordType::AAAA))
        .map(|r| r.name().to_utf8().trim_end_matches('.').to_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| host.to_owned())
}

/// `HTTP/<host>` service principal name for a handshake.
///
/// An explicit `Host` header wins for origin authentication and is used
/// verbatim. Otherwise the host of `auth_uri` (the proxy for proxy
/// authentication) is canonicalized through `resolver`; IP literals are used
/// as-is so no reverse lookup happens.
///
/// # Errors
///
/// Returns the resolver's error if the host name does not resolve.
pub async fn service_principal_name(
    host_header: Option<&str>,
    auth_uri: &Url,
    is_proxy: bool,
    resolver: &dyn HostResolver,
) -> io::Result<String> {
    if !is_proxy && let Some(host) = host_header {
        return Ok(format!("HTTP/{host}"));
    }

    let host = match auth_uri.host() {
        Some(Host::Ipv4(ip)) => IpAddr::V4(ip).to_string(),
        Some(Host::Ipv6(ip)) => IpAddr::V6(ip).to_string(),
        Some(Host::Domain(name)) => resolver.canonical_name(name).await?,
        None => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{auth_uri} has no host"),
            ));
        }
    };
    Ok(format!("HTTP/{host}"))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use hickory_resolver::proto::rr::rdata::{A, AAAA, CNAME};
    use hickory_resolver::proto::rr::{Name, RData};
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Cname {
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl HostResolver for Cname {
        async fn canonical_name(&self, host: &str) -> io::Result<String> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{host}.corp.example"))
        }
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_host_header_wins_for_origin() {
        let resolver = Cname::default();
        let spn = service_principal_name(Some("alias:8080"), &url("http://web/"), false, &resolver)
            .await
            .unwrap();
        assert_eq!(spn, "HTTP/alias:8080");
        assert_eq!(resolver.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_proxy_ignores_host_header() {
        let resolver = Cname::default();
        let spn = service_principal_name(Some("alias"), &url("http://proxy:3128/"), true, &resolver)
            .await
            .unwrap();
        assert_eq!(spn, "HTTP/proxy.corp.example");
    }

    #[tokio::test]
    async fn test_ip_literals_skip_lookup() {
        let resolver = Cname::default();
        let v4 = service_principal_name(None, &url("http://10.0.0.1/"), false, &resolver)
            .await
            .unwrap();
        let v6 = service_principal_name(None, &url("http://[::1]:80/"), false, &resolver)
            .await
            .unwrap();
        assert_eq!(v4, "HTTP/10.0.0.1");
        assert_eq!(v6, "HTTP/::1");
        assert_eq!(resolver.lookups.load(Ordering::SeqCst), 0);
    }

    fn record(name: &str, rdata: RData) -> Record {
        Record::from_rdata(Name::from_str(name).unwrap(), 300, rdata)
    }

    #[test]
    fn test_canonical_owner_follows_cname_chain() {
        let records = vec![
            record(
                "intranet.corp.example.",
                RData::CNAME(CNAME(Name::from_str("web01.corp.example.").unwrap())),
            ),
            record("web01.corp.example.", RData::A(A::new(10, 0, 0, 7))),
        ];
        assert_eq!(canonical_owner(&records, "intranet"), "web01.corp.example");
    }

    #[test]
    fn test_canonical_owner_without_alias() {
        let records = vec![record(
            "web01.corp.example.",
            RData::AAAA(AAAA::new(0xfd00, 0, 0, 0, 0, 0, 0, 1)),
        )];
        assert_eq!(
            canonical_owner(&records, "web01.corp.example"),
            "web01.corp.example"
        );
        assert_eq!(canonical_owner(&[], "web01"), "web01");
    }
}
