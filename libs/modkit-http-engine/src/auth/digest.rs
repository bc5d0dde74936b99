//! RFC 2617 / RFC 7616 `Digest` authentication.
//!
//! `qop=auth-int` needs a hash of the entity body, which the engine does not
//! have when the header is built. A challenge offering only `auth-int` is
//! declined.

use super::session_cache::{DigestSession, DigestSessionCache, DigestSessionKey};
use super::{AuthModule, AuthenticationScheme, Authorization};
use crate::credentials::{Credentials, NetworkCredential};
use crate::transport::RequestTarget;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use md5::{Digest, Md5};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Instant;
use url::Position;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Algorithm {
    Md5,
    Md5Sess,
    Sha256,
    Sha256Sess,
}

impl Algorithm {
    fn parse(name: Option<&str>) -> Option<Self> {
        let Some(name) = name else {
            return Some(Algorithm::Md5);
        };
        match name.to_ascii_lowercase().as_str() {
            "md5" => Some(Algorithm::Md5),
            "md5-sess" => Some(Algorithm::Md5Sess),
            "sha-256" => Some(Algorithm::Sha256),
            "sha-256-sess" => Some(Algorithm::Sha256Sess),
            _ => None,
        }
    }

    fn is_session(self) -> bool {
        matches!(self, Algorithm::Md5Sess | Algorithm::Sha256Sess)
    }

    fn hash(self, data: &str) -> String {
        match self {
            Algorithm::Md5 | Algorithm::Md5Sess => hex::encode(Md5::digest(data.as_bytes())),
            Algorithm::Sha256 | Algorithm::Sha256Sess => {
                hex::encode(Sha256::digest(data.as_bytes()))
            }
        }
    }
}

/// Parameters of a `Digest` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
    pub qop: Option<String>,
}

impl DigestChallenge {
    /// Parse `Digest k=v, k="v", ...`. Quotes are optional; unknown
    /// parameters are skipped. `realm` and `nonce` are required.
    pub(crate) fn parse(challenge: &str) -> Option<Self> {
        let challenge = challenge.trim_start();
        let (scheme, params) = challenge.split_at_checked(6)?;
        if !scheme.eq_ignore_ascii_case("digest") {
            return None;
        }
        if !params.is_empty() && !params.starts_with(char::is_whitespace) {
            return None;
        }

        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut algorithm = None;
        let mut qop = None;

        for (key, value) in ParamScanner::new(params) {
            let slot = match key.to_ascii_lowercase().as_str() {
                "realm" => &mut realm,
                "nonce" => &mut nonce,
                "opaque" => &mut opaque,
                "algorithm" => &mut algorithm,
                "qop" => &mut qop,
                _ => continue,
            };
            *slot = Some(value);
        }

        Some(Self {
            realm: realm?,
            nonce: nonce?,
            opaque,
            algorithm,
            qop,
        })
    }

    /// `auth` if offered; `None` for no qop; `Err` if only unsupported
    /// qop values are offered.
    fn select_qop(&self) -> Result<Option<&'static str>, ()> {
        let Some(qop) = &self.qop else {
            return Ok(None);
        };
        if qop.split(',').any(|q| q.trim().eq_ignore_ascii_case("auth")) {
            Ok(Some("auth"))
        } else {
            Err(())
        }
    }
}

/// Tolerant `key=value` scanner for challenge parameters.
struct ParamScanner<'a> {
    rest: &'a str,
}

impl<'a> ParamScanner<'a> {
    fn new(input: &'a str) -> Self {
        Self { rest: input }
    }
}

impl Iterator for ParamScanner<'_> {
    type Item = (String, String);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.rest = self.rest.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
            if self.rest.is_empty() {
                return None;
            }

            let Some(eq) = self.rest.find('=') else {
                self.rest = "";
                return None;
            };
            let key = self.rest[..eq].trim();
            let after = self.rest[eq + 1..].trim_start();

            let (value, rest) = if let Some(quoted) = after.strip_prefix('"') {
                let mut value = String::new();
                let mut chars = quoted.char_indices();
                let mut end = quoted.len();
                while let Some((i, c)) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some((_, escaped)) = chars.next() {
                                value.push(escaped);
                            }
                        }
                        '"' => {
                            end = i + 1;
                            break;
                        }
                        other => value.push(other),
                    }
                }
                (value, &quoted[end.min(quoted.len())..])
            } else {
                let end = after.find(',').unwrap_or(after.len());
                (after[..end].trim().to_owned(), &after[end..])
            };
            self.rest = rest;

            // A key with whitespace inside is a stray token; skip it.
            if key.is_empty() || key.contains(char::is_whitespace) {
                continue;
            }
            return Some((key.to_owned(), value));
        }
    }
}

fn new_cnonce() -> String {
    let bytes: [u8; 15] = rand::random();
    STANDARD.encode(bytes)
}

fn quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Build the `Authorization` value for one request of `session`.
fn authorize(
    session: &DigestSession,
    credential: &NetworkCredential,
    method: &str,
    request_uri: &str,
) -> Option<Authorization> {
    let challenge = session.challenge();
    let Some(algorithm) = Algorithm::parse(challenge.algorithm.as_deref()) else {
        tracing::warn!(
            algorithm = challenge.algorithm.as_deref().unwrap_or_default(),
            "unsupported digest algorithm"
        );
        return None;
    };
    let Ok(qop) = challenge.select_qop() else {
        tracing::warn!(
            qop = challenge.qop.as_deref().unwrap_or_default(),
            "unsupported digest qop"
        );
        return None;
    };

    let user = &credential.user_name;
    let cnonce = session.cnonce();

    let mut ha1 = algorithm.hash(&format!(
        "{user}:{}:{}",
        challenge.realm,
        credential.password.expose()
    ));
    if algorithm.is_session() {
        ha1 = algorithm.hash(&format!("{ha1}:{}:{cnonce}", challenge.nonce));
    }
    let ha2 = algorithm.hash(&format!("{method}:{request_uri}"));

    let mut fields = vec![
        format!("username=\"{}\"", quote(user)),
        format!("realm=\"{}\"", quote(&challenge.realm)),
        format!("nonce=\"{}\"", quote(&challenge.nonce)),
        format!("uri=\"{}\"", quote(request_uri)),
    ];
    if let Some(name) = &challenge.algorithm {
        fields.push(format!("algorithm={name}"));
    }

    if let Some(qop) = qop {
        let nc = format!("{:08x}", session.next_nonce_count());
        let response = algorithm.hash(&format!(
            "{ha1}:{}:{nc}:{cnonce}:{qop}:{ha2}",
            challenge.nonce
        ));
        fields.push(format!("response=\"{response}\""));
        fields.push(format!("qop={qop}"));
        fields.push(format!("nc={nc}"));
        fields.push(format!("cnonce=\"{cnonce}\""));
    } else {
        let response = algorithm.hash(&format!("{ha1}:{}:{ha2}", challenge.nonce));
        fields.push(format!("response=\"{response}\""));
        if algorithm.is_session() {
            fields.push(format!("cnonce=\"{cnonce}\""));
        }
    }
    tracing::trace!(realm = %challenge.realm, "answered digest challenge");

    if let Some(opaque) = &challenge.opaque {
        fields.push(format!("opaque=\"{}\"", quote(opaque)));
    }

    let header = format!("Digest {}", fields.join(", "));
    Some(Authorization::new(header))
}

/// `Digest` authentication backed by an engine-owned session cache.
#[derive(Debug, Clone)]
pub struct DigestAuthModule {
    sessions: Arc<DigestSessionCache>,
}

impl DigestAuthModule {
    #[must_use]
    pub fn new(sessions: Arc<DigestSessionCache>) -> Self {
        Self { sessions }
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<DigestSessionCache> {
        &self.sessions
    }
}

impl AuthModule for DigestAuthModule {
    fn scheme(&self) -> AuthenticationScheme {
        AuthenticationScheme::Digest
    }

    fn authentication_type(&self) -> &str {
        "Digest"
    }

    fn can_pre_authenticate(&self) -> bool {
        false
    }

    fn authenticate(
        &self,
        challenge: &str,
        target: &dyn RequestTarget,
        credentials: &dyn Credentials,
    ) -> Option<Authorization> {
        let parsed = DigestChallenge::parse(challenge)?;
        let url = target.url();
        let credential = credentials.credential_for(url, "Digest")?;
        if credential.user_name.is_empty() {
            return None;
        }

        let key = DigestSessionKey {
            uri: url[..Position::AfterQuery].to_owned(),
            user_name: credential.user_name.clone(),
            domain: credential.domain.clone(),
            nonce: parsed.nonce.clone(),
        };
        let session = self
            .sessions
            .get_or_insert(key, || DigestSession::new(parsed, new_cnonce(), Instant::now()));

        let request_uri = &url[Position::BeforePath..Position::AfterQuery];
        authorize(&session, &credential, target.method().as_str(), request_uri)
    }

    fn pre_authenticate(
        &self,
        _target: &dyn RequestTarget,
        _credentials: &dyn Credentials,
    ) -> Option<Authorization> {
        None
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::auth::test_support::Target;
    use http::Method;

    fn md5_hex(s: &str) -> String {
        hex::encode(Md5::digest(s.as_bytes()))
    }

    fn field<'a>(header: &'a str, name: &str) -> Option<&'a str> {
        header
            .trim_start_matches("Digest ")
            .split(", ")
            .find_map(|kv| kv.strip_prefix(&format!("{name}=")))
            .map(|v| v.trim_matches('"'))
    }

    #[test]
    fn test_parse_tolerates_missing_quotes() {
        let c = DigestChallenge::parse(
            "digest realm=test, nonce=\"abc\",qop=\"auth,auth-int\", algorithm=MD5, opaque=xyz, stale=false",
        )
        .unwrap();
        assert_eq!(c.realm, "test");
        assert_eq!(c.nonce, "abc");
        assert_eq!(c.qop.as_deref(), Some("auth,auth-int"));
        assert_eq!(c.algorithm.as_deref(), Some("MD5"));
        assert_eq!(c.opaque.as_deref(), Some("xyz"));
    }

    #[test]
    fn test_parse_requires_realm_nonce_and_scheme() {
        assert!(DigestChallenge::parse("Digest realm=\"r\"").is_none());
        assert!(DigestChallenge::parse("Basic realm=\"r\", nonce=\"n\"").is_none());
        assert!(DigestChallenge::parse("Digestive realm=\"r\", nonce=\"n\"").is_none());
    }

    #[test]
    fn test_parse_escaped_quotes() {
        let c = DigestChallenge::parse(r#"Digest realm="a \"b\" c", nonce="n""#).unwrap();
        assert_eq!(c.realm, "a \"b\" c");
    }

    #[test]
    fn test_response_matches_reference_md5() {
        let module = DigestAuthModule::new(Arc::new(DigestSessionCache::new()));
        let target = Target::new(Method::GET, "http://example.com/x");
        let cred = NetworkCredential::new("u", "p");

        let auth = module
            .authenticate(
                "Digest realm=\"test\", nonce=\"abc\", qop=\"auth\"",
                &target,
                &cred,
            )
            .unwrap();
        let header = auth.message;

        let cnonce = field(&header, "cnonce").unwrap();
        assert_eq!(field(&header, "nc"), Some("00000001"));
        assert_eq!(field(&header, "qop"), Some("auth"));
        assert_eq!(field(&header, "uri"), Some("/x"));

        let ha1 = md5_hex("u:test:p");
        let ha2 = md5_hex("GET:/x");
        let expected = md5_hex(&format!("{ha1}:abc:00000001:{cnonce}:auth:{ha2}"));
        assert_eq!(field(&header, "response"), Some(expected.as_str()));
    }

    #[test]
    fn test_same_nonce_increments_nc() {
        let module = DigestAuthModule::new(Arc::new(DigestSessionCache::new()));
        let target = Target::new(Method::GET, "http://example.com/x");
        let cred = NetworkCredential::new("u", "p");
        let challenge = "Digest realm=\"test\", nonce=\"abc\", qop=\"auth\"";

        let counts: Vec<String> = (0..3)
            .map(|_| {
                let header = module.authenticate(challenge, &target, &cred).unwrap().message;
                field(&header, "nc").unwrap().to_owned()
            })
            .collect();
        assert_eq!(counts, ["00000001", "00000002", "00000003"]);

        let first = module.authenticate(challenge, &target, &cred).unwrap().message;
        let second = module.authenticate(challenge, &target, &cred).unwrap().message;
        assert_eq!(field(&first, "cnonce"), field(&second, "cnonce"));
        assert_eq!(module.sessions().len(), 1);
    }

    #[test]
    fn test_without_qop_uses_rfc2069_response() {
        let module = DigestAuthModule::new(Arc::new(DigestSessionCache::new()));
        let target = Target::new(Method::POST, "http://example.com/a/b?c=d");
        let cred = NetworkCredential::new("u", "p");

        let header = module
            .authenticate("Digest realm=\"r\", nonce=\"n\", opaque=\"o\"", &target, &cred)
            .unwrap()
            .message;

        let expected = md5_hex(&format!(
            "{}:n:{}",
            md5_hex("u:r:p"),
            md5_hex("POST:/a/b?c=d")
        ));
        assert_eq!(field(&header, "response"), Some(expected.as_str()));
        assert_eq!(field(&header, "opaque"), Some("o"));
        assert!(field(&header, "nc").is_none());
    }

    #[test]
    fn test_md5_sess_and_sha256() {
        let module = DigestAuthModule::new(Arc::new(DigestSessionCache::new()));
        let target = Target::new(Method::GET, "http://example.com/x");
        let cred = NetworkCredential::new("u", "p");

        let header = module
            .authenticate(
                "Digest realm=\"r\", nonce=\"n1\", qop=auth, algorithm=MD5-sess",
                &target,
                &cred,
            )
            .unwrap()
            .message;
        let cnonce = field(&header, "cnonce").unwrap();
        let ha1 = md5_hex(&format!("{}:n1:{cnonce}", md5_hex("u:r:p")));
        let expected = md5_hex(&format!("{ha1}:n1:00000001:{cnonce}:auth:{}", md5_hex("GET:/x")));
        assert_eq!(field(&header, "response"), Some(expected.as_str()));

        let header = module
            .authenticate(
                "Digest realm=\"r\", nonce=\"n2\", qop=auth, algorithm=SHA-256",
                &target,
                &cred,
            )
            .unwrap()
            .message;
        assert_eq!(field(&header, "response").unwrap().len(), 64);
        assert_eq!(field(&header, "algorithm"), Some("SHA-256"));
    }

    #[test]
    fn test_declines_auth_int_only_and_unknown_algorithm() {
        let module = DigestAuthModule::new(Arc::new(DigestSessionCache::new()));
        let target = Target::new(Method::GET, "http://example.com/x");
        let cred = NetworkCredential::new("u", "p");

        assert!(module
            .authenticate("Digest realm=\"r\", nonce=\"n\", qop=\"auth-int\"", &target, &cred)
            .is_none());
        assert!(module
            .authenticate("Digest realm=\"r\", nonce=\"n\", algorithm=SHA-512-256", &target, &cred)
            .is_none());
    }

    #[test]
    fn test_never_pre_authenticates() {
        let module = DigestAuthModule::new(Arc::new(DigestSessionCache::new()));
        let target = Target::new(Method::GET, "http://example.com/x");
        assert!(!module.can_pre_authenticate());
        assert!(module
            .pre_authenticate(&target, &NetworkCredential::new("u", "p"))
            .is_none());
    }
}
