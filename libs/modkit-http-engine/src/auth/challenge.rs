use super::{AuthenticationData, AuthenticationScheme};
use http::HeaderMap;
use http::header::{PROXY_AUTHENTICATE, WWW_AUTHENTICATE};

/// One parsed `WWW-Authenticate` / `Proxy-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub scheme: String,
    /// Raw parameter text after the scheme name (may be empty)
    pub parameters: String,
    pub is_proxy: bool,
}

impl AuthChallenge {
    /// `scheme parameters`, or just the scheme when there are none.
    #[must_use]
    pub fn text(&self) -> String {
        if self.parameters.is_empty() {
            self.scheme.clone()
        } else {
            format!("{} {}", self.scheme, self.parameters)
        }
    }
}

/// Split at commas that are outside quoted strings.
fn split_top_level(value: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0;

    for (i, c) in value.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&value[start..]);
    parts
}

/// Parse every challenge in the given header values.
///
/// A header value may carry several challenges (`Basic realm="a", Digest
/// realm="b", nonce="n"`). A comma-separated segment starts a new challenge
/// when its first token is not an `auth-param`.
#[must_use]
pub fn parse_challenges<'a>(
    values: impl IntoIterator<Item = &'a str>,
    is_proxy: bool,
) -> Vec<AuthChallenge> {
    let mut challenges: Vec<AuthChallenge> = Vec::new();

    for value in values {
        for segment in split_top_level(value) {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }

            let (first, rest) = match segment.split_once(char::is_whitespace) {
                Some((first, rest)) => (first, rest.trim()),
                None => (segment, ""),
            };

            let continues_params = first.contains('=') && !challenges.is_empty();
            if continues_params {
                if let Some(current) = challenges.last_mut() {
                    if !current.parameters.is_empty() {
                        current.parameters.push_str(", ");
                    }
                    current.parameters.push_str(segment);
                }
                continue;
            }

            challenges.push(AuthChallenge {
                scheme: first.to_owned(),
                parameters: rest.to_owned(),
                is_proxy,
            });
        }
    }

    challenges
}

/// Turn the challenges of a 401/407 response into [`AuthenticationData`].
///
/// `WWW-Authenticate` takes precedence; `Proxy-Authenticate` is used only when
/// the response has no origin challenge.
#[must_use]
pub fn collect_auth_info(headers: &HeaderMap) -> Vec<AuthenticationData> {
    let (name, is_proxy) = if headers.contains_key(WWW_AUTHENTICATE) {
        (WWW_AUTHENTICATE, false)
    } else if headers.contains_key(PROXY_AUTHENTICATE) {
        (PROXY_AUTHENTICATE, true)
    } else {
        return Vec::new();
    };

    let values = headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok());

    parse_challenges(values, is_proxy)
        .into_iter()
        .map(|c| AuthenticationData {
            scheme: AuthenticationScheme::from_name(&c.scheme),
            challenge: c.text(),
            use_proxy_authentication: c.is_proxy,
            auth_module: None,
        })
        .collect()
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_multiple_challenges_in_one_value() {
        let parsed = parse_challenges(
            [r#"Basic realm="a, b", Digest realm="x", nonce="n", qop="auth,auth-int", Negotiate"#],
            false,
        );

        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].scheme, "Basic");
        assert_eq!(parsed[0].parameters, r#"realm="a, b""#);
        assert_eq!(parsed[1].scheme, "Digest");
        assert_eq!(
            parsed[1].parameters,
            r#"realm="x", nonce="n", qop="auth,auth-int""#
        );
        assert_eq!(parsed[2].text(), "Negotiate");
    }

    #[test]
    fn test_token68_challenge() {
        let parsed = parse_challenges(["NTLM TlRMTVNTUAACAAAA=="], true);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].scheme, "NTLM");
        assert_eq!(parsed[0].parameters, "TlRMTVNTUAACAAAA==");
        assert!(parsed[0].is_proxy);
    }

    #[test]
    fn test_collect_prefers_www_authenticate() {
        let mut headers = HeaderMap::new();
        headers.append(WWW_AUTHENTICATE, HeaderValue::from_static("Basic realm=\"r\""));
        headers.append(WWW_AUTHENTICATE, HeaderValue::from_static("Custom token"));
        headers.append(PROXY_AUTHENTICATE, HeaderValue::from_static("Basic realm=\"p\""));

        let data = collect_auth_info(&headers);
        assert_eq!(data.len(), 2);
        assert_eq!(data[0].scheme, AuthenticationScheme::Basic);
        assert_eq!(data[0].challenge, "Basic realm=\"r\"");
        assert!(!data[0].use_proxy_authentication);
        assert_eq!(data[1].scheme, AuthenticationScheme::Unsupported);
    }

    #[test]
    fn test_collect_proxy_challenges() {
        let mut headers = HeaderMap::new();
        headers.append(
            PROXY_AUTHENTICATE,
            HeaderValue::from_static("Digest realm=\"p\", nonce=\"n\""),
        );

        let data = collect_auth_info(&headers);
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].scheme, AuthenticationScheme::Digest);
        assert!(data[0].use_proxy_authentication);
    }

    #[test]
    fn test_collect_without_challenges() {
        assert!(collect_auth_info(&HeaderMap::new()).is_empty());
    }
}
