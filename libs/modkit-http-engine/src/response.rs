use crate::auth::AuthenticationData;
use crate::error::{BoxError, HttpError};
use crate::request::RequestHead;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use http_body_util::{BodyExt, Empty, Full};
use std::fmt;

/// Type alias for the boxed response body.
///
/// Holds either the raw transport body or a decompressing wrapper around it.
pub type ResponseBody = http_body_util::combinators::BoxBody<Bytes, BoxError>;

/// Empty boxed body.
#[must_use]
pub fn empty_body() -> ResponseBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Boxed body over in-memory bytes.
#[must_use]
pub fn full_body(data: impl Into<Bytes>) -> ResponseBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Response body with its content-describing headers.
///
/// The body is read lazily; nothing is pulled from the connection until one of
/// the reading methods is called.
pub struct ResponseContent {
    headers: HeaderMap,
    body: ResponseBody,
}

impl fmt::Debug for ResponseContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseContent")
            .field("headers", &self.headers)
            .field("body", &"<stream>")
            .finish()
    }
}

impl ResponseContent {
    pub(crate) fn new(body: ResponseBody) -> Self {
        Self {
            headers: HeaderMap::new(),
            body,
        }
    }

    /// Content headers (`Content-Type`, `Content-Encoding`, `Content-Length`, ...).
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Take the body stream.
    #[must_use]
    pub fn into_body(self) -> ResponseBody {
        self.body
    }

    /// Read the whole body.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::Transport`] if reading or decompressing fails.
    pub async fn bytes(self) -> Result<Bytes, HttpError> {
        let collected = self.body.collect().await.map_err(HttpError::Transport)?;
        Ok(collected.to_bytes())
    }

    /// Read the body into memory and keep it, so the exchange that produced
    /// it is fully consumed.
    pub(crate) async fn load_into_buffer(&mut self) -> Result<(), HttpError> {
        let body = std::mem::replace(&mut self.body, empty_body());
        let data = body
            .collect()
            .await
            .map_err(HttpError::Transport)?
            .to_bytes();
        self.body = full_body(data);
        Ok(())
    }
}

/// Result of [`HttpEngine::execute`](crate::HttpEngine::execute).
#[derive(Debug)]
pub struct HttpResponse {
    pub(crate) status: StatusCode,
    pub(crate) reason: Option<String>,
    pub(crate) headers: HeaderMap,
    pub(crate) content: ResponseContent,
    pub(crate) request: RequestHead,
    pub(crate) requested_authentication: Vec<AuthenticationData>,
}

impl HttpResponse {
    /// Get the response status code
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Reason phrase of the status line, if the transport reported one
    #[must_use]
    pub fn reason_phrase(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Response headers, excluding content headers
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[must_use]
    pub fn content(&self) -> &ResponseContent {
        &self.content
    }

    pub fn content_mut(&mut self) -> &mut ResponseContent {
        &mut self.content
    }

    #[must_use]
    pub fn into_content(self) -> ResponseContent {
        self.content
    }

    /// The request as finally sent, after any redirects.
    #[must_use]
    pub fn request(&self) -> &RequestHead {
        &self.request
    }

    /// Challenges offered by the server on a 401/407.
    ///
    /// Empty for every other status. To authenticate, re-issue the request with
    /// one of these entries as pre-authentication data and matching credentials.
    #[must_use]
    pub fn requested_authentication(&self) -> &[AuthenticationData] {
        &self.requested_authentication
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Read the whole body.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::Transport`] if reading or decompressing fails.
    pub async fn bytes(self) -> Result<Bytes, HttpError> {
        self.content.bytes().await
    }

    /// Read the body as UTF-8 text, replacing invalid sequences.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::Transport`] if reading or decompressing fails.
    pub async fn text(self) -> Result<String, HttpError> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    #[cfg(test)]
    pub(crate) fn synthetic(status: StatusCode, headers: HeaderMap, body: &'static str) -> Self {
        Self {
            status,
            reason: None,
            headers,
            content: ResponseContent::new(full_body(body)),
            request: RequestHead {
                method: http::Method::GET,
                uri: url::Url::parse("http://example.com/").expect("static URL"),
                headers: HeaderMap::new(),
            },
            requested_authentication: Vec::new(),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use http::Method;
    use url::Url;

    fn response(body: ResponseBody) -> HttpResponse {
        HttpResponse {
            status: StatusCode::OK,
            reason: Some("OK".to_owned()),
            headers: HeaderMap::new(),
            content: ResponseContent::new(body),
            request: RequestHead {
                method: Method::GET,
                uri: Url::parse("http://example.com/").unwrap(),
                headers: HeaderMap::new(),
            },
            requested_authentication: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_text_reads_body() {
        let resp = response(full_body("hello"));
        assert_eq!(resp.reason_phrase(), Some("OK"));
        assert!(resp.requested_authentication().is_empty());
        assert_eq!(resp.text().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_load_into_buffer_keeps_content() {
        let mut content = ResponseContent::new(full_body("buffered"));
        content.load_into_buffer().await.unwrap();
        assert_eq!(content.bytes().await.unwrap(), Bytes::from_static(b"buffered"));
    }

    #[tokio::test]
    async fn test_empty_body() {
        let content = ResponseContent::new(empty_body());
        assert!(content.bytes().await.unwrap().is_empty());
    }
}
