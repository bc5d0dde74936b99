use crate::error::{BoxError, HttpError};
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use http_body_util::BodyExt;
use std::fmt;
use url::Url;

/// Boxed streaming request body.
pub type RequestBodyStream = http_body_util::combinators::BoxBody<Bytes, BoxError>;

/// Method, target and headers of a request, without its content.
///
/// Handed to the certificate validation callback and kept on the response as
/// the request that produced it.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Url,
    pub headers: HeaderMap,
}

/// A logical HTTP request.
///
/// The target is always an absolute URL. Method and content may be replaced by
/// the engine while following redirects.
#[derive(Debug)]
pub struct HttpRequest {
    method: Method,
    uri: Url,
    headers: HeaderMap,
    content: Option<RequestContent>,
}

impl HttpRequest {
    /// Create a request for an absolute URI.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::InvalidRequest`] if `uri` is relative or malformed.
    pub fn new(method: Method, uri: &str) -> Result<Self, HttpError> {
        let uri = Url::parse(uri).map_err(|e| match e {
            url::ParseError::RelativeUrlWithoutBase => {
                HttpError::invalid_request(format!("'{uri}' is not an absolute URI"))
            }
            other => HttpError::invalid_request(format!("invalid URI '{uri}': {other}")),
        })?;
        Ok(Self::from_url(method, uri))
    }

    /// Create a request from an already parsed URL.
    #[must_use]
    pub fn from_url(method: Method, uri: Url) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            content: None,
        }
    }

    /// Shorthand for a `GET` request.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::InvalidRequest`] if `uri` is relative or malformed.
    pub fn get(uri: &str) -> Result<Self, HttpError> {
        Self::new(Method::GET, uri)
    }

    /// Add a header value, keeping existing values for the same name.
    #[must_use]
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Attach request content.
    #[must_use]
    pub fn with_content(mut self, content: RequestContent) -> Self {
        self.content = Some(content);
        self
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    #[must_use]
    pub fn uri(&self) -> &Url {
        &self.uri
    }

    pub(crate) fn set_uri(&mut self, uri: Url) {
        self.uri = uri;
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    #[must_use]
    pub fn content(&self) -> Option<&RequestContent> {
        self.content.as_ref()
    }

    pub fn content_mut(&mut self) -> Option<&mut RequestContent> {
        self.content.as_mut()
    }

    pub fn set_content(&mut self, content: Option<RequestContent>) {
        self.content = content;
    }

    /// Snapshot of method, target and headers.
    #[must_use]
    pub fn head(&self) -> RequestHead {
        RequestHead {
            method: self.method.clone(),
            uri: self.uri.clone(),
            headers: self.headers.clone(),
        }
    }
}

enum ContentBody {
    /// Replayable from the start on every send
    Buffered(Bytes),
    /// One-shot; `None` once consumed
    Streaming(Option<RequestBodyStream>),
}

/// Request content: the body plus its content-describing headers
/// (`Content-Type`, `Content-Language`, ...).
pub struct RequestContent {
    headers: HeaderMap,
    body: ContentBody,
    length: Option<u64>,
}

impl fmt::Debug for RequestContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = match &self.body {
            ContentBody::Buffered(b) => format!("Buffered({} bytes)", b.len()),
            ContentBody::Streaming(Some(_)) => "Streaming".to_owned(),
            ContentBody::Streaming(None) => "Streaming(consumed)".to_owned(),
        };
        f.debug_struct("RequestContent")
            .field("headers", &self.headers)
            .field("body", &body)
            .field("length", &self.length)
            .finish()
    }
}

/// Body handed to a connection for one send.
pub enum OutgoingBody {
    Buffered(Bytes),
    Streaming(RequestBodyStream),
}

impl RequestContent {
    /// In-memory content. Can be resent any number of times.
    #[must_use]
    pub fn bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            headers: HeaderMap::new(),
            length: Some(data.len() as u64),
            body: ContentBody::Buffered(data),
        }
    }

    /// Streaming content of optionally known length.
    ///
    /// The stream is consumed by the first send; a redirect or authentication
    /// round that needs to resend it fails with [`HttpError::InvalidRequest`].
    #[must_use]
    pub fn streaming<B>(body: B, length: Option<u64>) -> Self
    where
        B: http_body::Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        Self {
            headers: HeaderMap::new(),
            body: ContentBody::Streaming(Some(body.map_err(Into::into).boxed())),
            length,
        }
    }

    /// Add a content header.
    #[must_use]
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Length of the body if known, from the body itself or an explicit
    /// `Content-Length` content header.
    #[must_use]
    pub fn length(&self) -> Option<u64> {
        self.length.or_else(|| {
            self.headers
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok())
        })
    }

    /// `true` if the body can be sent again.
    #[must_use]
    pub fn is_replayable(&self) -> bool {
        match &self.body {
            ContentBody::Buffered(_) => true,
            ContentBody::Streaming(body) => body.is_some(),
        }
    }

    /// Body for the next send. Buffered content starts from the beginning
    /// every time.
    pub(crate) fn outgoing(&mut self) -> Result<OutgoingBody, HttpError> {
        match &mut self.body {
            ContentBody::Buffered(data) => Ok(OutgoingBody::Buffered(data.clone())),
            ContentBody::Streaming(body) => body.take().map(OutgoingBody::Streaming).ok_or_else(
                || HttpError::invalid_request("request content stream cannot be replayed"),
            ),
        }
    }

    /// Read a streaming body fully into memory so it can be replayed.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::Transport`] if the stream fails, or
    /// [`HttpError::InvalidRequest`] if it was already consumed.
    pub async fn buffer(&mut self) -> Result<(), HttpError> {
        if let ContentBody::Streaming(body) = &mut self.body {
            let stream = body.take().ok_or_else(|| {
                HttpError::invalid_request("request content stream cannot be replayed")
            })?;
            let data = stream
                .collect()
                .await
                .map_err(HttpError::Transport)?
                .to_bytes();
            self.length = Some(data.len() as u64);
            self.body = ContentBody::Buffered(data);
        }
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use http::header::CONTENT_TYPE;
    use http_body_util::Full;

    #[test]
    fn test_relative_uri_is_invalid_request() {
        let err = HttpRequest::get("/relative/path").unwrap_err();
        assert!(matches!(err, HttpError::InvalidRequest(ref m) if m.contains("absolute")));
    }

    #[test]
    fn test_absolute_uri_keeps_fragment() {
        let req = HttpRequest::get("https://example.com/a?b=1#frag").unwrap();
        assert_eq!(req.uri().fragment(), Some("frag"));
        assert_eq!(req.method(), Method::GET);
    }

    #[test]
    fn test_buffered_content_is_replayable() {
        let mut content = RequestContent::bytes("hello")
            .header(CONTENT_TYPE, HeaderValue::from_static("text/plain"));

        assert_eq!(content.length(), Some(5));
        for _ in 0..3 {
            let OutgoingBody::Buffered(data) = content.outgoing().unwrap() else {
                panic!("expected buffered body");
            };
            assert_eq!(data, Bytes::from_static(b"hello"));
        }
        assert!(content.is_replayable());
    }

    #[test]
    fn test_streaming_content_is_one_shot() {
        let mut content =
            RequestContent::streaming(Full::new(Bytes::from_static(b"abc")), None);

        assert_eq!(content.length(), None);
        assert!(content.outgoing().is_ok());
        assert!(!content.is_replayable());
        assert!(matches!(
            content.outgoing(),
            Err(HttpError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_length_from_content_header() {
        let content = RequestContent::streaming(Full::new(Bytes::from_static(b"abcd")), None)
            .header(CONTENT_LENGTH, HeaderValue::from_static("4"));
        assert_eq!(content.length(), Some(4));
    }

    #[tokio::test]
    async fn test_buffering_makes_stream_replayable() {
        let mut content =
            RequestContent::streaming(Full::new(Bytes::from_static(b"payload")), None);

        content.buffer().await.unwrap();

        assert!(content.is_replayable());
        assert_eq!(content.length(), Some(7));
        assert!(content.outgoing().is_ok());
        assert!(content.outgoing().is_ok());
    }
}
