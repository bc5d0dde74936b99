#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Engine behaviour against a scripted in-memory transport
//!
//! The fake records every connection the engine opens: the headers in the
//! order they were set, the body framing, the written body and whether the
//! connection was torn down.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{
    AUTHORIZATION, CONTENT_LANGUAGE, CONTENT_TYPE, HeaderName, HeaderValue, LOCATION,
    WWW_AUTHENTICATE,
};
use http::{HeaderMap, Method, StatusCode};
use http_body_util::Full;
use modkit_http_engine::negotiate::{
    ContextFlags, HostResolver, SecurityContext, SecurityContextFactory, SecurityError,
};
use modkit_http_engine::transport::{
    BodyLength, Connection, ConnectionError, ProxySelection, RequestTarget, TlsSettings,
    Transport,
};
use modkit_http_engine::trust::ChainRejectedError;
use modkit_http_engine::{
    HttpEngine, HttpError, HttpRequest, NetworkCredential, RequestContent, ResponseBody,
    full_body,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use url::Url;

/// What one scripted connection does.
enum Step {
    Reply {
        status: StatusCode,
        headers: Vec<(&'static str, &'static str)>,
        body: &'static str,
        /// Expose the body through `error_stream` for 4xx/5xx
        error_stream: bool,
    },
    /// Never produce a status line
    Hang,
    /// Fail the connect with a TLS error carrying a chain rejection
    RejectChain,
}

fn reply(status: u16, headers: Vec<(&'static str, &'static str)>, body: &'static str) -> Step {
    Step::Reply {
        status: StatusCode::from_u16(status).unwrap(),
        headers,
        body,
        error_stream: true,
    }
}

/// What the engine did with one connection.
#[derive(Debug, Clone)]
struct Sent {
    url: Url,
    method: Method,
    header_order: Vec<HeaderName>,
    headers: HeaderMap,
    body_length: Option<BodyLength>,
    body: Vec<u8>,
    disconnected: bool,
}

#[derive(Default)]
struct Recorder {
    sent: Mutex<Vec<Sent>>,
    waiting: Notify,
}

impl Recorder {
    fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }
}

struct FakeTransport {
    script: Mutex<VecDeque<Step>>,
    recorder: Arc<Recorder>,
}

impl FakeTransport {
    fn new(steps: Vec<Step>) -> (Arc<Self>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let transport = Arc::new(Self {
            script: Mutex::new(steps.into()),
            recorder: Arc::clone(&recorder),
        });
        (transport, recorder)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(
        &self,
        url: &Url,
        _proxy: &ProxySelection,
    ) -> Result<Box<dyn Connection>, ConnectionError> {
        let step = self
            .script
            .lock()
            .pop_front()
            .expect("engine opened more connections than scripted");
        let index = {
            let mut sent = self.recorder.sent.lock();
            sent.push(Sent {
                url: url.clone(),
                method: Method::GET,
                header_order: Vec::new(),
                headers: HeaderMap::new(),
                body_length: None,
                body: Vec::new(),
                disconnected: false,
            });
            sent.len() - 1
        };
        Ok(Box::new(FakeConnection {
            url: url.clone(),
            method: Method::GET,
            step: Some(step),
            status: None,
            response_headers: HeaderMap::new(),
            body: None,
            error_stream: false,
            recorder: Arc::clone(&self.recorder),
            index,
        }))
    }
}

struct FakeConnection {
    url: Url,
    method: Method,
    step: Option<Step>,
    status: Option<StatusCode>,
    response_headers: HeaderMap,
    body: Option<ResponseBody>,
    error_stream: bool,
    recorder: Arc<Recorder>,
    index: usize,
}

impl FakeConnection {
    fn record(&self, update: impl FnOnce(&mut Sent)) {
        update(&mut self.recorder.sent.lock()[self.index]);
    }
}

impl RequestTarget for FakeConnection {
    fn url(&self) -> &Url {
        &self.url
    }

    fn method(&self) -> &Method {
        &self.method
    }
}

#[async_trait]
impl Connection for FakeConnection {
    fn set_method(&mut self, method: Method) -> Result<(), ConnectionError> {
        self.record(|s| s.method = method.clone());
        self.method = method;
        Ok(())
    }

    fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.record(|s| {
            s.header_order.push(name.clone());
            s.headers.insert(name, value);
        });
    }

    fn set_timeouts(&mut self, _connect: Option<Duration>, _read: Option<Duration>) {}

    fn set_body_length(&mut self, length: BodyLength) {
        self.record(|s| s.body_length = Some(length));
    }

    fn tls_settings(&mut self) -> Option<&mut dyn TlsSettings> {
        None
    }

    async fn connect(&mut self) -> Result<(), ConnectionError> {
        if matches!(self.step, Some(Step::RejectChain)) {
            return Err(ConnectionError::Tls(Box::new(ChainRejectedError)));
        }
        Ok(())
    }

    async fn write_body(&mut self, chunk: Bytes) -> Result<(), ConnectionError> {
        self.record(|s| s.body.extend_from_slice(&chunk));
        Ok(())
    }

    async fn status_code(&mut self) -> Result<StatusCode, ConnectionError> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        match self.step.take() {
            Some(Step::Reply {
                status,
                headers,
                body,
                error_stream,
            }) => {
                for (name, value) in headers {
                    self.response_headers.append(
                        HeaderName::from_static(name),
                        HeaderValue::from_static(value),
                    );
                }
                self.body = Some(full_body(body));
                self.error_stream = error_stream;
                self.status = Some(status);
                Ok(status)
            }
            Some(Step::Hang) => {
                self.recorder.waiting.notify_one();
                std::future::pending().await
            }
            _ => Err(ConnectionError::Protocol("nothing scripted".to_owned())),
        }
    }

    fn response_message(&self) -> Option<String> {
        self.status
            .and_then(|s| s.canonical_reason())
            .map(str::to_owned)
    }

    fn header_fields(&self) -> HeaderMap {
        self.response_headers.clone()
    }

    fn input_stream(&mut self) -> Result<ResponseBody, ConnectionError> {
        self.body
            .take()
            .ok_or_else(|| ConnectionError::Protocol("body already taken".to_owned()))
    }

    fn error_stream(&mut self) -> Option<ResponseBody> {
        if self.error_stream {
            self.body.take()
        } else {
            None
        }
    }

    async fn disconnect(&mut self) {
        self.record(|s| s.disconnected = true);
    }
}

fn engine(transport: Arc<FakeTransport>) -> HttpEngine {
    HttpEngine::builder()
        .transport(transport)
        .use_proxy(false)
        .build()
        .unwrap()
}

#[tokio::test]
async fn cancellation_disconnects_before_returning() {
    let (transport, recorder) = FakeTransport::new(vec![Step::Hang]);
    let engine = engine(transport);
    let cancel = CancellationToken::new();

    let task = {
        let cancel = cancel.clone();
        let request = HttpRequest::get("http://slow.example/").unwrap();
        tokio::spawn(async move { engine.execute(request, cancel).await })
    };
    recorder.waiting.notified().await;
    cancel.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, HttpError::Cancelled));
    let sent = recorder.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].disconnected);
}

#[tokio::test]
async fn already_cancelled_request_never_reaches_status() {
    let (transport, recorder) = FakeTransport::new(vec![reply(200, vec![], "")]);
    let engine = engine(transport);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = engine
        .execute(HttpRequest::get("http://example.com/").unwrap(), cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, HttpError::Cancelled));
    assert!(recorder.sent()[0].disconnected);
}

#[tokio::test]
async fn empty_post_sends_zero_content_length() {
    let (transport, recorder) = FakeTransport::new(vec![reply(204, vec![], "")]);
    let engine = engine(transport);

    let response = engine
        .execute(
            HttpRequest::new(Method::POST, "http://example.com/submit").unwrap(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let sent = recorder.sent();
    assert_eq!(sent[0].method, Method::POST);
    assert_eq!(sent[0].body_length, Some(BodyLength::Fixed(0)));
    assert!(sent[0].body.is_empty());
}

#[tokio::test]
async fn get_without_content_has_no_framing() {
    let (transport, recorder) = FakeTransport::new(vec![reply(200, vec![], "ok")]);
    let engine = engine(transport);

    engine
        .execute(
            HttpRequest::get("http://example.com/").unwrap(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(recorder.sent()[0].body_length, None);
}

#[tokio::test]
async fn streaming_content_without_length_is_chunked() {
    let (transport, recorder) = FakeTransport::new(vec![reply(201, vec![], "")]);
    let engine = engine(transport);
    let content = RequestContent::streaming(Full::new(Bytes::from_static(b"streamed")), None);

    engine
        .execute(
            HttpRequest::new(Method::PUT, "http://example.com/blob")
                .unwrap()
                .with_content(content),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let sent = recorder.sent();
    assert_eq!(sent[0].body_length, Some(BodyLength::Chunked));
    assert_eq!(sent[0].body, b"streamed");
}

#[tokio::test]
async fn content_headers_are_set_before_request_headers() {
    let (transport, recorder) = FakeTransport::new(vec![reply(200, vec![], "")]);
    let engine = engine(transport);

    let request = HttpRequest::new(Method::POST, "http://example.com/")
        .unwrap()
        .header(
            HeaderName::from_static("x-trace"),
            HeaderValue::from_static("a"),
        )
        .header(
            HeaderName::from_static("x-trace"),
            HeaderValue::from_static("b"),
        )
        .with_content(
            RequestContent::bytes("{}")
                .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
                .header(CONTENT_LANGUAGE, HeaderValue::from_static("en")),
        );
    engine
        .execute(request, CancellationToken::new())
        .await
        .unwrap();

    let sent = &recorder.sent()[0];
    let position = |name: &str| {
        sent.header_order
            .iter()
            .position(|n| n == name)
            .unwrap_or_else(|| panic!("{name} not set"))
    };
    assert!(position("content-type") < position("x-trace"));
    assert!(position("content-language") < position("x-trace"));
    assert!(position("x-trace") < position("accept-encoding"));
    assert_eq!(sent.headers["x-trace"], "a,b");
    assert_eq!(sent.headers["accept-encoding"], "identity");
    assert_eq!(sent.body_length, Some(BodyLength::Fixed(2)));
    assert_eq!(sent.body, b"{}");
}

#[tokio::test]
async fn unauthorized_without_error_stream_reads_as_unauthorized() {
    let (transport, _) = FakeTransport::new(vec![Step::Reply {
        status: StatusCode::UNAUTHORIZED,
        headers: vec![("www-authenticate", "Basic realm=\"api\"")],
        body: "",
        error_stream: false,
    }]);
    let engine = engine(transport);

    let response = engine
        .execute(
            HttpRequest::get("http://example.com/private").unwrap(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.requested_authentication().len(), 1);
    assert_eq!(response.text().await.unwrap(), "Unauthorized");
}

#[tokio::test]
async fn one_shot_body_cannot_follow_307() {
    let (transport, recorder) = FakeTransport::new(vec![
        reply(307, vec![("location", "http://example.com/elsewhere")], ""),
        reply(200, vec![], ""),
    ]);
    let engine = engine(transport);
    let content = RequestContent::streaming(Full::new(Bytes::from_static(b"once")), Some(4));

    let err = engine
        .execute(
            HttpRequest::new(Method::POST, "http://example.com/upload")
                .unwrap()
                .with_content(content),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, HttpError::InvalidRequest(_)));
    let sent = recorder.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|s| s.disconnected));
}

#[tokio::test]
async fn redirect_drops_authorization() {
    let (transport, recorder) = FakeTransport::new(vec![
        reply(302, vec![("location", "/next")], ""),
        reply(200, vec![], "done"),
    ]);
    let engine = engine(transport);

    let response = engine
        .execute(
            HttpRequest::get("http://example.com/start")
                .unwrap()
                .header(AUTHORIZATION, HeaderValue::from_static("Bearer secret")),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let sent = recorder.sent();
    assert!(sent[0].headers.contains_key(AUTHORIZATION));
    assert!(sent[0].disconnected);
    assert_eq!(sent[1].url.as_str(), "http://example.com/next");
    assert!(!sent[1].headers.contains_key(AUTHORIZATION));
    assert!(!response.request().headers.contains_key(AUTHORIZATION));
    assert_eq!(response.text().await.unwrap(), "done");
}

#[tokio::test]
async fn cookies_are_replayed_on_the_next_request() {
    let (transport, recorder) = FakeTransport::new(vec![
        reply(200, vec![("set-cookie", "session=abc; Path=/")], ""),
        reply(200, vec![], ""),
    ]);
    let engine = engine(transport);

    for _ in 0..2 {
        engine
            .execute(
                HttpRequest::get("http://example.com/app").unwrap(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
    }

    let sent = recorder.sent();
    assert!(!sent[0].headers.contains_key("cookie"));
    assert_eq!(sent[1].headers["cookie"], "session=abc");
}

#[tokio::test]
async fn redirect_cookie_is_sent_to_the_next_hop() {
    let (transport, recorder) = FakeTransport::new(vec![
        reply(
            302,
            vec![("set-cookie", "session=abc; Path=/"), ("location", "/next")],
            "",
        ),
        reply(200, vec![], ""),
    ]);
    let engine = engine(transport);

    engine
        .execute(
            HttpRequest::get("http://example.com/start").unwrap(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let sent = recorder.sent();
    assert_eq!(sent.len(), 2);
    assert!(!sent[0].headers.contains_key("cookie"));
    assert_eq!(sent[1].headers["cookie"], "session=abc");
}

#[tokio::test]
async fn challenge_cookies_are_not_stored() {
    let (transport, recorder) = FakeTransport::new(vec![
        reply(
            401,
            vec![
                ("www-authenticate", "Basic realm=\"api\""),
                ("set-cookie", "tracking=1; Path=/"),
            ],
            "",
        ),
        reply(200, vec![], ""),
    ]);
    let engine = engine(transport);

    for _ in 0..2 {
        engine
            .execute(
                HttpRequest::get("http://example.com/private").unwrap(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
    }

    assert!(!recorder.sent()[1].headers.contains_key("cookie"));
}

#[tokio::test]
async fn rejected_chain_maps_to_chain_rejected() {
    let (transport, recorder) = FakeTransport::new(vec![Step::RejectChain]);
    let engine = engine(transport);

    let err = engine
        .execute(
            HttpRequest::get("https://untrusted.example/").unwrap(),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, HttpError::ChainRejected));
    assert!(recorder.sent()[0].disconnected);
}

#[derive(Default)]
struct Handshake {
    created: Vec<(String, String, ContextFlags)>,
    incoming: Vec<Option<String>>,
    closed: usize,
}

struct TwoRoundContext {
    state: Arc<Mutex<Handshake>>,
    round: usize,
}

impl SecurityContext for TwoRoundContext {
    fn outgoing_token(&mut self, incoming: Option<&str>) -> Result<Option<String>, SecurityError> {
        self.state.lock().incoming.push(incoming.map(str::to_owned));
        self.round += 1;
        Ok(match self.round {
            1 => Some("bmVnb3RpYXRl".to_owned()),
            2 => Some("YXV0aA==".to_owned()),
            _ => None,
        })
    }

    fn is_complete(&self) -> bool {
        false
    }

    fn close(&mut self) {
        self.state.lock().closed += 1;
    }
}

struct TwoRoundFactory(Arc<Mutex<Handshake>>);

impl SecurityContextFactory for TwoRoundFactory {
    fn create(
        &self,
        package: &str,
        _credential: &NetworkCredential,
        spn: &str,
        flags: ContextFlags,
    ) -> Result<Box<dyn SecurityContext>, SecurityError> {
        self.0
            .lock()
            .created
            .push((package.to_owned(), spn.to_owned(), flags));
        Ok(Box::new(TwoRoundContext {
            state: Arc::clone(&self.0),
            round: 0,
        }))
    }
}

struct Verbatim;

#[async_trait]
impl HostResolver for Verbatim {
    async fn canonical_name(&self, host: &str) -> io::Result<String> {
        Ok(host.to_owned())
    }
}

#[tokio::test]
async fn ntlm_handshake_resends_with_tokens() {
    let (transport, recorder) = FakeTransport::new(vec![
        reply(401, vec![("www-authenticate", "NTLM")], "denied"),
        reply(401, vec![("www-authenticate", "NTLM Y2hhbGxlbmdl")], ""),
        reply(200, vec![], "welcome"),
    ]);
    let handshake = Arc::new(Mutex::new(Handshake::default()));
    let engine = HttpEngine::builder()
        .transport(transport)
        .use_proxy(false)
        .use_negotiate_authentication(true)
        .credentials(Arc::new(
            NetworkCredential::new("alice", "secret").with_domain("CORP"),
        ))
        .security_contexts(Arc::new(TwoRoundFactory(Arc::clone(&handshake))))
        .host_resolver(Arc::new(Verbatim))
        .build()
        .unwrap();

    let response = engine
        .execute(
            HttpRequest::get("http://intranet.corp/report").unwrap(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "welcome");

    let sent = recorder.sent();
    assert_eq!(sent.len(), 3);
    assert!(!sent[0].headers.contains_key(AUTHORIZATION));
    assert_eq!(sent[1].headers[AUTHORIZATION], "NTLM bmVnb3RpYXRl");
    assert_eq!(sent[2].headers[AUTHORIZATION], "NTLM YXV0aA==");

    let handshake = handshake.lock();
    assert_eq!(
        handshake.created,
        vec![(
            "NTLM".to_owned(),
            "HTTP/intranet.corp".to_owned(),
            ContextFlags::for_target(false)
        )]
    );
    assert_eq!(
        handshake.incoming,
        vec![None, Some("Y2hhbGxlbmdl".to_owned())]
    );
    assert_eq!(handshake.closed, 1);
}

struct NxDomain;

#[async_trait]
impl HostResolver for NxDomain {
    async fn canonical_name(&self, _host: &str) -> io::Result<String> {
        Err(io::Error::new(io::ErrorKind::NotFound, "nxdomain"))
    }
}

#[tokio::test]
async fn unresolvable_spn_host_returns_the_challenge() {
    let (transport, recorder) = FakeTransport::new(vec![reply(
        401,
        vec![("www-authenticate", "Negotiate")],
        "denied",
    )]);
    let handshake = Arc::new(Mutex::new(Handshake::default()));
    let engine = HttpEngine::builder()
        .transport(transport)
        .use_proxy(false)
        .use_negotiate_authentication(true)
        .credentials(Arc::new(NetworkCredential::new("alice", "secret")))
        .security_contexts(Arc::new(TwoRoundFactory(Arc::clone(&handshake))))
        .host_resolver(Arc::new(NxDomain))
        .build()
        .unwrap();

    let response = engine
        .execute(
            HttpRequest::get("http://intranet.corp/").unwrap(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.text().await.unwrap(), "denied");
    assert_eq!(recorder.sent().len(), 1);
    assert!(handshake.lock().created.is_empty());
}

#[tokio::test]
async fn negotiate_is_skipped_without_credentials() {
    let (transport, recorder) = FakeTransport::new(vec![reply(
        401,
        vec![("www-authenticate", "Negotiate")],
        "",
    )]);
    let handshake = Arc::new(Mutex::new(Handshake::default()));
    let engine = HttpEngine::builder()
        .transport(transport)
        .use_proxy(false)
        .use_negotiate_authentication(true)
        .security_contexts(Arc::new(TwoRoundFactory(Arc::clone(&handshake))))
        .build()
        .unwrap();

    let response = engine
        .execute(
            HttpRequest::get("http://intranet.corp/").unwrap(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.requested_authentication()[0].challenge,
        "Negotiate"
    );
    assert_eq!(recorder.sent().len(), 1);
    assert!(handshake.lock().created.is_empty());
}

#[tokio::test]
async fn location_header_is_ignored_without_auto_redirect() {
    let (transport, recorder) =
        FakeTransport::new(vec![reply(301, vec![("location", "/moved")], "")]);
    let engine = HttpEngine::builder()
        .transport(transport)
        .use_proxy(false)
        .allow_auto_redirect(false)
        .build()
        .unwrap();

    let response = engine
        .execute(
            HttpRequest::get("http://example.com/old").unwrap(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(response.headers()[LOCATION], "/moved");
    assert_eq!(recorder.sent().len(), 1);
    assert!(!response.headers().contains_key(WWW_AUTHENTICATE));
}
