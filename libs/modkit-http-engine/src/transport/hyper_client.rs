use super::{
    BodyLength, Connection, ConnectionError, ProxySelection, RequestTarget, TlsSettings, Transport,
    system_proxy_for,
};
use crate::config::TlsRootConfig;
use crate::error::BoxError;
use crate::request::RequestBodyStream;
use crate::response::{ResponseBody, empty_body};
use crate::tls;
use crate::trust::{
    ChainRejectedError, HostnameVerifier, SslSession, TrustError, TrustManager,
    TrustManagerCertVerifier, WebPkiHostnameVerifier, WebPkiTrustVerifier,
};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{self, HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use rustls_pki_types::{CertificateDer, ServerName};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use url::{Position, Url};

/// Largest proxy reply head accepted for a `CONNECT`.
const MAX_PROXY_HEAD: usize = 16 * 1024;

/// [`Transport`] over hyper's HTTP/1.1 client connections.
///
/// Every connection is a fresh TCP (and TLS) session. Nothing is pooled, so the
/// trust settings of one request never leak into another.
#[derive(Debug, Clone, Copy, Default)]
pub struct HyperTransport {
    tls_roots: TlsRootConfig,
}

impl HyperTransport {
    /// Transport whose default trust managers use `tls_roots`.
    #[must_use]
    pub fn new(tls_roots: TlsRootConfig) -> Self {
        Self { tls_roots }
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn open(
        &self,
        url: &Url,
        proxy: &ProxySelection,
    ) -> Result<Box<dyn Connection>, ConnectionError> {
        let secure = match url.scheme() {
            "https" => true,
            "http" => false,
            other => return Err(ConnectionError::UnknownService(other.to_owned())),
        };

        let proxy = match proxy {
            ProxySelection::SystemDefault => system_proxy_for(url),
            ProxySelection::Direct => None,
            ProxySelection::Via(address) => Some(address.clone()),
        };
        if let Some(address) = &proxy
            && address.scheme() != "http"
        {
            return Err(ConnectionError::UnknownService(format!(
                "{} proxy",
                address.scheme()
            )));
        }

        let tls = secure.then(|| HyperTlsSettings::new(self.tls_roots));
        Ok(Box::new(HyperConnection::new(url.clone(), proxy, tls)))
    }
}

impl From<hyper::Error> for ConnectionError {
    fn from(err: hyper::Error) -> Self {
        if err.is_parse() || err.is_parse_status() || err.is_user() {
            ConnectionError::Protocol(err.to_string())
        } else {
            ConnectionError::Io(std::io::Error::other(err))
        }
    }
}

struct HyperTlsSettings {
    roots: TlsRootConfig,
    managers: Option<Vec<TrustManager>>,
    hostname_verifier: Option<Arc<dyn HostnameVerifier>>,
}

impl HyperTlsSettings {
    fn new(roots: TlsRootConfig) -> Self {
        Self {
            roots,
            managers: None,
            hostname_verifier: None,
        }
    }
}

impl TlsSettings for HyperTlsSettings {
    fn default_trust_managers(
        &self,
        trusted_certs: Option<&[CertificateDer<'static>]>,
    ) -> Result<Vec<TrustManager>, ConnectionError> {
        let store = tls::root_store(self.roots, trusted_certs)
            .map_err(|reason| ConnectionError::Tls(reason.into()))?;
        Ok(vec![TrustManager::X509(Arc::new(WebPkiTrustVerifier::new(
            store,
            tls::crypto_provider(),
        )))])
    }

    fn set_trust_managers(&mut self, managers: Vec<TrustManager>) {
        self.managers = Some(managers);
    }

    fn default_hostname_verifier(&self) -> Arc<dyn HostnameVerifier> {
        Arc::new(WebPkiHostnameVerifier)
    }

    fn set_hostname_verifier(&mut self, verifier: Arc<dyn HostnameVerifier>) {
        self.hostname_verifier = Some(verifier);
    }
}

/// TLS session as seen after a completed handshake.
struct EstablishedSession {
    chain: Vec<CertificateDer<'static>>,
    host: String,
    port: u16,
    cipher_suite: Option<String>,
    protocol: Option<String>,
    created: SystemTime,
}

impl EstablishedSession {
    fn capture(conn: &rustls::ClientConnection, host: &str, port: u16) -> Self {
        Self {
            chain: conn.peer_certificates().map(<[_]>::to_vec).unwrap_or_default(),
            host: host.to_owned(),
            port,
            cipher_suite: conn
                .negotiated_cipher_suite()
                .and_then(|suite| suite.suite().as_str())
                .map(str::to_owned),
            protocol: conn
                .protocol_version()
                .and_then(|version| version.as_str())
                .map(str::to_owned),
            created: SystemTime::now(),
        }
    }
}

impl SslSession for EstablishedSession {
    fn peer_certificates(&self) -> Result<Vec<CertificateDer<'static>>, TrustError> {
        Ok(self.chain.clone())
    }

    fn peer_host(&self) -> Result<String, TrustError> {
        Ok(self.host.clone())
    }

    fn peer_port(&self) -> Result<u16, TrustError> {
        Ok(self.port)
    }

    fn cipher_suite(&self) -> Result<String, TrustError> {
        self.cipher_suite
            .clone()
            .ok_or(TrustError::NotSupported("cipher_suite"))
    }

    fn protocol(&self) -> Result<String, TrustError> {
        self.protocol
            .clone()
            .ok_or(TrustError::NotSupported("protocol"))
    }

    fn local_certificates(&self) -> Result<Vec<CertificateDer<'static>>, TrustError> {
        Ok(Vec::new())
    }

    fn creation_time(&self) -> Result<SystemTime, TrustError> {
        Ok(self.created)
    }
}

enum Link {
    Idle,
    Open {
        sender: http1::SendRequest<RequestBodyStream>,
        driver: JoinHandle<()>,
    },
    Closed,
}

struct ResponseHead {
    status: StatusCode,
    reason: Option<String>,
    headers: HeaderMap,
    body: Option<ResponseBody>,
}

impl ResponseHead {
    fn is_error(&self) -> bool {
        self.status.is_client_error() || self.status.is_server_error()
    }
}

/// Status line and headers of a proxy's reply to `CONNECT`.
#[derive(Debug)]
struct ProxyReply {
    status: StatusCode,
    reason: Option<String>,
    headers: HeaderMap,
}

struct HyperConnection {
    url: Url,
    method: Method,
    headers: HeaderMap,
    proxy: Option<Url>,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    body_length: Option<BodyLength>,
    body: Vec<Bytes>,
    tls: Option<HyperTlsSettings>,
    link: Link,
    response: Option<ResponseHead>,
}

impl HyperConnection {
    fn new(url: Url, proxy: Option<Url>, tls: Option<HyperTlsSettings>) -> Self {
        Self {
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            proxy,
            connect_timeout: None,
            read_timeout: None,
            body_length: None,
            body: Vec::new(),
            tls,
            link: Link::Idle,
            response: None,
        }
    }

    /// Requests to a plain-HTTP origin through a proxy use the absolute form.
    fn uses_absolute_form(&self) -> bool {
        self.proxy.is_some() && self.tls.is_none()
    }

    async fn open_tunnel(
        &mut self,
        mut tcp: TcpStream,
        host: &str,
        port: u16,
    ) -> Result<Option<TcpStream>, ConnectionError> {
        let authority = authority(host, port);
        let mut head = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n").into_bytes();
        if let Some(value) = self.headers.get(header::PROXY_AUTHORIZATION) {
            head.extend_from_slice(b"Proxy-Authorization: ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }
        head.extend_from_slice(b"\r\n");

        within(self.connect_timeout, tcp.write_all(&head)).await??;
        let raw = within(self.read_timeout, read_head(&mut tcp)).await??;
        let reply = parse_proxy_reply(&raw)?;
        if reply.status.is_success() {
            return Ok(Some(tcp));
        }

        tracing::debug!(
            status = reply.status.as_u16(),
            target = %authority,
            "proxy refused CONNECT"
        );
        self.response = Some(ResponseHead {
            status: reply.status,
            reason: reply.reason,
            headers: reply.headers,
            body: Some(empty_body()),
        });
        self.link = Link::Closed;
        Ok(None)
    }

    async fn tls_handshake(
        &self,
        tcp: TcpStream,
        host: &str,
        port: u16,
    ) -> Result<TlsStream<TcpStream>, ConnectionError> {
        let settings = self
            .tls
            .as_ref()
            .ok_or_else(|| ConnectionError::Protocol("TLS settings missing".to_owned()))?;
        let managers = match &settings.managers {
            Some(managers) => managers.clone(),
            None => settings.default_trust_managers(None)?,
        };

        let provider = tls::crypto_provider();
        let verifier = Arc::new(
            TrustManagerCertVerifier::from_managers(&managers, Arc::clone(&provider))
                .map_err(tls_error)?,
        );
        let mut config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(tls_error)?
            .dangerous()
            .with_custom_certificate_verifier(Arc::clone(&verifier) as Arc<dyn rustls::client::danger::ServerCertVerifier>)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let server_name = ServerName::try_from(host.to_owned()).map_err(tls_error)?;
        let connector = TlsConnector::from(Arc::new(config));
        let stream = match within(self.connect_timeout, connector.connect(server_name, tcp)).await? {
            Ok(stream) => stream,
            Err(_) if verifier.was_rejected_by_callback() => {
                return Err(ConnectionError::Tls(Box::new(ChainRejectedError)));
            }
            Err(e) => return Err(tls_error(e)),
        };

        let session = EstablishedSession::capture(stream.get_ref().1, host, port);
        let hostname_verifier = settings
            .hostname_verifier
            .clone()
            .unwrap_or_else(|| settings.default_hostname_verifier());
        if !hostname_verifier.verify(host, &session) {
            return Err(ConnectionError::Tls(
                format!("certificate is not valid for {host}").into(),
            ));
        }
        Ok(stream)
    }

    async fn start_http<S>(&mut self, stream: S) -> Result<(), ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (sender, connection) =
            within(self.connect_timeout, http1::handshake(TokioIo::new(stream))).await??;
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(error = %e, "HTTP connection ended with error");
            }
        });
        self.link = Link::Open { sender, driver };
        Ok(())
    }

    fn build_request(&mut self) -> Result<http::Request<RequestBodyStream>, ConnectionError> {
        let absolute = self.uses_absolute_form();
        let target = if absolute {
            self.url[..Position::AfterQuery].to_owned()
        } else {
            self.url[Position::BeforePath..Position::AfterQuery].to_owned()
        };
        let uri: http::Uri = target
            .parse()
            .map_err(|e: http::uri::InvalidUri| ConnectionError::Protocol(e.to_string()))?;

        let mut headers = self.headers.clone();
        if !headers.contains_key(header::HOST) {
            let host = HeaderValue::from_str(&host_header(&self.url))
                .map_err(|e| ConnectionError::Protocol(e.to_string()))?;
            headers.insert(header::HOST, host);
        }
        if !absolute {
            headers.remove(header::PROXY_AUTHORIZATION);
        }

        let chunks = std::mem::take(&mut self.body);
        let body = match self.body_length {
            Some(BodyLength::Fixed(length)) => {
                headers.remove(header::TRANSFER_ENCODING);
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
                buffered(chunks)
            }
            Some(BodyLength::Chunked) => {
                headers.remove(header::CONTENT_LENGTH);
                streamed(chunks)
            }
            None => buffered(chunks),
        };

        let mut request = http::Request::new(body);
        *request.method_mut() = self.method.clone();
        *request.uri_mut() = uri;
        *request.headers_mut() = headers;
        Ok(request)
    }
}

impl RequestTarget for HyperConnection {
    fn url(&self) -> &Url {
        &self.url
    }

    fn method(&self) -> &Method {
        &self.method
    }
}

#[async_trait]
impl Connection for HyperConnection {
    fn set_method(&mut self, method: Method) -> Result<(), ConnectionError> {
        if !matches!(self.link, Link::Idle) || self.response.is_some() {
            return Err(ConnectionError::Protocol(
                "method cannot change after connecting".to_owned(),
            ));
        }
        self.method = method;
        Ok(())
    }

    fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.insert(name, value);
    }

    fn set_timeouts(&mut self, connect: Option<Duration>, read: Option<Duration>) {
        self.connect_timeout = connect;
        self.read_timeout = read;
    }

    fn set_body_length(&mut self, length: BodyLength) {
        self.body_length = Some(length);
    }

    fn tls_settings(&mut self) -> Option<&mut dyn TlsSettings> {
        self.tls.as_mut().map(|tls| tls as &mut dyn TlsSettings)
    }

    async fn connect(&mut self) -> Result<(), ConnectionError> {
        if !matches!(self.link, Link::Idle) || self.response.is_some() {
            return Ok(());
        }

        let (host, port) = endpoint(&self.url)?;
        let (dial_host, dial_port) = match &self.proxy {
            Some(proxy) => endpoint(proxy)?,
            None => (host.clone(), port),
        };
        tracing::debug!(
            host = %dial_host,
            port = dial_port,
            proxied = self.proxy.is_some(),
            "opening connection"
        );

        let tcp = within(
            self.connect_timeout,
            TcpStream::connect((dial_host.as_str(), dial_port)),
        )
        .await?
        .map_err(|e| ConnectionError::Connect(Box::new(e)))?;
        tcp.set_nodelay(true)?;

        if self.tls.is_none() {
            return self.start_http(tcp).await;
        }

        let tcp = if self.proxy.is_some() {
            match self.open_tunnel(tcp, &host, port).await? {
                Some(tcp) => tcp,
                None => return Ok(()),
            }
        } else {
            tcp
        };
        let stream = self.tls_handshake(tcp, &host, port).await?;
        self.start_http(stream).await
    }

    async fn write_body(&mut self, chunk: Bytes) -> Result<(), ConnectionError> {
        if self.response.is_some() {
            return Err(ConnectionError::Protocol("request already sent".to_owned()));
        }
        if !chunk.is_empty() {
            self.body.push(chunk);
        }
        Ok(())
    }

    async fn status_code(&mut self) -> Result<StatusCode, ConnectionError> {
        if let Some(head) = &self.response {
            return Ok(head.status);
        }
        self.connect().await?;
        if let Some(head) = &self.response {
            return Ok(head.status);
        }

        let request = self.build_request()?;
        let read_timeout = self.read_timeout;
        let Link::Open { sender, .. } = &mut self.link else {
            return Err(ConnectionError::Protocol("connection is closed".to_owned()));
        };
        within(read_timeout, sender.ready()).await??;
        let response = within(read_timeout, sender.send_request(request)).await??;

        let (parts, body) = response.into_parts();
        let status = parts.status;
        let reason = parts
            .extensions
            .get::<hyper::ext::ReasonPhrase>()
            .map(|phrase| String::from_utf8_lossy(phrase.as_bytes()).into_owned())
            .or_else(|| status.canonical_reason().map(str::to_owned));
        tracing::debug!(status = status.as_u16(), url = %self.url, "response head received");

        self.response = Some(ResponseHead {
            status,
            reason,
            headers: parts.headers,
            body: Some(body.map_err(BoxError::from).boxed()),
        });
        Ok(status)
    }

    fn response_message(&self) -> Option<String> {
        self.response.as_ref().and_then(|head| head.reason.clone())
    }

    fn header_fields(&self) -> HeaderMap {
        self.response
            .as_ref()
            .map(|head| head.headers.clone())
            .unwrap_or_default()
    }

    fn input_stream(&mut self) -> Result<ResponseBody, ConnectionError> {
        let head = self
            .response
            .as_mut()
            .ok_or_else(|| ConnectionError::Protocol("status has not been read".to_owned()))?;
        if head.is_error() {
            return Err(ConnectionError::Protocol(format!(
                "no input stream for status {}",
                head.status
            )));
        }
        head.body
            .take()
            .ok_or_else(|| ConnectionError::Protocol("response body already taken".to_owned()))
    }

    fn error_stream(&mut self) -> Option<ResponseBody> {
        let head = self.response.as_mut().filter(|head| head.is_error())?;
        head.body.take()
    }

    async fn disconnect(&mut self) {
        if let Link::Open { driver, .. } = std::mem::replace(&mut self.link, Link::Closed) {
            driver.abort();
        }
        if let Some(head) = &mut self.response {
            head.body = None;
        }
        self.body.clear();
    }
}

async fn within<F: Future>(limit: Option<Duration>, fut: F) -> Result<F::Output, ConnectionError> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| ConnectionError::Timeout(limit)),
        None => Ok(fut.await),
    }
}

fn tls_error(err: impl std::error::Error + Send + Sync + 'static) -> ConnectionError {
    ConnectionError::Tls(Box::new(err))
}

fn endpoint(url: &Url) -> Result<(String, u16), ConnectionError> {
    let host = url
        .host_str()
        .ok_or_else(|| ConnectionError::Protocol(format!("{url} has no host")))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| ConnectionError::UnknownService(url.scheme().to_owned()))?;
    Ok((host.trim_matches(['[', ']']).to_owned(), port))
}

fn authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// `Host` value for `url`; the port is omitted when it is the scheme default.
fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    }
}

fn buffered(mut chunks: Vec<Bytes>) -> RequestBodyStream {
    let data = if chunks.len() <= 1 {
        chunks.pop().unwrap_or_default()
    } else {
        Bytes::from(chunks.concat())
    };
    Full::new(data).map_err(|never| match never {}).boxed()
}

fn streamed(chunks: Vec<Bytes>) -> RequestBodyStream {
    let frames = chunks
        .into_iter()
        .map(|chunk| Ok::<_, BoxError>(Frame::data(chunk)));
    StreamBody::new(futures::stream::iter(frames)).boxed()
}

async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>, ConnectionError> {
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_PROXY_HEAD {
            return Err(ConnectionError::Protocol(
                "proxy reply head too large".to_owned(),
            ));
        }
        if stream.read(&mut byte).await? == 0 {
            return Err(ConnectionError::Protocol(
                "proxy closed the connection during CONNECT".to_owned(),
            ));
        }
        head.push(byte[0]);
    }
    Ok(head)
}

fn parse_proxy_reply(raw: &[u8]) -> Result<ProxyReply, ConnectionError> {
    let malformed = |what: &str| ConnectionError::Protocol(format!("malformed proxy reply: {what}"));

    let text = std::str::from_utf8(raw).map_err(|_| malformed("not UTF-8"))?;
    let mut lines = text.split("\r\n");
    let mut status_line = lines.next().unwrap_or_default().splitn(3, ' ');
    if !status_line
        .next()
        .is_some_and(|version| version.starts_with("HTTP/1."))
    {
        return Err(malformed("bad version"));
    }
    let status = status_line
        .next()
        .and_then(|code| StatusCode::from_bytes(code.as_bytes()).ok())
        .ok_or_else(|| malformed("bad status"))?;
    let reason = status_line
        .next()
        .map(str::trim)
        .filter(|reason| !reason.is_empty())
        .map(str::to_owned);

    let mut headers = HeaderMap::new();
    for line in lines.take_while(|line| !line.is_empty()) {
        let (name, value) = line.split_once(':').ok_or_else(|| malformed("bad header"))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| malformed("bad header name"))?;
        let value = HeaderValue::from_str(value.trim()).map_err(|_| malformed("bad header value"))?;
        headers.append(name, value);
    }

    Ok(ProxyReply {
        status,
        reason,
        headers,
    })
}
