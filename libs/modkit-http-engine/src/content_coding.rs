//! `Accept-Encoding` negotiation and response body decompression.
//!
//! The engine advertises only what the caller asked it to decompress. With
//! nothing requested it sends `Accept-Encoding: identity` explicitly so the
//! transport does not negotiate (and silently undo) gzip on its own, which
//! would leave `Content-Length`/`Content-Encoding` describing bytes the caller
//! never sees.

use crate::error::BoxError;
use crate::response::ResponseBody;
use bitflags::bitflags;
use bytes::Bytes;
use http::header::{CONTENT_ENCODING, HeaderValue};
use http::HeaderMap;
use http_body::{Body, Frame};
use http_body_util::BodyExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use pin_project_lite::pin_project;
use std::io::{self, Write};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

bitflags! {
    /// Content codings the engine decompresses on the caller's behalf.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DecompressionMethods: u8 {
        const GZIP = 0b0001;
        const DEFLATE = 0b0010;
        const BROTLI = 0b0100;
        const ALL = Self::GZIP.bits() | Self::DEFLATE.bits() | Self::BROTLI.bits();
    }
}

impl DecompressionMethods {
    /// No decompression; `identity` is advertised.
    pub const NONE: Self = Self::empty();
}

/// A content coding the engine can undo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCoding {
    Gzip,
    Deflate,
    Brotli,
}

impl ContentCoding {
    /// Selection order when a response lists several codings.
    const PRIORITY: [ContentCoding; 3] =
        [ContentCoding::Gzip, ContentCoding::Deflate, ContentCoding::Brotli];

    /// Token used in `Accept-Encoding` / `Content-Encoding`.
    #[must_use]
    pub fn token(self) -> &'static str {
        match self {
            ContentCoding::Gzip => "gzip",
            ContentCoding::Deflate => "deflate",
            ContentCoding::Brotli => "br",
        }
    }

    fn flag(self) -> DecompressionMethods {
        match self {
            ContentCoding::Gzip => DecompressionMethods::GZIP,
            ContentCoding::Deflate => DecompressionMethods::DEFLATE,
            ContentCoding::Brotli => DecompressionMethods::BROTLI,
        }
    }

    fn matches(self, token: &str) -> bool {
        token.eq_ignore_ascii_case(self.token())
            || (self == ContentCoding::Gzip && token.eq_ignore_ascii_case("x-gzip"))
    }
}

/// What to send as `Accept-Encoding` and whether the engine must decompress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptEncoding {
    pub header: HeaderValue,
    pub decompress_locally: bool,
}

/// Build the `Accept-Encoding` advertisement for `methods`.
#[must_use]
pub fn accept_encoding(methods: DecompressionMethods) -> AcceptEncoding {
    let tokens: Vec<&str> = ContentCoding::PRIORITY
        .iter()
        .filter(|c| methods.contains(c.flag()))
        .map(|c| c.token())
        .collect();

    if tokens.is_empty() {
        return AcceptEncoding {
            header: HeaderValue::from_static("identity"),
            decompress_locally: false,
        };
    }

    AcceptEncoding {
        header: HeaderValue::from_static(match tokens.as_slice() {
            ["gzip"] => "gzip",
            ["deflate"] => "deflate",
            ["br"] => "br",
            ["gzip", "deflate"] => "gzip,deflate",
            ["gzip", "br"] => "gzip,br",
            ["deflate", "br"] => "deflate,br",
            _ => "gzip,deflate,br",
        }),
        decompress_locally: true,
    }
}

/// Outward `Content-Encoding` after decompression.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EncodingUpdate {
    /// Leave the header as the server sent it
    #[default]
    Keep,
    /// Every listed coding was undone
    Remove,
    /// Only these codings remain
    Replace(String),
}

/// Header adjustments owed to the caller for one response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContentState {
    pub remove_content_length: bool,
    pub content_encoding: EncodingUpdate,
}

impl ContentState {
    /// Apply to the content headers of the response.
    pub fn apply(&self, headers: &mut HeaderMap) {
        if self.remove_content_length {
            headers.remove(http::header::CONTENT_LENGTH);
        }
        match &self.content_encoding {
            EncodingUpdate::Keep => {}
            EncodingUpdate::Remove => {
                headers.remove(CONTENT_ENCODING);
            }
            EncodingUpdate::Replace(value) => {
                if let Ok(value) = HeaderValue::from_str(value) {
                    headers.insert(CONTENT_ENCODING, value);
                }
            }
        }
    }
}

/// Wrap `body` in a decoder for the first supported coding listed in
/// `headers`' `Content-Encoding`, if the caller requested that coding.
#[must_use]
pub fn decode_body(
    requested: DecompressionMethods,
    headers: &HeaderMap,
    body: ResponseBody,
) -> (ResponseBody, ContentState) {
    let mut codings: Vec<String> = headers
        .get_all(CONTENT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
        .collect();

    let selected = ContentCoding::PRIORITY
        .iter()
        .copied()
        .filter(|c| requested.contains(c.flag()))
        .find(|c| codings.iter().any(|t| c.matches(t)));

    let Some(coding) = selected else {
        return (body, ContentState::default());
    };

    // The header is a set: drop every spelling of the decoded coding and
    // repeated leftovers.
    codings.retain(|t| !coding.matches(t));
    let mut seen = HashSet::new();
    codings.retain(|t| seen.insert(t.to_ascii_lowercase()));
    tracing::debug!(
        coding = coding.token(),
        remaining = codings.len(),
        "decompressing response body"
    );

    let content_encoding = if codings.is_empty() {
        EncodingUpdate::Remove
    } else {
        EncodingUpdate::Replace(codings.join(", "))
    };

    (
        DecompressionBody::new(body, coding).boxed(),
        ContentState {
            remove_content_length: true,
            content_encoding,
        },
    )
}

/// Output buffer shared between a push decoder and the body that drains it.
#[derive(Clone, Default)]
struct SharedSink(Arc<Mutex<Vec<u8>>>);

impl SharedSink {
    fn take(&self) -> Bytes {
        Bytes::from(std::mem::take(&mut *self.0.lock()))
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum Decoder {
    /// `deflate` bodies come both zlib-wrapped and raw; hold bytes until the
    /// header can be inspected
    Sniffing(Vec<u8>, SharedSink),
    Gzip(flate2::write::GzDecoder<SharedSink>),
    Zlib(flate2::write::ZlibDecoder<SharedSink>),
    RawDeflate(flate2::write::DeflateDecoder<SharedSink>),
    Brotli(Box<brotli::DecompressorWriter<SharedSink>>),
}

const BROTLI_BUFFER_SIZE: usize = 4096;

fn looks_like_zlib(header: &[u8]) -> bool {
    match header {
        [cmf, flg, ..] => cmf & 0x0f == 8 && ((u16::from(*cmf) << 8) | u16::from(*flg)) % 31 == 0,
        [cmf] => cmf & 0x0f == 8,
        [] => false,
    }
}

impl Decoder {
    fn new(coding: ContentCoding, sink: SharedSink) -> Self {
        match coding {
            ContentCoding::Gzip => Decoder::Gzip(flate2::write::GzDecoder::new(sink)),
            ContentCoding::Deflate => Decoder::Sniffing(Vec::new(), sink),
            ContentCoding::Brotli => Decoder::Brotli(Box::new(brotli::DecompressorWriter::new(
                sink,
                BROTLI_BUFFER_SIZE,
            ))),
        }
    }

    fn resolve_deflate(header: &[u8], sink: SharedSink) -> Self {
        if looks_like_zlib(header) {
            Decoder::Zlib(flate2::write::ZlibDecoder::new(sink))
        } else {
            Decoder::RawDeflate(flate2::write::DeflateDecoder::new(sink))
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Decoder::Sniffing(buffered, sink) => {
                buffered.extend_from_slice(data);
                if buffered.len() >= 2 {
                    let buffered = std::mem::take(buffered);
                    *self = Self::resolve_deflate(&buffered, sink.clone());
                    self.write(&buffered)?;
                }
                Ok(())
            }
            Decoder::Gzip(d) => d.write_all(data),
            Decoder::Zlib(d) => d.write_all(data),
            Decoder::RawDeflate(d) => d.write_all(data),
            Decoder::Brotli(d) => d.write_all(data),
        }
    }

    fn finish(self) -> io::Result<()> {
        match self {
            Decoder::Sniffing(buffered, sink) => {
                if buffered.is_empty() {
                    return Ok(());
                }
                let mut resolved = Self::resolve_deflate(&buffered, sink);
                resolved.write(&buffered)?;
                resolved.finish()
            }
            Decoder::Gzip(d) => d.finish().map(drop),
            Decoder::Zlib(d) => d.finish().map(drop),
            Decoder::RawDeflate(d) => d.finish().map(drop),
            Decoder::Brotli(mut d) => d.flush(),
        }
    }
}

pin_project! {
    /// Body that decompresses its inner body on the fly.
    pub struct DecompressionBody {
        #[pin]
        inner: ResponseBody,
        decoder: Option<Decoder>,
        sink: SharedSink,
    }
}

impl DecompressionBody {
    #[must_use]
    pub fn new(inner: ResponseBody, coding: ContentCoding) -> Self {
        let sink = SharedSink::default();
        Self {
            inner,
            decoder: Some(Decoder::new(coding, sink.clone())),
            sink,
        }
    }
}

fn decode_error(err: io::Error) -> BoxError {
    Box::new(err)
}

impl Body for DecompressionBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut this = self.project();

        loop {
            let Some(decoder) = this.decoder.as_mut() else {
                return Poll::Ready(None);
            };

            match ready!(this.inner.as_mut().poll_frame(cx)) {
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(data) => {
                        if let Err(e) = decoder.write(&data) {
                            *this.decoder = None;
                            return Poll::Ready(Some(Err(decode_error(e))));
                        }
                        let out = this.sink.take();
                        if !out.is_empty() {
                            return Poll::Ready(Some(Ok(Frame::data(out))));
                        }
                    }
                    Err(trailers) => return Poll::Ready(Some(Ok(trailers))),
                },
                Some(Err(e)) => {
                    *this.decoder = None;
                    return Poll::Ready(Some(Err(e)));
                }
                None => {
                    let finished = this.decoder.take().map_or(Ok(()), Decoder::finish);
                    if let Err(e) = finished {
                        return Poll::Ready(Some(Err(decode_error(e))));
                    }
                    let out = this.sink.take();
                    if out.is_empty() {
                        return Poll::Ready(None);
                    }
                    return Poll::Ready(Some(Ok(Frame::data(out))));
                }
            }
        }
    }
}
