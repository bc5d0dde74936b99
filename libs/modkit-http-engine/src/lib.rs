#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! HTTP request-execution engine for `ModKit`
//!
//! This crate turns one logical HTTP request into as many physical exchanges
//! as it takes to finish it:
//! - Automatic redirects (300/301/302/303/307) with method and body rewriting
//! - Basic and Digest authentication, including pre-authentication
//! - Multi-round NTLM/Negotiate handshakes over a pluggable security package
//! - `Accept-Encoding` negotiation and local gzip/deflate/brotli decoding
//! - A server-certificate validation callback that overrides default trust
//!
//! Sockets, TLS and DNS live behind the [`transport::Transport`] boundary.
//! [`transport::HyperTransport`] (hyper + rustls) is used unless another
//! transport is configured.
//!
//! # Authentication
//!
//! A 401/407 is never retried with guessed credentials. The response lists
//! the offered challenges in
//! [`HttpResponse::requested_authentication`]; re-issue the request with one
//! of them as pre-authentication data. Only NTLM/Negotiate are answered by
//! the engine itself, and only when enabled.
//!
//! # Example
//!
//! ```ignore
//! use modkit_http_engine::{DecompressionMethods, HttpEngine, HttpRequest};
//! use tokio_util::sync::CancellationToken;
//!
//! let engine = HttpEngine::builder()
//!     .automatic_decompression(DecompressionMethods::GZIP | DecompressionMethods::BROTLI)
//!     .max_automatic_redirections(10)
//!     .build()?;
//!
//! let response = engine
//!     .execute(HttpRequest::get("https://example.com/api")?, CancellationToken::new())
//!     .await?;
//!
//! if response.requested_authentication().is_empty() {
//!     println!("{}", response.text().await?);
//! }
//! ```

pub mod auth;
mod builder;
mod config;
mod content_coding;
mod cookies;
mod credentials;
mod engine;
mod error;
mod headers;
pub mod negotiate;
mod redirect;
mod request;
mod response;
mod tls;
pub mod transport;
pub mod trust;

pub use builder::HttpEngineBuilder;
pub use config::{
    DEFAULT_MAX_AUTOMATIC_REDIRECTIONS, DEFAULT_TIMEOUT, HttpEngineConfig, TlsRootConfig,
};
pub use content_coding::{
    AcceptEncoding, ContentCoding, ContentState, DecompressionMethods, EncodingUpdate,
    accept_encoding, decode_body,
};
pub use cookies::{CookieError, CookieJar, MemoryCookieJar};
pub use credentials::{CredentialCache, Credentials, NetworkCredential, Password};
pub use engine::HttpEngine;
pub use error::{BoxError, HttpError};
pub use headers::{is_content_header, joined_value, split_content_headers};
pub use redirect::{RedirectState, RedirectVerdict, decide as decide_redirect};
pub use request::{HttpRequest, OutgoingBody, RequestBodyStream, RequestContent, RequestHead};
pub use response::{HttpResponse, ResponseBody, ResponseContent, empty_body, full_body};
pub use tls::{crypto_provider, native_root_certs};
