//! Multi-round `NTLM` / `Negotiate` authentication.
//!
//! Unlike Basic and Digest, these schemes need the engine to resend the
//! request itself: each round feeds the server's token into a
//! [`SecurityContext`] and sends the next token back, until the context
//! completes or the server stops challenging. The security package itself is
//! supplied by the caller through a [`SecurityContextFactory`].

mod handshake;
mod target;

pub(crate) use handshake::{NegotiateChallenge, Negotiator, Resend};
pub use target::{HostResolver, SystemResolver, service_principal_name};

use crate::credentials::NetworkCredential;
use bitflags::bitflags;
use thiserror::Error;

/// Upper bound on request rounds in one handshake.
pub const MAX_ROUNDS: u32 = 10;

bitflags! {
    /// Context requirements passed to the security package.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ContextFlags: u32 {
        /// Connection-oriented context
        const CONNECTION = 0x0000_0800;
        /// Request message integrity; not asked of proxies
        const INIT_INTEGRITY = 0x0001_0000;
    }
}

impl ContextFlags {
    /// Flags for an origin (`false`) or proxy (`true`) handshake.
    #[must_use]
    pub fn for_target(is_proxy: bool) -> Self {
        if is_proxy {
            ContextFlags::CONNECTION
        } else {
            ContextFlags::CONNECTION | ContextFlags::INIT_INTEGRITY
        }
    }
}

/// Failure reported by a security package.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SecurityError {
    /// The package does not exist on this platform
    #[error("security package '{0}' is not available")]
    UnsupportedPackage(String),

    /// The package rejected a token or its own state
    #[error("security context failed: {0}")]
    Failed(String),
}

/// Client side of one NTLM/Negotiate handshake.
pub trait SecurityContext: Send {
    /// Next base64 token to send, given the server's last token (`None` on
    /// the first round). `Ok(None)` means the package has nothing more to say.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::Failed`] when the server token is rejected.
    fn outgoing_token(&mut self, incoming: Option<&str>) -> Result<Option<String>, SecurityError>;

    /// `true` once the handshake has completed successfully.
    fn is_complete(&self) -> bool;

    /// Release package resources. Called exactly once.
    fn close(&mut self);
}

/// Creates [`SecurityContext`]s for a package (`NTLM`, `Negotiate`).
pub trait SecurityContextFactory: Send + Sync {
    /// Start a client context for `package` targeting `spn`.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::UnsupportedPackage`] if `package` is unknown.
    fn create(
        &self,
        package: &str,
        credential: &NetworkCredential,
        spn: &str,
        flags: ContextFlags,
    ) -> Result<Box<dyn SecurityContext>, SecurityError>;
}

/// `NTLM` or `Negotiate` as written in `challenge`, if it is one of them.
pub(crate) fn supported_auth_type(challenge: &str) -> Option<&str> {
    let scheme = challenge.split(' ').next().unwrap_or_default();
    (scheme.eq_ignore_ascii_case("ntlm") || scheme.eq_ignore_ascii_case("negotiate"))
        .then_some(scheme)
}
