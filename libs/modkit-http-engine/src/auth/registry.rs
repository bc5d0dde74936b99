use super::{
    AuthModule, AuthenticationData, AuthenticationScheme, BasicAuthModule, DigestAuthModule,
    DigestSessionCache,
};
use std::sync::Arc;

/// Maps a challenge to the module that answers it.
///
/// Each engine owns one registry, so digest sessions are never shared
/// between engines.
#[derive(Clone)]
pub struct AuthModuleRegistry {
    basic: Arc<dyn AuthModule>,
    digest: Arc<dyn AuthModule>,
    digest_sessions: Arc<DigestSessionCache>,
}

impl AuthModuleRegistry {
    #[must_use]
    pub fn new() -> Self {
        let digest_sessions = Arc::new(DigestSessionCache::new());
        Self {
            basic: Arc::new(BasicAuthModule),
            digest: Arc::new(DigestAuthModule::new(Arc::clone(&digest_sessions))),
            digest_sessions,
        }
    }

    /// Built-in module for `scheme`; `None` for unsupported schemes.
    #[must_use]
    pub fn find(&self, scheme: AuthenticationScheme) -> Option<Arc<dyn AuthModule>> {
        match scheme {
            AuthenticationScheme::Basic => Some(Arc::clone(&self.basic)),
            AuthenticationScheme::Digest => Some(Arc::clone(&self.digest)),
            AuthenticationScheme::Unsupported => None,
        }
    }

    /// Module for `data`: the caller-supplied one for unsupported schemes,
    /// the built-in one otherwise.
    #[must_use]
    pub fn resolve(&self, data: &AuthenticationData) -> Option<Arc<dyn AuthModule>> {
        match data.scheme {
            AuthenticationScheme::Unsupported => data.auth_module.clone(),
            scheme => self.find(scheme),
        }
    }

    /// Digest session cache of this registry.
    #[must_use]
    pub fn digest_sessions(&self) -> &Arc<DigestSessionCache> {
        &self.digest_sessions
    }
}

impl Default for AuthModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AuthModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthModuleRegistry")
            .field("digest_sessions", &self.digest_sessions().len())
            .finish()
    }
}
