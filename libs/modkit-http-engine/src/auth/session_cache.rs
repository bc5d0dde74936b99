//! Digest session state shared across requests of one engine.

use super::digest::DigestChallenge;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Number of sessions above which stale ones are evicted.
const MAX_SESSIONS: usize = 10;

/// A session unused for this long is stale.
const STALE_AFTER: Duration = Duration::from_secs(10 * 60);

/// Identity of a digest session: target, credential and server nonce.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DigestSessionKey {
    pub uri: String,
    pub user_name: String,
    pub domain: Option<String>,
    pub nonce: String,
}

/// Client side of one digest nonce.
///
/// The client nonce is generated once; the nonce count only grows.
#[derive(Debug)]
pub struct DigestSession {
    challenge: DigestChallenge,
    cnonce: String,
    nonce_count: AtomicU32,
    last_use: Mutex<Instant>,
}

impl DigestSession {
    pub(crate) fn new(challenge: DigestChallenge, cnonce: String, now: Instant) -> Self {
        Self {
            challenge,
            cnonce,
            nonce_count: AtomicU32::new(0),
            last_use: Mutex::new(now),
        }
    }

    pub(crate) fn challenge(&self) -> &DigestChallenge {
        &self.challenge
    }

    #[must_use]
    pub fn cnonce(&self) -> &str {
        &self.cnonce
    }

    /// Increment and return the nonce count.
    pub fn next_nonce_count(&self) -> u32 {
        self.nonce_count.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    /// Last value handed out by [`next_nonce_count`](Self::next_nonce_count).
    #[must_use]
    pub fn nonce_count(&self) -> u32 {
        self.nonce_count.load(Ordering::Acquire)
    }

    fn touch(&self, now: Instant) {
        *self.last_use.lock() = now;
    }

    fn is_stale(&self, now: Instant) -> bool {
        now.saturating_duration_since(*self.last_use.lock()) > STALE_AFTER
    }
}

/// Bounded digest session cache owned by one engine.
#[derive(Debug, Default)]
pub struct DigestSessionCache {
    sessions: Mutex<HashMap<DigestSessionKey, Arc<DigestSession>>>,
}

impl DigestSessionCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    pub(crate) fn get_or_insert(
        &self,
        key: DigestSessionKey,
        create: impl FnOnce() -> DigestSession,
    ) -> Arc<DigestSession> {
        self.get_or_insert_at(key, create, Instant::now())
    }

    fn get_or_insert_at(
        &self,
        key: DigestSessionKey,
        create: impl FnOnce() -> DigestSession,
        now: Instant,
    ) -> Arc<DigestSession> {
        let mut sessions = self.sessions.lock();

        if let Some(existing) = sessions.get(&key) {
            existing.touch(now);
            return Arc::clone(existing);
        }

        if sessions.len() >= MAX_SESSIONS {
            let before = sessions.len();
            sessions.retain(|_, s| !s.is_stale(now));
            tracing::debug!(evicted = before - sessions.len(), "evicted stale digest sessions");
        }

        let session = Arc::new(create());
        session.touch(now);
        sessions.insert(key, Arc::clone(&session));
        session
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn key(n: usize) -> DigestSessionKey {
        DigestSessionKey {
            uri: "http://example.com/x".to_owned(),
            user_name: "u".to_owned(),
            domain: None,
            nonce: format!("nonce-{n}"),
        }
    }

    fn session(now: Instant) -> DigestSession {
        let challenge = DigestChallenge::parse("Digest realm=\"r\", nonce=\"n\"").unwrap();
        DigestSession::new(challenge, "cnonce".to_owned(), now)
    }

    #[test]
    fn test_same_key_reuses_session() {
        let cache = DigestSessionCache::new();
        let now = Instant::now();

        let first = cache.get_or_insert_at(key(1), || session(now), now);
        assert_eq!(first.next_nonce_count(), 1);

        let again = cache.get_or_insert_at(key(1), || panic!("must reuse"), now);
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(again.next_nonce_count(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_stale_sessions_evicted_when_full() {
        let cache = DigestSessionCache::new();
        let start = Instant::now();

        for n in 0..MAX_SESSIONS {
            cache.get_or_insert_at(key(n), || session(start), start);
        }
        assert_eq!(cache.len(), MAX_SESSIONS);

        // One session stays fresh.
        let later = start + STALE_AFTER + Duration::from_secs(1);
        cache.get_or_insert_at(key(0), || session(later), later);

        cache.get_or_insert_at(key(99), || session(later), later);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_fresh_sessions_are_never_evicted() {
        let cache = DigestSessionCache::new();
        let now = Instant::now();
        for n in 0..=MAX_SESSIONS {
            cache.get_or_insert_at(key(n), || session(now), now);
        }
        assert_eq!(cache.len(), MAX_SESSIONS + 1);
    }

    #[test]
    fn test_nonce_count_is_monotonic_across_threads() {
        let s = Arc::new(session(Instant::now()));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let s = Arc::clone(&s);
                std::thread::spawn(move || (0..250).map(|_| s.next_nonce_count()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 1000);
        assert_eq!(s.nonce_count(), 1000);
    }
}
