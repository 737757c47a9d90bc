//! Replay cache for request nonces.

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;

use parking_lot::Mutex;

use crate::headers::AuthError;

#[derive(Debug, Default)]
struct NonceInner {
    seen: HashMap<String, u64>,
    order: VecDeque<(u64, String)>,
}

impl NonceInner {
    fn purge(&mut self, now: u64) {
        while let Some((expires_at, _)) = self.order.front() {
            if *expires_at > now {
                break;
            }
            if let Some((expires_at, nonce)) = self.order.pop_front() {
                if self.seen.get(&nonce) == Some(&expires_at) {
                    self.seen.remove(&nonce);
                }
            }
        }
    }

    fn sweep(&mut self, now: u64) {
        self.seen.retain(|_, expires_at| *expires_at > now);
        self.order.retain(|(expires_at, _)| *expires_at > now);
    }
}

/// Bounded, time-evicted set of nonces seen inside the freshness window.
///
/// Lookup and insertion happen under one lock so two concurrent requests
/// carrying the same nonce cannot both be admitted.
#[derive(Debug)]
pub struct NonceCache {
    capacity: NonZeroUsize,
    inner: Mutex<NonceInner>,
}

impl NonceCache {
    /// Creates a cache remembering at most `capacity` live nonces.
    #[must_use]
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(NonceInner::default()),
        }
    }

    /// Records `nonce` until `expires_at`, rejecting it if already live.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::ReplayedNonce`] when the nonce is still remembered,
    /// and [`AuthError::ReplayCacheFull`] when the cache is full of live nonces.
    pub fn check_and_insert(&self, nonce: &str, now: u64, expires_at: u64) -> Result<(), AuthError> {
        let mut inner = self.inner.lock();
        inner.purge(now);

        if inner
            .seen
            .get(nonce)
            .is_some_and(|existing| *existing > now)
        {
            return Err(AuthError::ReplayedNonce);
        }

        if inner.seen.len() >= self.capacity.get() {
            inner.sweep(now);
            if inner.seen.len() >= self.capacity.get() {
                return Err(AuthError::ReplayCacheFull);
            }
        }

        inner.seen.insert(nonce.to_owned(), expires_at);
        inner.order.push_back((expires_at, nonce.to_owned()));
        Ok(())
    }

    /// Returns the number of remembered nonces, including not-yet-purged ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().seen.len()
    }

    /// Returns `true` when no nonce is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets every nonce.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.seen.clear();
        inner.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn cache(capacity: usize) -> NonceCache {
        NonceCache::new(NonZeroUsize::new(capacity).unwrap())
    }

    #[test]
    fn second_presentation_is_rejected() {
        let cache = cache(8);
        cache.check_and_insert("n-1", 100, 400).unwrap();
        assert!(matches!(
            cache.check_and_insert("n-1", 150, 450),
            Err(AuthError::ReplayedNonce)
        ));
    }

    #[test]
    fn expired_nonces_are_evicted() {
        let cache = cache(8);
        cache.check_and_insert("n-1", 100, 400).unwrap();
        cache.check_and_insert("n-2", 100, 500).unwrap();
        cache.check_and_insert("n-3", 401, 700).unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn full_cache_of_live_nonces_fails_closed() {
        let cache = cache(2);
        cache.check_and_insert("a", 0, 100).unwrap();
        cache.check_and_insert("b", 0, 100).unwrap();
        assert!(matches!(
            cache.check_and_insert("c", 10, 110),
            Err(AuthError::ReplayCacheFull)
        ));
        cache.check_and_insert("c", 100, 200).unwrap();
    }

    #[test]
    fn concurrent_presentations_admit_exactly_one() {
        let cache = Arc::new(cache(64));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || cache.check_and_insert("shared", 10, 310).is_ok())
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 1);
    }
}
