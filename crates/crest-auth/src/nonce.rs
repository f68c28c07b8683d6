//! Replay-protection nonce cache.
//!
//! Process-wide map of nonces accepted inside the HMAC request-freshness
//! window. Insertion is linearized by a small critical section; sweeping is
//! idempotent and happens opportunistically during inserts. A restart
//! invalidates the replay window — documented, best-effort behavior.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

/// Nonces older than this are swept.
const RETENTION: Duration = Duration::days(1);
/// Minimum interval between opportunistic sweeps.
const SWEEP_INTERVAL: Duration = Duration::minutes(10);

#[derive(Debug)]
struct Inner {
    seen: HashMap<String, DateTime<Utc>>,
    last_sweep: DateTime<Utc>,
}

#[derive(Debug)]
pub struct NonceCache {
    inner: Mutex<Inner>,
}

impl NonceCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                seen: HashMap::new(),
                last_sweep: Utc::now(),
            }),
        }
    }

    /// Record a nonce. Returns `false` when the nonce was already present
    /// (replay); `true` when it was inserted.
    pub fn insert_if_absent(&self, nonce: &str) -> bool {
        let now = Utc::now();
        let mut inner = self.inner.lock().expect("nonce cache poisoned");

        if now - inner.last_sweep > SWEEP_INTERVAL {
            inner.seen.retain(|_, seen_at| now - *seen_at < RETENTION);
            inner.last_sweep = now;
        }

        match inner.seen.entry(nonce.to_string()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    /// Membership probe without insertion. The authoritative replay gate is
    /// still [`Self::insert_if_absent`] after all other checks pass.
    pub fn contains(&self, nonce: &str) -> bool {
        self.inner
            .lock()
            .expect("nonce cache poisoned")
            .seen
            .contains_key(nonce)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("nonce cache poisoned").seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for NonceCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_nonce_is_rejected() {
        let cache = NonceCache::new();
        assert!(cache.insert_if_absent("abc"));
        assert!(!cache.insert_if_absent("abc"));
        assert!(cache.insert_if_absent("def"));
        assert_eq!(cache.len(), 2);
    }
}
