//! Token-bounded LRU bookkeeping for cached session snapshots.
//!
//! The budget is expressed in estimated tokens across all cached sessions,
//! not in entry or session counts: one giant conversation can evict many
//! small ones. The cache only tracks residency — appends are durable before
//! a snapshot is ever cached, so eviction is just a drop.

use openclaw_types::session::SessionKey;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Default cache budget: ~8M estimated tokens of history.
pub const DEFAULT_CACHE_TOKENS: u64 = 8_000_000;

struct CacheEntry {
    weight: u64,
    last_access: u64,
}

/// LRU by last access, bounded by total weight.
pub struct TokenLru {
    max_tokens: u64,
    inner: Mutex<LruInner>,
}

struct LruInner {
    entries: HashMap<SessionKey, CacheEntry>,
    total: u64,
    clock: u64,
}

impl TokenLru {
    pub fn new(max_tokens: u64) -> Self {
        Self {
            max_tokens,
            inner: Mutex::new(LruInner {
                entries: HashMap::new(),
                total: 0,
                clock: 0,
            }),
        }
    }

    /// Record residency (or a weight change) for a key and return the keys
    /// that must be evicted to get back under budget. The caller drops the
    /// snapshots; the returned keys never include the one just touched.
    #[must_use]
    pub fn touch(&self, key: &SessionKey, weight: u64) -> Vec<SessionKey> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        inner.clock += 1;
        let clock = inner.clock;

        if let Some(existing) = inner.entries.get_mut(key) {
            inner.total = inner.total - existing.weight + weight;
            existing.weight = weight;
            existing.last_access = clock;
        } else {
            inner.entries.insert(
                key.clone(),
                CacheEntry {
                    weight,
                    last_access: clock,
                },
            );
            inner.total += weight;
        }

        let mut evicted = Vec::new();
        while inner.total > self.max_tokens && inner.entries.len() > 1 {
            let victim = inner
                .entries
                .iter()
                .filter(|(k, _)| *k != key)
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());
            match victim {
                Some(victim) => {
                    if let Some(entry) = inner.entries.remove(&victim) {
                        inner.total -= entry.weight;
                    }
                    evicted.push(victim);
                }
                None => break,
            }
        }
        evicted
    }

    /// Drop a key without eviction side effects (session poisoned or reset).
    pub fn forget(&self, key: &SessionKey) {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        if let Some(entry) = inner.entries.remove(key) {
            inner.total -= entry.weight;
        }
    }

    /// Current total weight, for diagnostics.
    pub fn total_tokens(&self) -> u64 {
        self.inner.lock().total
    }

    pub fn resident_count(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u32) -> SessionKey {
        format!("agent:main:telegram:dm:u{n}").parse().unwrap()
    }

    #[test]
    fn test_under_budget_no_eviction() {
        let lru = TokenLru::new(100);
        assert!(lru.touch(&key(1), 40).is_empty());
        assert!(lru.touch(&key(2), 40).is_empty());
        assert_eq!(lru.total_tokens(), 80);
        assert_eq!(lru.resident_count(), 2);
    }

    #[test]
    fn test_evicts_least_recent_first() {
        let lru = TokenLru::new(100);
        let _ = lru.touch(&key(1), 40);
        let _ = lru.touch(&key(2), 40);
        let _ = lru.touch(&key(1), 40); // refresh 1; 2 is now oldest
        let evicted = lru.touch(&key(3), 40);
        assert_eq!(evicted, vec![key(2)]);
        assert_eq!(lru.total_tokens(), 80);
    }

    #[test]
    fn test_touched_key_never_evicted() {
        let lru = TokenLru::new(100);
        let _ = lru.touch(&key(1), 10);
        // A single session bigger than the whole budget stays resident.
        let evicted = lru.touch(&key(2), 500);
        assert_eq!(evicted, vec![key(1)]);
        assert_eq!(lru.resident_count(), 1);
    }

    #[test]
    fn test_weight_update_adjusts_total() {
        let lru = TokenLru::new(1000);
        let _ = lru.touch(&key(1), 100);
        let _ = lru.touch(&key(1), 250);
        assert_eq!(lru.total_tokens(), 250);
        assert_eq!(lru.resident_count(), 1);
    }

    #[test]
    fn test_forget() {
        let lru = TokenLru::new(1000);
        let _ = lru.touch(&key(1), 100);
        lru.forget(&key(1));
        assert_eq!(lru.total_tokens(), 0);
        assert_eq!(lru.resident_count(), 0);
    }
}
