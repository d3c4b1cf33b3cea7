//! Idempotency stores
//!
//! Consumers record the natural key of every event they have applied and
//! consult the store before doing any work. Two in-memory stores are
//! provided:
//!
//! - [`TtlIdempotencyStore`]: each key expires a fixed time after it was
//!   marked. An expired key reads as absent, so a redelivery after the TTL
//!   is processed again.
//! - [`ProcessedSet`]: remembers a bounded number of keys, evicting the
//!   oldest first.
//!
//! Both use `tokio::time::Instant`, so tests can drive expiry with a paused
//! clock.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

/// Duplicate suppression keyed by an event's natural key
#[async_trait]
pub trait IdempotencyStore<K>: Send + Sync {
    /// Whether `key` was marked and has not expired
    async fn is_processed(&self, key: &K) -> bool;

    /// Record `key` as applied
    async fn mark_processed(&self, key: K);

    /// Drop expired keys, returning how many were removed
    async fn purge_expired(&self) -> usize;

    /// Keys currently held
    async fn len(&self) -> usize;
}

/// Keys that expire a fixed time after being marked
#[derive(Debug)]
pub struct TtlIdempotencyStore<K> {
    ttl: Duration,
    entries: RwLock<HashMap<K, Instant>>,
}

impl<K: Eq + Hash> TtlIdempotencyStore<K> {
    /// Empty store
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Configured TTL
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[async_trait]
impl<K> IdempotencyStore<K> for TtlIdempotencyStore<K>
where
    K: Eq + Hash + Send + Sync,
{
    async fn is_processed(&self, key: &K) -> bool {
        self.entries
            .read()
            .get(key)
            .map(|expires_at| *expires_at > Instant::now())
            .unwrap_or(false)
    }

    async fn mark_processed(&self, key: K) {
        let expires_at = Instant::now() + self.ttl;
        self.entries.write().insert(key, expires_at);
    }

    async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, expires_at| *expires_at > now);
        before - entries.len()
    }

    async fn len(&self) -> usize {
        self.entries.read().len()
    }
}

/// Bounded set of keys with oldest-first eviction
#[derive(Debug)]
pub struct ProcessedSet<K> {
    capacity: usize,
    inner: RwLock<SetInner<K>>,
}

#[derive(Debug)]
struct SetInner<K> {
    keys: HashSet<K>,
    order: VecDeque<K>,
}

impl<K: Eq + Hash + Clone> ProcessedSet<K> {
    /// Empty set holding at most `capacity` keys
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(SetInner {
                keys: HashSet::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Whether `key` is held
    pub fn contains(&self, key: &K) -> bool {
        self.inner.read().keys.contains(key)
    }

    /// Add `key`, evicting the oldest key when full; false if already held
    pub fn insert(&self, key: K) -> bool {
        let mut inner = self.inner.write();
        if inner.keys.contains(&key) {
            return false;
        }
        while inner.order.len() >= self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.keys.remove(&oldest);
                }
                None => break,
            }
        }
        inner.keys.insert(key.clone());
        inner.order.push_back(key);
        true
    }

    /// Keys held
    pub fn size(&self) -> usize {
        self.inner.read().order.len()
    }
}

#[async_trait]
impl<K> IdempotencyStore<K> for ProcessedSet<K>
where
    K: Eq + Hash + Clone + Send + Sync,
{
    async fn is_processed(&self, key: &K) -> bool {
        self.contains(key)
    }

    async fn mark_processed(&self, key: K) {
        self.insert(key);
    }

    async fn purge_expired(&self) -> usize {
        0
    }

    async fn len(&self) -> usize {
        self.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entry_absent_after_ttl() {
        let store = TtlIdempotencyStore::new(Duration::from_secs(3600));
        store.mark_processed(42i64).await;
        assert!(store.is_processed(&42).await);

        tokio::time::advance(Duration::from_secs(3599)).await;
        assert!(store.is_processed(&42).await);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!store.is_processed(&42).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_removes_only_expired() {
        let store = TtlIdempotencyStore::new(Duration::from_secs(60));
        store.mark_processed("old".to_string()).await;
        tokio::time::advance(Duration::from_secs(30)).await;
        store.mark_processed("new".to_string()).await;
        tokio::time::advance(Duration::from_secs(31)).await;

        assert_eq!(store.purge_expired().await, 1);
        assert_eq!(store.len().await, 1);
        assert!(store.is_processed(&"new".to_string()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remark_extends_expiry() {
        let store = TtlIdempotencyStore::new(Duration::from_secs(10));
        store.mark_processed(1u64).await;
        tokio::time::advance(Duration::from_secs(8)).await;
        store.mark_processed(1u64).await;
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(store.is_processed(&1).await);
    }

    #[test]
    fn test_processed_set_evicts_oldest() {
        let set = ProcessedSet::new(3);
        for id in 1..=3i64 {
            assert!(set.insert(id));
        }
        assert!(!set.insert(2));
        assert!(set.insert(4));

        assert_eq!(set.size(), 3);
        assert!(!set.contains(&1));
        assert!(set.contains(&2));
        assert!(set.contains(&4));
    }
}
