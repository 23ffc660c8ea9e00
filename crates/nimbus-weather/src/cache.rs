//! In-memory TTL cache shared by every fetcher in the process.
//!
//! Expiry is checked lazily: an entry past its deadline is removed by the read
//! that finds it. Nothing is swept in the background and nothing is persisted.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::types::{ApiQuery, RequestKind};

/// A cached value with the moment it was written and the moment it stops being visible.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
    pub data: V,
    pub timestamp: Instant,
    pub expires_at: Instant,
}

impl<V> CacheEntry<V> {
    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.timestamp)
    }

    /// True while the entry is younger than `window`.
    pub fn is_fresh_within(&self, window: Duration) -> bool {
        self.age() <= window
    }
}

/// Thread-safe in-memory cache keyed by request key.
///
/// Cloning the handle shares the underlying map.
#[derive(Debug)]
pub struct TtlCache<V> {
    entries: Arc<Mutex<HashMap<String, CacheEntry<V>>>>,
}

impl<V> Clone for TtlCache<V> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<V> Default for TtlCache<V> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<V: Clone> TtlCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `key` for `ttl`, replacing any previous entry.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let now = Instant::now();
        let entry = CacheEntry {
            data: value,
            timestamp: now,
            expires_at: now + ttl,
        };
        self.entries.lock().insert(key.into(), entry);
    }

    /// The live entry for `key`. An expired entry is removed and `None` returned.
    /// Reading never extends the TTL.
    pub fn get(&self, key: &str) -> Option<CacheEntry<V>> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            None => return None,
            Some(entry) => Instant::now() > entry.expires_at,
        };

        if expired {
            entries.remove(key);
            tracing::debug!(key, "Cache entry expired");
            return None;
        }

        entries.get(key).cloned()
    }

    pub fn delete(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of stored entries, including expired ones not yet read.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Deterministic key for a request: kind plus parameters sorted by name,
/// e.g. `current:lat=21.028&lon=105.854` or `forecast:q=Hanoi`.
pub fn cache_key(kind: RequestKind, query: &ApiQuery) -> String {
    let mut params = query.params();
    params.sort_by(|a, b| a.0.cmp(b.0));

    let joined = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    format!("{}:{}", kind.as_str(), joined)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;
    use crate::types::Coordinates;

    #[tokio::test(start_paused = true)]
    async fn test_basic_operations() {
        let cache = TtlCache::new();

        assert!(cache.get("key1").is_none());

        cache.set("key1", "value1".to_string(), Duration::from_secs(60));
        assert_eq!(cache.get("key1").map(|e| e.data), Some("value1".to_string()));

        // Overwrite
        cache.set("key1", "value2".to_string(), Duration::from_secs(60));
        assert_eq!(cache.get("key1").map(|e| e.data), Some("value2".to_string()));

        cache.delete("key1");
        assert!(cache.get("key1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_visible_until_expiry_then_removed() {
        let cache = TtlCache::new();
        cache.set("key1", 1_u32, Duration::from_millis(1000));

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(cache.get("key1").is_some());

        tokio::time::advance(Duration::from_millis(2)).await;
        assert!(cache.get("key1").is_none());
        // The expired read evicted it
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_does_not_refresh_ttl() {
        let cache = TtlCache::new();
        cache.set("key1", 1_u32, Duration::from_millis(100));

        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(cache.get("key1").is_some());
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(cache.get("key1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_age_and_freshness() {
        let cache = TtlCache::new();
        cache.set("key1", 1_u32, Duration::from_secs(300));

        tokio::time::advance(Duration::from_secs(50)).await;
        let entry = cache.get("key1").unwrap();
        assert_eq!(entry.age(), Duration::from_secs(50));
        assert!(!entry.is_fresh_within(Duration::from_secs(45)));
        assert!(entry.is_fresh_within(Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clones_share_entries() {
        let cache = TtlCache::new();
        let other = cache.clone();

        cache.set("key1", 1_u32, Duration::from_secs(1));
        cache.set("key2", 2_u32, Duration::from_secs(1));
        assert_eq!(other.len(), 2);

        other.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_key_is_sorted_and_kind_scoped() {
        let coords = ApiQuery::Coords(Coordinates::new(21.028, 105.854));
        assert_eq!(
            cache_key(RequestKind::Current, &coords),
            "current:lat=21.028&lon=105.854"
        );
        assert_eq!(
            cache_key(RequestKind::Forecast, &ApiQuery::City("Hanoi".into())),
            "forecast:q=Hanoi"
        );
    }
}
