//! Shared TTL cache over a keyed store.
//!
//! The cache is never a source of request failure: store and encoding errors
//! are logged and degrade to a miss, a `false` write or a zero count.
//!
//! Keys are caller-chosen strings. The cache does no namespacing of its own,
//! so callers should prefix keys by feature (`api_stats:24h`, `user:42:profile`).

mod codec;

pub use codec::{decode, encode, Blob, Encoded, Encoding};

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::config::CacheConfig;
use crate::store::{KeyedStore, StoreStats};

/// TTL used when neither the call nor the configuration names one.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// Counters reported by the backing store.
pub type CacheStats = StoreStats;

/// Generic get/set cache with transparent value encoding.
#[derive(Clone)]
pub struct Cache {
    store: Arc<dyn KeyedStore>,
    default_ttl: Duration,
}

impl Cache {
    /// Create a cache using [`DEFAULT_TTL`].
    pub fn new(store: Arc<dyn KeyedStore>) -> Self {
        Self::with_default_ttl(store, DEFAULT_TTL)
    }

    pub fn from_config(store: Arc<dyn KeyedStore>, config: &CacheConfig) -> Self {
        Self::with_default_ttl(store, config.default_ttl())
    }

    pub fn with_default_ttl(store: Arc<dyn KeyedStore>, default_ttl: Duration) -> Self {
        let default_ttl = if default_ttl.is_zero() { DEFAULT_TTL } else { default_ttl };
        Self { store, default_ttl }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Read and decode the value under `key`.
    ///
    /// A stored `null` reads as a miss, so the two cannot be told apart.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.fetch(key).await?;
        if codec::is_null(&bytes) {
            return None;
        }
        match codec::decode(&bytes) {
            Ok((value, encoding)) => {
                trace!(key = %key, encoding = ?encoding, "Cache hit");
                Some(value)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cache get error");
                None
            }
        }
    }

    /// Read the value under `key` as text, without decoding it.
    pub async fn get_raw(&self, key: &str) -> Option<String> {
        let bytes = self.fetch(key).await?;
        match String::from_utf8(bytes) {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(key = %key, error = %e, "Cache get error");
                None
            }
        }
    }

    /// Encode and store `value`, expiring after `ttl` or the default.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) -> bool {
        let encoded = match codec::encode(value) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache set error");
                return false;
            }
        };
        trace!(key = %key, encoding = ?encoded.encoding, "Encoded cache value");
        self.store_bytes(key, &encoded.bytes, ttl).await
    }

    /// Store the text rendering of `value` without encoding it.
    pub async fn set_raw(&self, key: &str, value: impl Display, ttl: Option<Duration>) -> bool {
        self.store_bytes(key, value.to_string().as_bytes(), ttl).await
    }

    pub async fn delete(&self, key: &str) -> bool {
        match self.store.delete(&[key.to_string()]).await {
            Ok(removed) => removed > 0,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache delete error");
                false
            }
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        match self.store.exists(key).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache exists error");
                false
            }
        }
    }

    /// Delete every key matching a glob pattern, returning how many went.
    ///
    /// Enumeration and deletion are separate round-trips: a key written in
    /// between may survive.
    pub async fn clear_pattern(&self, pattern: &str) -> u64 {
        let keys = match self.store.keys_matching(pattern).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "Cache clear pattern error");
                return 0;
            }
        };
        if keys.is_empty() {
            return 0;
        }
        match self.store.delete(&keys).await {
            Ok(removed) => {
                debug!(pattern = %pattern, removed = removed, "Cleared cache keys");
                removed
            }
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "Cache clear pattern error");
                0
            }
        }
    }

    /// Return the cached value, or compute, store and return it.
    ///
    /// Concurrent misses on the same key each run `producer`; the last write
    /// wins.
    pub async fn get_or_compute<T, F, Fut>(&self, key: &str, producer: F, ttl: Option<Duration>) -> T
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if let Some(value) = self.get(key).await {
            return value;
        }
        let value = producer().await;
        self.set(key, &value, ttl).await;
        value
    }

    /// Like [`get_or_compute`](Self::get_or_compute) with a fallible producer.
    ///
    /// A producer error is returned as-is and nothing is cached.
    pub async fn try_get_or_compute<T, E, F, Fut>(
        &self,
        key: &str,
        producer: F,
        ttl: Option<Duration>,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }
        let value = producer().await?;
        self.set(key, &value, ttl).await;
        Ok(value)
    }

    /// Store-level hit/miss and resource counters.
    pub async fn stats(&self) -> Option<CacheStats> {
        match self.store.stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(error = %e, "Cache stats error");
                None
            }
        }
    }

    async fn fetch(&self, key: &str) -> Option<Vec<u8>> {
        match self.store.get(key).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache get error");
                None
            }
        }
    }

    async fn store_bytes(&self, key: &str, bytes: &[u8], ttl: Option<Duration>) -> bool {
        let ttl_secs = self.ttl_secs(ttl);
        match self.store.set_with_expiry(key, bytes, ttl_secs).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache set error");
                false
            }
        }
    }

    /// Whole seconds to expire after; zero or missing falls back to the
    /// default and sub-second TTLs round up.
    fn ttl_secs(&self, ttl: Option<Duration>) -> u64 {
        let ttl = ttl.filter(|ttl| !ttl.is_zero()).unwrap_or(self.default_ttl);
        let secs = ttl.as_secs();
        if ttl.subsec_nanos() > 0 {
            secs.saturating_add(1)
        } else {
            secs
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryStore;
    use serde::Deserialize;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache() -> (Cache, Arc<InMemoryStore>, ManualClock) {
        let clock = ManualClock::at_unix(1_700_000_000);
        let store = Arc::new(InMemoryStore::new(Arc::new(clock.clone())));
        (Cache::new(store.clone()), store, clock)
    }

    #[tokio::test]
    async fn test_round_trip_and_expiry() {
        let (cache, _store, clock) = cache();

        assert!(cache.set("k", &json!({"a": 1}), Some(Duration::from_secs(5))).await);
        let value: Option<serde_json::Value> = cache.get("k").await;
        assert_eq!(value, Some(json!({"a": 1})));

        clock.advance(Duration::from_secs(5));
        let value: Option<serde_json::Value> = cache.get("k").await;
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_default_ttl_applies() {
        let (cache, _store, clock) = cache();

        assert!(cache.set("k", &1u32, None).await);
        clock.advance(Duration::from_secs(3599));
        assert_eq!(cache.get::<u32>("k").await, Some(1));
        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.get::<u32>("k").await, None);
    }

    #[tokio::test]
    async fn test_zero_ttl_uses_default() {
        let (cache, _store, clock) = cache();

        assert!(cache.set("k", "v", Some(Duration::ZERO)).await);
        clock.advance(Duration::from_secs(60));
        assert_eq!(cache.get::<String>("k").await, Some("v".to_string()));
    }

    #[test]
    fn test_sub_second_ttl_rounds_up() {
        let (cache, _store, _clock) = cache();
        assert_eq!(cache.ttl_secs(Some(Duration::from_millis(1500))), 2);
        assert_eq!(cache.ttl_secs(Some(Duration::from_millis(200))), 1);
        assert_eq!(cache.ttl_secs(None), 3600);
    }

    #[tokio::test]
    async fn test_blob_round_trips_through_binary_path() {
        let (cache, store, _clock) = cache();
        let blob = Blob(vec![0x00, 0xff, 0xfe, 0x80, 0x7f]);

        assert!(cache.set("blob", &blob, None).await);
        let raw = store.get("blob").await.unwrap().unwrap();
        assert!(serde_json::from_slice::<serde_json::Value>(&raw).is_err());

        assert_eq!(cache.get::<Blob>("blob").await, Some(blob));
    }

    #[tokio::test]
    async fn test_json_unfriendly_value_round_trips() {
        let (cache, _store, _clock) = cache();
        let mut value = BTreeMap::new();
        value.insert(vec![1u8, 2], 3u64);

        assert!(cache.set("map", &value, None).await);
        assert_eq!(cache.get::<BTreeMap<Vec<u8>, u64>>("map").await, Some(value));
    }

    #[tokio::test]
    async fn test_stored_null_reads_as_miss() {
        let (cache, _store, _clock) = cache();

        assert!(cache.set("k", &Option::<u32>::None, None).await);
        assert!(cache.exists("k").await);
        assert_eq!(cache.get::<Option<u32>>("k").await, None);
    }

    #[tokio::test]
    async fn test_undecodable_value_is_a_miss() {
        let (cache, store, _clock) = cache();
        store.set_with_expiry("k", &[0xc1], 60).await.unwrap();
        assert_eq!(cache.get::<u32>("k").await, None);
    }

    #[tokio::test]
    async fn test_reading_with_the_wrong_type_is_a_miss() {
        let (cache, _store, _clock) = cache();

        assert!(cache.set("obj", &json!({"a": 1}), None).await);
        assert_eq!(cache.get::<u8>("obj").await, None);

        assert!(cache.set("s", "abc", None).await);
        assert_eq!(cache.get::<u32>("s").await, None);

        assert!(cache.set_raw("r", "hello", None).await);
        assert_eq!(cache.get::<u64>("r").await, None);
        assert_eq!(cache.get_raw("r").await, Some("hello".to_string()));
    }

    #[tokio::test]
    async fn test_raw_text_path() {
        let (cache, _store, _clock) = cache();

        assert!(cache.set_raw("k", 42, None).await);
        assert_eq!(cache.get_raw("k").await, Some("42".to_string()));
        assert_eq!(cache.get::<u32>("k").await, Some(42));
    }

    #[tokio::test]
    async fn test_delete_and_exists() {
        let (cache, _store, _clock) = cache();

        cache.set("k", "v", None).await;
        assert!(cache.exists("k").await);
        assert!(cache.delete("k").await);
        assert!(!cache.exists("k").await);
        assert!(!cache.delete("k").await);
    }

    #[tokio::test]
    async fn test_clear_pattern() {
        let (cache, _store, _clock) = cache();
        for key in ["ns:1", "ns:2", "other:1"] {
            cache.set(key, "v", None).await;
        }

        assert_eq!(cache.clear_pattern("ns:*").await, 2);
        assert!(!cache.exists("ns:1").await);
        assert!(!cache.exists("ns:2").await);
        assert!(cache.exists("other:1").await);
        assert_eq!(cache.clear_pattern("ns:*").await, 0);
    }

    #[tokio::test]
    async fn test_get_or_compute_only_computes_on_miss() {
        let (cache, _store, _clock) = cache();
        let calls = AtomicUsize::new(0);

        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Overview {
            users: u32,
        }

        for _ in 0..3 {
            let value = cache
                .get_or_compute(
                    "overview",
                    || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Overview { users: 12 }
                    },
                    Some(Duration::from_secs(300)),
                )
                .await;
            assert_eq!(value, Overview { users: 12 });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_try_get_or_compute_does_not_cache_errors() {
        let (cache, _store, _clock) = cache();

        let result: Result<u32, &str> = cache
            .try_get_or_compute("k", || async { Err("upstream down") }, None)
            .await;
        assert_eq!(result, Err("upstream down"));
        assert!(!cache.exists("k").await);

        let result: Result<u32, &str> = cache.try_get_or_compute("k", || async { Ok(7) }, None).await;
        assert_eq!(result, Ok(7));
        assert_eq!(cache.get::<u32>("k").await, Some(7));
    }

    #[tokio::test]
    async fn test_store_outage_degrades_quietly() {
        let (cache, store, _clock) = cache();
        cache.set("k", "v", None).await;
        store.set_offline(true);

        assert_eq!(cache.get::<String>("k").await, None);
        assert!(!cache.set("k", "w", None).await);
        assert!(!cache.delete("k").await);
        assert!(!cache.exists("k").await);
        assert_eq!(cache.clear_pattern("*").await, 0);
        assert!(cache.stats().await.is_none());

        let value = cache.get_or_compute("k", || async { 9u32 }, None).await;
        assert_eq!(value, 9);
    }

    #[tokio::test]
    async fn test_stats() {
        let (cache, _store, _clock) = cache();
        cache.set("k", "v", None).await;
        cache.get::<String>("k").await;
        cache.get::<String>("missing").await;

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.keyspace_hits, 1);
        assert_eq!(stats.keyspace_misses, 1);
    }
}
