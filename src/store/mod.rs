//! Keyed store contract shared by the cache and the limiter.
//!
//! A [`KeyedStore`] is the only place durable state lives. Byte values carry
//! an expiry; score-sets (members tagged with a numeric score) back the
//! limiter's per-key event logs and are mutated through [`KeyedStore::atomic_batch`].

mod memory;
mod redis;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::clock::SystemClock;
use crate::config::StoreConfig;
use crate::error::StoreError;

pub use self::memory::InMemoryStore;
pub use self::redis::RedisStore;

/// One score-set operation inside an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum ScoreSetOp {
    /// Remove members whose score is `<= max_score`.
    Evict { key: String, max_score: f64 },
    /// Count the members of the set.
    Count { key: String },
    /// Add (or re-score) a member.
    Add {
        key: String,
        member: String,
        score: f64,
    },
    /// Set the expiry of the whole set.
    Expire { key: String, ttl_secs: u64 },
}

impl ScoreSetOp {
    pub fn evict(key: impl Into<String>, max_score: f64) -> Self {
        ScoreSetOp::Evict {
            key: key.into(),
            max_score,
        }
    }

    pub fn count(key: impl Into<String>) -> Self {
        ScoreSetOp::Count { key: key.into() }
    }

    pub fn add(key: impl Into<String>, member: impl Into<String>, score: f64) -> Self {
        ScoreSetOp::Add {
            key: key.into(),
            member: member.into(),
            score,
        }
    }

    pub fn expire(key: impl Into<String>, ttl_secs: u64) -> Self {
        ScoreSetOp::Expire {
            key: key.into(),
            ttl_secs,
        }
    }
}

/// Reply to a [`ScoreSetOp`], in the same position as the op in the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchReply {
    /// Number of members removed by an evict.
    Removed(u64),
    /// Number of members counted.
    Count(u64),
    /// Whether an add created a new member.
    Added(bool),
    /// Whether an expire found a key to apply to.
    Expired(bool),
}

impl BatchReply {
    /// The count carried by a `Count` reply.
    pub fn as_count(&self) -> Option<u64> {
        match self {
            BatchReply::Count(n) => Some(*n),
            _ => None,
        }
    }
}

/// Counters a backend reports about itself.
///
/// Fields the backend does not track are `None`.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct StoreStats {
    pub used_memory_human: Option<String>,
    pub connected_clients: Option<u64>,
    pub total_commands_processed: Option<u64>,
    pub keyspace_hits: u64,
    pub keyspace_misses: u64,
}

impl StoreStats {
    /// Share of lookups that found a key, in `[0, 1]`.
    pub fn hit_rate(&self) -> f64 {
        let total = self.keyspace_hits + self.keyspace_misses;
        self.keyspace_hits as f64 / total.max(1) as f64
    }
}

/// Contract over an external key/value store.
///
/// Every operation may fail with a [`StoreError`]; a batch never partially
/// applies.
#[async_trait]
pub trait KeyedStore: Send + Sync {
    /// Read the bytes stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write `value` under `key`, expiring after `ttl_secs`.
    async fn set_with_expiry(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<(), StoreError>;

    /// Delete the given keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Enumerate keys matching a glob-style pattern (`*`, `?`, `[..]`).
    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    /// Execute the ops as one indivisible unit, replies in op order.
    async fn atomic_batch(&self, ops: &[ScoreSetOp]) -> Result<Vec<BatchReply>, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;

    /// Release backend resources. Further calls fail.
    async fn close(&self) {}

    async fn score_set_evict(&self, key: &str, max_score: f64) -> Result<u64, StoreError> {
        match single(self.atomic_batch(&[ScoreSetOp::evict(key, max_score)]).await?)? {
            BatchReply::Removed(n) => Ok(n),
            other => Err(unexpected("evict", other)),
        }
    }

    async fn score_set_count(&self, key: &str) -> Result<u64, StoreError> {
        match single(self.atomic_batch(&[ScoreSetOp::count(key)]).await?)? {
            BatchReply::Count(n) => Ok(n),
            other => Err(unexpected("count", other)),
        }
    }

    async fn score_set_add(&self, key: &str, member: &str, score: f64) -> Result<bool, StoreError> {
        match single(self.atomic_batch(&[ScoreSetOp::add(key, member, score)]).await?)? {
            BatchReply::Added(created) => Ok(created),
            other => Err(unexpected("add", other)),
        }
    }

    async fn score_set_expire(&self, key: &str, ttl_secs: u64) -> Result<bool, StoreError> {
        match single(self.atomic_batch(&[ScoreSetOp::expire(key, ttl_secs)]).await?)? {
            BatchReply::Expired(applied) => Ok(applied),
            other => Err(unexpected("expire", other)),
        }
    }
}

fn single(replies: Vec<BatchReply>) -> Result<BatchReply, StoreError> {
    replies
        .into_iter()
        .next()
        .ok_or_else(|| StoreError::Protocol("empty batch reply".to_string()))
}

fn unexpected(op: &str, reply: BatchReply) -> StoreError {
    StoreError::Protocol(format!("unexpected reply to {op}: {reply:?}"))
}

/// Build the store selected in configuration.
///
/// The Redis backend is pinged once so a bad URL surfaces at startup rather
/// than as a stream of fail-open warnings.
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn KeyedStore>, StoreError> {
    match config {
        StoreConfig::Memory => {
            info!("Using in-memory keyed store");
            Ok(Arc::new(InMemoryStore::new(Arc::new(SystemClock))))
        }
        StoreConfig::Redis(redis_config) => {
            let store = RedisStore::connect(redis_config).await?;
            info!(url = %redis_config.url, "Connected to Redis keyed store");
            Ok(Arc::new(store))
        }
    }
}
