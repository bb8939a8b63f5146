//! Redis-backed keyed store.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Connection, Pool, PoolConfig, Runtime, Timeouts};
use redis::{AsyncCommands, Value};
use tracing::{debug, trace};

use super::{BatchReply, KeyedStore, ScoreSetOp, StoreStats};
use crate::config::RedisConfig;
use crate::error::StoreError;

/// Keys fetched per `SCAN` page.
const SCAN_BATCH_SIZE: usize = 100;

/// Redis keyed store over a deadpool connection pool.
///
/// Checking out a connection is bounded by the connect timeout and every
/// command by the response timeout; a call that overruns either is reported
/// as [`StoreError::Timeout`].
pub struct RedisStore {
    pool: Pool,
    connect_timeout: Duration,
    response_timeout: Duration,
}

impl RedisStore {
    /// Build the pool without touching the network.
    pub fn new(config: &RedisConfig) -> Result<Self, StoreError> {
        let mut pool_config = PoolConfig::new(config.pool_max_size);
        pool_config.timeouts = Timeouts {
            wait: Some(config.connect_timeout()),
            create: Some(config.connect_timeout()),
            recycle: Some(config.connect_timeout()),
        };

        let mut redis_config = deadpool_redis::Config::from_url(config.url.clone());
        redis_config.pool = Some(pool_config);

        let pool = redis_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::Unavailable(format!("Failed to create Redis connection pool: {e}")))?;

        Ok(Self {
            pool,
            connect_timeout: config.connect_timeout(),
            response_timeout: config.response_timeout(),
        })
    }

    /// Build the pool and verify the server answers a `PING`.
    pub async fn connect(config: &RedisConfig) -> Result<Self, StoreError> {
        let store = Self::new(config)?;
        let mut conn = store.connection().await?;
        let _: String = store.bounded(redis::cmd("PING").query_async(&mut conn)).await?;
        Ok(store)
    }

    /// Check out a pooled connection, bounded by the connect timeout.
    async fn connection(&self) -> Result<Connection, StoreError> {
        tokio::time::timeout(self.connect_timeout, self.pool.get())
            .await
            .map_err(|_| StoreError::Timeout(self.connect_timeout))?
            .map_err(StoreError::from)
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        tokio::time::timeout(self.response_timeout, call)
            .await
            .map_err(|_| StoreError::Timeout(self.response_timeout))?
            .map_err(StoreError::from)
    }
}

#[async_trait]
impl KeyedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.connection().await?;
        self.bounded(conn.get(key)).await
    }

    async fn set_with_expiry(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        self.bounded(conn.set_ex(key, value, ttl_secs)).await
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        self.bounded(conn.del(keys)).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        self.bounded(conn.exists(key)).await
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection().await?;
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next_cursor, page): (u64, Vec<String>) = self
                .bounded(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH_SIZE)
                        .query_async(&mut conn),
                )
                .await?;
            keys.extend(page);
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        // SCAN may return a key more than once across pages.
        keys.sort();
        keys.dedup();
        trace!(pattern = %pattern, matched = keys.len(), "Scanned keys");
        Ok(keys)
    }

    async fn atomic_batch(&self, ops: &[ScoreSetOp]) -> Result<Vec<BatchReply>, StoreError> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            match op {
                ScoreSetOp::Evict { key, max_score } => {
                    pipe.zrembyscore(key, "-inf", *max_score);
                }
                ScoreSetOp::Count { key } => {
                    pipe.zcard(key);
                }
                ScoreSetOp::Add { key, member, score } => {
                    pipe.zadd(key, member, *score);
                }
                ScoreSetOp::Expire { key, ttl_secs } => {
                    pipe.expire(key, i64::try_from(*ttl_secs).unwrap_or(i64::MAX));
                }
            }
        }

        let mut conn = self.connection().await?;
        let values: Vec<Value> = self.bounded(pipe.query_async(&mut conn)).await?;
        if values.len() != ops.len() {
            return Err(StoreError::Protocol(format!(
                "batch of {} ops returned {} replies",
                ops.len(),
                values.len()
            )));
        }

        ops.iter().zip(values.iter()).map(|(op, value)| reply_for(op, value)).collect()
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let mut conn = self.connection().await?;
        let info: String = self.bounded(redis::cmd("INFO").query_async(&mut conn)).await?;
        Ok(parse_info(&info))
    }

    async fn close(&self) {
        debug!("Closing Redis connection pool");
        self.pool.close();
    }
}

fn reply_for(op: &ScoreSetOp, value: &Value) -> Result<BatchReply, StoreError> {
    let n: i64 = redis::from_redis_value(value)?;
    let n = u64::try_from(n).map_err(|_| StoreError::Protocol(format!("negative reply {n} to {op:?}")))?;
    Ok(match op {
        ScoreSetOp::Evict { .. } => BatchReply::Removed(n),
        ScoreSetOp::Count { .. } => BatchReply::Count(n),
        ScoreSetOp::Add { .. } => BatchReply::Added(n > 0),
        ScoreSetOp::Expire { .. } => BatchReply::Expired(n > 0),
    })
}

/// Pull the counters we report out of an `INFO` payload.
fn parse_info(info: &str) -> StoreStats {
    let mut stats = StoreStats::default();
    for line in info.lines() {
        let Some((field, value)) = line.trim().split_once(':') else {
            continue;
        };
        match field {
            "used_memory_human" => stats.used_memory_human = Some(value.to_string()),
            "connected_clients" => stats.connected_clients = value.parse().ok(),
            "total_commands_processed" => stats.total_commands_processed = value.parse().ok(),
            "keyspace_hits" => stats.keyspace_hits = value.parse().unwrap_or_default(),
            "keyspace_misses" => stats.keyspace_misses = value.parse().unwrap_or_default(),
            _ => {}
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedisConfig;

    fn unreachable_config() -> RedisConfig {
        RedisConfig {
            // Port 1 is reserved and refuses connections on any sane host.
            url: "redis://127.0.0.1:1/0".to_string(),
            pool_max_size: 2,
            response_timeout_ms: 50,
            connect_timeout_ms: 50,
        }
    }

    #[test]
    fn test_parse_info() {
        let info = "# Server\r\nredis_version:7.2.4\r\n# Clients\r\nconnected_clients:3\r\n\
                    # Memory\r\nused_memory_human:1.02M\r\n# Stats\r\n\
                    total_commands_processed:42\r\nkeyspace_hits:9\r\nkeyspace_misses:1\r\n";

        let stats = parse_info(info);
        assert_eq!(stats.connected_clients, Some(3));
        assert_eq!(stats.used_memory_human.as_deref(), Some("1.02M"));
        assert_eq!(stats.total_commands_processed, Some(42));
        assert_eq!(stats.keyspace_hits, 9);
        assert_eq!(stats.keyspace_misses, 1);
        assert!((stats.hit_rate() - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_reply_mapping() {
        let op = ScoreSetOp::count("w");
        assert_eq!(reply_for(&op, &Value::Int(4)).unwrap(), BatchReply::Count(4));

        let op = ScoreSetOp::add("w", "m", 1.0);
        assert_eq!(reply_for(&op, &Value::Int(0)).unwrap(), BatchReply::Added(false));

        assert!(reply_for(&op, &Value::Int(-1)).is_err());
    }

    #[tokio::test]
    async fn test_new_does_not_connect() {
        assert!(RedisStore::new(&unreachable_config()).is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_a_store_error() {
        let store = RedisStore::new(&unreachable_config()).unwrap();

        let result = store.get("k").await;
        assert!(matches!(
            result,
            Err(StoreError::Unavailable(_)) | Err(StoreError::Timeout(_))
        ));

        let result = store.atomic_batch(&[ScoreSetOp::count("w")]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_new_keeps_both_timeouts() {
        let config = RedisConfig {
            response_timeout_ms: 5,
            connect_timeout_ms: 750,
            ..RedisConfig::default()
        };
        let store = RedisStore::new(&config).unwrap();
        assert_eq!(store.connect_timeout, Duration::from_millis(750));
        assert_eq!(store.response_timeout, Duration::from_millis(5));
        assert_eq!(store.pool.status().max_size, config.pool_max_size);
    }

    #[tokio::test]
    async fn test_connection_checkout_is_not_bounded_by_response_timeout() {
        let config = RedisConfig {
            response_timeout_ms: 1,
            connect_timeout_ms: 200,
            ..unreachable_config()
        };
        let store = RedisStore::new(&config).unwrap();

        let err = store.get("k").await.unwrap_err();
        assert!(
            !matches!(err, StoreError::Timeout(d) if d == Duration::from_millis(1)),
            "checkout used the response timeout: {err:?}"
        );
    }

    #[tokio::test]
    async fn test_connect_fails_fast_on_unreachable_server() {
        assert!(RedisStore::connect(&unreachable_config()).await.is_err());
    }
}
