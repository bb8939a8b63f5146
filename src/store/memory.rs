//! In-process keyed store.
//!
//! Mirrors the Redis semantics the rest of the crate relies on: lazy TTL
//! expiry, score-sets that disappear once empty, and type errors when a byte
//! value is used as a score-set (or vice versa).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::trace;

use super::{BatchReply, KeyedStore, ScoreSetOp, StoreStats};
use crate::clock::Clock;
use crate::error::StoreError;

const WRONG_TYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

#[derive(Debug, Clone)]
enum Value {
    Bytes(Vec<u8>),
    ScoreSet(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// A keyed store held in process memory.
///
/// All operations take the keyspace lock once, so a batch is atomic with
/// respect to every other call on the same store.
pub struct InMemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
    offline: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl InMemoryStore {
    /// Create an empty store whose expiry follows `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
            offline: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`].
    ///
    /// Used to exercise the fail-open paths without a real outage.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries.read().values().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store is offline".to_string()));
        }
        Ok(())
    }

    fn apply(
        entries: &mut HashMap<String, Entry>,
        op: &ScoreSetOp,
        now: DateTime<Utc>,
    ) -> Result<BatchReply, StoreError> {
        match op {
            ScoreSetOp::Evict { key, max_score } => {
                let Some(set) = live_score_set(entries, key, now)? else {
                    return Ok(BatchReply::Removed(0));
                };
                let before = set.len();
                set.retain(|_, score| *score > *max_score);
                let removed = (before - set.len()) as u64;
                if set.is_empty() {
                    entries.remove(key);
                }
                Ok(BatchReply::Removed(removed))
            }
            ScoreSetOp::Count { key } => {
                let count = live_score_set(entries, key, now)?.map_or(0, |set| set.len());
                Ok(BatchReply::Count(count as u64))
            }
            ScoreSetOp::Add { key, member, score } => {
                if live_score_set(entries, key, now)?.is_none() {
                    entries.insert(
                        key.clone(),
                        Entry {
                            value: Value::ScoreSet(HashMap::new()),
                            expires_at: None,
                        },
                    );
                }
                let set = live_score_set(entries, key, now)?
                    .ok_or_else(|| StoreError::Protocol(format!("score-set {key} vanished")))?;
                let created = set.insert(member.clone(), *score).is_none();
                Ok(BatchReply::Added(created))
            }
            ScoreSetOp::Expire { key, ttl_secs } => {
                let Some(entry) = live_entry(entries, key, now) else {
                    return Ok(BatchReply::Expired(false));
                };
                entry.expires_at = Some(expiry_after(now, *ttl_secs));
                Ok(BatchReply::Expired(true))
            }
        }
    }
}

/// Returns the entry for `key` if it has not expired, dropping it otherwise.
fn live_entry<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
    now: DateTime<Utc>,
) -> Option<&'a mut Entry> {
    if entries.get(key).is_some_and(|e| !e.is_live(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

fn live_score_set<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
    now: DateTime<Utc>,
) -> Result<Option<&'a mut HashMap<String, f64>>, StoreError> {
    match live_entry(entries, key, now) {
        None => Ok(None),
        Some(Entry {
            value: Value::ScoreSet(set),
            ..
        }) => Ok(Some(set)),
        Some(_) => Err(StoreError::Protocol(WRONG_TYPE.to_string())),
    }
}

fn expiry_after(now: DateTime<Utc>, ttl_secs: u64) -> DateTime<Utc> {
    let ttl = i64::try_from(ttl_secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX);
    now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait]
impl KeyedStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.ensure_online()?;
        let now = self.clock.now();
        let mut entries = self.entries.write();

        let value = match live_entry(&mut entries, key, now) {
            None => None,
            Some(Entry {
                value: Value::Bytes(bytes),
                ..
            }) => Some(bytes.clone()),
            Some(_) => return Err(StoreError::Protocol(WRONG_TYPE.to_string())),
        };

        let counter = if value.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        trace!(key = %key, hit = value.is_some(), "In-memory get");
        Ok(value)
    }

    async fn set_with_expiry(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<(), StoreError> {
        self.ensure_online()?;
        if ttl_secs == 0 {
            return Err(StoreError::Protocol("invalid expire time in 'setex' command".to_string()));
        }
        let now = self.clock.now();
        self.entries.write().insert(
            key.to_string(),
            Entry {
                value: Value::Bytes(value.to_vec()),
                expires_at: Some(expiry_after(now, ttl_secs)),
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, StoreError> {
        self.ensure_online()?;
        let now = self.clock.now();
        let mut entries = self.entries.write();
        let removed = keys
            .iter()
            .filter(|key| entries.remove(key.as_str()).is_some_and(|e| e.is_live(now)))
            .count();
        Ok(removed as u64)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.ensure_online()?;
        let now = self.clock.now();
        Ok(self.entries.read().get(key).is_some_and(|e| e.is_live(now)))
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.ensure_online()?;
        let now = self.clock.now();
        let mut entries = self.entries.write();
        entries.retain(|_, e| e.is_live(now));
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|key| fast_glob::glob_match(pattern, key.as_str()))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn atomic_batch(&self, ops: &[ScoreSetOp]) -> Result<Vec<BatchReply>, StoreError> {
        self.ensure_online()?;
        let now = self.clock.now();
        let mut entries = self.entries.write();

        // Work on a copy of the touched keys so a failing op leaves nothing applied.
        let mut staged: HashMap<String, Entry> = HashMap::new();
        for op in ops {
            let key = op_key(op);
            if let Some(entry) = entries.get(key) {
                staged.entry(key.to_string()).or_insert_with(|| entry.clone());
            }
        }

        let replies = ops
            .iter()
            .map(|op| Self::apply(&mut staged, op, now))
            .collect::<Result<Vec<_>, _>>()?;

        let mut touched: Vec<&str> = ops.iter().map(op_key).collect();
        touched.sort_unstable();
        touched.dedup();
        for key in touched {
            match staged.remove(key) {
                Some(entry) => {
                    entries.insert(key.to_string(), entry);
                }
                None => {
                    entries.remove(key);
                }
            }
        }

        Ok(replies)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.ensure_online()?;
        Ok(StoreStats {
            keyspace_hits: self.hits.load(Ordering::Relaxed),
            keyspace_misses: self.misses.load(Ordering::Relaxed),
            ..StoreStats::default()
        })
    }
}

fn op_key(op: &ScoreSetOp) -> &str {
    match op {
        ScoreSetOp::Evict { key, .. }
        | ScoreSetOp::Count { key }
        | ScoreSetOp::Add { key, .. }
        | ScoreSetOp::Expire { key, .. } => key,
    }
}
