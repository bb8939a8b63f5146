//! Sliding-window limiter over a keyed store's score-sets.

use std::sync::Arc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::store::{KeyedStore, ScoreSetOp};

/// Raw outcome of one window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCheck {
    /// Whether the event fits under the limit.
    pub allowed: bool,
    /// Events in the window before this one was recorded.
    pub current_count: u64,
}

/// Decides admission for a key against a `(limit, window)` quota.
///
/// Each key owns a score-set whose members are events scored by the second
/// they happened in. The limiter holds no state of its own and is safe to
/// share across tasks; same-key races are settled by the store's atomic batch.
#[derive(Clone)]
pub struct SlidingWindowLimiter {
    store: Arc<dyn KeyedStore>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowLimiter {
    /// Create a limiter reading time from the system clock.
    pub fn new(store: Arc<dyn KeyedStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn KeyedStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Record an event for `key` and report whether it is admitted.
    ///
    /// Fails open: when the store cannot be reached the event is admitted.
    pub async fn is_allowed(&self, key: &str, limit: u32, window_secs: u64) -> bool {
        match self.check(key, limit, window_secs).await {
            Ok(check) => check.allowed,
            Err(e) => {
                warn!(key = %key, error = %e, "Rate limit check failed, allowing request");
                true
            }
        }
    }

    /// Record an event for `key` and return the raw outcome.
    ///
    /// The event is recorded even when it is denied; the decision uses the
    /// count from before the insertion.
    pub async fn check(&self, key: &str, limit: u32, window_secs: u64) -> Result<WindowCheck, StoreError> {
        let now = self.clock.unix_seconds();
        let window_start = now.saturating_sub(window_secs_i64(window_secs));

        let ops = [
            ScoreSetOp::evict(key, window_start as f64),
            ScoreSetOp::count(key),
            ScoreSetOp::add(key, event_member(now), now as f64),
            ScoreSetOp::expire(key, window_secs),
        ];

        let replies = self.store.atomic_batch(&ops).await?;
        let current_count = replies
            .get(1)
            .and_then(|reply| reply.as_count())
            .ok_or_else(|| StoreError::Protocol(format!("missing count in window reply: {replies:?}")))?;

        let allowed = current_count < u64::from(limit);

        trace!(
            key = %key,
            limit = limit,
            window_secs = window_secs,
            current_count = current_count,
            "Checked sliding window"
        );
        if !allowed {
            debug!(key = %key, current_count = current_count, limit = limit, "Rate limit exceeded");
        }

        Ok(WindowCheck {
            allowed,
            current_count,
        })
    }

    /// How many more events `key` may record in the current window.
    ///
    /// Evicts aged-out events but records nothing. Returns the full `limit`
    /// when the store cannot be reached.
    pub async fn get_remaining_requests(&self, key: &str, limit: u32, window_secs: u64) -> u32 {
        match self.count(key, window_secs).await {
            Ok(current_count) => {
                let used = u32::try_from(current_count).unwrap_or(u32::MAX);
                limit.saturating_sub(used)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Remaining-requests probe failed, reporting full quota");
                limit
            }
        }
    }

    async fn count(&self, key: &str, window_secs: u64) -> Result<u64, StoreError> {
        let now = self.clock.unix_seconds();
        let window_start = now.saturating_sub(window_secs_i64(window_secs));

        let ops = [ScoreSetOp::evict(key, window_start as f64), ScoreSetOp::count(key)];
        let replies = self.store.atomic_batch(&ops).await?;
        replies
            .get(1)
            .and_then(|reply| reply.as_count())
            .ok_or_else(|| StoreError::Protocol(format!("missing count in window reply: {replies:?}")))
    }
}

fn window_secs_i64(window_secs: u64) -> i64 {
    i64::try_from(window_secs).unwrap_or(i64::MAX)
}

/// Member identity for one event.
///
/// The score carries the second; the random suffix keeps two events in the
/// same second from collapsing into one member.
fn event_member(now: i64) -> String {
    format!("{now}:{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryStore;
    use std::time::Duration;

    fn limiter() -> (SlidingWindowLimiter, Arc<InMemoryStore>, ManualClock) {
        let clock = ManualClock::at_unix(1_700_000_000);
        let store = Arc::new(InMemoryStore::new(Arc::new(clock.clone())));
        let limiter = SlidingWindowLimiter::with_clock(store.clone(), Arc::new(clock.clone()));
        (limiter, store, clock)
    }

    #[tokio::test]
    async fn test_allows_up_to_limit_then_denies() {
        let (limiter, _store, _clock) = limiter();

        for _ in 0..5 {
            assert!(limiter.is_allowed("k", 5, 60).await);
        }
        assert!(!limiter.is_allowed("k", 5, 60).await);
    }

    #[tokio::test]
    async fn test_event_recorded_even_when_denied() {
        let (limiter, _store, _clock) = limiter();

        assert!(limiter.is_allowed("k", 1, 60).await);
        assert!(!limiter.is_allowed("k", 1, 60).await);
        assert_eq!(limiter.get_remaining_requests("k", 1, 60).await, 0);

        let check = limiter.check("k", 1, 60).await.unwrap();
        assert_eq!(check.current_count, 2);
        assert!(!check.allowed);
    }

    #[tokio::test]
    async fn test_first_event_ages_out_of_window() {
        let (limiter, _store, clock) = limiter();

        for _ in 0..3 {
            assert!(limiter.is_allowed("k", 3, 10).await);
        }
        clock.advance(Duration::from_secs(5));
        assert!(!limiter.is_allowed("k", 3, 10).await);
        assert!(!limiter.is_allowed("k", 3, 10).await);

        // The first three events are now older than the window.
        clock.advance(Duration::from_secs(6));
        assert!(limiter.is_allowed("k", 3, 10).await);
    }

    #[tokio::test]
    async fn test_remaining_requests_does_not_record() {
        let (limiter, _store, _clock) = limiter();

        assert_eq!(limiter.get_remaining_requests("k", 3, 60).await, 3);
        assert_eq!(limiter.get_remaining_requests("k", 3, 60).await, 3);

        limiter.is_allowed("k", 3, 60).await;
        assert_eq!(limiter.get_remaining_requests("k", 3, 60).await, 2);
    }

    #[tokio::test]
    async fn test_idle_window_expires() {
        let (limiter, store, clock) = limiter();

        limiter.is_allowed("k", 3, 30).await;
        assert!(store.exists("k").await.unwrap());

        clock.advance(Duration::from_secs(30));
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (limiter, _store, _clock) = limiter();

        assert!(limiter.is_allowed("a", 1, 60).await);
        assert!(!limiter.is_allowed("a", 1, 60).await);
        assert!(limiter.is_allowed("b", 1, 60).await);
    }

    #[tokio::test]
    async fn test_fails_open_when_store_unavailable() {
        let (limiter, store, _clock) = limiter();
        store.set_offline(true);

        for _ in 0..10 {
            assert!(limiter.is_allowed("k", 1, 60).await);
        }
        assert_eq!(limiter.get_remaining_requests("k", 7, 60).await, 7);
        assert!(matches!(
            limiter.check("k", 1, 60).await,
            Err(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_checks_never_over_admit() {
        let (limiter, _store, _clock) = limiter();

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.is_allowed("shared", 7, 60).await })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 7);
    }

    #[test]
    fn test_event_members_are_unique_within_a_second() {
        assert_ne!(event_member(5), event_member(5));
        assert!(event_member(5).starts_with("5:"));
    }
}
