//! Admission policy: identity in, allow/deny decision with retry metadata out.

use http::header::{HeaderName, RETRY_AFTER};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::identity::Identity;
use super::limiter::SlidingWindowLimiter;
use super::quota::{Quota, QuotaTable};
use crate::clock::{Clock, SystemClock};
use crate::config::AdmissionConfig;
use crate::store::KeyedStore;

/// `X-RateLimit-Limit`
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// `X-RateLimit-Remaining`
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// `X-RateLimit-Reset`
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Outcome of one admission check. Computed fresh, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub limit: u32,
    pub window_secs: u64,
    /// Events the caller may still make in this window
    pub remaining: u32,
    /// Seconds the caller should wait before retrying
    pub reset_after_secs: u64,
    /// Unix time at which the window is considered reset
    pub reset_at: i64,
}

impl AdmissionDecision {
    /// The rejection to surface, if this decision denies the request.
    pub fn rejection(&self) -> Option<AdmissionRejection> {
        (!self.allowed).then(|| AdmissionRejection {
            limit: self.limit,
            window: self.window_secs,
            remaining: self.remaining,
            retry_after: self.reset_after_secs,
            reset_at: self.reset_at,
        })
    }
}

/// A denied admission, shaped for a "too many requests" response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionRejection {
    pub limit: u32,
    pub window: u64,
    pub remaining: u32,
    pub retry_after: u64,
    #[serde(skip)]
    pub reset_at: i64,
}

impl AdmissionRejection {
    /// Standard rate-limit response headers.
    pub fn headers(&self) -> [(HeaderName, String); 4] {
        [
            (X_RATELIMIT_LIMIT, self.limit.to_string()),
            (X_RATELIMIT_REMAINING, self.remaining.to_string()),
            (X_RATELIMIT_RESET, self.reset_at.to_string()),
            (RETRY_AFTER, self.retry_after.to_string()),
        ]
    }

    /// JSON error body.
    pub fn body(&self) -> serde_json::Value {
        serde_json::json!({
            "error": "Rate limit exceeded",
            "limit": self.limit,
            "window": self.window,
            "remaining": self.remaining,
            "retry_after": self.retry_after,
        })
    }
}

/// Turns request identities into admission decisions.
///
/// Holds the limiter, the static quota table and the key namespace; no
/// per-request state.
#[derive(Clone)]
pub struct AdmissionPolicy {
    limiter: SlidingWindowLimiter,
    quotas: Arc<QuotaTable>,
    key_prefix: String,
    clock: Arc<dyn Clock>,
}

impl AdmissionPolicy {
    /// Build a policy from configuration over the given store.
    pub fn new(store: Arc<dyn KeyedStore>, config: &AdmissionConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn KeyedStore>, config: &AdmissionConfig, clock: Arc<dyn Clock>) -> Self {
        let quotas: QuotaTable = config.quotas.clone().into_iter().collect();
        info!(
            operations = quotas.len(),
            key_prefix = %config.key_prefix,
            "Admission policy initialized"
        );
        Self {
            limiter: SlidingWindowLimiter::with_clock(store, clock.clone()),
            quotas: Arc::new(quotas),
            key_prefix: config.key_prefix.clone(),
            clock,
        }
    }

    /// Scoped key for an identity: `subject:<id>` or `origin:<origin>`.
    pub fn resolve_key(identity: &Identity) -> String {
        identity.resolve_key()
    }

    /// Store key of the window `identity` is counted in.
    ///
    /// `{prefix}:{scope}` for ad-hoc quotas, `{prefix}:{operation}:{scope}`
    /// for configured operations.
    pub fn window_key(&self, operation: Option<&str>, identity: &Identity) -> String {
        match operation {
            Some(operation) => format!("{}:{}:{}", self.key_prefix, operation, identity.resolve_key()),
            None => format!("{}:{}", self.key_prefix, identity.resolve_key()),
        }
    }

    /// The configured quota table.
    pub fn quotas(&self) -> &QuotaTable {
        &self.quotas
    }

    /// The limiter this policy delegates to.
    pub fn limiter(&self) -> &SlidingWindowLimiter {
        &self.limiter
    }

    /// Check `identity` against `quota` in a window shared by every caller
    /// of this method.
    pub async fn check(&self, identity: &Identity, quota: &Quota) -> AdmissionDecision {
        let key = self.window_key(None, identity);
        self.decide(&key, quota).await
    }

    /// Check `identity` against the quota configured for `operation`.
    ///
    /// Windows are scoped per operation. Returns `None` when the operation
    /// is not metered.
    pub async fn check_operation(&self, operation: &str, identity: &Identity) -> Option<AdmissionDecision> {
        let Some(quota) = self.quotas.get(operation) else {
            debug!(operation = %operation, "No quota configured for operation - skipping");
            return None;
        };
        let key = self.window_key(Some(operation), identity);
        Some(self.decide(&key, &quota).await)
    }

    /// Events `identity` has left in the window [`check`](Self::check) uses.
    /// Records nothing.
    pub async fn remaining(&self, identity: &Identity, quota: &Quota) -> u32 {
        let key = self.window_key(None, identity);
        self.limiter
            .get_remaining_requests(&key, quota.limit, quota.window_secs)
            .await
    }

    /// Events `identity` has left for `operation`, or `None` when the
    /// operation is not metered. Records nothing.
    pub async fn remaining_for_operation(&self, operation: &str, identity: &Identity) -> Option<u32> {
        let quota = self.quotas.get(operation)?;
        let key = self.window_key(Some(operation), identity);
        Some(
            self.limiter
                .get_remaining_requests(&key, quota.limit, quota.window_secs)
                .await,
        )
    }

    async fn decide(&self, key: &str, quota: &Quota) -> AdmissionDecision {
        let (allowed, remaining) = match self.limiter.check(key, quota.limit, quota.window_secs).await {
            Ok(check) if check.allowed => {
                // This event now occupies one slot.
                let used = u32::try_from(check.current_count.saturating_add(1)).unwrap_or(u32::MAX);
                (true, quota.limit.saturating_sub(used))
            }
            Ok(_) => {
                let remaining = self
                    .limiter
                    .get_remaining_requests(key, quota.limit, quota.window_secs)
                    .await;
                debug!(key = %key, remaining = remaining, "Admission denied");
                (false, remaining)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Rate limit check failed, allowing request");
                (true, quota.limit)
            }
        };

        // The reset estimate is the full window, not the age of the oldest event.
        let reset_after_secs = quota.window_secs;
        let reset_at = self
            .clock
            .unix_seconds()
            .saturating_add(i64::try_from(reset_after_secs).unwrap_or(i64::MAX));

        AdmissionDecision {
            allowed,
            limit: quota.limit,
            window_secs: quota.window_secs,
            remaining,
            reset_after_secs,
            reset_at,
        }
    }
}
