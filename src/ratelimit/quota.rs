//! Quota shapes and the per-operation quota table.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// How many events a window may hold.
///
/// A quota is attached to a protected operation, not to a caller: every
/// subject shares the same shape but gets its own window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Quota {
    /// Maximum events admitted within one window
    pub limit: u32,
    /// Window length in seconds
    pub window_secs: u64,
}

impl Quota {
    pub const fn new(limit: u32, window_secs: u64) -> Self {
        Self { limit, window_secs }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Check the quota can be enforced.
    pub fn validate(&self) -> Result<(), String> {
        if self.limit == 0 {
            return Err("limit must be positive".to_string());
        }
        if self.window_secs == 0 {
            return Err("window_secs must be positive".to_string());
        }
        Ok(())
    }
}

/// Static mapping from operation identifier to its quota.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotaTable {
    quotas: BTreeMap<String, Quota>,
}

impl QuotaTable {
    pub fn new(quotas: BTreeMap<String, Quota>) -> Self {
        Self { quotas }
    }

    /// The quota guarding `operation`, if it is metered.
    pub fn get(&self, operation: &str) -> Option<Quota> {
        self.quotas.get(operation).copied()
    }

    pub fn insert(&mut self, operation: impl Into<String>, quota: Quota) {
        self.quotas.insert(operation.into(), quota);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Quota)> {
        self.quotas.iter().map(|(op, quota)| (op.as_str(), *quota))
    }

    pub fn len(&self) -> usize {
        self.quotas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotas.is_empty()
    }
}

impl FromIterator<(String, Quota)> for QuotaTable {
    fn from_iter<I: IntoIterator<Item = (String, Quota)>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_validation() {
        assert!(Quota::new(10, 60).validate().is_ok());
        assert!(Quota::new(0, 60).validate().is_err());
        assert!(Quota::new(10, 0).validate().is_err());
    }

    #[test]
    fn test_table_lookup() {
        let mut table = QuotaTable::default();
        table.insert("send_message", Quota::new(100, 60));

        assert_eq!(table.get("send_message"), Some(Quota::new(100, 60)));
        assert_eq!(table.get("unknown"), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_parse_quota_yaml() {
        let quota: Quota = serde_yaml::from_str("limit: 5\nwindow_secs: 60\n").unwrap();
        assert_eq!(quota, Quota::new(5, 60));
        assert_eq!(quota.window(), Duration::from_secs(60));
    }
}
