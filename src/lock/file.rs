//! Lock file content as persisted on the shared path

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Identity of this client process, written into every lock it creates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOwner {
    pub token: String,
    pub user: String,
    pub host: String,
}

impl LockOwner {
    /// A fresh identity for the running process
    pub fn current() -> Self {
        let host = hostname::get()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown-host".to_string());
        Self {
            token: Uuid::new_v4().to_string(),
            user: whoami::username(),
            host,
        }
    }

    pub fn named(user: &str, host: &str) -> Self {
        Self {
            token: Uuid::new_v4().to_string(),
            user: user.to_string(),
            host: host.to_string(),
        }
    }
}

/// Serialized marker of exclusive intent to mutate one dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockFile {
    pub dataset_id: String,
    pub owner_token: String,
    pub user: String,
    #[serde(rename = "machine")]
    pub host: String,
    pub acquired_at: DateTime<Utc>,
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    pub app_version: String,
}

impl LockFile {
    pub fn new(dataset_id: &str, owner: &LockOwner, acquired_at: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            dataset_id: dataset_id.to_string(),
            owner_token: owner.token.clone(),
            user: owner.user.clone(),
            host: owner.host.clone(),
            acquired_at,
            ttl,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Parse persisted content; `None` when the file is not a lock we understand
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| self.acquired_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// A lease is stale once strictly more than `ttl` has elapsed
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }

    pub fn remaining_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        (self.expires_at() - now).to_std().ok()
    }

    /// "Dataset locked by <user> on <host> since <timestamp>"
    pub fn holder_description(&self) -> String {
        format!(
            "Dataset locked by {} on {} since {}",
            self.user,
            self.host,
            self.acquired_at.format("%Y-%m-%d %H:%M UTC")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(ttl: Duration) -> LockFile {
        let owner = LockOwner::named("alice", "ws-12");
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap();
        LockFile::new("camera_1", &owner, at, ttl)
    }

    #[test]
    fn test_staleness_boundary() {
        let lock = sample(Duration::from_secs(30));
        let at = lock.acquired_at;
        assert!(!lock.is_stale_at(at + chrono::Duration::seconds(2)));
        assert!(!lock.is_stale_at(at + chrono::Duration::seconds(30)));
        assert!(lock.is_stale_at(at + chrono::Duration::seconds(31)));
        assert_eq!(
            lock.remaining_at(at + chrono::Duration::seconds(10)),
            Some(Duration::from_secs(20))
        );
    }

    #[test]
    fn test_holder_description() {
        let lock = sample(Duration::from_secs(4 * 3600));
        assert_eq!(
            lock.holder_description(),
            "Dataset locked by alice on ws-12 since 2024-05-01 09:30 UTC"
        );
    }

    #[test]
    fn test_parse_roundtrip_and_garbage() {
        let lock = sample(Duration::from_secs(3600));
        let bytes = lock.to_bytes().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("\"machine\": \"ws-12\""));
        assert!(text.contains("\"ttl\": \"1h\""));
        assert_eq!(LockFile::parse(&bytes), Some(lock));
        assert_eq!(LockFile::parse(b"locked by bob"), None);
    }

    #[test]
    fn test_current_owner_tokens_are_unique() {
        let a = LockOwner::current();
        let b = LockOwner::current();
        assert_ne!(a.token, b.token);
        assert!(!a.host.is_empty());
    }
}
