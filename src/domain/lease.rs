use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Monotonic number issued on every successful acquisition of a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FencingToken(pub i64);

impl FencingToken {
    pub fn value(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for FencingToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Row of the `locks` table as seen by diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub name: String,
    pub holder_id: Option<String>,
    pub fencing_token: FencingToken,
    pub expires_at: Option<DateTime<Utc>>,
}

impl LockRecord {
    /// Whether some holder has a lease that has not yet expired at `now`.
    pub fn is_held_at(&self, now: DateTime<Utc>) -> bool {
        match (&self.holder_id, self.expires_at) {
            (Some(_), Some(expires_at)) => expires_at > now,
            _ => false,
        }
    }
}

/// What the store reports back after a successful acquisition or renewal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseGrant {
    pub fencing_token: FencingToken,
    pub expires_at: DateTime<Utc>,
}

/// A lease held by this process.
///
/// `expires_at` is the database's view. `valid_until` is a local deadline taken
/// from the monotonic clock before the granting request was sent, so it never
/// outlives the database lease even when the round trip was slow.
#[derive(Debug, Clone)]
pub struct Lease {
    pub name: String,
    pub holder_id: String,
    pub fencing_token: FencingToken,
    pub expires_at: DateTime<Utc>,
    pub ttl: Duration,
    pub valid_until: Instant,
}

impl Lease {
    pub fn new(name: &str, holder_id: &str, grant: LeaseGrant, ttl: Duration, sent_at: Instant) -> Self {
        Self {
            name: name.to_string(),
            holder_id: holder_id.to_string(),
            fencing_token: grant.fencing_token,
            expires_at: grant.expires_at,
            ttl,
            valid_until: sent_at + ttl,
        }
    }

    /// Apply a renewal that was requested at `sent_at`.
    pub fn extend(&mut self, expires_at: DateTime<Utc>, ttl: Duration, sent_at: Instant) {
        self.expires_at = expires_at;
        self.ttl = ttl;
        self.valid_until = sent_at + ttl;
    }

    /// Time left before the local deadline passes.
    pub fn remaining(&self) -> Duration {
        self.valid_until.saturating_duration_since(Instant::now())
    }

    pub fn is_locally_expired(&self) -> bool {
        Instant::now() >= self.valid_until
    }

    /// The local deadline pulled in by `margin`. Work that must end while the
    /// lease is certainly still ours has to end by this instant.
    pub fn valid_until_less(&self, margin: Duration) -> Instant {
        self.valid_until
            .checked_sub(margin)
            .unwrap_or_else(Instant::now)
            .min(self.valid_until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_record_held() {
        let now = Utc::now();
        let mut record = LockRecord {
            name: "gateway-leader".to_string(),
            holder_id: Some("node-a".to_string()),
            fencing_token: FencingToken(1),
            expires_at: Some(now + chrono::Duration::seconds(10)),
        };
        assert!(record.is_held_at(now));
        assert!(!record.is_held_at(now + chrono::Duration::seconds(10)));

        record.holder_id = None;
        assert!(!record.is_held_at(now));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_local_deadline() {
        let sent_at = Instant::now();
        let grant = LeaseGrant {
            fencing_token: FencingToken(4),
            expires_at: Utc::now(),
        };
        let mut lease = Lease::new("l", "h", grant, Duration::from_secs(10), sent_at);
        assert_eq!(lease.remaining(), Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(lease.remaining(), Duration::from_secs(4));

        lease.extend(Utc::now(), Duration::from_secs(10), Instant::now());
        assert_eq!(lease.remaining(), Duration::from_secs(10));

        assert_eq!(
            lease.valid_until_less(Duration::from_secs(1)),
            lease.valid_until - Duration::from_secs(1)
        );

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(lease.is_locally_expired());
    }
}
