//! Named exclusive leases with fencing tokens

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::retry::{into_lock_not_owned, RetryPolicy};
use crate::adapters::CoordinationStore;
use crate::domain::{Lease, LockRecord};
use crate::error::{IbcError, Result};

/// Lease operations over the shared store.
///
/// Every call is a single compare-and-set transaction in the store. Callers
/// holding a [`Lease`] must treat `LockNotOwned` as an immediate loss of
/// ownership and stop privileged work.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn CoordinationStore>,
    retry: RetryPolicy,
}

impl LockManager {
    pub fn new(store: Arc<dyn CoordinationStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Claim `name` for `holder_id`. Fails with `LockHeld` while another
    /// holder's lease is live.
    pub async fn acquire(&self, name: &str, holder_id: &str, ttl: Duration) -> Result<Lease> {
        if ttl.is_zero() {
            return Err(IbcError::Validation("lease ttl must be positive".to_string()));
        }

        let mut sent_at = Instant::now();
        let grant = self
            .retry
            .run("acquire_lock", || {
                sent_at = Instant::now();
                self.store.acquire_lock(name, holder_id, ttl)
            })
            .await?;

        info!(lock = name, holder = holder_id, token = %grant.fencing_token, "lease acquired");
        Ok(Lease::new(name, holder_id, grant, ttl, sent_at))
    }

    /// Extend a held lease. Transient failures are retried only while the
    /// lease is still locally valid; running out of time means the lease must
    /// be considered lost.
    pub async fn renew(&self, lease: &mut Lease, ttl: Duration) -> Result<()> {
        let deadline = lease.valid_until;
        self.renew_before(lease, ttl, deadline).await
    }

    /// Like `renew`, but gives up at `deadline` (or the lease's own local
    /// deadline, if earlier), including while a store call is still pending.
    pub async fn renew_before(&self, lease: &mut Lease, ttl: Duration, deadline: Instant) -> Result<()> {
        let deadline = deadline.min(lease.valid_until);
        if Instant::now() >= deadline {
            return Err(IbcError::lock_not_owned(
                &lease.name,
                &lease.holder_id,
                lease.fencing_token.value(),
            ));
        }

        let mut sent_at = Instant::now();
        let attempt = self.retry.run_until("renew_lock", Some(deadline), || {
            sent_at = Instant::now();
            self.store
                .renew_lock(&lease.name, &lease.holder_id, lease.fencing_token, ttl)
        });

        let grant = match tokio::time::timeout_at(deadline, attempt).await {
            Ok(Ok(grant)) => grant,
            Ok(Err(err)) => {
                warn!(lock = %lease.name, token = %lease.fencing_token, error = %err, "lease renewal failed");
                return Err(into_lock_not_owned(
                    err,
                    &lease.name,
                    &lease.holder_id,
                    lease.fencing_token.value(),
                ));
            }
            Err(_) => {
                warn!(lock = %lease.name, token = %lease.fencing_token, "lease renewal ran past local deadline");
                return Err(IbcError::lock_not_owned(
                    &lease.name,
                    &lease.holder_id,
                    lease.fencing_token.value(),
                ));
            }
        };

        lease.extend(grant.expires_at, ttl, sent_at);
        debug!(lock = %lease.name, token = %lease.fencing_token, expires_at = %lease.expires_at, "lease renewed");
        Ok(())
    }

    pub async fn release(&self, lease: &Lease) -> Result<()> {
        self.retry
            .run("release_lock", || {
                self.store
                    .release_lock(&lease.name, &lease.holder_id, lease.fencing_token)
            })
            .await?;
        info!(lock = %lease.name, holder = %lease.holder_id, token = %lease.fencing_token, "lease released");
        Ok(())
    }

    /// Fencing check before a privileged side effect. Succeeds only while the
    /// database still records this exact lease as live.
    pub async fn ensure_held(&self, lease: &Lease) -> Result<()> {
        if lease.is_locally_expired() {
            return Err(IbcError::lock_not_owned(
                &lease.name,
                &lease.holder_id,
                lease.fencing_token.value(),
            ));
        }
        self.store
            .check_lock(&lease.name, &lease.holder_id, lease.fencing_token)
            .await
            .map(|_| ())
    }

    pub async fn inspect(&self, name: &str) -> Result<Option<LockRecord>> {
        self.store.get_lock(name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryStore;
    use crate::domain::FencingToken;

    const TTL: Duration = Duration::from_secs(10);

    fn manager() -> (Arc<MemoryStore>, LockManager) {
        let store = Arc::new(MemoryStore::new());
        let locks = LockManager::new(store.clone(), RetryPolicy::default());
        (store, locks)
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_contention() {
        let (_, locks) = manager();

        let a = locks.acquire("gateway-leader", "a", TTL).await.unwrap();
        assert_eq!(a.fencing_token, FencingToken(1));

        let err = locks.acquire("gateway-leader", "b", TTL).await.unwrap_err();
        match err {
            IbcError::LockHeld { holder, .. } => assert_eq!(holder, "a"),
            other => panic!("expected LockHeld, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_holder_reacquire_bumps_token() {
        let (_, locks) = manager();
        let first = locks.acquire("l", "a", TTL).await.unwrap();
        let second = locks.acquire("l", "a", TTL).await.unwrap();
        assert!(second.fencing_token > first.fencing_token);

        // the superseded lease can no longer renew
        let mut stale = first;
        let err = locks.renew(&mut stale, TTL).await.unwrap_err();
        assert!(err.is_ownership_loss());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_extends_local_deadline() {
        let (_, locks) = manager();
        let mut lease = locks.acquire("l", "a", TTL).await.unwrap();
        let before = lease.valid_until;

        tokio::time::advance(Duration::from_secs(3)).await;
        locks.renew(&mut lease, TTL).await.unwrap();

        assert_eq!(lease.valid_until, before + Duration::from_secs(3));
        assert_eq!(lease.fencing_token, FencingToken(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_after_expiry_is_lock_not_owned() {
        let (_, locks) = manager();
        let mut lease = locks.acquire("l", "a", TTL).await.unwrap();

        tokio::time::advance(TTL + Duration::from_millis(1)).await;
        let err = locks.renew(&mut lease, TTL).await.unwrap_err();
        assert!(err.is_ownership_loss());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_outage_past_deadline_is_lock_not_owned() {
        let (store, locks) = manager();
        let mut lease = locks.acquire("l", "a", Duration::from_millis(300)).await.unwrap();

        store.set_available(false);
        let err = locks.renew(&mut lease, Duration::from_millis(300)).await.unwrap_err();
        assert!(err.is_ownership_loss());
        assert!(Instant::now() <= lease.valid_until);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_renewal_gives_up_at_caller_deadline() {
        let (store, locks) = manager();
        let mut lease = locks.acquire("l", "a", TTL).await.unwrap();
        let valid_until = lease.valid_until;

        store.stall_renewals(true);
        let deadline = lease.valid_until_less(Duration::from_secs(1));
        let err = locks.renew_before(&mut lease, TTL, deadline).await.unwrap_err();

        assert!(err.is_ownership_loss());
        assert!(Instant::now() >= deadline);
        assert!(Instant::now() < valid_until);
        assert_eq!(lease.valid_until, valid_until);

        // the database lease is still ours, nobody else can take it yet
        let record = store.get_lock("l").await.unwrap().unwrap();
        assert!(record.is_held_at(store.now()));
        assert!(matches!(
            locks.acquire("l", "b", TTL).await,
            Err(IbcError::LockHeld { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_with_stale_token_fails() {
        let (_, locks) = manager();
        let lease = locks.acquire("l", "a", TTL).await.unwrap();
        locks.release(&lease).await.unwrap();

        let record = locks.inspect("l").await.unwrap().unwrap();
        assert_eq!(record.holder_id, None);

        let err = locks.release(&lease).await.unwrap_err();
        assert!(err.is_ownership_loss());

        let next = locks.acquire("l", "b", TTL).await.unwrap();
        assert_eq!(next.fencing_token, FencingToken(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_held_tracks_ownership() {
        let (_, locks) = manager();
        let lease = locks.acquire("l", "a", TTL).await.unwrap();
        locks.ensure_held(&lease).await.unwrap();

        tokio::time::advance(TTL).await;
        assert!(locks.ensure_held(&lease).await.unwrap_err().is_ownership_loss());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_rejected() {
        let (_, locks) = manager();
        let err = locks.acquire("l", "a", Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, IbcError::Validation(_)));
    }
}
