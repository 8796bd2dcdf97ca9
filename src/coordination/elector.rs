//! Gateway leader election
//!
//! Each node runs one elector. It loops on acquiring the gateway lock; the
//! winner is promoted in membership, hands control to the
//! [`GatewayController`], and renews until the lease is lost or the node
//! shuts down. The controller is always told to stop before anything else
//! happens once the lease may be gone.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::lock_manager::LockManager;
use super::membership::ClusterMembership;
use super::retry::jittered_interval;
use super::shutdown::ShutdownToken;
use crate::config::ElectionConfig;
use crate::domain::{FencingToken, Lease};
use crate::error::IbcError;

/// The collaborator that may only act between `on_become_leader` and
/// `on_lose_leadership`.
#[async_trait]
pub trait GatewayController: Send + Sync {
    /// Start privileged work. An error aborts the term.
    async fn on_become_leader(&self, lease: &Lease) -> anyhow::Result<()>;

    /// Stop privileged work. Must not return before it has stopped.
    async fn on_lose_leadership(&self, reason: LeadershipLoss);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadershipLoss {
    /// Renewal failed or ran out of time
    LeaseLost(String),
    /// `on_become_leader` returned an error
    StartFailed(String),
    Shutdown,
}

impl std::fmt::Display for LeadershipLoss {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeadershipLoss::LeaseLost(reason) => write!(f, "lease lost: {}", reason),
            LeadershipLoss::StartFailed(reason) => write!(f, "start failed: {}", reason),
            LeadershipLoss::Shutdown => write!(f, "shutdown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ElectorState {
    Follower,
    Acquiring,
    Leader { token: FencingToken },
}

impl ElectorState {
    pub fn is_leader(&self) -> bool {
        matches!(self, ElectorState::Leader { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ElectorStats {
    pub terms_won: u64,
    pub leadership_losses: u64,
    pub acquisition_attempts: u64,
}

#[derive(Default)]
struct Counters {
    terms_won: AtomicU64,
    leadership_losses: AtomicU64,
    acquisition_attempts: AtomicU64,
}

pub struct GatewayElector {
    locks: LockManager,
    membership: ClusterMembership,
    controller: Arc<dyn GatewayController>,
    config: ElectionConfig,
    state_tx: watch::Sender<ElectorState>,
    counters: Counters,
}

impl GatewayElector {
    pub fn new(
        locks: LockManager,
        membership: ClusterMembership,
        controller: Arc<dyn GatewayController>,
        config: ElectionConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(ElectorState::Follower);
        Self {
            locks,
            membership,
            controller,
            config,
            state_tx,
            counters: Counters::default(),
        }
    }

    pub fn state(&self) -> ElectorState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ElectorState> {
        self.state_tx.subscribe()
    }

    pub fn stats(&self) -> ElectorStats {
        ElectorStats {
            terms_won: self.counters.terms_won.load(Ordering::Relaxed),
            leadership_losses: self.counters.leadership_losses.load(Ordering::Relaxed),
            acquisition_attempts: self.counters.acquisition_attempts.load(Ordering::Relaxed),
        }
    }

    fn set_state(&self, state: ElectorState) {
        self.state_tx.send_replace(state);
    }

    /// Campaign until shutdown. A leader stops the controller, releases the
    /// lock and demotes itself before this returns.
    pub async fn run(&self, shutdown: ShutdownToken) {
        let node_id = self.membership.node_id().to_string();
        let lock_name = self.config.lock_name.as_str();
        info!(node_id = %node_id, lock = lock_name, "elector started");

        while !shutdown.is_cancelled() {
            self.set_state(ElectorState::Acquiring);
            self.counters.acquisition_attempts.fetch_add(1, Ordering::Relaxed);

            match self.locks.acquire(lock_name, &node_id, self.config.lease_ttl()).await {
                Ok(lease) => self.lead(lease, &shutdown).await,
                Err(IbcError::LockHeld { holder, expires_at, .. }) => {
                    debug!(lock = lock_name, holder = %holder, expires_at = %expires_at, "gateway lock held elsewhere");
                }
                Err(e) => warn!(lock = lock_name, error = %e, "gateway lock acquisition failed"),
            }

            self.set_state(ElectorState::Follower);
            let delay = jittered_interval(self.config.retry_interval(), self.config.retry_jitter());
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(ElectorState::Follower);
        info!(node_id = %node_id, "elector stopped");
    }

    /// One leadership term, from a fresh lease to its end.
    async fn lead(&self, mut lease: Lease, shutdown: &ShutdownToken) {
        if let Err(e) = self.membership.promote(&lease).await {
            warn!(token = %lease.fencing_token, error = %e, "promotion failed, giving up lease");
            self.release(&lease).await;
            return;
        }

        self.counters.terms_won.fetch_add(1, Ordering::Relaxed);
        self.set_state(ElectorState::Leader {
            token: lease.fencing_token,
        });
        info!(lock = %lease.name, token = %lease.fencing_token, "became gateway leader");

        if let Err(e) = self.controller.on_become_leader(&lease).await {
            error!(token = %lease.fencing_token, error = %e, "gateway controller failed to start");
            self.step_down(LeadershipLoss::StartFailed(e.to_string()), Some(&lease))
                .await;
            return;
        }

        let ttl = self.config.lease_ttl();
        let renew_interval = self.config.renew_interval();
        let margin = self.config.stop_margin();
        loop {
            // stop_at leaves the controller `margin` to wind down while the
            // lease is still exclusively ours
            let stop_at = lease.valid_until_less(margin);
            let next_renewal = (Instant::now() + renew_interval).min(stop_at);
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    self.step_down(LeadershipLoss::Shutdown, Some(&lease)).await;
                    return;
                }
                _ = tokio::time::sleep_until(next_renewal) => {}
            }

            if let Err(e) = self.locks.renew_before(&mut lease, ttl, stop_at).await {
                error!(lock = %lease.name, token = %lease.fencing_token, error = %e, "gateway lease lost");
                self.step_down(LeadershipLoss::LeaseLost(e.to_string()), None).await;
                return;
            }
        }
    }

    /// Stop the controller first, then give up the lease if it is still
    /// ours, then clear the leader row.
    async fn step_down(&self, reason: LeadershipLoss, held: Option<&Lease>) {
        self.controller.on_lose_leadership(reason.clone()).await;
        self.set_state(ElectorState::Follower);
        if reason != LeadershipLoss::Shutdown {
            self.counters.leadership_losses.fetch_add(1, Ordering::Relaxed);
        }
        info!(reason = %reason, "stepped down from gateway leader");

        if let Some(lease) = held {
            self.release(lease).await;
        }
        if let Err(e) = self.membership.demote().await {
            warn!(error = %e, "failed to clear leader row");
        }
    }

    async fn release(&self, lease: &Lease) {
        if let Err(e) = self.locks.release(lease).await {
            warn!(lock = %lease.name, token = %lease.fencing_token, error = %e, "failed to release gateway lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{CoordinationStore, MemoryStore};
    use crate::config::MembershipConfig;
    use crate::coordination::{RetryPolicy, Shutdown, ShutdownSignal};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Start(FencingToken),
        Stop(LeadershipLoss),
    }

    #[derive(Default)]
    struct RecordingController {
        events: Mutex<Vec<Event>>,
        /// Local deadline of the current lease and the instant stop was called
        deadlines: Mutex<Vec<(Instant, Instant)>>,
        current_deadline: Mutex<Option<Instant>>,
        fail_starts: AtomicU64,
    }

    impl RecordingController {
        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl GatewayController for RecordingController {
        async fn on_become_leader(&self, lease: &Lease) -> anyhow::Result<()> {
            self.events.lock().unwrap().push(Event::Start(lease.fencing_token));
            *self.current_deadline.lock().unwrap() = Some(lease.valid_until);
            if self.fail_starts.load(Ordering::SeqCst) > 0 {
                self.fail_starts.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("gateway refused to start");
            }
            Ok(())
        }

        async fn on_lose_leadership(&self, reason: LeadershipLoss) {
            self.events.lock().unwrap().push(Event::Stop(reason));
            if let Some(deadline) = *self.current_deadline.lock().unwrap() {
                self.deadlines.lock().unwrap().push((deadline, Instant::now()));
            }
        }
    }

    fn elector(
        store: &Arc<MemoryStore>,
        node_id: &str,
        controller: Arc<RecordingController>,
    ) -> Arc<GatewayElector> {
        let retry = RetryPolicy::default();
        let membership = ClusterMembership::new(
            store.clone(),
            node_id,
            "gateway-leader",
            MembershipConfig::default(),
            retry,
        );
        Arc::new(GatewayElector::new(
            LockManager::new(store.clone(), retry),
            membership,
            controller,
            ElectionConfig::default(),
        ))
    }

    fn spawn(elector: &Arc<GatewayElector>, shutdown: &Shutdown) -> tokio::task::JoinHandle<()> {
        let elector = elector.clone();
        let token = shutdown.token();
        tokio::spawn(async move { elector.run(token).await })
    }

    async fn wait_leader(elector: &GatewayElector) -> FencingToken {
        let mut rx = elector.subscribe();
        let state = *tokio::time::timeout(Duration::from_secs(60), rx.wait_for(|s| s.is_leader()))
            .await
            .expect("leadership not reached")
            .unwrap();
        match state {
            ElectorState::Leader { token } => token,
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_node_leads_and_steps_down_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let controller = Arc::new(RecordingController::default());
        let a = elector(&store, "a", controller.clone());
        let shutdown = Shutdown::new();
        let task = spawn(&a, &shutdown);

        assert_eq!(wait_leader(&a).await, FencingToken(1));

        // several renewals go by
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(a.state().is_leader());

        shutdown.request_shutdown(ShutdownSignal::Graceful);
        task.await.unwrap();

        assert_eq!(
            controller.events(),
            vec![
                Event::Start(FencingToken(1)),
                Event::Stop(LeadershipLoss::Shutdown)
            ]
        );
        let record = store.get_lock("gateway-leader").await.unwrap().unwrap();
        assert_eq!(record.holder_id, None);
        assert_eq!(a.state(), ElectorState::Follower);
        assert_eq!(a.stats().terms_won, 1);
        assert_eq!(a.stats().leadership_losses, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_stops_controller_before_lease_expires() {
        let store = Arc::new(MemoryStore::new());
        let controller = Arc::new(RecordingController::default());
        let a = elector(&store, "a", controller.clone());
        let shutdown = Shutdown::new();
        let task = spawn(&a, &shutdown);

        wait_leader(&a).await;
        store.set_available(false);

        let mut rx = a.subscribe();
        tokio::time::timeout(Duration::from_secs(20), rx.wait_for(|s| !s.is_leader()))
            .await
            .unwrap()
            .unwrap();

        let deadlines = controller.deadlines.lock().unwrap().clone();
        assert_eq!(deadlines.len(), 1);
        let (valid_until, stopped_at) = deadlines[0];
        assert!(stopped_at + ElectionConfig::default().stop_margin() <= valid_until);
        assert!(matches!(
            controller.events().last(),
            Some(Event::Stop(LeadershipLoss::LeaseLost(_)))
        ));

        shutdown.request_shutdown(ShutdownSignal::Graceful);
        task.await.unwrap();
        assert_eq!(a.stats().leadership_losses, 1);
    }

    /// On a lost lease, checks from inside the stop callback whether the
    /// lease is still exclusively held by "a".
    struct ExclusivityCheck {
        store: Arc<MemoryStore>,
        observed: Mutex<Option<(bool, bool)>>,
    }

    #[async_trait]
    impl GatewayController for ExclusivityCheck {
        async fn on_become_leader(&self, _lease: &Lease) -> anyhow::Result<()> {
            Ok(())
        }

        async fn on_lose_leadership(&self, reason: LeadershipLoss) {
            if !matches!(reason, LeadershipLoss::LeaseLost(_)) {
                return;
            }
            let record = self.store.get_lock("gateway-leader").await.unwrap().unwrap();
            let still_ours = record.holder_id.as_deref() == Some("a")
                && record.is_held_at(self.store.now());
            let other_refused = matches!(
                self.store
                    .acquire_lock("gateway-leader", "b", Duration::from_secs(10))
                    .await,
                Err(IbcError::LockHeld { .. })
            );
            self.observed
                .lock()
                .unwrap()
                .get_or_insert((still_ours, other_refused));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_renewal_stops_controller_while_lease_is_exclusive() {
        let store = Arc::new(MemoryStore::new());
        let controller = Arc::new(ExclusivityCheck {
            store: store.clone(),
            observed: Mutex::new(None),
        });
        let retry = RetryPolicy::default();
        let a = Arc::new(GatewayElector::new(
            LockManager::new(store.clone(), retry),
            ClusterMembership::new(
                store.clone(),
                "a",
                "gateway-leader",
                MembershipConfig::default(),
                retry,
            ),
            controller.clone(),
            ElectionConfig::default(),
        ));
        let shutdown = Shutdown::new();
        let task = spawn(&a, &shutdown);

        wait_leader(&a).await;
        store.stall_renewals(true);

        tokio::time::timeout(Duration::from_secs(30), async {
            while controller.observed.lock().unwrap().is_none() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .unwrap();

        let (still_ours, other_refused) = controller.observed.lock().unwrap().unwrap();
        assert!(still_ours, "lease expired before the controller was stopped");
        assert!(other_refused, "another node acquired the lease during stop");

        store.stall_renewals(false);
        shutdown.request_shutdown(ShutdownSignal::Graceful);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_start_releases_and_retries() {
        let store = Arc::new(MemoryStore::new());
        let controller = Arc::new(RecordingController::default());
        controller.fail_starts.store(1, Ordering::SeqCst);
        let a = elector(&store, "a", controller.clone());
        let shutdown = Shutdown::new();
        let task = spawn(&a, &shutdown);

        // first term fails, the second one sticks
        let mut rx = a.subscribe();
        tokio::time::timeout(
            Duration::from_secs(60),
            rx.wait_for(|s| *s == ElectorState::Leader { token: FencingToken(2) }),
        )
        .await
        .unwrap()
        .unwrap();

        let events = controller.events();
        assert_eq!(events[0], Event::Start(FencingToken(1)));
        assert!(matches!(events[1], Event::Stop(LeadershipLoss::StartFailed(_))));
        assert_eq!(events[2], Event::Start(FencingToken(2)));

        shutdown.request_shutdown(ShutdownSignal::Graceful);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_standby_takes_over_after_leader_leaves() {
        let store = Arc::new(MemoryStore::new());
        let ca = Arc::new(RecordingController::default());
        let cb = Arc::new(RecordingController::default());
        let a = elector(&store, "a", ca.clone());
        let b = elector(&store, "b", cb.clone());

        let shutdown_a = Shutdown::new();
        let shutdown_b = Shutdown::new();
        let task_a = spawn(&a, &shutdown_a);
        assert_eq!(wait_leader(&a).await, FencingToken(1));
        let task_b = spawn(&b, &shutdown_b);

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(!b.state().is_leader());
        assert!(b.stats().acquisition_attempts > 1);

        shutdown_a.request_shutdown(ShutdownSignal::Graceful);
        task_a.await.unwrap();

        assert_eq!(wait_leader(&b).await, FencingToken(2));
        assert_eq!(cb.events(), vec![Event::Start(FencingToken(2))]);

        shutdown_b.request_shutdown(ShutdownSignal::Graceful);
        task_b.await.unwrap();
    }
}
