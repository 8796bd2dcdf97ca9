//! One process's view of the cluster
//!
//! `Node` wires every coordination component over a single injected store and
//! owns their background tasks.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::adapters::CoordinationStore;
use crate::config::AppConfig;
use crate::coordination::{
    ClusterMembership, GatewayController, GatewayElector, LockManager, Shutdown, ShutdownSignal,
    ShutdownToken,
};
use crate::error::{IbcError, Result};
use crate::pubsub::{NotificationDispatcher, PubSubBus};

pub struct Node {
    node_id: String,
    locks: LockManager,
    membership: ClusterMembership,
    elector: Arc<GatewayElector>,
    bus: PubSubBus,
    dispatcher: Arc<NotificationDispatcher>,
    /// Stops the elector, which must finish before membership deregisters
    elector_stop: Shutdown,
    shutdown: Shutdown,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Node {
    /// Register this node and start heartbeats, the elector and retention.
    pub async fn start(
        store: Arc<dyn CoordinationStore>,
        config: AppConfig,
        controller: Arc<dyn GatewayController>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|errors| IbcError::Validation(errors.join("; ")))?;

        let node_id = config.node.resolve_id();
        let retry = config.retry.policy();

        let locks = LockManager::new(store.clone(), retry);
        let membership = ClusterMembership::new(
            store.clone(),
            node_id.clone(),
            config.election.lock_name.clone(),
            config.membership.clone(),
            retry,
        );
        let elector = Arc::new(GatewayElector::new(
            locks.clone(),
            membership.clone(),
            controller,
            config.election.clone(),
        ));
        let bus = PubSubBus::new(store.clone(), config.pubsub.clone(), retry);
        let dispatcher = Arc::new(NotificationDispatcher::new(
            bus.clone(),
            config.dispatcher.clone(),
            retry,
        ));

        membership.register().await?;

        let elector_stop = Shutdown::new();
        let shutdown = Shutdown::new();
        let mut tasks = Vec::new();
        tasks.push(("elector", {
            let elector = elector.clone();
            let token = elector_stop.token();
            tokio::spawn(async move { elector.run(token).await })
        }));
        tasks.push(("membership", {
            let membership = membership.clone();
            let token = shutdown.token();
            tokio::spawn(async move { membership.run(token).await })
        }));
        tasks.push(("retention", {
            let bus = bus.clone();
            let token = shutdown.token();
            tokio::spawn(async move { bus.run_retention(token).await })
        }));

        info!(node_id = %node_id, "node started");
        Ok(Self {
            node_id,
            locks,
            membership,
            elector,
            bus,
            dispatcher,
            elector_stop,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn membership(&self) -> &ClusterMembership {
        &self.membership
    }

    pub fn elector(&self) -> &GatewayElector {
        &self.elector
    }

    pub fn bus(&self) -> &PubSubBus {
        &self.bus
    }

    pub fn dispatcher(&self) -> &NotificationDispatcher {
        &self.dispatcher
    }

    /// Token that fires when this node shuts down
    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.token()
    }

    /// Stop all background work and wait for it. The elector finishes
    /// (controller stopped, lease released, row demoted) before membership
    /// removes the node row. Safe to call more than once.
    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_empty() {
            return;
        }

        info!(node_id = %self.node_id, "node shutting down");
        self.elector_stop.request_shutdown(ShutdownSignal::Graceful);
        self.dispatcher.shutdown().await;

        // elector first, so the lease is released while the node row exists
        let (elector, rest): (Vec<_>, Vec<_>) =
            tasks.drain(..).partition(|(name, _)| *name == "elector");
        for (name, task) in elector {
            if let Err(e) = task.await {
                warn!(task = name, error = %e, "background task panicked");
            }
        }

        self.shutdown.request_shutdown(ShutdownSignal::Graceful);
        for (name, task) in rest {
            if let Err(e) = task.await {
                warn!(task = name, error = %e, "background task panicked");
            }
        }
        info!(node_id = %self.node_id, "node stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryStore;
    use crate::coordination::{ElectorState, LeadershipLoss};
    use crate::domain::Lease;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Noop;

    #[async_trait]
    impl GatewayController for Noop {
        async fn on_become_leader(&self, _lease: &Lease) -> anyhow::Result<()> {
            Ok(())
        }

        async fn on_lose_leadership(&self, _reason: LeadershipLoss) {}
    }

    fn config(id: &str) -> AppConfig {
        let mut config = AppConfig::with_database_url("postgres://localhost/ibc_test");
        config.node.id = Some(id.to_string());
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_idempotent_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let node = Node::start(store.clone(), config("a"), Arc::new(Noop)).await.unwrap();
        assert_eq!(node.node_id(), "a");

        let mut state = node.elector().subscribe();
        tokio::time::timeout(Duration::from_secs(30), state.wait_for(|s| s.is_leader()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(node.membership().leader().await.unwrap().as_deref(), Some("a"));

        node.shutdown().await;
        node.shutdown().await;

        assert_eq!(node.elector().state(), ElectorState::Follower);
        assert!(store.get_lock("gateway-leader").await.unwrap().unwrap().holder_id.is_none());
        assert!(node.membership().list_nodes().await.unwrap().is_empty());
    }

    /// Records whether this node's membership row still existed when the
    /// controller was stopped.
    struct RowCheck {
        store: Arc<MemoryStore>,
        row_present: std::sync::Mutex<Option<bool>>,
    }

    #[async_trait]
    impl GatewayController for RowCheck {
        async fn on_become_leader(&self, _lease: &Lease) -> anyhow::Result<()> {
            Ok(())
        }

        async fn on_lose_leadership(&self, _reason: LeadershipLoss) {
            // give a concurrently cancelled membership loop time to run
            tokio::time::sleep(Duration::from_millis(100)).await;
            let present = self.store.nodes().await.iter().any(|n| n.node_id == "a");
            *self.row_present.lock().unwrap() = Some(present);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_leadership_handed_back_before_deregistering() {
        let store = Arc::new(MemoryStore::new());
        let controller = Arc::new(RowCheck {
            store: store.clone(),
            row_present: std::sync::Mutex::new(None),
        });
        let node = Node::start(store.clone(), config("a"), controller.clone()).await.unwrap();

        let mut state = node.elector().subscribe();
        tokio::time::timeout(Duration::from_secs(30), state.wait_for(|s| s.is_leader()))
            .await
            .unwrap()
            .unwrap();

        node.shutdown().await;

        assert_eq!(*controller.row_present.lock().unwrap(), Some(true));
        assert!(store.nodes().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let mut config = config("a");
        config.dispatcher.queue_capacity = 0;
        let err = Node::start(store, config, Arc::new(Noop)).await.err().unwrap();
        assert!(matches!(err, IbcError::Validation(_)));
    }
}
