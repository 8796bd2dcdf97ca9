//! Node liveness via periodic heartbeats
//!
//! Membership is diagnostic. Exclusivity comes from the lock table alone; the
//! leader flag on a node row is only reported while that node's lease is live.

use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::retry::RetryPolicy;
use super::shutdown::ShutdownToken;
use crate::adapters::CoordinationStore;
use crate::config::MembershipConfig;
use crate::domain::{ClusterView, Lease, NodeRole, NodeStatus};
use crate::error::Result;

pub type NodeId = String;

#[derive(Clone)]
pub struct ClusterMembership {
    store: Arc<dyn CoordinationStore>,
    node_id: NodeId,
    leader_lock: String,
    config: MembershipConfig,
    retry: RetryPolicy,
}

impl ClusterMembership {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        node_id: impl Into<NodeId>,
        leader_lock: impl Into<String>,
        config: MembershipConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            node_id: node_id.into(),
            leader_lock: leader_lock.into(),
            config,
            retry,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub async fn register(&self) -> Result<()> {
        self.retry
            .run("register_node", || self.store.register_node(&self.node_id))
            .await?;
        info!(node_id = %self.node_id, "node registered");
        Ok(())
    }

    pub async fn heartbeat(&self) -> Result<()> {
        let at = self.store.heartbeat_node(&self.node_id).await?;
        debug!(node_id = %self.node_id, at = %at, "heartbeat");
        Ok(())
    }

    pub async fn deregister(&self) -> Result<()> {
        self.store.remove_node(&self.node_id).await?;
        info!(node_id = %self.node_id, "node deregistered");
        Ok(())
    }

    /// Heartbeat until shutdown, pruning long-dead rows along the way. The
    /// node's own row is removed on the way out.
    pub async fn run(&self, shutdown: ShutdownToken) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut prune = tokio::time::interval(self.config.dead_threshold());
        prune.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = heartbeat.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        warn!(node_id = %self.node_id, error = %e, "heartbeat failed");
                    }
                }
                _ = prune.tick() => {
                    match self.store.prune_nodes(self.config.prune_after()).await {
                        Ok(0) => {}
                        Ok(removed) => info!(removed, "pruned dead nodes"),
                        Err(e) => warn!(error = %e, "node prune failed"),
                    }
                }
            }
        }

        if let Err(e) = self.deregister().await {
            warn!(node_id = %self.node_id, error = %e, "failed to deregister node");
        }
    }

    pub async fn view(&self) -> Result<ClusterView> {
        self.store.cluster_view(&self.leader_lock).await
    }

    /// Rows with their liveness judged at database time
    pub async fn list_nodes(&self) -> Result<Vec<NodeStatus>> {
        let view = self.view().await?;
        let threshold = chrono::Duration::milliseconds(self.config.dead_threshold_ms as i64);

        Ok(view
            .nodes
            .into_iter()
            .map(|node| {
                let age = view.observed_at - node.last_heartbeat_at;
                NodeStatus {
                    alive: age <= threshold,
                    heartbeat_age_ms: age.num_milliseconds(),
                    node,
                }
            })
            .collect())
    }

    pub async fn list_live(&self) -> Result<BTreeSet<NodeId>> {
        Ok(self
            .list_nodes()
            .await?
            .into_iter()
            .filter(|status| status.alive)
            .map(|status| status.node.node_id)
            .collect())
    }

    /// The node whose leader row is backed by a live lease, if any.
    pub async fn leader(&self) -> Result<Option<NodeId>> {
        Ok(self
            .view()
            .await?
            .nodes
            .into_iter()
            .find(|node| node.role == NodeRole::GatewayLeader)
            .map(|node| node.node_id))
    }

    /// Mark this node as gateway leader. The store verifies `lease` is still
    /// current and demotes any other leader row in the same transaction.
    pub async fn promote(&self, lease: &Lease) -> Result<()> {
        self.store
            .promote_node(&self.node_id, &lease.name, lease.fencing_token)
            .await?;
        info!(node_id = %self.node_id, token = %lease.fencing_token, "promoted to gateway-leader");
        Ok(())
    }

    pub async fn demote(&self) -> Result<()> {
        self.retry
            .run("demote_node", || self.store.demote_node(&self.node_id))
            .await?;
        info!(node_id = %self.node_id, "demoted to follower");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryStore;
    use crate::coordination::{LockManager, Shutdown, ShutdownSignal};
    use std::time::Duration;

    fn membership(store: &Arc<MemoryStore>, node_id: &str) -> ClusterMembership {
        ClusterMembership::new(
            store.clone(),
            node_id,
            "gateway-leader",
            MembershipConfig::default(),
            RetryPolicy::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_nodes_drop_out_of_live_set() {
        let store = Arc::new(MemoryStore::new());
        let a = membership(&store, "a");
        let b = membership(&store, "b");
        a.register().await.unwrap();
        b.register().await.unwrap();

        let live = a.list_live().await.unwrap();
        assert_eq!(live.into_iter().collect::<Vec<_>>(), vec!["a", "b"]);

        tokio::time::advance(Duration::from_secs(11)).await;
        a.heartbeat().await.unwrap();

        let live = a.list_live().await.unwrap();
        assert_eq!(live.into_iter().collect::<Vec<_>>(), vec!["a"]);

        let nodes = a.list_nodes().await.unwrap();
        let stale = nodes.iter().find(|s| s.node.node_id == "b").unwrap();
        assert!(!stale.alive);
        assert_eq!(stale.heartbeat_age_ms, 11_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leader_reported_only_while_lease_live() {
        let store = Arc::new(MemoryStore::new());
        let locks = LockManager::new(store.clone(), RetryPolicy::default());
        let a = membership(&store, "a");
        a.register().await.unwrap();

        let lease = locks
            .acquire("gateway-leader", "a", Duration::from_secs(10))
            .await
            .unwrap();
        a.promote(&lease).await.unwrap();
        assert_eq!(a.leader().await.unwrap().as_deref(), Some("a"));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(a.leader().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_deregisters_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let a = membership(&store, "a");
        a.register().await.unwrap();

        let shutdown = Shutdown::new();
        let task = tokio::spawn({
            let a = a.clone();
            let token = shutdown.token();
            async move { a.run(token).await }
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(a.list_live().await.unwrap().contains("a"));

        shutdown.request_shutdown(ShutdownSignal::Graceful);
        task.await.unwrap();
        assert!(a.list_nodes().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_prunes_long_dead_nodes() {
        let store = Arc::new(MemoryStore::new());
        let config = MembershipConfig {
            prune_after_ms: 20_000,
            ..MembershipConfig::default()
        };
        let a = ClusterMembership::new(
            store.clone(),
            "a",
            "gateway-leader",
            config,
            RetryPolicy::default(),
        );
        membership(&store, "ghost").register().await.unwrap();
        a.register().await.unwrap();

        let shutdown = Shutdown::new();
        let task = tokio::spawn({
            let a = a.clone();
            let token = shutdown.token();
            async move { a.run(token).await }
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        let ids: Vec<_> = a
            .list_nodes()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.node.node_id)
            .collect();
        assert_eq!(ids, vec!["a".to_string()]);

        shutdown.request_shutdown(ShutdownSignal::Graceful);
        task.await.unwrap();
    }
}
