//! In-process coordination store
//!
//! Mirrors the Postgres semantics table for table. Each operation runs under a
//! single mutex, which plays the role of the database transaction. Time comes
//! from tokio's clock, so tests on a paused runtime can expire leases with
//! `tokio::time::advance`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::Instant;
use tracing::debug;

use super::store::{millis, CoordinationStore};
use crate::domain::{
    ChannelWatermark, ClusterNode, ClusterView, FencingToken, LeaseGrant, LockRecord, Message,
    NodeRole, SequenceId,
};
use crate::error::{IbcError, Result};

#[derive(Debug, Clone, Copy)]
struct CursorRow {
    last_delivered: SequenceId,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Tables {
    locks: HashMap<String, LockRecord>,
    nodes: BTreeMap<String, ClusterNode>,
    counters: BTreeMap<String, ChannelWatermark>,
    messages: HashMap<String, BTreeMap<SequenceId, Message>>,
    cursors: HashMap<(String, String), CursorRow>,
}

impl Tables {
    fn lease_matches(&self, name: &str, holder_id: &str, token: FencingToken, now: DateTime<Utc>) -> Option<&LockRecord> {
        self.locks.get(name).filter(|lock| {
            lock.holder_id.as_deref() == Some(holder_id)
                && lock.fencing_token == token
                && lock.is_held_at(now)
        })
    }
}

pub struct MemoryStore {
    tables: Mutex<Tables>,
    epoch: DateTime<Utc>,
    started: Instant,
    available: AtomicBool,
    renewals_stalled: watch::Sender<bool>,
    changes: broadcast::Sender<String>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            tables: Mutex::new(Tables::default()),
            epoch: Utc::now(),
            started: Instant::now(),
            available: AtomicBool::new(true),
            renewals_stalled: watch::channel(false).0,
            changes,
        }
    }

    /// Simulate losing (or regaining) the database connection. While
    /// unavailable every operation fails with `ConnectionLost`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Simulate a stalled connection for lease renewals only. While stalled,
    /// `renew_lock` calls neither succeed nor fail; they wait until the stall
    /// is lifted.
    pub fn stall_renewals(&self, stalled: bool) {
        self.renewals_stalled.send_replace(stalled);
    }

    /// Current store time
    pub fn now(&self) -> DateTime<Utc> {
        self.epoch + chrono_duration(self.started.elapsed())
    }

    /// Membership rows as stored, without masking stale leader flags
    pub async fn nodes(&self) -> Vec<ClusterNode> {
        self.tables.lock().await.nodes.values().cloned().collect()
    }

    async fn wait_while_renewals_stalled(&self) {
        let mut stalled = self.renewals_stalled.subscribe();
        let _ = stalled.wait_for(|stalled| !*stalled).await;
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(IbcError::ConnectionLost("memory store unavailable".to_string()))
        }
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(millis(duration))
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    // ==================== Locks ====================

    async fn acquire_lock(&self, name: &str, holder_id: &str, ttl: Duration) -> Result<LeaseGrant> {
        self.ensure_available()?;
        let now = self.now();
        let mut tables = self.tables.lock().await;

        let lock = tables.locks.entry(name.to_string()).or_insert_with(|| LockRecord {
            name: name.to_string(),
            holder_id: None,
            fencing_token: FencingToken(0),
            expires_at: None,
        });

        let claimable = !lock.is_held_at(now) || lock.holder_id.as_deref() == Some(holder_id);
        if !claimable {
            return Err(IbcError::LockHeld {
                name: name.to_string(),
                holder: lock.holder_id.clone().unwrap_or_default(),
                expires_at: lock.expires_at.unwrap_or(now),
            });
        }

        let expires_at = now + chrono_duration(ttl);
        lock.holder_id = Some(holder_id.to_string());
        lock.fencing_token = FencingToken(lock.fencing_token.value() + 1);
        lock.expires_at = Some(expires_at);

        debug!(lock = name, holder = holder_id, token = %lock.fencing_token, "lock acquired");
        Ok(LeaseGrant {
            fencing_token: lock.fencing_token,
            expires_at,
        })
    }

    async fn renew_lock(
        &self,
        name: &str,
        holder_id: &str,
        token: FencingToken,
        ttl: Duration,
    ) -> Result<LeaseGrant> {
        self.wait_while_renewals_stalled().await;
        self.ensure_available()?;
        let now = self.now();
        let mut tables = self.tables.lock().await;

        if tables.lease_matches(name, holder_id, token, now).is_none() {
            return Err(IbcError::lock_not_owned(name, holder_id, token.value()));
        }

        let expires_at = now + chrono_duration(ttl);
        if let Some(lock) = tables.locks.get_mut(name) {
            lock.expires_at = Some(expires_at);
        }
        Ok(LeaseGrant {
            fencing_token: token,
            expires_at,
        })
    }

    async fn release_lock(&self, name: &str, holder_id: &str, token: FencingToken) -> Result<()> {
        self.ensure_available()?;
        let mut tables = self.tables.lock().await;

        match tables.locks.get_mut(name) {
            Some(lock) if lock.holder_id.as_deref() == Some(holder_id) && lock.fencing_token == token => {
                lock.holder_id = None;
                lock.expires_at = None;
                Ok(())
            }
            _ => Err(IbcError::lock_not_owned(name, holder_id, token.value())),
        }
    }

    async fn check_lock(
        &self,
        name: &str,
        holder_id: &str,
        token: FencingToken,
    ) -> Result<LeaseGrant> {
        self.ensure_available()?;
        let now = self.now();
        let tables = self.tables.lock().await;

        tables
            .lease_matches(name, holder_id, token, now)
            .and_then(|lock| {
                lock.expires_at.map(|expires_at| LeaseGrant {
                    fencing_token: lock.fencing_token,
                    expires_at,
                })
            })
            .ok_or_else(|| IbcError::lock_not_owned(name, holder_id, token.value()))
    }

    async fn get_lock(&self, name: &str) -> Result<Option<LockRecord>> {
        self.ensure_available()?;
        Ok(self.tables.lock().await.locks.get(name).cloned())
    }

    // ==================== Membership ====================

    async fn register_node(&self, node_id: &str) -> Result<()> {
        self.ensure_available()?;
        let now = self.now();
        self.tables.lock().await.nodes.insert(
            node_id.to_string(),
            ClusterNode {
                node_id: node_id.to_string(),
                last_heartbeat_at: now,
                role: NodeRole::Follower,
            },
        );
        Ok(())
    }

    async fn heartbeat_node(&self, node_id: &str) -> Result<DateTime<Utc>> {
        self.ensure_available()?;
        let now = self.now();
        let mut tables = self.tables.lock().await;
        tables
            .nodes
            .entry(node_id.to_string())
            .and_modify(|node| node.last_heartbeat_at = now)
            .or_insert_with(|| ClusterNode {
                node_id: node_id.to_string(),
                last_heartbeat_at: now,
                role: NodeRole::Follower,
            });
        Ok(now)
    }

    async fn remove_node(&self, node_id: &str) -> Result<()> {
        self.ensure_available()?;
        self.tables.lock().await.nodes.remove(node_id);
        Ok(())
    }

    async fn cluster_view(&self, leader_lock: &str) -> Result<ClusterView> {
        self.ensure_available()?;
        let now = self.now();
        let tables = self.tables.lock().await;
        let lock = tables.locks.get(leader_lock);

        let nodes = tables
            .nodes
            .values()
            .map(|node| {
                let holds_lock = lock.map_or(false, |l| {
                    l.holder_id.as_deref() == Some(node.node_id.as_str()) && l.is_held_at(now)
                });
                let role = if node.role == NodeRole::GatewayLeader && holds_lock {
                    NodeRole::GatewayLeader
                } else {
                    NodeRole::Follower
                };
                ClusterNode { role, ..node.clone() }
            })
            .collect();

        Ok(ClusterView {
            observed_at: now,
            nodes,
        })
    }

    async fn promote_node(&self, node_id: &str, lock_name: &str, token: FencingToken) -> Result<()> {
        self.ensure_available()?;
        let now = self.now();
        let mut tables = self.tables.lock().await;

        if tables.lease_matches(lock_name, node_id, token, now).is_none() {
            return Err(IbcError::lock_not_owned(lock_name, node_id, token.value()));
        }

        for node in tables.nodes.values_mut() {
            if node.node_id != node_id {
                node.role = NodeRole::Follower;
            }
        }
        tables
            .nodes
            .entry(node_id.to_string())
            .or_insert_with(|| ClusterNode {
                node_id: node_id.to_string(),
                last_heartbeat_at: now,
                role: NodeRole::Follower,
            })
            .role = NodeRole::GatewayLeader;
        Ok(())
    }

    async fn demote_node(&self, node_id: &str) -> Result<()> {
        self.ensure_available()?;
        if let Some(node) = self.tables.lock().await.nodes.get_mut(node_id) {
            node.role = NodeRole::Follower;
        }
        Ok(())
    }

    async fn prune_nodes(&self, dead_for: Duration) -> Result<u64> {
        self.ensure_available()?;
        let cutoff = self.now() - chrono_duration(dead_for);
        let mut tables = self.tables.lock().await;
        let before = tables.nodes.len();
        tables.nodes.retain(|_, node| node.last_heartbeat_at >= cutoff);
        Ok((before - tables.nodes.len()) as u64)
    }

    // ==================== Pub-sub ====================

    async fn append_message(&self, channel: &str, payload: &[u8]) -> Result<Message> {
        self.ensure_available()?;
        let now = self.now();
        let mut tables = self.tables.lock().await;

        let counter = tables.counters.entry(channel.to_string()).or_default();
        counter.last_sequence_id += 1;
        let message = Message {
            channel: channel.to_string(),
            sequence_id: counter.last_sequence_id,
            payload: payload.to_vec(),
            published_at: now,
        };
        tables
            .messages
            .entry(channel.to_string())
            .or_default()
            .insert(message.sequence_id, message.clone());
        drop(tables);

        let _ = self.changes.send(channel.to_string());
        Ok(message)
    }

    async fn fetch_messages(
        &self,
        channel: &str,
        after: SequenceId,
        limit: u32,
    ) -> Result<Vec<Message>> {
        self.ensure_available()?;
        let tables = self.tables.lock().await;
        Ok(tables
            .messages
            .get(channel)
            .map(|log| {
                log.range(after.saturating_add(1)..)
                    .take(limit as usize)
                    .map(|(_, message)| message.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn channel_watermark(&self, channel: &str) -> Result<ChannelWatermark> {
        self.ensure_available()?;
        Ok(self
            .tables
            .lock()
            .await
            .counters
            .get(channel)
            .copied()
            .unwrap_or_default())
    }

    async fn list_channels(&self) -> Result<Vec<String>> {
        self.ensure_available()?;
        Ok(self.tables.lock().await.counters.keys().cloned().collect())
    }

    async fn open_cursor(
        &self,
        subscriber_id: &str,
        channel: &str,
        initial: SequenceId,
    ) -> Result<SequenceId> {
        self.ensure_available()?;
        let now = self.now();
        let mut tables = self.tables.lock().await;
        let row = tables
            .cursors
            .entry((subscriber_id.to_string(), channel.to_string()))
            .or_insert(CursorRow {
                last_delivered: initial,
                updated_at: now,
            });
        row.updated_at = now;
        Ok(row.last_delivered)
    }

    async fn load_cursor(&self, subscriber_id: &str, channel: &str) -> Result<Option<SequenceId>> {
        self.ensure_available()?;
        let tables = self.tables.lock().await;
        Ok(tables
            .cursors
            .get(&(subscriber_id.to_string(), channel.to_string()))
            .map(|row| row.last_delivered))
    }

    async fn advance_cursor(
        &self,
        subscriber_id: &str,
        channel: &str,
        sequence_id: SequenceId,
    ) -> Result<()> {
        self.ensure_available()?;
        let now = self.now();
        let mut tables = self.tables.lock().await;
        let row = tables
            .cursors
            .entry((subscriber_id.to_string(), channel.to_string()))
            .or_insert(CursorRow {
                last_delivered: sequence_id,
                updated_at: now,
            });
        row.last_delivered = row.last_delivered.max(sequence_id);
        row.updated_at = now;
        Ok(())
    }

    async fn touch_cursor(&self, subscriber_id: &str, channel: &str) -> Result<()> {
        self.ensure_available()?;
        let now = self.now();
        let mut tables = self.tables.lock().await;
        if let Some(row) = tables
            .cursors
            .get_mut(&(subscriber_id.to_string(), channel.to_string()))
        {
            row.updated_at = now;
        }
        Ok(())
    }

    async fn delete_cursor(&self, subscriber_id: &str, channel: &str) -> Result<bool> {
        self.ensure_available()?;
        let mut tables = self.tables.lock().await;
        Ok(tables
            .cursors
            .remove(&(subscriber_id.to_string(), channel.to_string()))
            .is_some())
    }

    async fn prune_channel(
        &self,
        channel: &str,
        retention: Duration,
        active_within: Duration,
    ) -> Result<u64> {
        self.ensure_available()?;
        let now = self.now();
        let expired_before = now - chrono_duration(retention);
        let active_since = now - chrono_duration(active_within);
        let mut tables = self.tables.lock().await;

        let Some(pruned_through) = tables.counters.get(channel).map(|c| c.pruned_through) else {
            return Ok(0);
        };

        let expired_through = tables.messages.get(channel).and_then(|log| {
            log.values()
                .filter(|message| message.published_at < expired_before)
                .map(|message| message.sequence_id)
                .max()
        });
        let oldest_cursor = tables
            .cursors
            .iter()
            .filter(|((_, c), row)| c == channel && row.updated_at >= active_since)
            .map(|(_, row)| row.last_delivered)
            .min();

        let cutoff = match (expired_through, oldest_cursor) {
            (Some(expired), Some(cursor)) => expired.min(cursor),
            (Some(expired), None) => expired,
            (None, _) => pruned_through,
        };
        if cutoff <= pruned_through {
            return Ok(0);
        }

        let mut deleted = 0u64;
        if let Some(log) = tables.messages.get_mut(channel) {
            let retained = log.split_off(&(cutoff + 1));
            deleted = log.len() as u64;
            *log = retained;
        }
        if let Some(counter) = tables.counters.get_mut(channel) {
            counter.pruned_through = cutoff;
        }
        Ok(deleted)
    }

    fn change_feed(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(10);

    #[tokio::test(start_paused = true)]
    async fn test_lock_row_created_on_first_acquire() {
        let store = MemoryStore::new();
        assert!(store.get_lock("gateway-leader").await.unwrap().is_none());

        let grant = store.acquire_lock("gateway-leader", "a", TTL).await.unwrap();
        assert_eq!(grant.fencing_token, FencingToken(1));

        let record = store.get_lock("gateway-leader").await.unwrap().unwrap();
        assert_eq!(record.holder_id.as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_keeps_token_history() {
        let store = MemoryStore::new();
        let first = store.acquire_lock("l", "a", TTL).await.unwrap();
        store.release_lock("l", "a", first.fencing_token).await.unwrap();

        let record = store.get_lock("l").await.unwrap().unwrap();
        assert_eq!(record.holder_id, None);
        assert_eq!(record.expires_at, None);

        let second = store.acquire_lock("l", "b", TTL).await.unwrap();
        assert_eq!(second.fencing_token, FencingToken(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_rejects_expired_lease() {
        let store = MemoryStore::new();
        let grant = store.acquire_lock("l", "a", TTL).await.unwrap();

        tokio::time::advance(TTL).await;
        let err = store
            .renew_lock("l", "a", grant.fencing_token, TTL)
            .await
            .unwrap_err();
        assert!(err.is_ownership_loss());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_store_reports_connection_lost() {
        let store = MemoryStore::new();
        store.set_available(false);
        let err = store.acquire_lock("l", "a", TTL).await.unwrap_err();
        assert!(err.is_transient());

        store.set_available(true);
        assert!(store.acquire_lock("l", "a", TTL).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_promote_demotes_previous_leader_row() {
        let store = MemoryStore::new();
        store.register_node("a").await.unwrap();
        store.register_node("b").await.unwrap();

        let a = store.acquire_lock("gw", "a", TTL).await.unwrap();
        store.promote_node("a", "gw", a.fencing_token).await.unwrap();

        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        let b = store.acquire_lock("gw", "b", TTL).await.unwrap();
        store.promote_node("b", "gw", b.fencing_token).await.unwrap();

        // stale token can no longer promote
        let err = store.promote_node("a", "gw", a.fencing_token).await.unwrap_err();
        assert!(err.is_ownership_loss());

        let leaders: Vec<_> = store
            .nodes()
            .await
            .into_iter()
            .filter(|n| n.role == NodeRole::GatewayLeader)
            .map(|n| n.node_id)
            .collect();
        assert_eq!(leaders, vec!["b".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_respects_active_cursor() {
        let store = MemoryStore::new();
        for i in 0..5u8 {
            store.append_message("orders", &[i]).await.unwrap();
        }
        store.open_cursor("worker", "orders", 2).await.unwrap();

        tokio::time::advance(Duration::from_secs(120)).await;
        store.touch_cursor("worker", "orders").await.unwrap();

        let deleted = store
            .prune_channel("orders", Duration::from_secs(60), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(deleted, 2);

        let mark = store.channel_watermark("orders").await.unwrap();
        assert_eq!(mark.pruned_through, 2);
        assert_eq!(mark.last_sequence_id, 5);

        let remaining = store.fetch_messages("orders", 0, 10).await.unwrap();
        let ids: Vec<_> = remaining.iter().map(|m| m.sequence_id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
    }
}
