//! Coordination store abstraction
//!
//! Every method is one atomic database transaction with explicit pre-image
//! checks. Components hold an `Arc<dyn CoordinationStore>` handed to their
//! constructors; nothing reaches the database any other way.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::domain::{
    ChannelWatermark, ClusterView, FencingToken, LeaseGrant, LockRecord, Message, SequenceId,
};
use crate::error::Result;

/// Name of the Postgres NOTIFY channel carrying pub-sub wakeups
pub const CHANGE_CHANNEL: &str = "ibc_messages";

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    // ==================== Locks ====================

    /// Claim `name` for `holder_id` if it is free, expired, or already held by
    /// `holder_id`. Bumps the fencing token. Fails with `LockHeld` otherwise.
    async fn acquire_lock(&self, name: &str, holder_id: &str, ttl: Duration) -> Result<LeaseGrant>;

    /// Extend a live lease whose holder and token match exactly.
    /// Fails with `LockNotOwned` otherwise.
    async fn renew_lock(
        &self,
        name: &str,
        holder_id: &str,
        token: FencingToken,
        ttl: Duration,
    ) -> Result<LeaseGrant>;

    /// Clear holder and expiry if the token matches. Fails with `LockNotOwned` otherwise.
    async fn release_lock(&self, name: &str, holder_id: &str, token: FencingToken) -> Result<()>;

    /// Read-only fencing check: succeeds only while the lease is current.
    async fn check_lock(&self, name: &str, holder_id: &str, token: FencingToken)
        -> Result<LeaseGrant>;

    async fn get_lock(&self, name: &str) -> Result<Option<LockRecord>>;

    // ==================== Membership ====================

    /// Insert or reset this node's row as a follower with a fresh heartbeat.
    async fn register_node(&self, node_id: &str) -> Result<()>;

    /// Refresh `last_heartbeat_at`, recreating the row if it was pruned.
    async fn heartbeat_node(&self, node_id: &str) -> Result<DateTime<Utc>>;

    async fn remove_node(&self, node_id: &str) -> Result<()>;

    /// All nodes. A row only reports gateway-leader while `leader_lock` is
    /// held by that node and unexpired.
    async fn cluster_view(&self, leader_lock: &str) -> Result<ClusterView>;

    /// Mark `node_id` gateway-leader after verifying it holds `lock_name` with
    /// `token`; any other leader row is demoted in the same transaction.
    async fn promote_node(&self, node_id: &str, lock_name: &str, token: FencingToken) -> Result<()>;

    async fn demote_node(&self, node_id: &str) -> Result<()>;

    /// Delete nodes without a heartbeat for longer than `dead_for`.
    async fn prune_nodes(&self, dead_for: Duration) -> Result<u64>;

    // ==================== Pub-sub ====================

    /// Append to `channel` with the next per-channel sequence id and emit a
    /// change notification in the same transaction.
    async fn append_message(&self, channel: &str, payload: &[u8]) -> Result<Message>;

    /// Messages with `sequence_id > after`, ascending.
    async fn fetch_messages(&self, channel: &str, after: SequenceId, limit: u32)
        -> Result<Vec<Message>>;

    async fn channel_watermark(&self, channel: &str) -> Result<ChannelWatermark>;

    async fn list_channels(&self) -> Result<Vec<String>>;

    /// Create the cursor at `initial` unless one exists; returns the persisted value.
    async fn open_cursor(&self, subscriber_id: &str, channel: &str, initial: SequenceId)
        -> Result<SequenceId>;

    async fn load_cursor(&self, subscriber_id: &str, channel: &str) -> Result<Option<SequenceId>>;

    /// Move the cursor forward to `sequence_id`; never moves it backwards.
    async fn advance_cursor(&self, subscriber_id: &str, channel: &str, sequence_id: SequenceId)
        -> Result<()>;

    /// Mark the cursor as active without moving it.
    async fn touch_cursor(&self, subscriber_id: &str, channel: &str) -> Result<()>;

    async fn delete_cursor(&self, subscriber_id: &str, channel: &str) -> Result<bool>;

    /// Delete the contiguous prefix of `channel` older than `retention`, capped
    /// at the lowest cursor touched within `active_within`. Returns rows removed.
    async fn prune_channel(&self, channel: &str, retention: Duration, active_within: Duration)
        -> Result<u64>;

    /// Channel names of appended messages, as they are published.
    fn change_feed(&self) -> broadcast::Receiver<String>;
}

/// Milliseconds for SQL interval arithmetic
pub(crate) fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
