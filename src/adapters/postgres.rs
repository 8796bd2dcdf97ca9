use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::store::{millis, CoordinationStore, CHANGE_CHANNEL};
use crate::config::DatabaseConfig;
use crate::coordination::ShutdownToken;
use crate::domain::{
    ChannelWatermark, ClusterNode, ClusterView, FencingToken, LeaseGrant, LockRecord, Message,
    NodeRole, SequenceId,
};
use crate::error::{IbcError, Result};

/// PostgreSQL coordination store
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    changes: broadcast::Sender<String>,
}

impl PostgresStore {
    /// Create a new PostgreSQL store
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_millis(config.acquire_timeout_ms))
            .connect(&config.url)
            .await?;

        info!(max_connections = config.max_connections, "Connected to PostgreSQL");
        Ok(Self::from_pool(pool))
    }

    /// Create a PostgreSQL store from an existing connection pool
    pub fn from_pool(pool: PgPool) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self { pool, changes }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Forward LISTEN notifications into the change feed until shutdown.
    ///
    /// Notifications sent while the listener is reconnecting are lost; the
    /// subscription poll interval covers them.
    pub async fn start_change_listener(&self, shutdown: ShutdownToken) -> Result<JoinHandle<()>> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(CHANGE_CHANNEL).await?;
        info!(channel = CHANGE_CHANNEL, "Listening for pub-sub notifications");

        let changes = self.changes.clone();
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = listener.recv() => match received {
                        Ok(notification) => {
                            let _ = changes.send(notification.payload().to_string());
                        }
                        Err(e) => {
                            warn!(error = %e, "Notification listener error, retrying");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
            debug!("Notification listener stopped");
        }))
    }

    async fn current_holder(
        &self,
        conn: &mut sqlx::PgConnection,
        name: &str,
    ) -> Result<(String, DateTime<Utc>)> {
        let row = sqlx::query("SELECT holder_id, expires_at FROM locks WHERE name = $1")
            .bind(name)
            .fetch_one(conn)
            .await?;
        let holder: Option<String> = row.get("holder_id");
        let expires_at: Option<DateTime<Utc>> = row.get("expires_at");
        Ok((
            holder.unwrap_or_default(),
            expires_at.unwrap_or_else(Utc::now),
        ))
    }
}

fn grant_from_row(row: &PgRow) -> LeaseGrant {
    LeaseGrant {
        fencing_token: FencingToken(row.get("fencing_token")),
        expires_at: row.get("expires_at"),
    }
}

fn message_from_row(row: &PgRow) -> Message {
    Message {
        channel: row.get("channel"),
        sequence_id: row.get("sequence_id"),
        payload: row.get("payload"),
        published_at: row.get("published_at"),
    }
}

fn node_from_row(row: &PgRow) -> Result<ClusterNode> {
    let role: String = row.get("role");
    Ok(ClusterNode {
        node_id: row.get("node_id"),
        last_heartbeat_at: row.get("last_heartbeat_at"),
        role: role.parse::<NodeRole>().map_err(IbcError::Internal)?,
    })
}

#[async_trait]
impl CoordinationStore for PostgresStore {
    // ==================== Locks ====================

    #[instrument(skip(self))]
    async fn acquire_lock(&self, name: &str, holder_id: &str, ttl: Duration) -> Result<LeaseGrant> {
        let mut tx = self.pool.begin().await?;

        // The conflicting row is locked and the WHERE re-evaluated against its
        // latest version, so concurrent claimants serialize here.
        let row = sqlx::query(
            r#"
            INSERT INTO locks (name, holder_id, fencing_token, expires_at)
            VALUES ($1, $2, 1, NOW() + ($3::bigint * INTERVAL '1 millisecond'))
            ON CONFLICT (name) DO UPDATE SET
                holder_id = EXCLUDED.holder_id,
                fencing_token = locks.fencing_token + 1,
                expires_at = EXCLUDED.expires_at
            WHERE locks.holder_id IS NULL
               OR locks.expires_at IS NULL
               OR locks.expires_at <= NOW()
               OR locks.holder_id = EXCLUDED.holder_id
            RETURNING fencing_token, expires_at
            "#,
        )
        .bind(name)
        .bind(holder_id)
        .bind(millis(ttl))
        .fetch_optional(&mut *tx)
        .await?;

        match row {
            Some(row) => {
                tx.commit().await?;
                let grant = grant_from_row(&row);
                debug!(lock = name, holder = holder_id, token = %grant.fencing_token, "lock acquired");
                Ok(grant)
            }
            None => {
                let (holder, expires_at) = self.current_holder(&mut *tx, name).await?;
                tx.commit().await?;
                Err(IbcError::LockHeld {
                    name: name.to_string(),
                    holder,
                    expires_at,
                })
            }
        }
    }

    #[instrument(skip(self))]
    async fn renew_lock(
        &self,
        name: &str,
        holder_id: &str,
        token: FencingToken,
        ttl: Duration,
    ) -> Result<LeaseGrant> {
        let row = sqlx::query(
            r#"
            UPDATE locks SET expires_at = NOW() + ($4::bigint * INTERVAL '1 millisecond')
            WHERE name = $1 AND holder_id = $2 AND fencing_token = $3 AND expires_at > NOW()
            RETURNING fencing_token, expires_at
            "#,
        )
        .bind(name)
        .bind(holder_id)
        .bind(token.value())
        .bind(millis(ttl))
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| grant_from_row(&r))
            .ok_or_else(|| IbcError::lock_not_owned(name, holder_id, token.value()))
    }

    #[instrument(skip(self))]
    async fn release_lock(&self, name: &str, holder_id: &str, token: FencingToken) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE locks SET holder_id = NULL, expires_at = NULL
            WHERE name = $1 AND holder_id = $2 AND fencing_token = $3
            "#,
        )
        .bind(name)
        .bind(holder_id)
        .bind(token.value())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(IbcError::lock_not_owned(name, holder_id, token.value()));
        }
        Ok(())
    }

    async fn check_lock(
        &self,
        name: &str,
        holder_id: &str,
        token: FencingToken,
    ) -> Result<LeaseGrant> {
        let row = sqlx::query(
            r#"
            SELECT fencing_token, expires_at FROM locks
            WHERE name = $1 AND holder_id = $2 AND fencing_token = $3 AND expires_at > NOW()
            "#,
        )
        .bind(name)
        .bind(holder_id)
        .bind(token.value())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| grant_from_row(&r))
            .ok_or_else(|| IbcError::lock_not_owned(name, holder_id, token.value()))
    }

    async fn get_lock(&self, name: &str) -> Result<Option<LockRecord>> {
        let row = sqlx::query(
            "SELECT name, holder_id, fencing_token, expires_at FROM locks WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| LockRecord {
            name: r.get("name"),
            holder_id: r.get("holder_id"),
            fencing_token: FencingToken(r.get("fencing_token")),
            expires_at: r.get("expires_at"),
        }))
    }

    // ==================== Membership ====================

    #[instrument(skip(self))]
    async fn register_node(&self, node_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cluster_nodes (node_id, last_heartbeat_at, role)
            VALUES ($1, NOW(), 'follower')
            ON CONFLICT (node_id) DO UPDATE SET
                last_heartbeat_at = NOW(),
                role = 'follower'
            "#,
        )
        .bind(node_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn heartbeat_node(&self, node_id: &str) -> Result<DateTime<Utc>> {
        let at: DateTime<Utc> = sqlx::query_scalar(
            r#"
            INSERT INTO cluster_nodes (node_id, last_heartbeat_at, role)
            VALUES ($1, NOW(), 'follower')
            ON CONFLICT (node_id) DO UPDATE SET last_heartbeat_at = NOW()
            RETURNING last_heartbeat_at
            "#,
        )
        .bind(node_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(at)
    }

    async fn remove_node(&self, node_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM cluster_nodes WHERE node_id = $1")
            .bind(node_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn cluster_view(&self, leader_lock: &str) -> Result<ClusterView> {
        let mut tx = self.pool.begin().await?;

        let observed_at: DateTime<Utc> = sqlx::query_scalar("SELECT NOW()")
            .fetch_one(&mut *tx)
            .await?;

        let rows = sqlx::query(
            r#"
            SELECT n.node_id, n.last_heartbeat_at,
                   CASE WHEN n.role = 'gateway-leader'
                             AND l.holder_id = n.node_id
                             AND l.expires_at > NOW()
                        THEN 'gateway-leader' ELSE 'follower' END AS role
            FROM cluster_nodes n
            LEFT JOIN locks l ON l.name = $1
            ORDER BY n.node_id
            "#,
        )
        .bind(leader_lock)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let nodes = rows.iter().map(node_from_row).collect::<Result<Vec<_>>>()?;
        Ok(ClusterView { observed_at, nodes })
    }

    #[instrument(skip(self))]
    async fn promote_node(&self, node_id: &str, lock_name: &str, token: FencingToken) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // Holding the row lock keeps a competing acquisition out until commit.
        let held = sqlx::query(
            r#"
            SELECT 1 FROM locks
            WHERE name = $1 AND holder_id = $2 AND fencing_token = $3 AND expires_at > NOW()
            FOR UPDATE
            "#,
        )
        .bind(lock_name)
        .bind(node_id)
        .bind(token.value())
        .fetch_optional(&mut *tx)
        .await?;

        if held.is_none() {
            tx.rollback().await?;
            return Err(IbcError::lock_not_owned(lock_name, node_id, token.value()));
        }

        sqlx::query(
            "UPDATE cluster_nodes SET role = 'follower' WHERE role = 'gateway-leader' AND node_id <> $1",
        )
        .bind(node_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO cluster_nodes (node_id, last_heartbeat_at, role)
            VALUES ($1, NOW(), 'gateway-leader')
            ON CONFLICT (node_id) DO UPDATE SET role = 'gateway-leader'
            "#,
        )
        .bind(node_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn demote_node(&self, node_id: &str) -> Result<()> {
        sqlx::query("UPDATE cluster_nodes SET role = 'follower' WHERE node_id = $1")
            .bind(node_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn prune_nodes(&self, dead_for: Duration) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM cluster_nodes WHERE last_heartbeat_at < NOW() - ($1::bigint * INTERVAL '1 millisecond')",
        )
        .bind(millis(dead_for))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ==================== Pub-sub ====================

    #[instrument(skip(self, payload), fields(bytes = payload.len()))]
    async fn append_message(&self, channel: &str, payload: &[u8]) -> Result<Message> {
        let mut tx = self.pool.begin().await?;

        // The counter row stays locked until commit, so messages of one
        // channel become visible in sequence order.
        let sequence_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO channel_counters (channel, next_sequence_id, pruned_through)
            VALUES ($1, 2, 0)
            ON CONFLICT (channel) DO UPDATE SET
                next_sequence_id = channel_counters.next_sequence_id + 1
            RETURNING next_sequence_id - 1
            "#,
        )
        .bind(channel)
        .fetch_one(&mut *tx)
        .await?;

        let row = sqlx::query(
            r#"
            INSERT INTO messages (channel, sequence_id, payload, published_at)
            VALUES ($1, $2, $3, NOW())
            RETURNING channel, sequence_id, payload, published_at
            "#,
        )
        .bind(channel)
        .bind(sequence_id)
        .bind(payload)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(CHANGE_CHANNEL)
            .bind(channel)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(message_from_row(&row))
    }

    async fn fetch_messages(
        &self,
        channel: &str,
        after: SequenceId,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT channel, sequence_id, payload, published_at
            FROM messages
            WHERE channel = $1 AND sequence_id > $2
            ORDER BY sequence_id ASC
            LIMIT $3
            "#,
        )
        .bind(channel)
        .bind(after)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(message_from_row).collect())
    }

    async fn channel_watermark(&self, channel: &str) -> Result<ChannelWatermark> {
        let row = sqlx::query(
            r#"
            SELECT next_sequence_id - 1 AS last_sequence_id, pruned_through
            FROM channel_counters WHERE channel = $1
            "#,
        )
        .bind(channel)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .map(|r| ChannelWatermark {
                last_sequence_id: r.get("last_sequence_id"),
                pruned_through: r.get("pruned_through"),
            })
            .unwrap_or_default())
    }

    async fn list_channels(&self) -> Result<Vec<String>> {
        let channels = sqlx::query_scalar("SELECT channel FROM channel_counters ORDER BY channel")
            .fetch_all(&self.pool)
            .await?;
        Ok(channels)
    }

    async fn open_cursor(
        &self,
        subscriber_id: &str,
        channel: &str,
        initial: SequenceId,
    ) -> Result<SequenceId> {
        let cursor: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO subscriptions (subscriber_id, channel, last_delivered_sequence_id, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (subscriber_id, channel) DO UPDATE SET updated_at = NOW()
            RETURNING last_delivered_sequence_id
            "#,
        )
        .bind(subscriber_id)
        .bind(channel)
        .bind(initial)
        .fetch_one(&self.pool)
        .await?;
        Ok(cursor)
    }

    async fn load_cursor(&self, subscriber_id: &str, channel: &str) -> Result<Option<SequenceId>> {
        let cursor = sqlx::query_scalar(
            r#"
            SELECT last_delivered_sequence_id FROM subscriptions
            WHERE subscriber_id = $1 AND channel = $2
            "#,
        )
        .bind(subscriber_id)
        .bind(channel)
        .fetch_optional(&self.pool)
        .await?;
        Ok(cursor)
    }

    async fn advance_cursor(
        &self,
        subscriber_id: &str,
        channel: &str,
        sequence_id: SequenceId,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (subscriber_id, channel, last_delivered_sequence_id, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (subscriber_id, channel) DO UPDATE SET
                last_delivered_sequence_id = GREATEST(
                    subscriptions.last_delivered_sequence_id,
                    EXCLUDED.last_delivered_sequence_id
                ),
                updated_at = NOW()
            "#,
        )
        .bind(subscriber_id)
        .bind(channel)
        .bind(sequence_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_cursor(&self, subscriber_id: &str, channel: &str) -> Result<()> {
        sqlx::query(
            "UPDATE subscriptions SET updated_at = NOW() WHERE subscriber_id = $1 AND channel = $2",
        )
        .bind(subscriber_id)
        .bind(channel)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_cursor(&self, subscriber_id: &str, channel: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM subscriptions WHERE subscriber_id = $1 AND channel = $2")
                .bind(subscriber_id)
                .bind(channel)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn prune_channel(
        &self,
        channel: &str,
        retention: Duration,
        active_within: Duration,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let pruned_through: Option<i64> = sqlx::query_scalar(
            "SELECT pruned_through FROM channel_counters WHERE channel = $1 FOR UPDATE",
        )
        .bind(channel)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(pruned_through) = pruned_through else {
            tx.rollback().await?;
            return Ok(0);
        };

        let expired_through: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MAX(sequence_id) FROM messages
            WHERE channel = $1 AND published_at < NOW() - ($2::bigint * INTERVAL '1 millisecond')
            "#,
        )
        .bind(channel)
        .bind(millis(retention))
        .fetch_one(&mut *tx)
        .await?;

        let oldest_cursor: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MIN(last_delivered_sequence_id) FROM subscriptions
            WHERE channel = $1 AND updated_at >= NOW() - ($2::bigint * INTERVAL '1 millisecond')
            "#,
        )
        .bind(channel)
        .bind(millis(active_within))
        .fetch_one(&mut *tx)
        .await?;

        let cutoff = match (expired_through, oldest_cursor) {
            (Some(expired), Some(cursor)) => expired.min(cursor),
            (Some(expired), None) => expired,
            (None, _) => pruned_through,
        };
        if cutoff <= pruned_through {
            tx.rollback().await?;
            return Ok(0);
        }

        let deleted = sqlx::query("DELETE FROM messages WHERE channel = $1 AND sequence_id <= $2")
            .bind(channel)
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        sqlx::query("UPDATE channel_counters SET pruned_through = $2 WHERE channel = $1")
            .bind(channel)
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(channel, cutoff, deleted, "pruned channel");
        Ok(deleted)
    }

    fn change_feed(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }
}
