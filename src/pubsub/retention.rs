//! Message retention
//!
//! Old messages are deleted per channel, never past the lowest cursor of a
//! subscriber that was active recently. Subscribers idle for longer than the
//! window may find their cursor pruned and get `SubscriptionLag`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::adapters::CoordinationStore;
use crate::config::PubSubConfig;
use crate::coordination::ShutdownToken;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Messages younger than this are always kept
    pub retention: Duration,
    /// Cursors touched within this window hold back pruning
    pub active_subscriber_window: Duration,
}

impl RetentionPolicy {
    pub fn from_config(config: &PubSubConfig) -> Self {
        Self {
            retention: config.retention(),
            active_subscriber_window: config.active_subscriber_window(),
        }
    }
}

/// Apply `policy` to every channel. Returns deleted rows per channel,
/// omitting channels where nothing was removed.
pub async fn prune_all(
    store: &dyn CoordinationStore,
    policy: &RetentionPolicy,
) -> Result<BTreeMap<String, u64>> {
    let mut report = BTreeMap::new();
    for channel in store.list_channels().await? {
        let deleted = store
            .prune_channel(&channel, policy.retention, policy.active_subscriber_window)
            .await?;
        if deleted > 0 {
            debug!(channel = %channel, deleted, "pruned messages");
            report.insert(channel, deleted);
        }
    }
    Ok(report)
}

/// Prune every `interval` until shutdown.
pub async fn run_retention(
    store: Arc<dyn CoordinationStore>,
    policy: RetentionPolicy,
    interval: Duration,
    shutdown: ShutdownToken,
) {
    if interval.is_zero() {
        warn!("retention interval is zero, retention disabled");
        return;
    }
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                match prune_all(store.as_ref(), &policy).await {
                    Ok(report) if report.is_empty() => {}
                    Ok(report) => {
                        let total: u64 = report.values().sum();
                        info!(channels = report.len(), deleted = total, "retention pass complete");
                    }
                    Err(e) => warn!(error = %e, "retention pass failed"),
                }
            }
        }
    }
}
