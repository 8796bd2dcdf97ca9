use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::retention::{self, RetentionPolicy};
use super::subscription::Subscription;
use crate::adapters::CoordinationStore;
use crate::config::PubSubConfig;
use crate::coordination::{RetryPolicy, ShutdownToken};
use crate::domain::{ChannelWatermark, Notification, SequenceId};
use crate::error::{IbcError, Result};

/// Ordered per-channel message log over the shared store.
///
/// Publishing appends with the next sequence id of the channel. Delivery is
/// at-least-once and in order per channel; consumers must tolerate duplicates.
#[derive(Clone)]
pub struct PubSubBus {
    store: Arc<dyn CoordinationStore>,
    config: PubSubConfig,
    retry: RetryPolicy,
}

impl PubSubBus {
    pub fn new(store: Arc<dyn CoordinationStore>, config: PubSubConfig, retry: RetryPolicy) -> Self {
        Self { store, config, retry }
    }

    pub fn config(&self) -> &PubSubConfig {
        &self.config
    }

    /// Append `payload` to `channel`. A retried publish after a lost commit
    /// acknowledgement may append the payload twice.
    #[instrument(skip(self, payload), fields(bytes = payload.len()))]
    pub async fn publish(&self, channel: &str, payload: &[u8]) -> Result<SequenceId> {
        validate_channel(channel)?;
        let message = self
            .retry
            .run("append_message", || self.store.append_message(channel, payload))
            .await?;
        debug!(channel, seq = message.sequence_id, "published");
        Ok(message.sequence_id)
    }

    pub async fn publish_notification(&self, notification: &Notification) -> Result<SequenceId> {
        let payload = notification.to_payload()?;
        self.publish(notification.kind.channel(), &payload).await
    }

    /// Open a subscription. An existing persisted cursor wins over
    /// `from_sequence_id`, so a returning subscriber resumes where it acked.
    pub async fn subscribe(
        &self,
        channel: &str,
        subscriber_id: &str,
        from_sequence_id: SequenceId,
    ) -> Result<Subscription> {
        validate_channel(channel)?;
        if subscriber_id.is_empty() {
            return Err(IbcError::Validation("subscriber id must not be empty".to_string()));
        }
        if from_sequence_id < 0 {
            return Err(IbcError::Validation(format!(
                "from sequence id must not be negative, got {from_sequence_id}"
            )));
        }

        let cursor = self
            .retry
            .run("open_cursor", || {
                self.store.open_cursor(subscriber_id, channel, from_sequence_id)
            })
            .await?;

        let mark = self.store.channel_watermark(channel).await?;
        if mark.cursor_lags(cursor) {
            return Err(IbcError::SubscriptionLag {
                channel: channel.to_string(),
                subscriber: subscriber_id.to_string(),
                cursor,
                pruned_through: mark.pruned_through,
            });
        }

        info!(channel, subscriber = subscriber_id, cursor, "subscribed");
        Ok(Subscription::new(
            self.store.clone(),
            channel,
            subscriber_id,
            cursor,
            &self.config,
            self.retry,
        ))
    }

    /// Persist progress for a subscriber without holding its `Subscription`.
    pub async fn ack(&self, channel: &str, subscriber_id: &str, sequence_id: SequenceId) -> Result<()> {
        self.retry
            .run("advance_cursor", || {
                self.store.advance_cursor(subscriber_id, channel, sequence_id)
            })
            .await
    }

    /// Drop the persisted cursor. Returns whether one existed.
    pub async fn unsubscribe(&self, channel: &str, subscriber_id: &str) -> Result<bool> {
        let removed = self.store.delete_cursor(subscriber_id, channel).await?;
        info!(channel, subscriber = subscriber_id, removed, "unsubscribed");
        Ok(removed)
    }

    pub async fn watermark(&self, channel: &str) -> Result<ChannelWatermark> {
        self.store.channel_watermark(channel).await
    }

    pub async fn channels(&self) -> Result<Vec<String>> {
        self.store.list_channels().await
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy::from_config(&self.config)
    }

    /// One retention pass over every channel
    pub async fn prune(&self) -> Result<BTreeMap<String, u64>> {
        retention::prune_all(self.store.as_ref(), &self.retention_policy()).await
    }

    pub async fn run_retention(&self, shutdown: ShutdownToken) {
        retention::run_retention(
            self.store.clone(),
            self.retention_policy(),
            self.config.prune_interval(),
            shutdown,
        )
        .await
    }
}

fn validate_channel(channel: &str) -> Result<()> {
    if channel.trim().is_empty() {
        return Err(IbcError::Validation("channel name must not be empty".to_string()));
    }
    Ok(())
}
