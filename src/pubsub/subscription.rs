//! Cursor-based delivery for one subscriber on one channel

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::adapters::CoordinationStore;
use crate::config::PubSubConfig;
use crate::coordination::{RetryPolicy, ShutdownToken};
use crate::domain::{Message, SequenceId};
use crate::error::{IbcError, Result};

/// A restartable, in-order stream of messages on one channel.
///
/// `next` hands out messages after the current position. Nothing is persisted
/// until `ack`, so a subscriber that stops between delivery and ack receives
/// the message again when it resubscribes.
pub struct Subscription {
    store: Arc<dyn CoordinationStore>,
    channel: String,
    subscriber_id: String,
    position: SequenceId,
    acked: SequenceId,
    buffer: VecDeque<Message>,
    changes: broadcast::Receiver<String>,
    poll_interval: Duration,
    batch_size: u32,
    touch_interval: Duration,
    last_touch: Instant,
    retry: RetryPolicy,
}

impl Subscription {
    pub(crate) fn new(
        store: Arc<dyn CoordinationStore>,
        channel: &str,
        subscriber_id: &str,
        cursor: SequenceId,
        config: &PubSubConfig,
        retry: RetryPolicy,
    ) -> Self {
        let changes = store.change_feed();
        Self {
            store,
            channel: channel.to_string(),
            subscriber_id: subscriber_id.to_string(),
            position: cursor,
            acked: cursor,
            buffer: VecDeque::new(),
            changes,
            poll_interval: config.poll_interval(),
            batch_size: config.batch_size.max(1),
            touch_interval: config.active_subscriber_window() / 4,
            last_touch: Instant::now(),
            retry,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    /// Sequence id of the last message handed out
    pub fn position(&self) -> SequenceId {
        self.position
    }

    /// Last sequence id persisted with `ack`
    pub fn acked(&self) -> SequenceId {
        self.acked
    }

    /// Next message in sequence order. Waits for new messages until one
    /// arrives or `shutdown` fires, in which case `None` is returned.
    pub async fn next(&mut self, shutdown: &ShutdownToken) -> Result<Option<Message>> {
        loop {
            if let Some(message) = self.buffer.pop_front() {
                self.position = message.sequence_id;
                return Ok(Some(message));
            }
            if shutdown.is_cancelled() {
                return Ok(None);
            }

            // Subscribe to wakeups before polling so nothing published in
            // between is missed.
            self.changes = self.changes.resubscribe();
            self.fill().await?;
            if !self.buffer.is_empty() {
                continue;
            }
            self.keep_alive().await;

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(None),
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = wait_for_change(&mut self.changes, &self.channel) => {}
            }
        }
    }

    /// Persist progress through `sequence_id`. The stored cursor never moves
    /// backwards.
    pub async fn ack(&mut self, sequence_id: SequenceId) -> Result<()> {
        let store = &self.store;
        let (channel, subscriber_id) = (self.channel.as_str(), self.subscriber_id.as_str());
        self.retry
            .run("advance_cursor", || store.advance_cursor(subscriber_id, channel, sequence_id))
            .await?;
        self.acked = self.acked.max(sequence_id);
        self.last_touch = Instant::now();
        Ok(())
    }

    async fn fill(&mut self) -> Result<()> {
        let store = &self.store;
        let (channel, after, limit) = (self.channel.as_str(), self.position, self.batch_size);
        let batch = self
            .retry
            .run("fetch_messages", || store.fetch_messages(channel, after, limit))
            .await?;

        let contiguous = batch
            .first()
            .map_or(true, |first| first.sequence_id == after + 1);
        if !contiguous || batch.is_empty() {
            self.check_lag().await?;
        }

        if !batch.is_empty() {
            debug!(
                channel = %self.channel,
                subscriber = %self.subscriber_id,
                from = after + 1,
                count = batch.len(),
                "fetched messages"
            );
        }
        self.buffer.extend(batch);
        Ok(())
    }

    async fn check_lag(&self) -> Result<()> {
        let mark = self.store.channel_watermark(&self.channel).await?;
        if mark.cursor_lags(self.position) {
            warn!(
                channel = %self.channel,
                subscriber = %self.subscriber_id,
                cursor = self.position,
                pruned_through = mark.pruned_through,
                "subscription fell behind retention"
            );
            return Err(IbcError::SubscriptionLag {
                channel: self.channel.clone(),
                subscriber: self.subscriber_id.clone(),
                cursor: self.position,
                pruned_through: mark.pruned_through,
            });
        }
        Ok(())
    }

    /// Keep the cursor inside the active window while idle, so retention
    /// does not prune past it.
    async fn keep_alive(&mut self) {
        if self.last_touch.elapsed() < self.touch_interval {
            return;
        }
        match self.store.touch_cursor(&self.subscriber_id, &self.channel).await {
            Ok(()) => self.last_touch = Instant::now(),
            Err(e) => warn!(channel = %self.channel, subscriber = %self.subscriber_id, error = %e, "cursor touch failed"),
        }
    }
}

async fn wait_for_change(changes: &mut broadcast::Receiver<String>, channel: &str) {
    loop {
        match changes.recv().await {
            Ok(changed) if changed == channel => return,
            Ok(_) => continue,
            Err(RecvError::Lagged(_)) => return,
            // no feed, fall back to polling
            Err(RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}
