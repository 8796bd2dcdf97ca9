//! Fan-out of bus messages to in-process handlers
//!
//! Every registration runs two tasks joined by a bounded queue. The delivery
//! task pulls from the bus and blocks when the queue is full, so a slow
//! handler slows delivery instead of losing messages. The consumer task runs
//! the handler and acks only after it succeeds.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::bus::PubSubBus;
use super::subscription::Subscription;
use crate::config::DispatcherConfig;
use crate::coordination::{RetryPolicy, Shutdown, ShutdownSignal, ShutdownToken};
use crate::domain::{Message, SequenceId};
use crate::error::{IbcError, Result};

#[async_trait]
pub trait NotificationHandler: Send + Sync {
    /// Process one message. Returning an error retries the same message.
    async fn handle(&self, message: &Message) -> anyhow::Result<()>;
}

/// A running registration.
pub struct DispatchHandle {
    channel: String,
    subscriber_id: String,
    cancel: Arc<Shutdown>,
    outcome: oneshot::Receiver<Result<()>>,
}

impl DispatchHandle {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    /// Stop after the message currently being handled, if any.
    pub fn cancel(&self) {
        self.cancel.request_shutdown(ShutdownSignal::Graceful);
    }

    /// Wait for the registration to end. Cancellation ends it with `Ok(())`;
    /// `SubscriptionLag` and exhausted handler retries end it with an error.
    pub async fn join(self) -> Result<()> {
        self.outcome
            .await
            .unwrap_or_else(|_| Err(IbcError::Internal("dispatch task vanished".to_string())))
    }
}

pub struct NotificationDispatcher {
    bus: PubSubBus,
    config: DispatcherConfig,
    retry: RetryPolicy,
    shutdown: Shutdown,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NotificationDispatcher {
    pub fn new(bus: PubSubBus, config: DispatcherConfig, retry: RetryPolicy) -> Self {
        Self {
            bus,
            config,
            retry,
            shutdown: Shutdown::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Deliver `channel` to `handler` in sequence order, starting after the
    /// subscriber's persisted cursor (or `from` for a new subscriber).
    pub async fn register(
        &self,
        channel: &str,
        subscriber_id: &str,
        from: SequenceId,
        handler: Arc<dyn NotificationHandler>,
    ) -> Result<DispatchHandle> {
        if self.shutdown.is_shutdown_requested() {
            return Err(IbcError::Cancelled);
        }

        let subscription = self.bus.subscribe(channel, subscriber_id, from).await?;
        let (queue_tx, queue_rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let cancel = Arc::new(Shutdown::new());
        let (outcome_tx, outcome_rx) = oneshot::channel();

        let delivery = tokio::spawn(deliver(
            subscription,
            queue_tx,
            cancel.token(),
            self.shutdown.token(),
        ));
        let consumer = tokio::spawn(consume(
            self.bus.clone(),
            channel.to_string(),
            subscriber_id.to_string(),
            queue_rx,
            handler,
            self.handler_retry(),
            cancel.token(),
            self.shutdown.token(),
        ));

        let supervisor = tokio::spawn({
            let cancel = cancel.clone();
            let channel = channel.to_string();
            let subscriber_id = subscriber_id.to_string();
            async move {
                let outcome = supervise(delivery, consumer, &cancel).await;
                match &outcome {
                    Ok(()) => info!(channel = %channel, subscriber = %subscriber_id, "dispatch stopped"),
                    Err(e) => error!(channel = %channel, subscriber = %subscriber_id, error = %e, "dispatch failed"),
                }
                let _ = outcome_tx.send(outcome);
            }
        });
        let mut tasks = self.tasks.lock().await;
        // registrations that already ended need no joining
        tasks.retain(|task| !task.is_finished());
        tasks.push(supervisor);
        drop(tasks);

        info!(channel, subscriber = subscriber_id, "handler registered");
        Ok(DispatchHandle {
            channel: channel.to_string(),
            subscriber_id: subscriber_id.to_string(),
            cancel,
            outcome: outcome_rx,
        })
    }

    /// Stop every registration and wait for their tasks.
    pub async fn shutdown(&self) {
        self.shutdown.request_shutdown(ShutdownSignal::Graceful);
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "dispatch task panicked");
            }
        }
    }

    fn handler_retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.config.max_handler_attempts.max(1),
            ..self.retry
        }
    }
}

async fn deliver(
    mut subscription: Subscription,
    queue: mpsc::Sender<Message>,
    cancel: ShutdownToken,
    shutdown: ShutdownToken,
) -> Result<()> {
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            next = subscription.next(&cancel) => next?,
        };
        let Some(message) = next else {
            return Ok(());
        };

        // Blocks while the queue is full
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = cancel.cancelled() => return Ok(()),
            sent = queue.send(message) => {
                if sent.is_err() {
                    // consumer stopped
                    return Ok(());
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn consume(
    bus: PubSubBus,
    channel: String,
    subscriber_id: String,
    mut queue: mpsc::Receiver<Message>,
    handler: Arc<dyn NotificationHandler>,
    retry: RetryPolicy,
    cancel: ShutdownToken,
    shutdown: ShutdownToken,
) -> Result<()> {
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = cancel.cancelled() => return Ok(()),
            message = queue.recv() => match message {
                Some(message) => message,
                None => return Ok(()),
            },
        };

        let mut attempt = 0u32;
        loop {
            match handler.handle(&message).await {
                Ok(()) => break,
                Err(e) if attempt + 1 < retry.max_attempts => {
                    let delay = retry.jittered(attempt);
                    warn!(
                        channel = %channel,
                        seq = message.sequence_id,
                        attempt = attempt + 1,
                        error = %e,
                        "handler failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(IbcError::Callback(format!(
                        "{channel}#{} failed after {} attempts: {e:#}",
                        message.sequence_id,
                        attempt + 1
                    )));
                }
            }
        }

        bus.ack(&channel, &subscriber_id, message.sequence_id).await?;
        debug!(channel = %channel, seq = message.sequence_id, "delivered");
    }
}

/// Wait for both halves. When either one ends the other is told to stop, and
/// the consumer's error takes precedence.
async fn supervise(
    mut delivery: JoinHandle<Result<()>>,
    mut consumer: JoinHandle<Result<()>>,
    cancel: &Shutdown,
) -> Result<()> {
    let (delivered, consumed) = tokio::select! {
        delivered = &mut delivery => {
            // the queue sender is gone, the consumer drains and exits
            (delivered, (&mut consumer).await)
        }
        consumed = &mut consumer => {
            cancel.request_shutdown(ShutdownSignal::Graceful);
            ((&mut delivery).await, consumed)
        }
    };

    let flatten = |joined: std::result::Result<Result<()>, tokio::task::JoinError>| {
        joined.unwrap_or_else(|e| Err(IbcError::Internal(format!("dispatch task failed: {e}"))))
    };
    flatten(consumed)?;
    flatten(delivered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryStore;
    use crate::adapters::store::CoordinationStore;
    use crate::config::PubSubConfig;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Collect {
        seen: std::sync::Mutex<Vec<SequenceId>>,
    }

    #[async_trait]
    impl NotificationHandler for Collect {
        async fn handle(&self, message: &Message) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(message.sequence_id);
            Ok(())
        }
    }

    fn setup(capacity: usize) -> (Arc<MemoryStore>, PubSubBus, NotificationDispatcher) {
        let store = Arc::new(MemoryStore::new());
        let bus = PubSubBus::new(store.clone(), PubSubConfig::default(), RetryPolicy::default());
        let dispatcher = NotificationDispatcher::new(
            bus.clone(),
            DispatcherConfig {
                queue_capacity: capacity,
                max_handler_attempts: 3,
            },
            RetryPolicy::default(),
        );
        (store, bus, dispatcher)
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivers_in_order_and_acks() {
        let (store, bus, dispatcher) = setup(4);
        let handler = Arc::new(Collect::default());
        let handle = dispatcher
            .register("orders", "cache", 0, handler.clone())
            .await
            .unwrap();

        for i in 0..10u8 {
            bus.publish("orders", &[i]).await.unwrap();
        }
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(*handler.seen.lock().unwrap(), (1..=10).collect::<Vec<_>>());
        assert_eq!(store.load_cursor("cache", "orders").await.unwrap(), Some(10));

        handle.cancel();
        handle.join().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_handler_surfaces_callback_error() {
        struct Broken(AtomicU32);

        #[async_trait]
        impl NotificationHandler for Broken {
            async fn handle(&self, _message: &Message) -> anyhow::Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("cache unavailable")
            }
        }

        let (store, bus, dispatcher) = setup(4);
        let broken = Arc::new(Broken(AtomicU32::new(0)));
        let handle = dispatcher
            .register("orders", "cache", 0, broken.clone())
            .await
            .unwrap();
        bus.publish("orders", b"x").await.unwrap();

        let err = handle.join().await.unwrap_err();
        assert!(matches!(err, IbcError::Callback(_)));
        assert_eq!(broken.0.load(Ordering::SeqCst), 3);
        // never acked, so a new registration sees it again
        assert_eq!(store.load_cursor("cache", "orders").await.unwrap(), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ended_registrations_are_not_retained() {
        let (_, _, dispatcher) = setup(4);
        for round in 0..5 {
            let handle = dispatcher
                .register("orders", &format!("worker-{round}"), 0, Arc::new(Collect::default()))
                .await
                .unwrap();
            handle.cancel();
            handle.join().await.unwrap();
            // let the supervisor task return after reporting
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let _live = dispatcher
            .register("orders", "live", 0, Arc::new(Collect::default()))
            .await
            .unwrap();
        assert_eq!(dispatcher.tasks.lock().await.len(), 1);
        dispatcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_all_registrations() {
        let (_, _, dispatcher) = setup(4);
        let a = dispatcher
            .register("orders", "a", 0, Arc::new(Collect::default()))
            .await
            .unwrap();
        let b = dispatcher
            .register("fills", "b", 0, Arc::new(Collect::default()))
            .await
            .unwrap();

        dispatcher.shutdown().await;
        a.join().await.unwrap();
        b.join().await.unwrap();

        let late = dispatcher
            .register("orders", "c", 0, Arc::new(Collect::default()))
            .await;
        assert!(matches!(late, Err(IbcError::Cancelled)));
    }
}
