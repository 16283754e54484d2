//! Dynamic consumer manager
//!
//! Maintains the invariant that every active subscription has exactly one
//! running logical consumer and every inactive or deleted subscription has
//! none. Consumers are registered from the store at startup and from the
//! admin notification hooks afterwards.
//!
//! The registry lock is a plain mutex held only for map operations;
//! consumer creation, polling and routing all happen outside it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use cb_broker::{BrokerConsumer, BrokerError, BrokerMessage, DriverRegistry};
use cb_common::{EventEnvelope, Subscription};
use cb_store::ConfigStore;

use crate::router::EventRouter;
use crate::shutdown::Shutdown;
use crate::{Result, RouterError};

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Messages pulled per poll.
    pub poll_batch_size: usize,
    /// Pause after a failed poll before trying again.
    pub error_backoff: Duration,
    /// Bound on waiting for consumers to finish at shutdown.
    pub shutdown_deadline: Duration,
    /// Bound on waiting for a single consumer during unregister.
    pub teardown_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            poll_batch_size: 10,
            error_backoff: Duration::from_secs(1),
            shutdown_deadline: Duration::from_secs(30),
            teardown_timeout: Duration::from_secs(10),
        }
    }
}

struct ConsumerHandle {
    subscription_id: Uuid,
    name: String,
    stop_tx: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

pub struct ConsumerManager {
    router: Arc<EventRouter>,
    store: Arc<dyn ConfigStore>,
    drivers: Arc<DriverRegistry>,
    consumers: Mutex<HashMap<Uuid, ConsumerHandle>>,
    running: AtomicBool,
    shutdown: Arc<Shutdown>,
    config: ManagerConfig,
}

impl ConsumerManager {
    pub fn new(
        router: Arc<EventRouter>,
        store: Arc<dyn ConfigStore>,
        drivers: Arc<DriverRegistry>,
        config: ManagerConfig,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        Self {
            router,
            store,
            drivers,
            consumers: Mutex::new(HashMap::new()),
            running: AtomicBool::new(true),
            shutdown,
            config,
        }
    }

    /// Startup recovery: registers a consumer for every active
    /// subscription in the store. Returns how many consumers are running.
    pub async fn start(&self) -> Result<usize> {
        let subscriptions = self.store.list_active_subscriptions().await?;
        info!(subscriptions = subscriptions.len(), "Recovering consumers from store");
        for subscription in subscriptions {
            let id = subscription.id;
            if let Err(e) = self.register(subscription).await {
                error!(subscription_id = %id, error = %e, "Failed to register consumer at startup");
            }
        }
        Ok(self.consumer_count())
    }

    /// Registers a consumer for an active subscription. Idempotent: a
    /// subscription that already has a running consumer is left alone.
    pub async fn register(&self, subscription: Subscription) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(RouterError::ShutdownInProgress);
        }
        if !subscription.active {
            debug!(subscription_id = %subscription.id, "Subscription inactive, nothing to register");
            return Ok(());
        }
        if self.is_running(subscription.id) {
            debug!(subscription_id = %subscription.id, "Consumer already running");
            return Ok(());
        }

        let consumer = self.drivers.create(&subscription).await?;
        let (stop_tx, stop_rx) = oneshot::channel();
        let join = tokio::spawn(Self::run_consumer(
            subscription.clone(),
            consumer,
            self.router.clone(),
            self.store.clone(),
            self.shutdown.clone(),
            stop_rx,
            self.config.clone(),
        ));

        let mut consumers = self.consumers.lock();
        if consumers.contains_key(&subscription.id) {
            // Lost a registration race; exactly one consumer may run, so
            // the newcomer is told to stop.
            drop(consumers);
            let _ = stop_tx.send(());
            return Ok(());
        }
        info!(
            subscription_id = %subscription.id,
            name = %subscription.name,
            topic = %subscription.topic_or_queue,
            broker = %subscription.broker_kind,
            "Registered consumer"
        );
        consumers.insert(
            subscription.id,
            ConsumerHandle {
                subscription_id: subscription.id,
                name: subscription.name.clone(),
                stop_tx,
                join,
            },
        );
        Ok(())
    }

    /// Tears down the consumer for a subscription, waiting briefly for its
    /// in-flight work. Returns whether a consumer was running.
    pub async fn unregister(&self, subscription_id: Uuid) -> bool {
        let handle = self.consumers.lock().remove(&subscription_id);
        let Some(handle) = handle else {
            return false;
        };
        info!(subscription_id = %subscription_id, name = %handle.name, "Unregistering consumer");
        let _ = handle.stop_tx.send(());
        let mut join = handle.join;
        if tokio::time::timeout(self.config.teardown_timeout, &mut join)
            .await
            .is_err()
        {
            warn!(subscription_id = %subscription_id, "Consumer did not stop in time, aborting");
            join.abort();
        }
        true
    }

    // Admin notification hooks. All are advisory and idempotent.

    pub async fn on_subscription_created(&self, subscription: &Subscription) {
        if !subscription.active {
            return;
        }
        if let Err(e) = self.register(subscription.clone()).await {
            error!(subscription_id = %subscription.id, error = %e, "Failed to register created subscription");
        }
    }

    pub async fn on_subscription_updated(&self, previous: &Subscription, next: &Subscription) {
        let deactivated = previous.active && !next.active;
        if deactivated || previous.requires_restart(next) {
            self.unregister(previous.id).await;
        }
        if next.active {
            if let Err(e) = self.register(next.clone()).await {
                error!(subscription_id = %next.id, error = %e, "Failed to register updated subscription");
            }
        }
    }

    pub async fn on_subscription_deleted(&self, subscription: &Subscription) {
        self.unregister(subscription.id).await;
    }

    pub fn is_running(&self, subscription_id: Uuid) -> bool {
        self.consumers.lock().contains_key(&subscription_id)
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().len()
    }

    pub fn consumer_ids(&self) -> Vec<Uuid> {
        self.consumers
            .lock()
            .values()
            .map(|h| h.subscription_id)
            .collect()
    }

    /// Graceful shutdown: stop accepting registrations, cancel in-flight
    /// work, and wait for every consumer bounded by the shutdown deadline.
    pub async fn shutdown(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Consumer manager shutting down");
        } else {
            return;
        }
        self.shutdown.trigger();

        let handles: Vec<ConsumerHandle> = {
            let mut consumers = self.consumers.lock();
            consumers.drain().map(|(_, handle)| handle).collect()
        };

        let deadline = Instant::now() + self.config.shutdown_deadline;
        for handle in handles {
            let _ = handle.stop_tx.send(());
            let remaining = deadline.saturating_duration_since(Instant::now());
            let mut join = handle.join;
            if tokio::time::timeout(remaining, &mut join).await.is_err() {
                warn!(
                    subscription_id = %handle.subscription_id,
                    "Consumer exceeded shutdown deadline, aborting"
                );
                join.abort();
            }
        }
        info!("Consumer manager shutdown complete");
    }

    async fn run_consumer(
        subscription: Subscription,
        consumer: Arc<dyn BrokerConsumer>,
        router: Arc<EventRouter>,
        store: Arc<dyn ConfigStore>,
        shutdown: Arc<Shutdown>,
        mut stop_rx: oneshot::Receiver<()>,
        config: ManagerConfig,
    ) {
        let poll_interval = Duration::from_millis(subscription.polling_interval_ms);
        let mut shutdown_rx = shutdown.subscribe();
        debug!(consumer = %consumer.identifier(), "Consumer loop started");

        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    debug!(consumer = %consumer.identifier(), "Consumer stop requested");
                    break;
                }
                _ = shutdown_rx.recv() => {
                    debug!(consumer = %consumer.identifier(), "Consumer shutting down");
                    break;
                }
                polled = consumer.poll(config.poll_batch_size) => {
                    match polled {
                        Ok(messages) if !messages.is_empty() => {
                            for message in messages {
                                Self::handle_message(
                                    &subscription,
                                    consumer.as_ref(),
                                    &router,
                                    &store,
                                    message,
                                )
                                .await;
                            }
                        }
                        Ok(_) => {
                            tokio::time::sleep(poll_interval).await;
                        }
                        Err(BrokerError::Stopped) => break,
                        Err(e) => {
                            error!(consumer = %consumer.identifier(), error = %e, "Poll failed");
                            tokio::time::sleep(config.error_backoff).await;
                        }
                    }
                }
            }
        }

        consumer.stop().await;
        info!(consumer = %consumer.identifier(), "Consumer stopped");
    }

    /// Processes one broker message end to end. The offset commits in every
    /// branch: at-least-once semantics make a duplicate acceptable while a
    /// poison message blocking the partition is not.
    async fn handle_message(
        subscription: &Subscription,
        consumer: &dyn BrokerConsumer,
        router: &Arc<EventRouter>,
        store: &Arc<dyn ConfigStore>,
        message: BrokerMessage,
    ) {
        let payload: serde_json::Value = match serde_json::from_slice(&message.payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    subscription_id = %subscription.id,
                    error = %e,
                    "Dropping message that failed to deserialize"
                );
                Self::record_stats(store, subscription.id, false).await;
                Self::commit(consumer, &message).await;
                return;
            }
        };

        let envelope = EventEnvelope::from_parts(payload, &message.headers);

        if !subscription.matches_event_type(&envelope.event_type) {
            debug!(
                subscription_id = %subscription.id,
                event_type = %envelope.event_type,
                "Event does not match subscription patterns"
            );
            Self::record_stats(store, subscription.id, true).await;
            Self::commit(consumer, &message).await;
            return;
        }

        // Routing runs in its own task so a panic inside a dispatch cannot
        // take the consumer loop down with it.
        let routed = {
            let router = router.clone();
            let envelope = envelope.clone();
            tokio::spawn(async move { router.route(&envelope).await }).await
        };

        match routed {
            Ok(dispatched) => {
                debug!(
                    subscription_id = %subscription.id,
                    event_type = %envelope.event_type,
                    dispatched = dispatched,
                    "Message processed"
                );
                Self::record_stats(store, subscription.id, true).await;
            }
            Err(e) => {
                error!(
                    subscription_id = %subscription.id,
                    error = %e,
                    "Routing task failed"
                );
                Self::record_stats(store, subscription.id, false).await;
            }
        }
        Self::commit(consumer, &message).await;
    }

    async fn record_stats(store: &Arc<dyn ConfigStore>, subscription_id: Uuid, success: bool) {
        if let Err(e) = store.record_subscription_message(subscription_id, success).await {
            warn!(subscription_id = %subscription_id, error = %e, "Failed to update subscription stats");
        }
    }

    async fn commit(consumer: &dyn BrokerConsumer, message: &BrokerMessage) {
        if let Err(e) = consumer.commit(message).await {
            warn!(consumer = %consumer.identifier(), error = %e, "Failed to commit offset");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cb_broker::{ChannelBroker, ChannelConsumerFactory};
    use cb_common::BrokerKind;
    use cb_store::MemoryStore;
    use serde_json::json;

    use crate::authorizer::{AuthzCacheConfig, DomainAuthorizer};
    use crate::breaker::CircuitBreakerRegistry;
    use crate::dispatcher::{CallbackDispatcher, DispatcherConfig};
    use crate::recorder::ExecutionRecorder;

    struct Harness {
        store: Arc<MemoryStore>,
        broker: Arc<ChannelBroker>,
        manager: ConsumerManager,
    }

    fn harness() -> Harness {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let store_dyn: Arc<dyn ConfigStore> = store.clone();
        let shutdown = Arc::new(Shutdown::new());
        let authorizer = Arc::new(DomainAuthorizer::new(
            store_dyn.clone(),
            AuthzCacheConfig::default(),
        ));
        let breakers = Arc::new(CircuitBreakerRegistry::default());
        let recorder = Arc::new(ExecutionRecorder::new(store_dyn.clone()));
        let dispatcher = Arc::new(
            CallbackDispatcher::new(
                store_dyn.clone(),
                authorizer,
                breakers,
                recorder,
                DispatcherConfig::default(),
                shutdown.clone(),
            )
            .unwrap(),
        );
        let router = Arc::new(EventRouter::new(store_dyn.clone(), dispatcher));

        let broker = Arc::new(ChannelBroker::new());
        let drivers = Arc::new(DriverRegistry::new());
        drivers.register(
            BrokerKind::Kafka,
            Arc::new(ChannelConsumerFactory::new(broker.clone())),
        );

        let manager = ConsumerManager::new(
            router,
            store_dyn,
            drivers,
            ManagerConfig {
                teardown_timeout: Duration::from_secs(2),
                shutdown_deadline: Duration::from_secs(2),
                ..ManagerConfig::default()
            },
            shutdown,
        );
        Harness {
            store,
            broker,
            manager,
        }
    }

    fn subscription(topic: &str) -> Subscription {
        let mut sub = Subscription::new("test-sub", BrokerKind::Kafka, topic)
            .with_connection("bootstrap.servers", "localhost:9092");
        sub.polling_interval_ms = 100;
        sub
    }

    /// Polls the store until the subscription has consumed `expected`
    /// messages or the timeout passes.
    async fn wait_for_received(
        store: &Arc<MemoryStore>,
        subscription_id: Uuid,
        expected: u64,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let received = store
                .get_subscription(subscription_id)
                .await
                .unwrap()
                .map(|s| s.total_messages_received)
                .unwrap_or(0);
            if received >= expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn register_unregister_register_leaves_one_consumer() {
        let h = harness();
        let sub = subscription("orders");

        h.manager.register(sub.clone()).await.unwrap();
        h.manager.register(sub.clone()).await.unwrap();
        assert_eq!(h.manager.consumer_count(), 1);

        assert!(h.manager.unregister(sub.id).await);
        assert_eq!(h.manager.consumer_count(), 0);
        assert!(!h.manager.unregister(sub.id).await);

        h.manager.register(sub.clone()).await.unwrap();
        assert_eq!(h.manager.consumer_count(), 1);
        assert!(h.manager.is_running(sub.id));

        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn inactive_subscription_is_not_registered() {
        let h = harness();
        let mut sub = subscription("orders");
        sub.active = false;
        h.manager.register(sub).await.unwrap();
        assert_eq!(h.manager.consumer_count(), 0);
    }

    #[tokio::test]
    async fn startup_recovers_active_subscriptions() {
        let h = harness();
        let active = subscription("orders");
        let mut inactive = subscription("invoices");
        inactive.active = false;

        h.store.insert_subscription(&active).await.unwrap();
        h.store.insert_subscription(&inactive).await.unwrap();

        let started = h.manager.start().await.unwrap();
        assert_eq!(started, 1);
        assert!(h.manager.is_running(active.id));
        assert!(!h.manager.is_running(inactive.id));

        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn update_hooks_drive_lifecycle() {
        let h = harness();
        let sub = subscription("orders");
        h.store.insert_subscription(&sub).await.unwrap();

        h.manager.on_subscription_created(&sub).await;
        assert!(h.manager.is_running(sub.id));

        // A topic change restarts the consumer; still exactly one runs.
        let mut moved = sub.clone();
        moved.topic_or_queue = "orders-v2".to_string();
        h.manager.on_subscription_updated(&sub, &moved).await;
        assert_eq!(h.manager.consumer_count(), 1);

        // Deactivation tears it down.
        let mut paused = moved.clone();
        paused.active = false;
        h.manager.on_subscription_updated(&moved, &paused).await;
        assert_eq!(h.manager.consumer_count(), 0);

        // Reactivation brings it back; deletion removes it again.
        h.manager.on_subscription_updated(&paused, &moved).await;
        assert_eq!(h.manager.consumer_count(), 1);
        h.manager.on_subscription_deleted(&moved).await;
        assert_eq!(h.manager.consumer_count(), 0);

        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn poison_message_is_counted_and_skipped() {
        let h = harness();
        let sub = subscription("orders");
        h.store.insert_subscription(&sub).await.unwrap();

        h.broker
            .publish("orders", b"{not json".to_vec(), HashMap::new());
        h.broker.publish_json("orders", &json!({"eventType": "order.created"}));

        h.manager.register(sub.clone()).await.unwrap();

        let drained =
            wait_for_received(&h.store, sub.id, 2, Duration::from_secs(3)).await;
        assert!(drained, "both messages should be consumed");

        let current = h.store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(current.total_messages_received, 2);
        assert_eq!(current.total_messages_failed, 1);
        assert_eq!(h.broker.depth("orders"), 0);

        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn subscription_patterns_gate_routing_but_commit_anyway() {
        let h = harness();
        let sub = subscription("orders").with_patterns(vec!["order.*".to_string()]);
        h.store.insert_subscription(&sub).await.unwrap();

        h.broker
            .publish_json("orders", &json!({"eventType": "invoice.created"}));
        h.manager.register(sub.clone()).await.unwrap();

        let consumed =
            wait_for_received(&h.store, sub.id, 1, Duration::from_secs(3)).await;
        assert!(consumed);
        assert_eq!(h.broker.depth("orders"), 0);

        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn register_after_shutdown_is_refused() {
        let h = harness();
        h.manager.shutdown().await;
        let result = h.manager.register(subscription("orders")).await;
        assert!(matches!(result, Err(RouterError::ShutdownInProgress)));
    }
}
