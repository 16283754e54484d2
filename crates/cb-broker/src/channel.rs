//! In-process channel driver
//!
//! Topic queues held in memory with explicit commit tracking: `poll` moves
//! messages into the consumer's in-flight buffer, `commit` drops them, and
//! `stop` requeues whatever was never committed. This mirrors the
//! at-least-once contract real drivers must provide and is the driver used
//! by the test suites and loopback deployments.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use cb_common::Subscription;

use crate::{BrokerConsumer, BrokerError, BrokerMessage, ConsumerFactory, Result};

#[derive(Debug, Clone)]
struct StoredMessage {
    seq: u64,
    payload: Vec<u8>,
    headers: HashMap<String, String>,
}

#[derive(Default)]
struct TopicState {
    pending: Mutex<VecDeque<StoredMessage>>,
    next_seq: AtomicU64,
}

/// Shared in-memory broker. Consumers on the same topic compete for
/// messages, queue style.
#[derive(Default)]
pub struct ChannelBroker {
    topics: DashMap<String, Arc<TopicState>>,
}

impl ChannelBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn topic(&self, name: &str) -> Arc<TopicState> {
        self.topics
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    pub fn publish(&self, topic: &str, payload: Vec<u8>, headers: HashMap<String, String>) {
        let state = self.topic(topic);
        let seq = state.next_seq.fetch_add(1, Ordering::SeqCst);
        state.pending.lock().push_back(StoredMessage {
            seq,
            payload,
            headers,
        });
    }

    pub fn publish_json(&self, topic: &str, payload: &serde_json::Value) {
        self.publish(topic, payload.to_string().into_bytes(), HashMap::new());
    }

    pub fn depth(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|t| t.pending.lock().len())
            .unwrap_or(0)
    }
}

pub struct ChannelConsumer {
    identifier: String,
    topic: Arc<TopicState>,
    in_flight: Mutex<HashMap<String, StoredMessage>>,
    stopped: AtomicBool,
}

#[async_trait]
impl BrokerConsumer for ChannelConsumer {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn poll(&self, max_messages: usize) -> Result<Vec<BrokerMessage>> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(BrokerError::Stopped);
        }

        let mut batch = Vec::new();
        {
            let mut pending = self.topic.pending.lock();
            let mut in_flight = self.in_flight.lock();
            while batch.len() < max_messages {
                let Some(stored) = pending.pop_front() else {
                    break;
                };
                let token = stored.seq.to_string();
                let mut message = BrokerMessage::new(token.clone(), stored.payload.clone());
                message.headers = stored.headers.clone();
                in_flight.insert(token, stored);
                batch.push(message);
            }
        }
        Ok(batch)
    }

    async fn commit(&self, message: &BrokerMessage) -> Result<()> {
        let removed = self.in_flight.lock().remove(&message.offset_token);
        match removed {
            Some(_) => Ok(()),
            None => Err(BrokerError::Commit(format!(
                "unknown offset token: {}",
                message.offset_token
            ))),
        }
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        // Release uncommitted messages for redelivery, oldest first.
        let mut released: Vec<StoredMessage> = {
            let mut in_flight = self.in_flight.lock();
            in_flight.drain().map(|(_, stored)| stored).collect()
        };
        if released.is_empty() {
            return;
        }
        released.sort_by_key(|m| m.seq);
        debug!(
            consumer = %self.identifier,
            requeued = released.len(),
            "Requeueing uncommitted messages on stop"
        );
        let mut pending = self.topic.pending.lock();
        for stored in released.into_iter().rev() {
            pending.push_front(stored);
        }
    }

    fn is_healthy(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }
}

/// Factory exposing a [`ChannelBroker`] through the driver seam.
pub struct ChannelConsumerFactory {
    broker: Arc<ChannelBroker>,
}

impl ChannelConsumerFactory {
    pub fn new(broker: Arc<ChannelBroker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl ConsumerFactory for ChannelConsumerFactory {
    async fn create(&self, subscription: &Subscription) -> Result<Arc<dyn BrokerConsumer>> {
        let topic = self.broker.topic(&subscription.topic_or_queue);
        Ok(Arc::new(ChannelConsumer {
            identifier: format!("{}:{}", subscription.topic_or_queue, subscription.id),
            topic,
            in_flight: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cb_common::BrokerKind;
    use serde_json::json;

    async fn consumer_for(
        broker: &Arc<ChannelBroker>,
        topic: &str,
    ) -> Arc<dyn BrokerConsumer> {
        let subscription = Subscription::new("test", BrokerKind::Kafka, topic)
            .with_connection("bootstrap.servers", "localhost:9092");
        ChannelConsumerFactory::new(broker.clone())
            .create(&subscription)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn poll_commit_drains_topic() {
        let broker = Arc::new(ChannelBroker::new());
        broker.publish_json("orders", &json!({"n": 1}));
        broker.publish_json("orders", &json!({"n": 2}));

        let consumer = consumer_for(&broker, "orders").await;
        let batch = consumer.poll(10).await.unwrap();
        assert_eq!(batch.len(), 2);

        for message in &batch {
            consumer.commit(message).await.unwrap();
        }
        assert!(consumer.poll(10).await.unwrap().is_empty());
        assert_eq!(broker.depth("orders"), 0);
    }

    #[tokio::test]
    async fn messages_are_delivered_in_publish_order() {
        let broker = Arc::new(ChannelBroker::new());
        for n in 0..5 {
            broker.publish_json("orders", &json!({"n": n}));
        }

        let consumer = consumer_for(&broker, "orders").await;
        let batch = consumer.poll(10).await.unwrap();
        let order: Vec<i64> = batch
            .iter()
            .map(|m| {
                serde_json::from_slice::<serde_json::Value>(&m.payload).unwrap()["n"]
                    .as_i64()
                    .unwrap()
            })
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn stop_requeues_uncommitted_messages() {
        let broker = Arc::new(ChannelBroker::new());
        broker.publish_json("orders", &json!({"n": 1}));
        broker.publish_json("orders", &json!({"n": 2}));

        let consumer = consumer_for(&broker, "orders").await;
        let batch = consumer.poll(10).await.unwrap();
        assert_eq!(batch.len(), 2);
        consumer.commit(&batch[0]).await.unwrap();
        consumer.stop().await;

        // The uncommitted message is redeliverable to a fresh consumer.
        assert_eq!(broker.depth("orders"), 1);
        let replacement = consumer_for(&broker, "orders").await;
        let redelivered = replacement.poll(10).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        let value: serde_json::Value = serde_json::from_slice(&redelivered[0].payload).unwrap();
        assert_eq!(value["n"], 2);
    }

    #[tokio::test]
    async fn stopped_consumer_refuses_polls() {
        let broker = Arc::new(ChannelBroker::new());
        let consumer = consumer_for(&broker, "orders").await;
        consumer.stop().await;
        assert!(matches!(
            consumer.poll(1).await,
            Err(BrokerError::Stopped)
        ));
        assert!(!consumer.is_healthy());
    }

    #[tokio::test]
    async fn registry_routes_by_kind() {
        let broker = Arc::new(ChannelBroker::new());
        let registry = crate::DriverRegistry::new();
        registry.register(
            BrokerKind::Kafka,
            Arc::new(ChannelConsumerFactory::new(broker)),
        );

        let kafka = Subscription::new("a", BrokerKind::Kafka, "t")
            .with_connection("bootstrap.servers", "localhost:9092");
        assert!(registry.create(&kafka).await.is_ok());

        let sqs = Subscription::new("b", BrokerKind::Sqs, "q")
            .with_connection("queue.url", "http://localhost:4566/q");
        assert!(matches!(
            registry.create(&sqs).await,
            Err(BrokerError::UnsupportedKind { .. })
        ));
    }
}
