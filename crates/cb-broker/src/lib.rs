//! Broker consumer abstraction
//!
//! The consumer manager drives broker traffic exclusively through these
//! traits. Concrete drivers (Kafka, SQS, ...) live outside the core and are
//! plugged in through a [`DriverRegistry`]; the in-process
//! [`channel::ChannelBroker`] driver ships here for tests and loopback
//! deployments, and doubles as the reference implementation of the commit
//! contract.

pub mod channel;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use cb_common::{BrokerKind, Subscription};

pub use channel::{ChannelBroker, ChannelConsumerFactory};

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("No driver registered for broker kind {kind}")]
    UnsupportedKind { kind: BrokerKind },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Consume error: {0}")]
    Consume(String),

    #[error("Commit error: {0}")]
    Commit(String),

    #[error("Consumer is stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, BrokerError>;

/// One message pulled from a broker.
///
/// `offset_token` is the driver-opaque handle used to commit the message
/// once routing has finished; the core never interprets it.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub offset_token: String,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl BrokerMessage {
    pub fn new(offset_token: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            offset_token: offset_token.into(),
            payload,
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// A running consumer bound to one subscription's topic or queue.
///
/// Implementations must not auto-commit: the manager calls [`commit`] only
/// after the router has finished with a message. `stop` releases broker
/// resources; uncommitted messages must become redeliverable.
///
/// [`commit`]: BrokerConsumer::commit
#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    /// Stable identifier for logs and health reporting.
    fn identifier(&self) -> &str;

    /// Pulls up to `max_messages` messages. An empty vec means nothing is
    /// available right now; the caller decides how long to wait.
    async fn poll(&self, max_messages: usize) -> Result<Vec<BrokerMessage>>;

    /// Commits one message. At-least-once: a missed commit leads to
    /// redelivery, never to loss.
    async fn commit(&self, message: &BrokerMessage) -> Result<()>;

    /// Stops consuming and releases uncommitted messages for redelivery.
    async fn stop(&self);

    fn is_healthy(&self) -> bool {
        true
    }
}

/// Builds consumers for one broker kind from subscription settings.
#[async_trait]
pub trait ConsumerFactory: Send + Sync {
    async fn create(&self, subscription: &Subscription) -> Result<Arc<dyn BrokerConsumer>>;
}

/// Driver lookup keyed by broker kind. Real drivers register here at
/// wiring time, next to the in-process channel driver.
#[derive(Default)]
pub struct DriverRegistry {
    factories: dashmap::DashMap<BrokerKind, Arc<dyn ConsumerFactory>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: BrokerKind, factory: Arc<dyn ConsumerFactory>) {
        self.factories.insert(kind, factory);
    }

    pub fn supports(&self, kind: BrokerKind) -> bool {
        self.factories.contains_key(&kind)
    }

    pub async fn create(&self, subscription: &Subscription) -> Result<Arc<dyn BrokerConsumer>> {
        let factory = self
            .factories
            .get(&subscription.broker_kind)
            .map(|f| f.clone())
            .ok_or(BrokerError::UnsupportedKind {
                kind: subscription.broker_kind,
            })?;
        factory.create(subscription).await
    }
}
