//! Router error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Store error: {0}")]
    Store(#[from] cb_store::StoreError),

    #[error("Broker error: {0}")]
    Broker(#[from] cb_broker::BrokerError),

    #[error("Consumer error: {0}")]
    Consumer(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Shutdown in progress")]
    ShutdownInProgress,
}
