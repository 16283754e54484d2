//! CallBridge shared domain model
//!
//! Core types used across the delivery engine:
//! - Entities: subscriptions, authorized domains, callback configurations,
//!   callback executions
//! - EventEnvelope: normalized form of an incoming broker message
//! - Pattern matching: restricted glob used for event types and URL paths
//! - Filter expressions: `path=value` payload filters

pub mod envelope;
pub mod error;
pub mod filter;
pub mod model;
pub mod pattern;

pub use envelope::EventEnvelope;
pub use error::CallBridgeError;
pub use model::{
    AuthorizedDomain, BrokerKind, CallbackConfiguration, CallbackExecution, CallbackStatus,
    ExecutionStatus, HttpMethod, Subscription,
};

pub type Result<T> = std::result::Result<T, CallBridgeError>;
