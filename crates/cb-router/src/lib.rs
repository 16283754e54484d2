//! CallBridge dispatch pipeline
//!
//! This crate holds the delivery path of the engine:
//! - DomainAuthorizer: URL authorization against the domain whitelist
//! - CircuitBreakerRegistry: per-configuration breakers gating attempts
//! - ExecutionRecorder: audit rows for every attempt
//! - CallbackDispatcher: signed HTTP delivery with bounded retries
//! - EventRouter: configuration matching and concurrent fan-out
//! - ConsumerManager: broker consumer lifecycle driven by subscriptions

pub mod authorizer;
pub mod breaker;
pub mod dispatcher;
pub mod error;
pub mod manager;
pub mod recorder;
pub mod router;
pub mod shutdown;

pub use authorizer::{AuthzDecision, AuthzCacheConfig, DenyReason, DomainAuthorizer};
pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker, CircuitBreakerRegistry};
pub use dispatcher::{CallbackDispatcher, DispatcherConfig};
pub use error::RouterError;
pub use manager::{ConsumerManager, ManagerConfig};
pub use recorder::ExecutionRecorder;
pub use router::EventRouter;
pub use shutdown::Shutdown;

pub type Result<T> = std::result::Result<T, RouterError>;
