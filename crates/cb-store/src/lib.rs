//! Config store for the CallBridge delivery engine
//!
//! The [`ConfigStore`] trait is the persistence contract the rest of the
//! engine is written against. Two implementations ship here:
//! - [`MemoryStore`]: DashMap-backed, used by tests and loopback mode
//! - [`PostgresStore`]: sqlx-backed relational store

pub mod memory;
pub mod postgres;
pub mod store;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use store::{ConfigStore, ExecutionPatch, StoreError};

pub type Result<T> = std::result::Result<T, StoreError>;
