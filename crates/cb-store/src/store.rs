//! Store contract
//!
//! Every operation the engine needs from persistence, as one async trait.
//! Counter updates (`record_success`, `record_failure`,
//! `record_domain_callback`, `record_subscription_message`) must be atomic
//! per row; overlapping updates on the same row are serialized by the
//! implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use cb_common::{
    AuthorizedDomain, CallBridgeError, CallbackConfiguration, CallbackExecution, ExecutionStatus,
    Subscription,
};

use crate::Result;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Duplicate entity: {entity_type} with {field}={value}")]
    Duplicate {
        entity_type: String,
        field: String,
        value: String,
    },

    #[error("Core error: {0}")]
    Core(#[from] CallBridgeError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn not_found(entity_type: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.to_string(),
        }
    }

    pub fn duplicate(
        entity_type: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self::Duplicate {
            entity_type: entity_type.into(),
            field: field.into(),
            value: value.into(),
        }
    }
}

/// Partial update applied to an execution row. Only terminal bookkeeping
/// fields are patchable; identity and request fields are immutable once
/// appended.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPatch {
    pub status: Option<ExecutionStatus>,
    pub response_status_code: Option<u16>,
    pub response_headers: Option<String>,
    pub response_body: Option<String>,
    pub request_duration_ms: Option<u64>,
    pub error_message: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionPatch {
    pub fn apply(&self, execution: &mut CallbackExecution) {
        if let Some(status) = self.status {
            execution.status = status;
        }
        if let Some(code) = self.response_status_code {
            execution.response_status_code = Some(code);
        }
        if let Some(ref headers) = self.response_headers {
            execution.response_headers = Some(headers.clone());
        }
        if let Some(ref body) = self.response_body {
            execution.response_body = Some(body.clone());
        }
        if let Some(duration) = self.request_duration_ms {
            execution.request_duration_ms = Some(duration);
        }
        if let Some(ref message) = self.error_message {
            execution.error_message = Some(message.clone());
        }
        if let Some(at) = self.next_retry_at {
            execution.next_retry_at = Some(at);
        }
        if let Some(at) = self.completed_at {
            execution.completed_at = Some(at);
        }
    }
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    // Subscriptions

    async fn insert_subscription(&self, subscription: &Subscription) -> Result<()>;

    async fn update_subscription(&self, subscription: &Subscription) -> Result<()>;

    async fn delete_subscription(&self, id: Uuid) -> Result<bool>;

    async fn get_subscription(&self, id: Uuid) -> Result<Option<Subscription>>;

    /// Subscriptions with `active = true`, for startup consumer recovery.
    async fn list_active_subscriptions(&self) -> Result<Vec<Subscription>>;

    /// Bumps `total_messages_received` (always), `total_messages_failed`
    /// (on `!success`) and stamps `last_message_at`.
    async fn record_subscription_message(&self, id: Uuid, success: bool) -> Result<()>;

    // Authorized domains

    async fn insert_domain(&self, domain: &AuthorizedDomain) -> Result<()>;

    async fn update_domain(&self, domain: &AuthorizedDomain) -> Result<()>;

    async fn delete_domain(&self, id: Uuid) -> Result<bool>;

    /// Lookup by the unique domain key (lowercased host, optional
    /// non-standard `:port`).
    async fn get_domain_by_name(&self, domain: &str) -> Result<Option<AuthorizedDomain>>;

    /// Marks a domain verified and records how.
    async fn verify_domain(&self, domain: &str, method: &str) -> Result<()>;

    /// Bumps `total_callbacks` (always), `total_failed` (on `!success`) and
    /// stamps `last_callback_at`.
    async fn record_domain_callback(&self, domain: &str, success: bool) -> Result<()>;

    // Callback configurations

    async fn insert_config(&self, config: &CallbackConfiguration) -> Result<()>;

    async fn update_config(&self, config: &CallbackConfiguration) -> Result<()>;

    async fn delete_config(&self, id: Uuid) -> Result<bool>;

    async fn get_config(&self, id: Uuid) -> Result<Option<CallbackConfiguration>>;

    /// Every eligible configuration (`active` and status `ACTIVE`) with at
    /// least one subscribed pattern matching `event_type`. No duplicates.
    async fn active_configs_for_event_type(
        &self,
        event_type: &str,
    ) -> Result<Vec<CallbackConfiguration>>;

    /// `last_success_at := now`, `failure_count := 0`, and a `PAUSED`
    /// configuration reactivates.
    async fn record_success(&self, id: Uuid) -> Result<()>;

    /// `last_failure_at := now`, `failure_count += 1`, and the
    /// configuration pauses once the failure threshold is reached.
    async fn record_failure(&self, id: Uuid) -> Result<()>;

    // Executions

    async fn append_execution(&self, execution: &CallbackExecution) -> Result<()>;

    async fn update_execution(&self, id: Uuid, patch: ExecutionPatch) -> Result<()>;

    async fn get_execution(&self, id: Uuid) -> Result<Option<CallbackExecution>>;

    /// Execution history for one configuration, oldest first.
    async fn list_executions(&self, configuration_id: Uuid) -> Result<Vec<CallbackExecution>>;
}
