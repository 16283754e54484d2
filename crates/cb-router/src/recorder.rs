//! Execution recording
//!
//! Every dispatch outcome leaves at least one execution row behind. Each
//! attempt opens an `IN_PROGRESS` row and patches it to its terminal
//! status; denials and breaker rejections append a single terminal row.
//! A store failure here is logged and swallowed: the audit trail must
//! never change the outcome already delivered to the endpoint.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, warn};
use uuid::Uuid;

use cb_common::{CallbackConfiguration, CallbackExecution, ExecutionStatus};
use cb_store::{ConfigStore, ExecutionPatch};

pub const RESPONSE_BODY_CAP: usize = 10_000;
pub const ERROR_MESSAGE_CAP: usize = 2_000;

pub struct ExecutionRecorder {
    store: Arc<dyn ConfigStore>,
    response_body_cap: usize,
    error_message_cap: usize,
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => text[..byte_index].to_string(),
        None => text.to_string(),
    }
}

impl ExecutionRecorder {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self {
            store,
            response_body_cap: RESPONSE_BODY_CAP,
            error_message_cap: ERROR_MESSAGE_CAP,
        }
    }

    /// Opens an attempt row. Returns the row id, or `None` when the append
    /// failed (the dispatch continues regardless).
    pub async fn begin_attempt(
        &self,
        config: &CallbackConfiguration,
        event_type: &str,
        source_event_id: Uuid,
        request_payload: &str,
        request_headers_json: &str,
        attempt_number: u32,
        max_attempts: u32,
    ) -> Option<Uuid> {
        let execution = CallbackExecution::begin(
            config.id,
            event_type,
            source_event_id,
            request_payload,
            attempt_number,
            max_attempts,
        )
        .with_request_headers(request_headers_json);
        let id = execution.id;
        match self.store.append_execution(&execution).await {
            Ok(()) => Some(id),
            Err(e) => {
                error!(config_id = %config.id, error = %e, "Failed to append execution row");
                None
            }
        }
    }

    pub async fn complete_success(
        &self,
        execution_id: Option<Uuid>,
        status_code: u16,
        duration_ms: u64,
        response_headers: Option<String>,
        response_body: Option<String>,
    ) {
        self.patch(
            execution_id,
            ExecutionPatch {
                status: Some(ExecutionStatus::Success),
                response_status_code: Some(status_code),
                response_headers,
                response_body: response_body.map(|b| truncate_chars(&b, self.response_body_cap)),
                request_duration_ms: Some(duration_ms),
                completed_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await;
    }

    pub async fn complete_retrying(
        &self,
        execution_id: Option<Uuid>,
        status_code: Option<u16>,
        duration_ms: u64,
        error_message: &str,
        next_retry_at: DateTime<Utc>,
    ) {
        self.patch(
            execution_id,
            ExecutionPatch {
                status: Some(ExecutionStatus::FailedRetrying),
                response_status_code: status_code,
                request_duration_ms: Some(duration_ms),
                error_message: Some(truncate_chars(error_message, self.error_message_cap)),
                next_retry_at: Some(next_retry_at),
                completed_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await;
    }

    pub async fn complete_permanent(
        &self,
        execution_id: Option<Uuid>,
        status_code: Option<u16>,
        duration_ms: Option<u64>,
        error_message: &str,
    ) {
        self.patch(
            execution_id,
            ExecutionPatch {
                status: Some(ExecutionStatus::FailedPermanent),
                response_status_code: status_code,
                request_duration_ms: duration_ms,
                error_message: Some(truncate_chars(error_message, self.error_message_cap)),
                completed_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await;
    }

    /// Appends a terminal `FAILED_PERMANENT` row for a dispatch that never
    /// produced an HTTP attempt (authorization denial, open breaker,
    /// request build failure).
    pub async fn record_rejection(
        &self,
        config: &CallbackConfiguration,
        event_type: &str,
        source_event_id: Uuid,
        request_payload: &str,
        attempt_number: u32,
        error_message: &str,
    ) {
        let mut execution = CallbackExecution::begin(
            config.id,
            event_type,
            source_event_id,
            request_payload,
            attempt_number,
            config.max_retries + 1,
        );
        execution.status = ExecutionStatus::FailedPermanent;
        execution.error_message = Some(truncate_chars(error_message, self.error_message_cap));
        execution.completed_at = Some(execution.executed_at);
        if let Err(e) = self.store.append_execution(&execution).await {
            error!(config_id = %config.id, error = %e, "Failed to append rejection row");
        }
    }

    async fn patch(&self, execution_id: Option<Uuid>, patch: ExecutionPatch) {
        let Some(id) = execution_id else {
            // The open failed earlier; nothing to patch.
            return;
        };
        if let Err(e) = self.store.update_execution(id, patch).await {
            warn!(execution_id = %id, error = %e, "Failed to update execution row");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cb_common::HttpMethod;
    use cb_store::MemoryStore;

    fn test_config() -> CallbackConfiguration {
        CallbackConfiguration::new(
            "hook",
            "https://example.com/hook",
            HttpMethod::Post,
            vec!["order.*".to_string()],
        )
    }

    #[tokio::test]
    async fn attempt_rows_go_through_in_progress() {
        let store = Arc::new(MemoryStore::new());
        let recorder = ExecutionRecorder::new(store.clone());
        let config = test_config();
        let event_id = Uuid::new_v4();

        let id = recorder
            .begin_attempt(&config, "order.created", event_id, "{}", "{}", 1, 4)
            .await
            .unwrap();

        let open = store.get_execution(id).await.unwrap().unwrap();
        assert_eq!(open.status, ExecutionStatus::InProgress);
        assert!(open.completed_at.is_none());

        recorder
            .complete_success(Some(id), 200, 15, None, Some("ok".to_string()))
            .await;
        let done = store.get_execution(id).await.unwrap().unwrap();
        assert_eq!(done.status, ExecutionStatus::Success);
        assert_eq!(done.response_status_code, Some(200));
        assert!(done.completed_at.unwrap() >= done.executed_at);
    }

    #[tokio::test]
    async fn long_fields_are_truncated() {
        let store = Arc::new(MemoryStore::new());
        let recorder = ExecutionRecorder::new(store.clone());
        let config = test_config();

        let id = recorder
            .begin_attempt(&config, "order.created", Uuid::new_v4(), "{}", "{}", 1, 1)
            .await
            .unwrap();

        let long_body = "x".repeat(RESPONSE_BODY_CAP + 500);
        recorder
            .complete_success(Some(id), 200, 1, None, Some(long_body))
            .await;
        let row = store.get_execution(id).await.unwrap().unwrap();
        assert_eq!(row.response_body.unwrap().chars().count(), RESPONSE_BODY_CAP);

        let long_error = "e".repeat(ERROR_MESSAGE_CAP + 500);
        recorder
            .record_rejection(&config, "order.created", Uuid::new_v4(), "{}", 1, &long_error)
            .await;
        let rows = store.list_executions(config.id).await.unwrap();
        let rejection = rows
            .iter()
            .find(|r| r.status == ExecutionStatus::FailedPermanent)
            .unwrap();
        assert_eq!(
            rejection.error_message.as_ref().unwrap().chars().count(),
            ERROR_MESSAGE_CAP
        );
    }

    #[tokio::test]
    async fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("short", 100), "short");
    }
}
