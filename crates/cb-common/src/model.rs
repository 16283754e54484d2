//! Domain entities
//!
//! The four durable entities owned by the config store. Field inventory and
//! lifecycle semantics follow the callback management data model; all
//! identifiers are UUIDs and all instants are UTC.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::CallBridgeError;
use crate::Result;

/// Messaging systems a subscription can bind to.
///
/// Driver availability is decided at runtime by the registered consumer
/// factories; the model accepts every kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrokerKind {
    Kafka,
    Rabbitmq,
    Sqs,
}

impl fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerKind::Kafka => write!(f, "KAFKA"),
            BrokerKind::Rabbitmq => write!(f, "RABBITMQ"),
            BrokerKind::Sqs => write!(f, "SQS"),
        }
    }
}

impl FromStr for BrokerKind {
    type Err = CallBridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "KAFKA" => Ok(BrokerKind::Kafka),
            "RABBITMQ" => Ok(BrokerKind::Rabbitmq),
            "SQS" => Ok(BrokerKind::Sqs),
            other => Err(CallBridgeError::validation(format!(
                "unknown broker kind: {other}"
            ))),
        }
    }
}

/// HTTP method used for a callback request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HttpMethod {
    Post,
    Put,
    Patch,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpMethod::Post => write!(f, "POST"),
            HttpMethod::Put => write!(f, "PUT"),
            HttpMethod::Patch => write!(f, "PATCH"),
        }
    }
}

impl FromStr for HttpMethod {
    type Err = CallBridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            other => Err(CallBridgeError::validation(format!(
                "unknown http method: {other}"
            ))),
        }
    }
}

/// Operational status of a callback configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallbackStatus {
    Active,
    Paused,
    Disabled,
    Failed,
}

impl fmt::Display for CallbackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackStatus::Active => write!(f, "ACTIVE"),
            CallbackStatus::Paused => write!(f, "PAUSED"),
            CallbackStatus::Disabled => write!(f, "DISABLED"),
            CallbackStatus::Failed => write!(f, "FAILED"),
        }
    }
}

impl FromStr for CallbackStatus {
    type Err = CallBridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ACTIVE" => Ok(CallbackStatus::Active),
            "PAUSED" => Ok(CallbackStatus::Paused),
            "DISABLED" => Ok(CallbackStatus::Disabled),
            "FAILED" => Ok(CallbackStatus::Failed),
            other => Err(CallBridgeError::validation(format!(
                "unknown callback status: {other}"
            ))),
        }
    }
}

/// Status of a single callback execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    InProgress,
    Success,
    FailedRetrying,
    FailedPermanent,
    Skipped,
}

impl ExecutionStatus {
    /// Terminal statuses close the attempt; non-terminal rows may still be
    /// patched.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Success
                | ExecutionStatus::FailedRetrying
                | ExecutionStatus::FailedPermanent
                | ExecutionStatus::Skipped
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Pending => write!(f, "PENDING"),
            ExecutionStatus::InProgress => write!(f, "IN_PROGRESS"),
            ExecutionStatus::Success => write!(f, "SUCCESS"),
            ExecutionStatus::FailedRetrying => write!(f, "FAILED_RETRYING"),
            ExecutionStatus::FailedPermanent => write!(f, "FAILED_PERMANENT"),
            ExecutionStatus::Skipped => write!(f, "SKIPPED"),
        }
    }
}

impl FromStr for ExecutionStatus {
    type Err = CallBridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(ExecutionStatus::Pending),
            "IN_PROGRESS" => Ok(ExecutionStatus::InProgress),
            "SUCCESS" => Ok(ExecutionStatus::Success),
            "FAILED_RETRYING" => Ok(ExecutionStatus::FailedRetrying),
            "FAILED_PERMANENT" => Ok(ExecutionStatus::FailedPermanent),
            "SKIPPED" => Ok(ExecutionStatus::Skipped),
            other => Err(CallBridgeError::validation(format!(
                "unknown execution status: {other}"
            ))),
        }
    }
}

/// A durable binding between a broker topic/queue and the event router.
///
/// Creating or activating a subscription obligates the consumer manager to
/// run exactly one logical consumer for it; deactivation or deletion
/// obligates teardown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,

    pub name: String,

    pub description: Option<String>,

    /// Messaging system this subscription consumes from.
    pub broker_kind: BrokerKind,

    /// Driver connection settings (bootstrap servers, credentials, ...).
    /// Must be non-empty while the subscription is active.
    pub connection_config: HashMap<String, String>,

    pub topic_or_queue: String,

    /// Consumer group, for brokers that support one.
    pub consumer_group_id: Option<String>,

    /// Event-type glob patterns. Empty means accept everything.
    pub event_type_patterns: Vec<String>,

    /// Upper bound on driver-internal concurrency, 1..=100.
    pub max_concurrent_consumers: u32,

    /// Poll interval for pull-based drivers, 100..=60000 ms.
    pub polling_interval_ms: u64,

    pub active: bool,

    pub last_message_at: Option<DateTime<Utc>>,

    pub total_messages_received: u64,

    pub total_messages_failed: u64,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn new(
        name: impl Into<String>,
        broker_kind: BrokerKind,
        topic_or_queue: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            broker_kind,
            connection_config: HashMap::new(),
            topic_or_queue: topic_or_queue.into(),
            consumer_group_id: None,
            event_type_patterns: Vec::new(),
            max_concurrent_consumers: 1,
            polling_interval_ms: 1000,
            active: true,
            last_message_at: None,
            total_messages_received: 0,
            total_messages_failed: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_connection(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.connection_config.insert(key.into(), value.into());
        self
    }

    pub fn with_patterns(mut self, patterns: Vec<String>) -> Self {
        self.event_type_patterns = patterns;
        self
    }

    pub fn with_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group_id = Some(group.into());
        self
    }

    /// True when `event_type` matches this subscription (empty pattern list
    /// accepts everything).
    pub fn matches_event_type(&self, event_type: &str) -> bool {
        crate::pattern::matches_any(&self.event_type_patterns, event_type)
    }

    /// True when an update from `self` to `next` requires tearing the
    /// running consumer down and registering a fresh one.
    pub fn requires_restart(&self, next: &Subscription) -> bool {
        self.broker_kind != next.broker_kind
            || self.topic_or_queue != next.topic_or_queue
            || self.connection_config != next.connection_config
            || self.consumer_group_id != next.consumer_group_id
            || self.event_type_patterns != next.event_type_patterns
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CallBridgeError::validation("subscription name is required"));
        }
        if self.topic_or_queue.trim().is_empty() {
            return Err(CallBridgeError::validation("topic_or_queue is required"));
        }
        if self.active && self.connection_config.is_empty() {
            return Err(CallBridgeError::validation(
                "connection_config must have at least one entry for an active subscription",
            ));
        }
        if !(1..=100).contains(&self.max_concurrent_consumers) {
            return Err(CallBridgeError::validation(
                "max_concurrent_consumers must be in 1..=100",
            ));
        }
        if !(100..=60_000).contains(&self.polling_interval_ms) {
            return Err(CallBridgeError::validation(
                "polling_interval_ms must be in 100..=60000",
            ));
        }
        Ok(())
    }
}

/// Whitelist entry a callback URL's host must resolve to before any network
/// call is made.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizedDomain {
    pub id: Uuid,

    /// Lowercased host, with `:port` appended when the port is non-standard.
    /// Unique across the store.
    pub domain: String,

    pub organization: Option<String>,

    pub contact_email: Option<String>,

    pub verified: bool,

    pub verification_method: Option<String>,

    pub verified_at: Option<DateTime<Utc>>,

    pub active: bool,

    /// Path glob patterns; empty means any path is allowed.
    pub allowed_paths: Vec<String>,

    /// Informational; rate limiting is not enforced by the core.
    pub max_callbacks_per_minute: Option<u32>,

    /// Informational; the core never dials by IP.
    pub ip_whitelist: Vec<String>,

    pub require_https: bool,

    pub notes: Option<String>,

    pub expires_at: Option<DateTime<Utc>>,

    pub last_callback_at: Option<DateTime<Utc>>,

    pub total_callbacks: u64,

    pub total_failed: u64,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl AuthorizedDomain {
    pub fn new(domain: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            domain: domain.into().to_lowercase(),
            organization: None,
            contact_email: None,
            verified: false,
            verification_method: None,
            verified_at: None,
            active: true,
            allowed_paths: Vec::new(),
            max_callbacks_per_minute: None,
            ip_whitelist: Vec::new(),
            require_https: false,
            notes: None,
            expires_at: None,
            last_callback_at: None,
            total_callbacks: 0,
            total_failed: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn verified(mut self) -> Self {
        self.verified = true;
        self.verified_at = Some(Utc::now());
        self
    }

    pub fn with_allowed_paths(mut self, paths: Vec<String>) -> Self {
        self.allowed_paths = paths;
        self
    }

    pub fn with_require_https(mut self, require: bool) -> Self {
        self.require_https = require;
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn is_path_allowed(&self, path: &str) -> bool {
        self.allowed_paths.is_empty()
            || self
                .allowed_paths
                .iter()
                .any(|p| crate::pattern::matches_path(p, path))
    }

    pub fn validate(&self) -> Result<()> {
        if self.domain.trim().is_empty() {
            return Err(CallBridgeError::validation("domain is required"));
        }
        if self.domain != self.domain.to_lowercase() {
            return Err(CallBridgeError::validation("domain must be lowercase"));
        }
        Ok(())
    }
}

/// A webhook definition: where to deliver, how to authenticate, and how to
/// back off when the endpoint misbehaves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackConfiguration {
    pub id: Uuid,

    pub name: String,

    pub description: Option<String>,

    /// Absolute http/https URL, at most 2048 characters.
    pub url: String,

    pub method: HttpMethod,

    pub status: CallbackStatus,

    /// Event-type glob patterns this configuration subscribes to. At least
    /// one entry.
    pub subscribed_event_types: Vec<String>,

    /// Extra request headers; entries override the standard set on name
    /// collision.
    pub custom_headers: HashMap<String, String>,

    /// Operator bookkeeping; never sent on the wire.
    pub metadata: HashMap<String, serde_json::Value>,

    pub signature_enabled: bool,

    /// HMAC secret; required when signatures are enabled.
    pub secret: Option<String>,

    /// Header carrying the signature; `X-Signature` when unset.
    pub signature_header: Option<String>,

    /// Retries after the first attempt, 0..=10.
    pub max_retries: u32,

    /// Base retry delay, 100..=300000 ms.
    pub retry_delay_ms: u64,

    /// Backoff multiplier, 1.0..=10.0.
    pub retry_backoff_multiplier: f64,

    /// Per-attempt timeout, 1000..=300000 ms.
    pub timeout_ms: u64,

    /// Optional `path=value` payload filter.
    pub filter_expression: Option<String>,

    /// Consecutive permanent failures before auto-pause, 1..=100.
    pub failure_threshold: u32,

    pub failure_count: u32,

    pub last_success_at: Option<DateTime<Utc>>,

    pub last_failure_at: Option<DateTime<Utc>>,

    pub active: bool,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

pub const DEFAULT_SIGNATURE_HEADER: &str = "X-Signature";

impl CallbackConfiguration {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        method: HttpMethod,
        subscribed_event_types: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            url: url.into(),
            method,
            status: CallbackStatus::Active,
            subscribed_event_types,
            custom_headers: HashMap::new(),
            metadata: HashMap::new(),
            signature_enabled: false,
            secret: None,
            signature_header: None,
            max_retries: 3,
            retry_delay_ms: 1000,
            retry_backoff_multiplier: 2.0,
            timeout_ms: 30_000,
            filter_expression: None,
            failure_threshold: 10,
            failure_count: 0,
            last_success_at: None,
            last_failure_at: None,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_signature(mut self, secret: impl Into<String>) -> Self {
        self.signature_enabled = true;
        self.secret = Some(secret.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_headers.insert(name.into(), value.into());
        self
    }

    pub fn with_retries(mut self, max_retries: u32, delay_ms: u64, multiplier: f64) -> Self {
        self.max_retries = max_retries;
        self.retry_delay_ms = delay_ms;
        self.retry_backoff_multiplier = multiplier;
        self
    }

    pub fn with_filter(mut self, expression: impl Into<String>) -> Self {
        self.filter_expression = Some(expression.into());
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// A configuration fires only while it is both active and ACTIVE.
    pub fn is_eligible(&self) -> bool {
        self.active && self.status == CallbackStatus::Active
    }

    pub fn matches_event_type(&self, event_type: &str) -> bool {
        self.subscribed_event_types
            .iter()
            .any(|p| crate::pattern::matches_event_type(p, event_type))
    }

    pub fn effective_signature_header(&self) -> &str {
        self.signature_header
            .as_deref()
            .filter(|h| !h.is_empty())
            .unwrap_or(DEFAULT_SIGNATURE_HEADER)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CallBridgeError::validation("configuration name is required"));
        }
        if self.url.len() > 2048 {
            return Err(CallBridgeError::validation("url exceeds 2048 characters"));
        }
        let parsed = Url::parse(&self.url)
            .map_err(|e| CallBridgeError::invalid_url(format!("{}: {e}", self.url)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(CallBridgeError::invalid_url(format!(
                "unsupported scheme: {}",
                parsed.scheme()
            )));
        }
        if parsed.host_str().map_or(true, str::is_empty) {
            return Err(CallBridgeError::invalid_url("url has no host"));
        }
        if self.subscribed_event_types.is_empty() {
            return Err(CallBridgeError::validation(
                "at least one subscribed event type is required",
            ));
        }
        if self.signature_enabled && self.secret.as_deref().map_or(true, str::is_empty) {
            return Err(CallBridgeError::validation(
                "secret is required when signatures are enabled",
            ));
        }
        if self.max_retries > 10 {
            return Err(CallBridgeError::validation("max_retries must be in 0..=10"));
        }
        if !(100..=300_000).contains(&self.retry_delay_ms) {
            return Err(CallBridgeError::validation(
                "retry_delay_ms must be in 100..=300000",
            ));
        }
        if !(1.0..=10.0).contains(&self.retry_backoff_multiplier) {
            return Err(CallBridgeError::validation(
                "retry_backoff_multiplier must be in 1.0..=10.0",
            ));
        }
        if !(1000..=300_000).contains(&self.timeout_ms) {
            return Err(CallBridgeError::validation(
                "timeout_ms must be in 1000..=300000",
            ));
        }
        if !(1..=100).contains(&self.failure_threshold) {
            return Err(CallBridgeError::validation(
                "failure_threshold must be in 1..=100",
            ));
        }
        Ok(())
    }
}

/// A persisted record of one delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackExecution {
    pub id: Uuid,

    pub configuration_id: Uuid,

    pub event_type: String,

    pub source_event_id: Uuid,

    pub status: ExecutionStatus,

    /// 1-based attempt index within the dispatch.
    pub attempt_number: u32,

    /// Total attempts the dispatch may make (`max_retries + 1`).
    pub max_attempts: u32,

    /// Serialized event payload, exactly the bytes sent on the wire.
    pub request_payload: String,

    /// JSON snapshot of the request headers.
    pub request_headers: Option<String>,

    pub response_status_code: Option<u16>,

    /// JSON snapshot of the response headers.
    pub response_headers: Option<String>,

    /// Response body, truncated to the recorder's cap.
    pub response_body: Option<String>,

    pub request_duration_ms: Option<u64>,

    pub error_message: Option<String>,

    /// Scheduled time of the next attempt, for FAILED_RETRYING rows.
    pub next_retry_at: Option<DateTime<Utc>>,

    pub executed_at: DateTime<Utc>,

    pub completed_at: Option<DateTime<Utc>>,
}

impl CallbackExecution {
    /// Opens an attempt row in `IN_PROGRESS`; the recorder patches it to a
    /// terminal status when the attempt finishes.
    pub fn begin(
        configuration_id: Uuid,
        event_type: impl Into<String>,
        source_event_id: Uuid,
        request_payload: impl Into<String>,
        attempt_number: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            configuration_id,
            event_type: event_type.into(),
            source_event_id,
            status: ExecutionStatus::InProgress,
            attempt_number,
            max_attempts,
            request_payload: request_payload.into(),
            request_headers: None,
            response_status_code: None,
            response_headers: None,
            response_body: None,
            request_duration_ms: None,
            error_message: None,
            next_retry_at: None,
            executed_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn with_request_headers(mut self, headers_json: impl Into<String>) -> Self {
        self.request_headers = Some(headers_json.into());
        self
    }
}
