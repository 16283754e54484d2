//! Callback dispatcher
//!
//! Drives one `(configuration, event)` pair to a terminal outcome:
//! authorize the URL, build the signed request once, then attempt delivery
//! under the configuration's circuit breaker with bounded exponential
//! backoff. Every attempt is recorded; endpoint failures never propagate
//! past this module.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use sha2::Sha256;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use cb_common::{CallbackConfiguration, HttpMethod};
use cb_store::ConfigStore;

use crate::authorizer::{AuthzDecision, DomainAuthorizer};
use crate::breaker::CircuitBreakerRegistry;
use crate::recorder::ExecutionRecorder;
use crate::shutdown::Shutdown;
use crate::Result;

type HmacSha256 = Hmac<Sha256>;

/// Computes the signature header value: standard Base64 (padded) of
/// HMAC-SHA-256 over the exact bytes sent on the wire.
pub fn sign_payload(payload: &[u8], secret: &[u8]) -> String {
    // HMAC-SHA-256 accepts keys of any length.
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(payload);
    BASE64.encode(mac.finalize().into_bytes())
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Ceiling for the exponential retry delay.
    pub max_backoff: Duration,
    /// TCP connect timeout for the shared client.
    pub connect_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_backoff: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Request parts computed once per dispatch and reused verbatim across
/// retries.
struct BuiltRequest {
    headers: HeaderMap,
    headers_json: String,
    body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusClass {
    Success,
    Retryable,
    Permanent,
}

fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        408 | 429 => StatusClass::Retryable,
        500..=599 => StatusClass::Retryable,
        _ => StatusClass::Permanent,
    }
}

enum AttemptOutcome {
    Ok {
        status: u16,
        duration_ms: u64,
        response_headers: String,
        response_body: String,
    },
    Retryable {
        error: String,
        status: Option<u16>,
        duration_ms: u64,
    },
    Permanent {
        error: String,
        status: Option<u16>,
        duration_ms: u64,
    },
    Cancelled,
}

fn backoff_delay(config: &CallbackConfiguration, attempt: u32, cap: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1) as i32;
    let factor = config.retry_backoff_multiplier.powi(exponent);
    let delay_ms = (config.retry_delay_ms as f64 * factor).min(cap.as_millis() as f64);
    Duration::from_millis(delay_ms as u64)
}

fn headers_to_json(headers: &HeaderMap) -> String {
    let map: BTreeMap<String, String> = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();
    serde_json::to_string(&map).unwrap_or_else(|_| "{}".to_string())
}

pub struct CallbackDispatcher {
    client: reqwest::Client,
    store: Arc<dyn ConfigStore>,
    authorizer: Arc<DomainAuthorizer>,
    breakers: Arc<CircuitBreakerRegistry>,
    recorder: Arc<ExecutionRecorder>,
    config: DispatcherConfig,
    shutdown: Arc<Shutdown>,
}

impl CallbackDispatcher {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        authorizer: Arc<DomainAuthorizer>,
        breakers: Arc<CircuitBreakerRegistry>,
        recorder: Arc<ExecutionRecorder>,
        config: DispatcherConfig,
        shutdown: Arc<Shutdown>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self {
            client,
            store,
            authorizer,
            breakers,
            recorder,
            config,
            shutdown,
        })
    }

    /// Delivers one event to one configuration. Completes when the dispatch
    /// is terminal; never returns an error to the router.
    pub async fn dispatch(
        &self,
        config: &CallbackConfiguration,
        event_type: &str,
        source_event_id: Uuid,
        payload: &serde_json::Value,
    ) {
        if self.shutdown.is_triggered() {
            debug!(config_id = %config.id, "Shutdown in progress, not starting dispatch");
            return;
        }

        debug!(
            config_id = %config.id,
            event_type = %event_type,
            event_id = %source_event_id,
            "Dispatching callback"
        );

        let body = match serde_json::to_string(payload) {
            Ok(body) => body,
            Err(e) => {
                // The event can never deliver; record the cause and stop.
                self.recorder
                    .record_rejection(
                        config,
                        event_type,
                        source_event_id,
                        "",
                        1,
                        &format!("payload_serialization: {e}"),
                    )
                    .await;
                self.record_failure_counters(config, None).await;
                return;
            }
        };

        let domain = match self.authorizer.authorize(&config.url).await {
            AuthzDecision::Allow { domain } => domain,
            AuthzDecision::Deny { reason, domain } => {
                warn!(
                    config_id = %config.id,
                    url = %config.url,
                    reason = %reason,
                    "Callback URL not authorized"
                );
                self.recorder
                    .record_rejection(
                        config,
                        event_type,
                        source_event_id,
                        &body,
                        1,
                        &format!("not_authorized: {reason}"),
                    )
                    .await;
                self.record_failure_counters(config, domain.as_deref()).await;
                return;
            }
        };

        let built = match self.build_request(config, event_type, source_event_id, body) {
            Ok(built) => built,
            Err(message) => {
                self.recorder
                    .record_rejection(config, event_type, source_event_id, "", 1, &message)
                    .await;
                self.record_failure_counters(config, Some(&domain)).await;
                return;
            }
        };

        let max_attempts = config.max_retries + 1;
        let breaker = self.breakers.get_or_create(config.id);

        for attempt in 1..=max_attempts {
            if !breaker.try_acquire() {
                self.recorder
                    .record_rejection(
                        config,
                        event_type,
                        source_event_id,
                        &built.body,
                        attempt,
                        "circuit_open",
                    )
                    .await;
                self.record_failure_counters(config, Some(&domain)).await;
                return;
            }

            let execution_id = self
                .recorder
                .begin_attempt(
                    config,
                    event_type,
                    source_event_id,
                    &built.body,
                    &built.headers_json,
                    attempt,
                    max_attempts,
                )
                .await;

            match self.send_attempt(config, &built).await {
                AttemptOutcome::Ok {
                    status,
                    duration_ms,
                    response_headers,
                    response_body,
                } => {
                    breaker.record_success(Duration::from_millis(duration_ms));
                    info!(
                        config_id = %config.id,
                        status = status,
                        duration_ms = duration_ms,
                        attempt = attempt,
                        "Callback delivered"
                    );
                    self.recorder
                        .complete_success(
                            execution_id,
                            status,
                            duration_ms,
                            Some(response_headers),
                            Some(response_body),
                        )
                        .await;
                    self.record_success_counters(config, &domain).await;
                    return;
                }
                AttemptOutcome::Cancelled => {
                    self.recorder
                        .complete_permanent(execution_id, None, None, "cancelled")
                        .await;
                    self.record_failure_counters(config, Some(&domain)).await;
                    return;
                }
                AttemptOutcome::Retryable {
                    error,
                    status,
                    duration_ms,
                } if attempt < max_attempts => {
                    breaker.record_failure(Duration::from_millis(duration_ms));
                    let delay = backoff_delay(config, attempt, self.config.max_backoff);
                    warn!(
                        config_id = %config.id,
                        attempt = attempt,
                        error = %error,
                        delay_ms = delay.as_millis() as u64,
                        "Callback attempt failed, retrying"
                    );
                    let next_retry_at = Utc::now()
                        + chrono::Duration::milliseconds(delay.as_millis() as i64);
                    self.recorder
                        .complete_retrying(execution_id, status, duration_ms, &error, next_retry_at)
                        .await;

                    let mut shutdown_rx = self.shutdown.subscribe();
                    tokio::select! {
                        _ = shutdown_rx.recv() => {
                            debug!(config_id = %config.id, "Shutdown during retry backoff, abandoning dispatch");
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                AttemptOutcome::Retryable {
                    error,
                    status,
                    duration_ms,
                }
                | AttemptOutcome::Permanent {
                    error,
                    status,
                    duration_ms,
                } => {
                    breaker.record_failure(Duration::from_millis(duration_ms));
                    error!(
                        config_id = %config.id,
                        attempt = attempt,
                        error = %error,
                        "Callback failed permanently"
                    );
                    self.recorder
                        .complete_permanent(execution_id, status, Some(duration_ms), &error)
                        .await;
                    self.record_failure_counters(config, Some(&domain)).await;
                    return;
                }
            }
        }
    }

    /// Builds the request parts once. The headers and body are invariant
    /// across retries; the signature covers exactly the body bytes.
    fn build_request(
        &self,
        config: &CallbackConfiguration,
        event_type: &str,
        source_event_id: Uuid,
        body: String,
    ) -> std::result::Result<BuiltRequest, String> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let parse_pair = |name: &str, value: &str| {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| format!("invalid header name {name:?}: {e}"))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| format!("invalid header value for {name:?}: {e}"))?;
            Ok::<_, String>((name, value))
        };

        let (name, value) = parse_pair("X-Event-Type", event_type)?;
        headers.insert(name, value);
        let (name, value) = parse_pair("X-Event-Id", &source_event_id.to_string())?;
        headers.insert(name, value);
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let (name, value) = parse_pair("X-Timestamp", &timestamp)?;
        headers.insert(name, value);

        // Custom headers override the standard set on name collision.
        for (name, value) in &config.custom_headers {
            let (name, value) = parse_pair(name, value)?;
            headers.insert(name, value);
        }

        if config.signature_enabled {
            let secret = config
                .secret
                .as_deref()
                .ok_or_else(|| "signature enabled without a secret".to_string())?;
            let signature = sign_payload(body.as_bytes(), secret.as_bytes());
            let (name, value) = parse_pair(config.effective_signature_header(), &signature)?;
            headers.insert(name, value);
        }

        let headers_json = headers_to_json(&headers);
        Ok(BuiltRequest {
            headers,
            headers_json,
            body,
        })
    }

    async fn send_attempt(
        &self,
        config: &CallbackConfiguration,
        built: &BuiltRequest,
    ) -> AttemptOutcome {
        let method = match config.method {
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
        };

        let request = self
            .client
            .request(method, &config.url)
            .headers(built.headers.clone())
            .timeout(Duration::from_millis(config.timeout_ms))
            .body(built.body.clone());

        let start = Instant::now();
        let mut shutdown_rx = self.shutdown.subscribe();
        let response = tokio::select! {
            _ = shutdown_rx.recv() => return AttemptOutcome::Cancelled,
            response = request.send() => response,
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        match response {
            Ok(response) => {
                let status = response.status().as_u16();
                match classify_status(status) {
                    StatusClass::Success => {
                        let response_headers = headers_to_json(response.headers());
                        let response_body = response.text().await.unwrap_or_default();
                        AttemptOutcome::Ok {
                            status,
                            duration_ms,
                            response_headers,
                            response_body,
                        }
                    }
                    StatusClass::Retryable => AttemptOutcome::Retryable {
                        error: format!("server_error: HTTP {status}"),
                        status: Some(status),
                        duration_ms,
                    },
                    StatusClass::Permanent => AttemptOutcome::Permanent {
                        error: format!("client_error: HTTP {status}"),
                        status: Some(status),
                        duration_ms,
                    },
                }
            }
            Err(e) if e.is_timeout() => AttemptOutcome::Retryable {
                error: format!("attempt_timeout: {e}"),
                status: None,
                duration_ms,
            },
            Err(e) => AttemptOutcome::Retryable {
                error: format!("transport_error: {e}"),
                status: None,
                duration_ms,
            },
        }
    }

    async fn record_success_counters(&self, config: &CallbackConfiguration, domain: &str) {
        if let Err(e) = self.store.record_success(config.id).await {
            error!(config_id = %config.id, error = %e, "Failed to record configuration success");
        }
        if let Err(e) = self.store.record_domain_callback(domain, true).await {
            error!(domain = %domain, error = %e, "Failed to record domain callback");
        }
    }

    async fn record_failure_counters(
        &self,
        config: &CallbackConfiguration,
        domain: Option<&str>,
    ) {
        if let Err(e) = self.store.record_failure(config.id).await {
            error!(config_id = %config.id, error = %e, "Failed to record configuration failure");
        }
        if let Some(domain) = domain {
            if let Err(e) = self.store.record_domain_callback(domain, false).await {
                error!(domain = %domain, error = %e, "Failed to record domain callback");
            }
        }
    }
}
