//! PostgreSQL config store
//!
//! Runtime-checked sqlx queries over four tables. The unique index on
//! `authorized_domains.domain` backs the contract's uniqueness invariant;
//! counter updates are single UPDATE statements so concurrent
//! `record_success`/`record_failure` on one row serialize on the row lock.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use cb_common::{
    AuthorizedDomain, BrokerKind, CallbackConfiguration, CallbackExecution, CallbackStatus,
    ExecutionStatus, HttpMethod, Subscription,
};

use crate::store::{ConfigStore, ExecutionPatch, StoreError};
use crate::Result;

pub struct PostgresStore {
    pool: PgPool,
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS subscriptions (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT,
        broker_kind TEXT NOT NULL,
        connection_config TEXT NOT NULL,
        topic_or_queue TEXT NOT NULL,
        consumer_group_id TEXT,
        event_type_patterns TEXT[] NOT NULL DEFAULT '{}',
        max_concurrent_consumers INTEGER NOT NULL,
        polling_interval_ms BIGINT NOT NULL,
        active BOOLEAN NOT NULL,
        last_message_at TIMESTAMPTZ,
        total_messages_received BIGINT NOT NULL DEFAULT 0,
        total_messages_failed BIGINT NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_subscriptions_active ON subscriptions(active)",
    r#"
    CREATE TABLE IF NOT EXISTS authorized_domains (
        id UUID PRIMARY KEY,
        domain TEXT NOT NULL,
        organization TEXT,
        contact_email TEXT,
        verified BOOLEAN NOT NULL,
        verification_method TEXT,
        verified_at TIMESTAMPTZ,
        active BOOLEAN NOT NULL,
        allowed_paths TEXT[] NOT NULL DEFAULT '{}',
        max_callbacks_per_minute INTEGER,
        ip_whitelist TEXT[] NOT NULL DEFAULT '{}',
        require_https BOOLEAN NOT NULL,
        notes TEXT,
        expires_at TIMESTAMPTZ,
        last_callback_at TIMESTAMPTZ,
        total_callbacks BIGINT NOT NULL DEFAULT 0,
        total_failed BIGINT NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_authorized_domains_domain ON authorized_domains(domain)",
    r#"
    CREATE TABLE IF NOT EXISTS callback_configurations (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT,
        url TEXT NOT NULL,
        method TEXT NOT NULL,
        status TEXT NOT NULL,
        subscribed_event_types TEXT[] NOT NULL,
        custom_headers TEXT NOT NULL,
        metadata TEXT NOT NULL,
        signature_enabled BOOLEAN NOT NULL,
        secret TEXT,
        signature_header TEXT,
        max_retries INTEGER NOT NULL,
        retry_delay_ms BIGINT NOT NULL,
        retry_backoff_multiplier DOUBLE PRECISION NOT NULL,
        timeout_ms BIGINT NOT NULL,
        filter_expression TEXT,
        failure_threshold INTEGER NOT NULL,
        failure_count INTEGER NOT NULL DEFAULT 0,
        last_success_at TIMESTAMPTZ,
        last_failure_at TIMESTAMPTZ,
        active BOOLEAN NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_configurations_eligible ON callback_configurations(active, status)",
    r#"
    CREATE TABLE IF NOT EXISTS callback_executions (
        id UUID PRIMARY KEY,
        configuration_id UUID NOT NULL,
        event_type TEXT NOT NULL,
        source_event_id UUID NOT NULL,
        status TEXT NOT NULL,
        attempt_number INTEGER NOT NULL,
        max_attempts INTEGER NOT NULL,
        request_payload TEXT NOT NULL,
        request_headers TEXT,
        response_status_code INTEGER,
        response_headers TEXT,
        response_body TEXT,
        request_duration_ms BIGINT,
        error_message TEXT,
        next_retry_at TIMESTAMPTZ,
        executed_at TIMESTAMPTZ NOT NULL,
        completed_at TIMESTAMPTZ
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_executions_configuration ON callback_executions(configuration_id, executed_at)",
];

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn map_subscription(row: &PgRow) -> Result<Subscription> {
    let connection_config: HashMap<String, String> =
        serde_json::from_str(row.get("connection_config"))?;
    Ok(Subscription {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        broker_kind: BrokerKind::from_str(row.get("broker_kind")).map_err(StoreError::Core)?,
        connection_config,
        topic_or_queue: row.get("topic_or_queue"),
        consumer_group_id: row.get("consumer_group_id"),
        event_type_patterns: row.get("event_type_patterns"),
        max_concurrent_consumers: row.get::<i32, _>("max_concurrent_consumers") as u32,
        polling_interval_ms: row.get::<i64, _>("polling_interval_ms") as u64,
        active: row.get("active"),
        last_message_at: row.get("last_message_at"),
        total_messages_received: row.get::<i64, _>("total_messages_received") as u64,
        total_messages_failed: row.get::<i64, _>("total_messages_failed") as u64,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn map_domain(row: &PgRow) -> Result<AuthorizedDomain> {
    Ok(AuthorizedDomain {
        id: row.get("id"),
        domain: row.get("domain"),
        organization: row.get("organization"),
        contact_email: row.get("contact_email"),
        verified: row.get("verified"),
        verification_method: row.get("verification_method"),
        verified_at: row.get("verified_at"),
        active: row.get("active"),
        allowed_paths: row.get("allowed_paths"),
        max_callbacks_per_minute: row
            .get::<Option<i32>, _>("max_callbacks_per_minute")
            .map(|v| v as u32),
        ip_whitelist: row.get("ip_whitelist"),
        require_https: row.get("require_https"),
        notes: row.get("notes"),
        expires_at: row.get("expires_at"),
        last_callback_at: row.get("last_callback_at"),
        total_callbacks: row.get::<i64, _>("total_callbacks") as u64,
        total_failed: row.get::<i64, _>("total_failed") as u64,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn map_config(row: &PgRow) -> Result<CallbackConfiguration> {
    let custom_headers: HashMap<String, String> = serde_json::from_str(row.get("custom_headers"))?;
    let metadata: HashMap<String, serde_json::Value> = serde_json::from_str(row.get("metadata"))?;
    Ok(CallbackConfiguration {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        url: row.get("url"),
        method: HttpMethod::from_str(row.get("method")).map_err(StoreError::Core)?,
        status: CallbackStatus::from_str(row.get("status")).map_err(StoreError::Core)?,
        subscribed_event_types: row.get("subscribed_event_types"),
        custom_headers,
        metadata,
        signature_enabled: row.get("signature_enabled"),
        secret: row.get("secret"),
        signature_header: row.get("signature_header"),
        max_retries: row.get::<i32, _>("max_retries") as u32,
        retry_delay_ms: row.get::<i64, _>("retry_delay_ms") as u64,
        retry_backoff_multiplier: row.get("retry_backoff_multiplier"),
        timeout_ms: row.get::<i64, _>("timeout_ms") as u64,
        filter_expression: row.get("filter_expression"),
        failure_threshold: row.get::<i32, _>("failure_threshold") as u32,
        failure_count: row.get::<i32, _>("failure_count") as u32,
        last_success_at: row.get("last_success_at"),
        last_failure_at: row.get("last_failure_at"),
        active: row.get("active"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn map_execution(row: &PgRow) -> Result<CallbackExecution> {
    Ok(CallbackExecution {
        id: row.get("id"),
        configuration_id: row.get("configuration_id"),
        event_type: row.get("event_type"),
        source_event_id: row.get("source_event_id"),
        status: ExecutionStatus::from_str(row.get("status")).map_err(StoreError::Core)?,
        attempt_number: row.get::<i32, _>("attempt_number") as u32,
        max_attempts: row.get::<i32, _>("max_attempts") as u32,
        request_payload: row.get("request_payload"),
        request_headers: row.get("request_headers"),
        response_status_code: row
            .get::<Option<i32>, _>("response_status_code")
            .map(|v| v as u16),
        response_headers: row.get("response_headers"),
        response_body: row.get("response_body"),
        request_duration_ms: row
            .get::<Option<i64>, _>("request_duration_ms")
            .map(|v| v as u64),
        error_message: row.get("error_message"),
        next_retry_at: row.get("next_retry_at"),
        executed_at: row.get("executed_at"),
        completed_at: row.get("completed_at"),
    })
}

#[async_trait]
impl ConfigStore for PostgresStore {
    async fn insert_subscription(&self, subscription: &Subscription) -> Result<()> {
        subscription.validate()?;
        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, name, description, broker_kind, connection_config, topic_or_queue,
                consumer_group_id, event_type_patterns, max_concurrent_consumers,
                polling_interval_ms, active, last_message_at, total_messages_received,
                total_messages_failed, created_at, updated_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16)
            "#,
        )
        .bind(subscription.id)
        .bind(&subscription.name)
        .bind(&subscription.description)
        .bind(subscription.broker_kind.to_string())
        .bind(serde_json::to_string(&subscription.connection_config)?)
        .bind(&subscription.topic_or_queue)
        .bind(&subscription.consumer_group_id)
        .bind(&subscription.event_type_patterns)
        .bind(subscription.max_concurrent_consumers as i32)
        .bind(subscription.polling_interval_ms as i64)
        .bind(subscription.active)
        .bind(subscription.last_message_at)
        .bind(subscription.total_messages_received as i64)
        .bind(subscription.total_messages_failed as i64)
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::duplicate("Subscription", "id", subscription.id.to_string())
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    async fn update_subscription(&self, subscription: &Subscription) -> Result<()> {
        subscription.validate()?;
        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET
                name = $2, description = $3, broker_kind = $4, connection_config = $5,
                topic_or_queue = $6, consumer_group_id = $7, event_type_patterns = $8,
                max_concurrent_consumers = $9, polling_interval_ms = $10, active = $11,
                updated_at = $12
            WHERE id = $1
            "#,
        )
        .bind(subscription.id)
        .bind(&subscription.name)
        .bind(&subscription.description)
        .bind(subscription.broker_kind.to_string())
        .bind(serde_json::to_string(&subscription.connection_config)?)
        .bind(&subscription.topic_or_queue)
        .bind(&subscription.consumer_group_id)
        .bind(&subscription.event_type_patterns)
        .bind(subscription.max_concurrent_consumers as i32)
        .bind(subscription.polling_interval_ms as i64)
        .bind(subscription.active)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("Subscription", subscription.id));
        }
        Ok(())
    }

    async fn delete_subscription(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_subscription(&self, id: Uuid) -> Result<Option<Subscription>> {
        let row = sqlx::query("SELECT * FROM subscriptions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_subscription).transpose()
    }

    async fn list_active_subscriptions(&self) -> Result<Vec<Subscription>> {
        let rows = sqlx::query("SELECT * FROM subscriptions WHERE active = TRUE")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_subscription).collect()
    }

    async fn record_subscription_message(&self, id: Uuid, success: bool) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET
                total_messages_received = total_messages_received + 1,
                total_messages_failed = total_messages_failed + CASE WHEN $2 THEN 0 ELSE 1 END,
                last_message_at = $3,
                updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(success)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("Subscription", id));
        }
        Ok(())
    }

    async fn insert_domain(&self, domain: &AuthorizedDomain) -> Result<()> {
        domain.validate()?;
        sqlx::query(
            r#"
            INSERT INTO authorized_domains (
                id, domain, organization, contact_email, verified, verification_method,
                verified_at, active, allowed_paths, max_callbacks_per_minute, ip_whitelist,
                require_https, notes, expires_at, last_callback_at, total_callbacks,
                total_failed, created_at, updated_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19)
            "#,
        )
        .bind(domain.id)
        .bind(&domain.domain)
        .bind(&domain.organization)
        .bind(&domain.contact_email)
        .bind(domain.verified)
        .bind(&domain.verification_method)
        .bind(domain.verified_at)
        .bind(domain.active)
        .bind(&domain.allowed_paths)
        .bind(domain.max_callbacks_per_minute.map(|v| v as i32))
        .bind(&domain.ip_whitelist)
        .bind(domain.require_https)
        .bind(&domain.notes)
        .bind(domain.expires_at)
        .bind(domain.last_callback_at)
        .bind(domain.total_callbacks as i64)
        .bind(domain.total_failed as i64)
        .bind(domain.created_at)
        .bind(domain.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::duplicate("AuthorizedDomain", "domain", domain.domain.clone())
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    async fn update_domain(&self, domain: &AuthorizedDomain) -> Result<()> {
        domain.validate()?;
        let result = sqlx::query(
            r#"
            UPDATE authorized_domains SET
                domain = $2, organization = $3, contact_email = $4, active = $5,
                allowed_paths = $6, max_callbacks_per_minute = $7, ip_whitelist = $8,
                require_https = $9, notes = $10, expires_at = $11, updated_at = $12
            WHERE id = $1
            "#,
        )
        .bind(domain.id)
        .bind(&domain.domain)
        .bind(&domain.organization)
        .bind(&domain.contact_email)
        .bind(domain.active)
        .bind(&domain.allowed_paths)
        .bind(domain.max_callbacks_per_minute.map(|v| v as i32))
        .bind(&domain.ip_whitelist)
        .bind(domain.require_https)
        .bind(&domain.notes)
        .bind(domain.expires_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::duplicate("AuthorizedDomain", "domain", domain.domain.clone())
            } else {
                StoreError::from(e)
            }
        })?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("AuthorizedDomain", domain.id));
        }
        Ok(())
    }

    async fn delete_domain(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM authorized_domains WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_domain_by_name(&self, domain: &str) -> Result<Option<AuthorizedDomain>> {
        let row = sqlx::query("SELECT * FROM authorized_domains WHERE domain = $1")
            .bind(domain)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_domain).transpose()
    }

    async fn verify_domain(&self, domain: &str, method: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE authorized_domains SET
                verified = TRUE, verification_method = $2, verified_at = $3, updated_at = $3
            WHERE domain = $1
            "#,
        )
        .bind(domain)
        .bind(method)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("AuthorizedDomain", domain));
        }
        Ok(())
    }

    async fn record_domain_callback(&self, domain: &str, success: bool) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE authorized_domains SET
                total_callbacks = total_callbacks + 1,
                total_failed = total_failed + CASE WHEN $2 THEN 0 ELSE 1 END,
                last_callback_at = $3,
                updated_at = $3
            WHERE domain = $1
            "#,
        )
        .bind(domain)
        .bind(success)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("AuthorizedDomain", domain));
        }
        Ok(())
    }

    async fn insert_config(&self, config: &CallbackConfiguration) -> Result<()> {
        config.validate()?;
        sqlx::query(
            r#"
            INSERT INTO callback_configurations (
                id, name, description, url, method, status, subscribed_event_types,
                custom_headers, metadata, signature_enabled, secret, signature_header,
                max_retries, retry_delay_ms, retry_backoff_multiplier, timeout_ms,
                filter_expression, failure_threshold, failure_count, last_success_at,
                last_failure_at, active, created_at, updated_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,$21,$22,$23,$24)
            "#,
        )
        .bind(config.id)
        .bind(&config.name)
        .bind(&config.description)
        .bind(&config.url)
        .bind(config.method.to_string())
        .bind(config.status.to_string())
        .bind(&config.subscribed_event_types)
        .bind(serde_json::to_string(&config.custom_headers)?)
        .bind(serde_json::to_string(&config.metadata)?)
        .bind(config.signature_enabled)
        .bind(&config.secret)
        .bind(&config.signature_header)
        .bind(config.max_retries as i32)
        .bind(config.retry_delay_ms as i64)
        .bind(config.retry_backoff_multiplier)
        .bind(config.timeout_ms as i64)
        .bind(&config.filter_expression)
        .bind(config.failure_threshold as i32)
        .bind(config.failure_count as i32)
        .bind(config.last_success_at)
        .bind(config.last_failure_at)
        .bind(config.active)
        .bind(config.created_at)
        .bind(config.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::duplicate("CallbackConfiguration", "id", config.id.to_string())
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    async fn update_config(&self, config: &CallbackConfiguration) -> Result<()> {
        config.validate()?;
        let result = sqlx::query(
            r#"
            UPDATE callback_configurations SET
                name = $2, description = $3, url = $4, method = $5, status = $6,
                subscribed_event_types = $7, custom_headers = $8, metadata = $9,
                signature_enabled = $10, secret = $11, signature_header = $12,
                max_retries = $13, retry_delay_ms = $14, retry_backoff_multiplier = $15,
                timeout_ms = $16, filter_expression = $17, failure_threshold = $18,
                active = $19, updated_at = $20
            WHERE id = $1
            "#,
        )
        .bind(config.id)
        .bind(&config.name)
        .bind(&config.description)
        .bind(&config.url)
        .bind(config.method.to_string())
        .bind(config.status.to_string())
        .bind(&config.subscribed_event_types)
        .bind(serde_json::to_string(&config.custom_headers)?)
        .bind(serde_json::to_string(&config.metadata)?)
        .bind(config.signature_enabled)
        .bind(&config.secret)
        .bind(&config.signature_header)
        .bind(config.max_retries as i32)
        .bind(config.retry_delay_ms as i64)
        .bind(config.retry_backoff_multiplier)
        .bind(config.timeout_ms as i64)
        .bind(&config.filter_expression)
        .bind(config.failure_threshold as i32)
        .bind(config.active)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("CallbackConfiguration", config.id));
        }
        Ok(())
    }

    async fn delete_config(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM callback_configurations WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_config(&self, id: Uuid) -> Result<Option<CallbackConfiguration>> {
        let row = sqlx::query("SELECT * FROM callback_configurations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_config).transpose()
    }

    async fn active_configs_for_event_type(
        &self,
        event_type: &str,
    ) -> Result<Vec<CallbackConfiguration>> {
        // Candidate query by eligibility; wildcard matching happens in
        // memory, as the patterns are globs rather than SQL expressions.
        let rows = sqlx::query(
            "SELECT * FROM callback_configurations WHERE active = TRUE AND status = 'ACTIVE'",
        )
        .fetch_all(&self.pool)
        .await?;
        let configs: Vec<CallbackConfiguration> =
            rows.iter().map(map_config).collect::<Result<_>>()?;
        Ok(configs
            .into_iter()
            .filter(|c| c.matches_event_type(event_type))
            .collect())
    }

    async fn record_success(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE callback_configurations SET
                last_success_at = $2,
                failure_count = 0,
                status = CASE WHEN status = 'PAUSED' THEN 'ACTIVE' ELSE status END,
                updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("CallbackConfiguration", id));
        }
        Ok(())
    }

    async fn record_failure(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE callback_configurations SET
                last_failure_at = $2,
                failure_count = failure_count + 1,
                status = CASE WHEN failure_count + 1 >= failure_threshold
                              THEN 'PAUSED' ELSE status END,
                updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("CallbackConfiguration", id));
        }
        Ok(())
    }

    async fn append_execution(&self, execution: &CallbackExecution) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO callback_executions (
                id, configuration_id, event_type, source_event_id, status, attempt_number,
                max_attempts, request_payload, request_headers, response_status_code,
                response_headers, response_body, request_duration_ms, error_message,
                next_retry_at, executed_at, completed_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17)
            "#,
        )
        .bind(execution.id)
        .bind(execution.configuration_id)
        .bind(&execution.event_type)
        .bind(execution.source_event_id)
        .bind(execution.status.to_string())
        .bind(execution.attempt_number as i32)
        .bind(execution.max_attempts as i32)
        .bind(&execution.request_payload)
        .bind(&execution.request_headers)
        .bind(execution.response_status_code.map(|v| v as i32))
        .bind(&execution.response_headers)
        .bind(&execution.response_body)
        .bind(execution.request_duration_ms.map(|v| v as i64))
        .bind(&execution.error_message)
        .bind(execution.next_retry_at)
        .bind(execution.executed_at)
        .bind(execution.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_execution(&self, id: Uuid, patch: ExecutionPatch) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE callback_executions SET
                status = COALESCE($2, status),
                response_status_code = COALESCE($3, response_status_code),
                response_headers = COALESCE($4, response_headers),
                response_body = COALESCE($5, response_body),
                request_duration_ms = COALESCE($6, request_duration_ms),
                error_message = COALESCE($7, error_message),
                next_retry_at = COALESCE($8, next_retry_at),
                completed_at = COALESCE($9, completed_at)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(patch.status.map(|s| s.to_string()))
        .bind(patch.response_status_code.map(|v| v as i32))
        .bind(patch.response_headers)
        .bind(patch.response_body)
        .bind(patch.request_duration_ms.map(|v| v as i64))
        .bind(patch.error_message)
        .bind(patch.next_retry_at)
        .bind(patch.completed_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("CallbackExecution", id));
        }
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<CallbackExecution>> {
        let row = sqlx::query("SELECT * FROM callback_executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_execution).transpose()
    }

    async fn list_executions(&self, configuration_id: Uuid) -> Result<Vec<CallbackExecution>> {
        let rows = sqlx::query(
            "SELECT * FROM callback_executions WHERE configuration_id = $1 ORDER BY executed_at",
        )
        .bind(configuration_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_execution).collect()
    }
}
