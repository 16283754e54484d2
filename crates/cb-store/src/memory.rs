//! In-memory config store
//!
//! DashMap-backed implementation used by tests and loopback deployments.
//! Counter updates mutate entries through the shard lock, which gives the
//! per-row atomicity the contract requires.

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{info, warn};
use uuid::Uuid;

use async_trait::async_trait;
use cb_common::{
    AuthorizedDomain, CallbackConfiguration, CallbackExecution, CallbackStatus, Subscription,
};

use crate::store::{ConfigStore, ExecutionPatch, StoreError};
use crate::Result;

#[derive(Default)]
pub struct MemoryStore {
    subscriptions: DashMap<Uuid, Subscription>,
    /// Keyed by the unique domain name; mirrors the relational unique index.
    domains: DashMap<String, AuthorizedDomain>,
    configs: DashMap<Uuid, CallbackConfiguration>,
    executions: DashMap<Uuid, CallbackExecution>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn execution_count(&self) -> usize {
        self.executions.len()
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn insert_subscription(&self, subscription: &Subscription) -> Result<()> {
        subscription.validate()?;
        match self.subscriptions.entry(subscription.id) {
            Entry::Occupied(_) => Err(StoreError::duplicate(
                "Subscription",
                "id",
                subscription.id.to_string(),
            )),
            Entry::Vacant(entry) => {
                entry.insert(subscription.clone());
                Ok(())
            }
        }
    }

    async fn update_subscription(&self, subscription: &Subscription) -> Result<()> {
        subscription.validate()?;
        match self.subscriptions.get_mut(&subscription.id) {
            Some(mut entry) => {
                *entry = subscription.clone();
                Ok(())
            }
            None => Err(StoreError::not_found("Subscription", subscription.id)),
        }
    }

    async fn delete_subscription(&self, id: Uuid) -> Result<bool> {
        Ok(self.subscriptions.remove(&id).is_some())
    }

    async fn get_subscription(&self, id: Uuid) -> Result<Option<Subscription>> {
        Ok(self.subscriptions.get(&id).map(|s| s.clone()))
    }

    async fn list_active_subscriptions(&self) -> Result<Vec<Subscription>> {
        Ok(self
            .subscriptions
            .iter()
            .filter(|entry| entry.active)
            .map(|entry| entry.clone())
            .collect())
    }

    async fn record_subscription_message(&self, id: Uuid, success: bool) -> Result<()> {
        match self.subscriptions.get_mut(&id) {
            Some(mut sub) => {
                let now = Utc::now();
                sub.total_messages_received += 1;
                if !success {
                    sub.total_messages_failed += 1;
                }
                sub.last_message_at = Some(now);
                sub.updated_at = now;
                Ok(())
            }
            None => Err(StoreError::not_found("Subscription", id)),
        }
    }

    async fn insert_domain(&self, domain: &AuthorizedDomain) -> Result<()> {
        domain.validate()?;
        match self.domains.entry(domain.domain.clone()) {
            Entry::Occupied(_) => Err(StoreError::duplicate(
                "AuthorizedDomain",
                "domain",
                domain.domain.clone(),
            )),
            Entry::Vacant(entry) => {
                entry.insert(domain.clone());
                Ok(())
            }
        }
    }

    async fn update_domain(&self, domain: &AuthorizedDomain) -> Result<()> {
        domain.validate()?;
        // The domain key may itself have changed; re-key by id.
        let previous_key = self
            .domains
            .iter()
            .find(|entry| entry.id == domain.id)
            .map(|entry| entry.key().clone());

        let Some(previous_key) = previous_key else {
            return Err(StoreError::not_found("AuthorizedDomain", domain.id));
        };

        if previous_key != domain.domain && self.domains.contains_key(&domain.domain) {
            return Err(StoreError::duplicate(
                "AuthorizedDomain",
                "domain",
                domain.domain.clone(),
            ));
        }

        self.domains.remove(&previous_key);
        self.domains.insert(domain.domain.clone(), domain.clone());
        Ok(())
    }

    async fn delete_domain(&self, id: Uuid) -> Result<bool> {
        let key = self
            .domains
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| entry.key().clone());
        match key {
            Some(key) => Ok(self.domains.remove(&key).is_some()),
            None => Ok(false),
        }
    }

    async fn get_domain_by_name(&self, domain: &str) -> Result<Option<AuthorizedDomain>> {
        Ok(self.domains.get(domain).map(|d| d.clone()))
    }

    async fn verify_domain(&self, domain: &str, method: &str) -> Result<()> {
        match self.domains.get_mut(domain) {
            Some(mut entry) => {
                let now = Utc::now();
                entry.verified = true;
                entry.verification_method = Some(method.to_string());
                entry.verified_at = Some(now);
                entry.updated_at = now;
                info!(domain = %domain, method = %method, "Domain verified");
                Ok(())
            }
            None => Err(StoreError::not_found("AuthorizedDomain", domain)),
        }
    }

    async fn record_domain_callback(&self, domain: &str, success: bool) -> Result<()> {
        match self.domains.get_mut(domain) {
            Some(mut entry) => {
                let now = Utc::now();
                entry.total_callbacks += 1;
                if !success {
                    entry.total_failed += 1;
                }
                entry.last_callback_at = Some(now);
                entry.updated_at = now;
                Ok(())
            }
            None => Err(StoreError::not_found("AuthorizedDomain", domain)),
        }
    }

    async fn insert_config(&self, config: &CallbackConfiguration) -> Result<()> {
        config.validate()?;
        match self.configs.entry(config.id) {
            Entry::Occupied(_) => Err(StoreError::duplicate(
                "CallbackConfiguration",
                "id",
                config.id.to_string(),
            )),
            Entry::Vacant(entry) => {
                entry.insert(config.clone());
                Ok(())
            }
        }
    }

    async fn update_config(&self, config: &CallbackConfiguration) -> Result<()> {
        config.validate()?;
        match self.configs.get_mut(&config.id) {
            Some(mut entry) => {
                *entry = config.clone();
                Ok(())
            }
            None => Err(StoreError::not_found("CallbackConfiguration", config.id)),
        }
    }

    async fn delete_config(&self, id: Uuid) -> Result<bool> {
        Ok(self.configs.remove(&id).is_some())
    }

    async fn get_config(&self, id: Uuid) -> Result<Option<CallbackConfiguration>> {
        Ok(self.configs.get(&id).map(|c| c.clone()))
    }

    async fn active_configs_for_event_type(
        &self,
        event_type: &str,
    ) -> Result<Vec<CallbackConfiguration>> {
        Ok(self
            .configs
            .iter()
            .filter(|entry| entry.is_eligible() && entry.matches_event_type(event_type))
            .map(|entry| entry.clone())
            .collect())
    }

    async fn record_success(&self, id: Uuid) -> Result<()> {
        match self.configs.get_mut(&id) {
            Some(mut config) => {
                let now = Utc::now();
                config.last_success_at = Some(now);
                config.failure_count = 0;
                config.updated_at = now;
                if config.status == CallbackStatus::Paused {
                    config.status = CallbackStatus::Active;
                    info!(config_id = %id, "Reactivated configuration after successful delivery");
                }
                Ok(())
            }
            None => Err(StoreError::not_found("CallbackConfiguration", id)),
        }
    }

    async fn record_failure(&self, id: Uuid) -> Result<()> {
        match self.configs.get_mut(&id) {
            Some(mut config) => {
                let now = Utc::now();
                config.last_failure_at = Some(now);
                config.failure_count += 1;
                config.updated_at = now;
                if config.failure_count >= config.failure_threshold {
                    config.status = CallbackStatus::Paused;
                    warn!(
                        config_id = %id,
                        failures = config.failure_count,
                        threshold = config.failure_threshold,
                        "Paused configuration after repeated failures"
                    );
                }
                Ok(())
            }
            None => Err(StoreError::not_found("CallbackConfiguration", id)),
        }
    }

    async fn append_execution(&self, execution: &CallbackExecution) -> Result<()> {
        self.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn update_execution(&self, id: Uuid, patch: ExecutionPatch) -> Result<()> {
        match self.executions.get_mut(&id) {
            Some(mut execution) => {
                patch.apply(&mut execution);
                Ok(())
            }
            None => Err(StoreError::not_found("CallbackExecution", id)),
        }
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<CallbackExecution>> {
        Ok(self.executions.get(&id).map(|e| e.clone()))
    }

    async fn list_executions(&self, configuration_id: Uuid) -> Result<Vec<CallbackExecution>> {
        let mut executions: Vec<CallbackExecution> = self
            .executions
            .iter()
            .filter(|entry| entry.configuration_id == configuration_id)
            .map(|entry| entry.clone())
            .collect();
        executions.sort_by_key(|e| e.executed_at);
        Ok(executions)
    }
}
