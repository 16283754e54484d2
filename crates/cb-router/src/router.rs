//! Event router
//!
//! Fans one normalized event out to every matching callback configuration.
//! Dispatches run concurrently and are isolated from each other; the
//! router returns only after all of them have terminated, which is what
//! lets the consumer manager commit the broker offset afterwards.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, error, info};

use cb_common::{filter, EventEnvelope};
use cb_store::ConfigStore;

use crate::dispatcher::CallbackDispatcher;

pub struct EventRouter {
    store: Arc<dyn ConfigStore>,
    dispatcher: Arc<CallbackDispatcher>,
}

impl EventRouter {
    pub fn new(store: Arc<dyn ConfigStore>, dispatcher: Arc<CallbackDispatcher>) -> Self {
        Self { store, dispatcher }
    }

    /// Routes one event. Returns the number of dispatches started, for
    /// observability only.
    pub async fn route(&self, envelope: &EventEnvelope) -> usize {
        debug!(
            event_type = %envelope.event_type,
            event_id = %envelope.source_event_id,
            "Routing event"
        );

        let configs = match self
            .store
            .active_configs_for_event_type(&envelope.event_type)
            .await
        {
            Ok(configs) => configs,
            Err(e) => {
                error!(
                    event_type = %envelope.event_type,
                    error = %e,
                    "Failed to load configurations for event"
                );
                return 0;
            }
        };

        let mut dispatches = Vec::new();
        for config in configs {
            if !filter::matches(config.filter_expression.as_deref(), &envelope.payload) {
                debug!(
                    config_id = %config.id,
                    filter = ?config.filter_expression,
                    "Event filtered out by configuration"
                );
                continue;
            }
            let dispatcher = self.dispatcher.clone();
            let event_type = envelope.event_type.clone();
            let event_id = envelope.source_event_id;
            let payload = envelope.payload.clone();
            dispatches.push(async move {
                dispatcher
                    .dispatch(&config, &event_type, event_id, &payload)
                    .await;
            });
        }

        let started = dispatches.len();
        if started == 0 {
            debug!(event_type = %envelope.event_type, "No matching callback configurations");
            return 0;
        }

        // One failing dispatch must not prevent or delay another; dispatch
        // itself never returns an error, so joining is pure synchronization.
        join_all(dispatches).await;

        info!(
            event_type = %envelope.event_type,
            event_id = %envelope.source_event_id,
            dispatched = started,
            "Event routed"
        );
        started
    }
}
