//! CallBridge server
//!
//! Builds the delivery engine and runs it until a shutdown signal arrives:
//! config store → authorizer/breakers/recorder → dispatcher → router →
//! consumer manager. Consumers are recovered from the store at startup.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cb_broker::{ChannelBroker, ChannelConsumerFactory, DriverRegistry};
use cb_common::BrokerKind;
use cb_router::{
    AuthzCacheConfig, BreakerConfig, CallbackDispatcher, CircuitBreakerRegistry, ConsumerManager,
    DispatcherConfig, DomainAuthorizer, EventRouter, ExecutionRecorder, ManagerConfig, Shutdown,
};
use cb_store::{ConfigStore, MemoryStore, PostgresStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    info!("Starting CallBridge delivery engine");

    // 1. Config store: PostgreSQL when configured, in-memory otherwise.
    let database_url = std::env::var("CALLBRIDGE_DATABASE_URL").ok();
    let store: Arc<dyn ConfigStore> = match &database_url {
        Some(url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(env_u32("CALLBRIDGE_DB_POOL_SIZE", 10))
                .connect(url)
                .await?;
            let store = PostgresStore::new(pool);
            store.init_schema().await?;
            info!("Using PostgreSQL config store");
            Arc::new(store)
        }
        None => {
            info!("CALLBRIDGE_DATABASE_URL not set, using in-memory config store");
            Arc::new(MemoryStore::new())
        }
    };

    // 2. Shared shutdown handle, then the dispatch-side components.
    let shutdown = Arc::new(Shutdown::new());

    let authorizer = Arc::new(DomainAuthorizer::new(
        store.clone(),
        AuthzCacheConfig {
            ttl: Duration::from_secs(env_u64("CALLBRIDGE_AUTHZ_CACHE_TTL_SECS", 5)),
            max_entries: env_u64("CALLBRIDGE_AUTHZ_CACHE_MAX", 10_000) as usize,
        },
    ));

    let breakers = Arc::new(CircuitBreakerRegistry::new(load_breaker_config()));
    let recorder = Arc::new(ExecutionRecorder::new(store.clone()));

    let dispatcher = Arc::new(CallbackDispatcher::new(
        store.clone(),
        authorizer,
        breakers,
        recorder,
        DispatcherConfig {
            max_backoff: Duration::from_millis(env_u64("CALLBRIDGE_MAX_BACKOFF_MS", 60_000)),
            connect_timeout: Duration::from_secs(env_u64("CALLBRIDGE_CONNECT_TIMEOUT_SECS", 10)),
        },
        shutdown.clone(),
    )?);

    // 3. Router, then the consumer manager it feeds.
    let router = Arc::new(EventRouter::new(store.clone(), dispatcher));

    let drivers = Arc::new(DriverRegistry::new());
    let loopback = std::env::var("CALLBRIDGE_LOOPBACK")
        .map(|v| v.parse().unwrap_or(false))
        .unwrap_or(database_url.is_none());
    if loopback {
        // In-process loopback broker standing in for the real driver.
        let broker = Arc::new(ChannelBroker::new());
        drivers.register(
            BrokerKind::Kafka,
            Arc::new(ChannelConsumerFactory::new(broker)),
        );
        info!("Loopback broker registered for KAFKA subscriptions");
    } else {
        warn!("No broker drivers registered; subscriptions will fail to start until one is wired in");
    }

    let manager = Arc::new(ConsumerManager::new(
        router,
        store,
        drivers,
        ManagerConfig {
            shutdown_deadline: Duration::from_secs(env_u64(
                "CALLBRIDGE_SHUTDOWN_DEADLINE_SECS",
                30,
            )),
            ..ManagerConfig::default()
        },
        shutdown,
    ));

    let running = manager.start().await?;
    info!(consumers = running, "CallBridge started. Press Ctrl+C to shut down.");

    shutdown_signal().await;
    info!("Shutdown signal received");

    manager.shutdown().await;
    info!("CallBridge shutdown complete");
    Ok(())
}

fn load_breaker_config() -> BreakerConfig {
    let defaults = BreakerConfig::default();
    BreakerConfig {
        window_size: env_u64("CALLBRIDGE_BREAKER_WINDOW", defaults.window_size as u64) as usize,
        minimum_calls: env_u64(
            "CALLBRIDGE_BREAKER_MINIMUM_CALLS",
            defaults.minimum_calls as u64,
        ) as usize,
        failure_rate_threshold: env_u64("CALLBRIDGE_BREAKER_FAILURE_RATE", 50) as f64 / 100.0,
        slow_call_duration: Duration::from_millis(env_u64(
            "CALLBRIDGE_BREAKER_SLOW_CALL_MS",
            10_000,
        )),
        slow_call_rate_threshold: env_u64("CALLBRIDGE_BREAKER_SLOW_RATE", 50) as f64 / 100.0,
        open_wait: Duration::from_secs(env_u64("CALLBRIDGE_BREAKER_OPEN_WAIT_SECS", 30)),
        half_open_permitted_calls: env_u32("CALLBRIDGE_BREAKER_HALF_OPEN_CALLS", 1),
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
