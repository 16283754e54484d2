//! Per-configuration circuit breakers
//!
//! Explicit state machine over a sliding window of completed-call
//! outcomes. The breaker is the one piece of shared mutable state on the
//! dispatch path, so transitions happen under a mutex that is never held
//! across a suspension point.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Completed calls tracked in the sliding window.
    pub window_size: usize,
    /// Observations required before rates are evaluated.
    pub minimum_calls: usize,
    /// Failure-rate threshold, 0.0..=1.0.
    pub failure_rate_threshold: f64,
    /// Calls at least this long count as slow.
    pub slow_call_duration: Duration,
    /// Slow-call-rate threshold, 0.0..=1.0.
    pub slow_call_rate_threshold: f64,
    /// Time spent OPEN before the breaker probes again.
    pub open_wait: Duration,
    /// Concurrent probe calls allowed while HALF_OPEN.
    pub half_open_permitted_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            minimum_calls: 10,
            failure_rate_threshold: 0.5,
            slow_call_duration: Duration::from_secs(10),
            slow_call_rate_threshold: 0.5,
            open_wait: Duration::from_secs(30),
            half_open_permitted_calls: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
struct CallRecord {
    failure: bool,
    slow: bool,
}

struct Inner {
    state: BreakerState,
    window: VecDeque<CallRecord>,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let capacity = config.window_size.max(1);
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                window: VecDeque::with_capacity(capacity),
                opened_at: None,
                half_open_in_flight: 0,
            }),
        }
    }

    /// Asks the breaker to admit one call. An OPEN breaker whose wait has
    /// elapsed moves to HALF_OPEN and admits the probe.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let waited = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.open_wait)
                    .unwrap_or(true);
                if waited {
                    info!(breaker = %self.name, "Breaker half-open, admitting probe call");
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_in_flight = 1;
                    true
                } else {
                    debug!(breaker = %self.name, "Breaker open, rejecting call");
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_permitted_calls {
                    inner.half_open_in_flight += 1;
                    true
                } else {
                    debug!(breaker = %self.name, "Half-open permits exhausted, rejecting call");
                    false
                }
            }
        }
    }

    pub fn record_success(&self, duration: Duration) {
        self.record(false, duration);
    }

    pub fn record_failure(&self, duration: Duration) {
        self.record(true, duration);
    }

    fn record(&self, failure: bool, duration: Duration) {
        let slow = duration >= self.config.slow_call_duration;
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                if failure {
                    warn!(breaker = %self.name, "Probe call failed, breaker re-opening");
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                } else {
                    info!(breaker = %self.name, "Probe call succeeded, breaker closing");
                    inner.state = BreakerState::Closed;
                    inner.half_open_in_flight = 0;
                }
                inner.window.clear();
            }
            BreakerState::Closed => {
                inner.window.push_back(CallRecord { failure, slow });
                while inner.window.len() > self.config.window_size {
                    inner.window.pop_front();
                }
                if inner.window.len() >= self.config.minimum_calls {
                    let len = inner.window.len() as f64;
                    let failures = inner.window.iter().filter(|r| r.failure).count() as f64;
                    let slows = inner.window.iter().filter(|r| r.slow).count() as f64;
                    let failure_rate = failures / len;
                    let slow_rate = slows / len;
                    if failure_rate >= self.config.failure_rate_threshold
                        || slow_rate >= self.config.slow_call_rate_threshold
                    {
                        warn!(
                            breaker = %self.name,
                            failure_rate = failure_rate,
                            slow_rate = slow_rate,
                            "Breaker opening"
                        );
                        inner.state = BreakerState::Open;
                        inner.opened_at = Some(Instant::now());
                        inner.window.clear();
                    }
                }
            }
            // A straggler finishing after the breaker opened carries no
            // information the window still needs.
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }
}

/// One breaker per configuration id, created on first use.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<Uuid, Arc<CircuitBreaker>>,
    default_config: BreakerConfig,
    overrides: DashMap<Uuid, BreakerConfig>,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
            overrides: DashMap::new(),
        }
    }

    /// Installs a per-configuration parameter override. Takes effect when
    /// the breaker is (re)created.
    pub fn set_override(&self, id: Uuid, config: BreakerConfig) {
        self.overrides.insert(id, config);
    }

    pub fn get_or_create(&self, id: Uuid) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(id)
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .get(&id)
                    .map(|c| c.clone())
                    .unwrap_or_else(|| self.default_config.clone());
                Arc::new(CircuitBreaker::new(format!("callback-{id}"), config))
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> BreakerConfig {
        BreakerConfig {
            open_wait: Duration::from_millis(30),
            ..BreakerConfig::default()
        }
    }

    fn fast_call() -> Duration {
        Duration::from_millis(5)
    }

    #[test]
    fn opens_once_failure_rate_reaches_threshold() {
        let breaker = CircuitBreaker::new("test", quick_config());

        // Nine observations are below minimum_calls; breaker stays closed.
        for _ in 0..9 {
            assert!(breaker.try_acquire());
            breaker.record_failure(fast_call());
        }
        assert_eq!(breaker.state(), BreakerState::Closed);

        assert!(breaker.try_acquire());
        breaker.record_failure(fast_call());
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn stays_closed_below_threshold() {
        let breaker = CircuitBreaker::new("test", quick_config());
        // 4 failures in 10 calls: 40%, below the 50% threshold.
        for i in 0..10 {
            assert!(breaker.try_acquire());
            if i < 4 {
                breaker.record_failure(fast_call());
            } else {
                breaker.record_success(fast_call());
            }
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn slow_calls_open_the_breaker_even_on_success() {
        let config = BreakerConfig {
            slow_call_duration: Duration::from_millis(10),
            ..quick_config()
        };
        let breaker = CircuitBreaker::new("test", config);
        for _ in 0..10 {
            assert!(breaker.try_acquire());
            breaker.record_success(Duration::from_millis(50));
        }
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn half_open_probe_success_closes() {
        let breaker = CircuitBreaker::new("test", quick_config());
        for _ in 0..10 {
            breaker.try_acquire();
            breaker.record_failure(fast_call());
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.try_acquire());

        std::thread::sleep(Duration::from_millis(40));
        assert!(breaker.try_acquire());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_success(fast_call());
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_probe_failure_reopens() {
        let breaker = CircuitBreaker::new("test", quick_config());
        for _ in 0..10 {
            breaker.try_acquire();
            breaker.record_failure(fast_call());
        }
        std::thread::sleep(Duration::from_millis(40));
        assert!(breaker.try_acquire());
        breaker.record_failure(fast_call());
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn half_open_limits_concurrent_probes() {
        let breaker = CircuitBreaker::new("test", quick_config());
        for _ in 0..10 {
            breaker.try_acquire();
            breaker.record_failure(fast_call());
        }
        std::thread::sleep(Duration::from_millis(40));

        // One permit by default: the second concurrent call is rejected.
        assert!(breaker.try_acquire());
        assert!(!breaker.try_acquire());
        breaker.record_success(fast_call());
        assert!(breaker.try_acquire());
    }

    #[test]
    fn window_slides_over_old_outcomes() {
        let breaker = CircuitBreaker::new("test", quick_config());
        // 5 early failures pushed out by 10 successes never open the breaker.
        for _ in 0..5 {
            breaker.try_acquire();
            breaker.record_failure(fast_call());
        }
        for _ in 0..10 {
            breaker.try_acquire();
            breaker.record_success(fast_call());
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn registry_creates_one_breaker_per_configuration() {
        let registry = CircuitBreakerRegistry::default();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let first = registry.get_or_create(a);
        let again = registry.get_or_create(a);
        assert!(Arc::ptr_eq(&first, &again));

        registry.get_or_create(b);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn registry_applies_overrides_on_creation() {
        let registry = CircuitBreakerRegistry::default();
        let id = Uuid::new_v4();
        registry.set_override(
            id,
            BreakerConfig {
                minimum_calls: 2,
                window_size: 2,
                ..BreakerConfig::default()
            },
        );

        let breaker = registry.get_or_create(id);
        breaker.try_acquire();
        breaker.record_failure(fast_call());
        breaker.try_acquire();
        breaker.record_failure(fast_call());
        assert_eq!(breaker.state(), BreakerState::Open);
    }
}
