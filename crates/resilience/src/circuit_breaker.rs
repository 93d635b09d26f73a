//! Per-service circuit breaker.
//!
//! Closed → Open after `failure_threshold` consecutive failures. Open rejects immediately until
//! `reset_timeout` has passed since the last failure; the next call moves the breaker to
//! HalfOpen, where at most `half_open_max_calls` trials run concurrently. `success_threshold`
//! consecutive trial successes close it again; any trial failure re-opens it.

use crate::config::CircuitBreakerConfig;
use crate::error::{CallError, NetworkError, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Read-only projection of a breaker's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_transition: DateTime<Utc>,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    /// Trials currently running in HalfOpen.
    half_open_in_flight: u32,
    /// Bumped on every transition; stale trial guards compare against it.
    generation: u64,
    last_failure: Option<Instant>,
    last_transition: DateTime<Utc>,
    total_calls: u64,
    total_failures: u64,
    total_rejections: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            half_open_in_flight: 0,
            generation: 0,
            last_failure: None,
            last_transition: Utc::now(),
            total_calls: 0,
            total_failures: 0,
            total_rejections: 0,
        }
    }

    fn transition(&mut self, to: CircuitState) {
        self.state = to;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.half_open_in_flight = 0;
        self.generation += 1;
        self.last_transition = Utc::now();
    }
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

/// Releases a HalfOpen trial slot if the wrapped future is dropped before it completes.
struct TrialSlot<'a> {
    breaker: &'a CircuitBreaker,
    generation: Option<u64>,
}

impl TrialSlot<'_> {
    /// Disarm the drop hook and hand back the trial generation (if this was a trial).
    fn complete(mut self) -> Option<u64> {
        self.generation.take()
    }
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        if let Some(generation) = self.generation {
            let mut st = self.breaker.state.lock();
            if st.generation == generation && st.state == CircuitState::HalfOpen {
                st.half_open_in_flight = st.half_open_in_flight.saturating_sub(1);
            }
        }
    }
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState::new()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let st = self.state.lock();
        CircuitBreakerMetrics {
            state: st.state,
            consecutive_failures: st.consecutive_failures,
            consecutive_successes: st.consecutive_successes,
            last_transition: st.last_transition,
            total_calls: st.total_calls,
            total_failures: st.total_failures,
            total_rejections: st.total_rejections,
        }
    }

    /// Run `op` under the breaker.
    ///
    /// Any error returned by `op` counts as a failure. With a disabled config this is a plain
    /// passthrough.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::CircuitOpen`] without invoking `op` when the breaker rejects the call,
    /// a timeout [`CallError::Network`] when `op` exceeds the configured timeout, and otherwise
    /// whatever `op` returned.
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let timeout = self.attempt_timeout();
        let name = self.name.as_str();
        self.guarded(|| async move {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, op()).await {
                    Ok(r) => r,
                    Err(_) => Err(NetworkError::timeout(format!(
                        "call to '{name}' exceeded {}ms",
                        limit.as_millis()
                    ))
                    .into()),
                },
                None => op().await,
            }
        })
        .await
    }

    /// Run a multi-attempt `op` (typically a retry loop) under the breaker as one call.
    ///
    /// The configured timeout is not applied to `op` as a whole; the caller bounds each attempt
    /// with [`Self::attempt_timeout`] so a slow attempt can still be retried.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::CircuitOpen`] without invoking `op` when the breaker rejects the call,
    /// otherwise whatever `op` returned.
    pub async fn execute_attempts<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.guarded(op).await
    }

    /// Bound for a single wrapped invocation; `None` when disabled or unbounded.
    #[must_use]
    pub fn attempt_timeout(&self) -> Option<Duration> {
        (self.config.enabled && !self.config.timeout.is_zero()).then_some(self.config.timeout)
    }

    async fn guarded<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.config.enabled {
            return op().await;
        }

        let slot = self.admit()?;
        let result = op().await;

        let trial = slot.complete();
        match &result {
            Ok(_) => self.on_success(trial),
            Err(e) => self.on_failure(trial, e),
        }
        result
    }

    fn admit(&self) -> Result<TrialSlot<'_>> {
        let mut st = self.state.lock();

        if st.state == CircuitState::Open {
            let cooled_down = st
                .last_failure
                .is_none_or(|t| t.elapsed() >= self.config.reset_timeout);
            if !cooled_down {
                st.total_rejections += 1;
                return Err(CallError::CircuitOpen {
                    service: self.name.clone(),
                });
            }
            st.transition(CircuitState::HalfOpen);
            info!(service = %self.name, "circuit breaker half-open");
        }

        let mut generation = None;
        if st.state == CircuitState::HalfOpen {
            if st.half_open_in_flight >= self.config.half_open_max_calls {
                st.total_rejections += 1;
                return Err(CallError::CircuitOpen {
                    service: self.name.clone(),
                });
            }
            st.half_open_in_flight += 1;
            generation = Some(st.generation);
        }

        st.total_calls += 1;
        Ok(TrialSlot {
            breaker: self,
            generation,
        })
    }

    fn on_success(&self, trial: Option<u64>) {
        let mut st = self.state.lock();
        match st.state {
            CircuitState::Closed => {
                st.consecutive_failures = 0;
                st.consecutive_successes = st.consecutive_successes.saturating_add(1);
            }
            CircuitState::HalfOpen if trial == Some(st.generation) => {
                st.half_open_in_flight = st.half_open_in_flight.saturating_sub(1);
                st.consecutive_successes += 1;
                if st.consecutive_successes >= self.config.success_threshold {
                    st.transition(CircuitState::Closed);
                    info!(service = %self.name, "circuit breaker closed");
                }
            }
            // A call admitted before the breaker tripped says nothing about recovery.
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn on_failure(&self, trial: Option<u64>, err: &CallError) {
        let mut st = self.state.lock();
        st.total_failures += 1;
        st.last_failure = Some(Instant::now());
        match st.state {
            CircuitState::Closed => {
                st.consecutive_successes = 0;
                st.consecutive_failures += 1;
                debug!(
                    service = %self.name,
                    failures = st.consecutive_failures,
                    error = %err,
                    "circuit breaker recorded failure"
                );
                if st.consecutive_failures >= self.config.failure_threshold {
                    st.transition(CircuitState::Open);
                    warn!(service = %self.name, error = %err, "circuit breaker opened");
                }
            }
            CircuitState::HalfOpen if trial == Some(st.generation) => {
                st.transition(CircuitState::Open);
                warn!(service = %self.name, error = %err, "circuit breaker re-opened after failed trial");
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }
}

/// Lazily created breakers, one per service name, kept for the registry's lifetime.
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the breaker for `service`, creating it with `config` on first use.
    ///
    /// The config of the first caller sticks for the breaker's lifetime.
    pub fn get_or_create(&self, service: &str, config: &CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(b) = self.breakers.read().get(service) {
            return b.clone();
        }
        let mut map = self.breakers.write();
        map.entry(service.to_string())
            .or_insert_with(|| {
                debug!(service = %service, "creating circuit breaker");
                Arc::new(CircuitBreaker::new(service, config.clone()))
            })
            .clone()
    }

    #[must_use]
    pub fn get(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(service).cloned()
    }

    #[must_use]
    pub fn metrics(&self) -> BTreeMap<String, CircuitBreakerMetrics> {
        self.breakers
            .read()
            .iter()
            .map(|(name, b)| (name.clone(), b.metrics()))
            .collect()
    }
}
