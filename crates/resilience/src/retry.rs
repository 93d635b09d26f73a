//! Bounded retry around a single network attempt.

use crate::config::{BackoffStrategy, RetryConfig};
use crate::error::{ApiError, CallError, NetworkError, Result};
use rand::Rng as _;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Jitter spreads each delay uniformly over `[1 - JITTER_SPREAD, 1 + JITTER_SPREAD)` of itself.
const JITTER_SPREAD: f64 = 0.25;

/// Lifetime counters for one retry scope (typically one service).
#[derive(Debug, Default)]
pub struct RetryMetrics {
    executions: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    exhausted: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryMetricsSnapshot {
    pub executions: u64,
    pub attempts: u64,
    pub retries: u64,
    pub exhausted: u64,
}

impl RetryMetrics {
    #[must_use]
    pub fn snapshot(&self) -> RetryMetricsSnapshot {
        RetryMetricsSnapshot {
            executions: self.executions.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
    metrics: Arc<RetryMetrics>,
    attempt_timeout: Option<Duration>,
}

impl RetryExecutor {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            metrics: Arc::default(),
            attempt_timeout: None,
        }
    }

    /// Fail any single send in [`Self::execute`] that runs longer than `limit` with a retryable
    /// timeout.
    #[must_use]
    pub fn with_attempt_timeout(mut self, limit: Option<Duration>) -> Self {
        self.attempt_timeout = limit;
        self
    }

    /// Record into a shared set of counters instead of private ones.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<RetryMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    #[must_use]
    pub fn metrics(&self) -> RetryMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Delay before the retry that follows 0-based `attempt`.
    #[must_use]
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay.as_secs_f64();
        let n = f64::from(attempt);
        let mut delay = match self.config.strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base * (n + 1.0),
            BackoffStrategy::Exponential => {
                base * self
                    .config
                    .backoff_factor
                    .powi(i32::try_from(attempt).unwrap_or(i32::MAX))
            }
        };
        if let Some(max) = self.config.max_delay {
            delay = delay.min(max.as_secs_f64());
        }
        if self.config.jitter {
            let factor = rand::rng().random_range((1.0 - JITTER_SPREAD)..(1.0 + JITTER_SPREAD));
            delay *= factor;
        }
        if !delay.is_finite() {
            return self.config.max_delay.unwrap_or(Duration::MAX);
        }
        Duration::from_secs_f64(delay.max(0.0))
    }

    /// Whether `err` warrants another attempt (budget permitting).
    #[must_use]
    pub fn is_retryable(&self, err: &CallError) -> bool {
        let listed = |category: &str, status: Option<u16>| {
            self.config.retryable_errors.iter().any(|entry| {
                let entry = entry.trim();
                entry.eq_ignore_ascii_case(category)
                    || status.is_some_and(|s| entry == s.to_string())
            })
        };
        match err {
            CallError::Network(e) => e.retryable || listed(e.category.as_str(), None),
            CallError::Api(e) => {
                e.is_retryable_by_default() || listed(e.category.as_str(), Some(e.status))
            }
            CallError::CircuitOpen { .. } | CallError::Cancelled | CallError::Request(_) => false,
        }
    }

    /// Run `op` until it succeeds, fails terminally, or the attempt budget is spent.
    ///
    /// `op` receives the 0-based attempt number. The wait between attempts is abandoned as soon
    /// as `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns the terminal error, the last error after exhaustion, or [`CallError::Cancelled`].
    pub async fn execute_with<F, Fut, T>(&self, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.metrics.executions.fetch_add(1, Ordering::Relaxed);

        if !self.config.enabled {
            self.metrics.attempts.fetch_add(1, Ordering::Relaxed);
            return op(0).await;
        }

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            self.metrics.attempts.fetch_add(1, Ordering::Relaxed);
            let err = match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };

            if !self.is_retryable(&err) {
                debug!(attempt, error = %err, "terminal failure, not retrying");
                return Err(err);
            }
            if attempt + 1 >= max_attempts {
                self.metrics.exhausted.fetch_add(1, Ordering::Relaxed);
                warn!(attempts = attempt + 1, error = %err, "retry attempts exhausted");
                return Err(err);
            }

            let wait = self.calculate_delay(attempt);
            debug!(
                attempt,
                wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "waiting before retry"
            );
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(CallError::Cancelled),
                () = tokio::time::sleep(wait) => {}
            }
            self.metrics.retries.fetch_add(1, Ordering::Relaxed);
            attempt += 1;
        }
    }

    /// Send `request` with retries.
    ///
    /// 2xx/3xx responses are returned as-is; any other status becomes [`CallError::Api`]. Each
    /// send is bounded by the attempt timeout, if one is set.
    ///
    /// # Errors
    ///
    /// See [`RetryExecutor::execute_with`]. Also fails if the request body cannot be cloned.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        client: &reqwest::Client,
        request: &reqwest::Request,
    ) -> Result<reqwest::Response> {
        let limit = self.attempt_timeout;
        self.execute_with(cancel, |_| {
            let req = request.try_clone();
            async move {
                let Some(req) = req else {
                    return Err(CallError::Request(
                        "request body cannot be cloned for retry".to_string(),
                    ));
                };
                let send = async {
                    match client.execute(req).await {
                        Ok(resp) => check_status(resp).await,
                        Err(e) => Err(CallError::from(e)),
                    }
                };
                let bounded = async {
                    match limit {
                        Some(limit) => tokio::time::timeout(limit, send).await.unwrap_or_else(|_| {
                            Err(NetworkError::timeout(format!(
                                "attempt exceeded {}ms",
                                limit.as_millis()
                            ))
                            .into())
                        }),
                        None => send.await,
                    }
                };
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => Err(CallError::Cancelled),
                    res = bounded => res,
                }
            }
        })
        .await
    }
}

/// Turn a non-success response into an [`ApiError`], consuming its body.
///
/// # Errors
///
/// Returns [`CallError::Api`] for statuses outside 2xx/3xx.
pub async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() || status.is_redirection() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ApiError::from_response(status.as_u16(), &body).into())
}
