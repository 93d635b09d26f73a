//! Fault tolerance for outbound API calls.
//!
//! Every call runs as `CircuitBreaker::execute_attempts(RetryExecutor::execute(request))`, with
//! the breaker's timeout applied to each attempt:
//! - [`retry::RetryExecutor`] retries transient failures (5xx, 429, network, timeouts) with
//!   fixed/linear/exponential backoff;
//! - [`circuit_breaker::CircuitBreaker`] stops calling a service that keeps failing.
//!
//! Neither layer knows about credentials. Callers decide what an auth failure means.

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod redact;
pub mod retry;
pub mod serde_duration;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerMetrics, CircuitBreakerRegistry, CircuitState,
};
pub use config::{
    BackoffStrategy, CircuitBreakerConfig, CircuitBreakerSettings, ConfigError, RetryConfig,
    RetrySettings,
};
pub use error::{ApiError, CallError, ErrorCategory, NetworkError, Result};
pub use retry::{RetryExecutor, RetryMetrics, RetryMetricsSnapshot};
