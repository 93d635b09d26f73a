//! Error taxonomy shared by the retry executor, the circuit breaker and the operation executor.

use crate::redact::{sanitize_reqwest_error, truncate_body};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Coarse classification of a failed call.
///
/// The retry executor only ever looks at the category (and the HTTP status), never at what the
/// failure means for the business operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Transient,
    Permanent,
    Auth,
    RateLimit,
    Timeout,
    Server,
    Client,
    Network,
}

impl ErrorCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Auth => "auth",
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::Server => "server",
            Self::Client => "client",
            Self::Network => "network",
        }
    }

    /// Categorize an HTTP status code.
    #[must_use]
    pub fn for_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::Auth,
            408 => Self::Timeout,
            429 => Self::RateLimit,
            502..=504 => Self::Transient,
            500..=599 => Self::Server,
            400..=499 => Self::Client,
            _ => Self::Permanent,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connectivity-level failure (DNS, connect, TLS, timeout, broken body stream).
#[derive(Debug, Clone, Error)]
#[error("network error ({category}): {message}")]
pub struct NetworkError {
    pub message: String,
    pub category: ErrorCategory,
    pub retryable: bool,
}

impl NetworkError {
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: ErrorCategory::Timeout,
            retryable: true,
        }
    }

    #[must_use]
    pub fn from_reqwest(e: &reqwest::Error) -> Self {
        let message = sanitize_reqwest_error(e);
        if e.is_timeout() {
            return Self::timeout(message);
        }
        // Builder errors are caused by the request itself; sending it again cannot help.
        let retryable = !e.is_builder();
        Self {
            message,
            category: if retryable {
                ErrorCategory::Network
            } else {
                ErrorCategory::Permanent
            },
            retryable,
        }
    }
}

/// Upstream answered, but with a non-success HTTP status.
#[derive(Debug, Clone, Error)]
#[error("api error: status {status} ({category}): {message}")]
pub struct ApiError {
    pub status: u16,
    pub category: ErrorCategory,
    pub message: String,
}

impl ApiError {
    /// Build an error from an upstream status and body.
    ///
    /// Bodies of 401/403 responses are never surfaced: they tend to describe why a credential
    /// was rejected.
    #[must_use]
    pub fn from_response(status: u16, body: &str) -> Self {
        let category = ErrorCategory::for_status(status);
        let message = if category == ErrorCategory::Auth {
            "upstream rejected the credentials (details redacted)".to_string()
        } else if body.trim().is_empty() {
            format!("upstream returned HTTP {status}")
        } else {
            truncate_body(body)
        };
        Self {
            status,
            category,
            message,
        }
    }

    /// Server errors and rate limiting are retried by default; other 4xx are terminal.
    #[must_use]
    pub fn is_retryable_by_default(&self) -> bool {
        self.status == 429 || (500..=599).contains(&self.status)
    }
}

/// Error returned by a call that went through the fault-tolerance pipeline.
#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Api(#[from] ApiError),

    /// The service's breaker is open (or its half-open trial budget is used up).
    #[error("circuit breaker open for service '{service}': call rejected")]
    CircuitOpen { service: String },

    #[error("call cancelled")]
    Cancelled,

    /// The request could not be (re)issued, e.g. a streaming body that cannot be cloned.
    #[error("invalid request: {0}")]
    Request(String),
}

impl CallError {
    /// HTTP status of the failure, if the upstream produced one.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api(e) => Some(e.status),
            _ => None,
        }
    }

    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Network(e) => e.category,
            Self::Api(e) => e.category,
            Self::CircuitOpen { .. } => ErrorCategory::Transient,
            Self::Cancelled | Self::Request(_) => ErrorCategory::Permanent,
        }
    }

    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

impl From<reqwest::Error> for CallError {
    fn from(value: reqwest::Error) -> Self {
        Self::Network(NetworkError::from_reqwest(&value))
    }
}

pub type Result<T> = std::result::Result<T, CallError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_categories() {
        assert_eq!(ErrorCategory::for_status(401), ErrorCategory::Auth);
        assert_eq!(ErrorCategory::for_status(403), ErrorCategory::Auth);
        assert_eq!(ErrorCategory::for_status(429), ErrorCategory::RateLimit);
        assert_eq!(ErrorCategory::for_status(503), ErrorCategory::Transient);
        assert_eq!(ErrorCategory::for_status(500), ErrorCategory::Server);
        assert_eq!(ErrorCategory::for_status(404), ErrorCategory::Client);
    }

    #[test]
    fn auth_failures_do_not_leak_upstream_body() {
        let err = ApiError::from_response(401, "token abc123 revoked for user bob");
        assert!(!err.to_string().contains("abc123"));
        assert!(!err.to_string().contains("bob"));

        let err = ApiError::from_response(404, "no such item");
        assert!(err.to_string().contains("no such item"));
    }

    #[test]
    fn default_retryability() {
        assert!(ApiError::from_response(500, "").is_retryable_by_default());
        assert!(ApiError::from_response(429, "").is_retryable_by_default());
        assert!(!ApiError::from_response(400, "").is_retryable_by_default());
        assert!(!ApiError::from_response(401, "").is_retryable_by_default());
    }
}
