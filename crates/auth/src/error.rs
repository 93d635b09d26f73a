//! Error types for `apiwire-auth`.

use crate::config::AuthType;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// OAuth2 `error` codes we act on (RFC 6749 §5.2, RFC 8628 §3.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OAuthErrorCode {
    AuthorizationPending,
    SlowDown,
    ExpiredToken,
    AccessDenied,
    InvalidGrant,
    InvalidClient,
    Other(String),
}

impl OAuthErrorCode {
    #[must_use]
    pub fn parse(code: &str) -> Self {
        match code.trim() {
            "authorization_pending" => Self::AuthorizationPending,
            "slow_down" => Self::SlowDown,
            "expired_token" => Self::ExpiredToken,
            // Some providers spell the RFC's `access_denied` as `authorization_declined`.
            "access_denied" | "authorization_declined" => Self::AccessDenied,
            "invalid_grant" => Self::InvalidGrant,
            "invalid_client" => Self::InvalidClient,
            other => Self::Other(other.to_string()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::AuthorizationPending => "authorization_pending",
            Self::SlowDown => "slow_down",
            Self::ExpiredToken => "expired_token",
            Self::AccessDenied => "access_denied",
            Self::InvalidGrant => "invalid_grant",
            Self::InvalidClient => "invalid_client",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for OAuthErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The user has to complete a device-authorization step before a token exists.
///
/// This is a control-flow signal, not a failure: surface [`DeviceCodeError::instructions`] to
/// the end user and retry the call once they are done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCodeError {
    pub service: String,
    pub verification_uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_uri_complete: Option<String>,
    pub user_code: String,
    pub expires_at: DateTime<Utc>,
    pub interval_secs: u64,
}

impl DeviceCodeError {
    #[must_use]
    pub fn instructions(&self) -> String {
        let minutes = (self.expires_at - Utc::now()).num_minutes().max(1);
        match &self.verification_uri_complete {
            Some(complete) => format!(
                "To authorize access to '{}', open {complete} (or visit {} and enter code {}) within {minutes} minute(s), then retry.",
                self.service, self.verification_uri, self.user_code
            ),
            None => format!(
                "To authorize access to '{}', visit {} and enter code {} within {minutes} minute(s), then retry.",
                self.service, self.verification_uri, self.user_code
            ),
        }
    }
}

impl fmt::Display for DeviceCodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device authorization pending: {}", self.instructions())
    }
}

impl std::error::Error for DeviceCodeError {}

#[derive(Debug, Error)]
pub enum AuthError {
    /// Obtaining or refreshing a credential failed.
    #[error("authentication failed for service '{service}': {message}")]
    Authentication {
        service: String,
        message: String,
        /// OAuth error code reported by the provider, if any.
        reason: Option<OAuthErrorCode>,
        #[source]
        source: Option<BoxError>,
    },

    #[error(transparent)]
    DeviceCodePending(#[from] DeviceCodeError),

    /// Invalid or incomplete auth configuration.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("no strategy registered for auth type '{0}'")]
    UnknownStrategy(AuthType),

    #[error("token store error: {0}")]
    Store(String),

    #[error("auth code error: {0}")]
    AuthCode(String),
}

impl AuthError {
    pub fn authentication(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Authentication {
            service: service.into(),
            message: message.into(),
            reason: None,
            source: None,
        }
    }

    pub fn oauth(service: impl Into<String>, reason: OAuthErrorCode, message: impl Into<String>) -> Self {
        Self::Authentication {
            service: service.into(),
            message: message.into(),
            reason: Some(reason),
            source: None,
        }
    }

    pub fn with_source(
        service: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Authentication {
            service: service.into(),
            message: message.into(),
            reason: None,
            source: Some(Box::new(source)),
        }
    }

    /// OAuth error code carried by an authentication failure.
    #[must_use]
    pub fn oauth_reason(&self) -> Option<&OAuthErrorCode> {
        match self {
            Self::Authentication { reason, .. } => reason.as_ref(),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_device_code_pending(&self) -> bool {
        matches!(self, Self::DeviceCodePending(_))
            || self.oauth_reason() == Some(&OAuthErrorCode::AuthorizationPending)
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn oauth_codes_parse_by_tag() {
        assert_eq!(
            OAuthErrorCode::parse("authorization_pending"),
            OAuthErrorCode::AuthorizationPending
        );
        assert_eq!(
            OAuthErrorCode::parse("authorization_declined"),
            OAuthErrorCode::AccessDenied
        );
        assert_eq!(
            OAuthErrorCode::parse("weird"),
            OAuthErrorCode::Other("weird".to_string())
        );

        let err = AuthError::oauth("svc", OAuthErrorCode::AuthorizationPending, "waiting");
        assert!(err.is_device_code_pending());
        assert!(!AuthError::authentication("svc", "nope").is_device_code_pending());
    }

    #[test]
    fn device_code_instructions_mention_code_and_url() {
        let prompt = DeviceCodeError {
            service: "github".to_string(),
            verification_uri: "https://example.com/device".to_string(),
            verification_uri_complete: None,
            user_code: "ABCD-1234".to_string(),
            expires_at: Utc::now() + Duration::minutes(10),
            interval_secs: 5,
        };
        let text = AuthError::from(prompt).to_string();
        assert!(text.contains("ABCD-1234"));
        assert!(text.contains("https://example.com/device"));
        assert!(text.contains("github"));
    }
}
