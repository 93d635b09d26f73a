//! Credential value objects and the tenant-scoped cache key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

pub const DEFAULT_TOKEN_TYPE: &str = "Bearer";

fn default_token_type() -> String {
    DEFAULT_TOKEN_TYPE.to_string()
}

/// An acquired credential.
///
/// `metadata` holds strategy-private fields (where/how to apply the token, refresh endpoints,
/// Basic credentials) and is persisted verbatim.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenInfo {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scope: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl fmt::Debug for TokenInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenInfo")
            .field("access_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .field("metadata_keys", &self.metadata.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TokenInfo {
    #[must_use]
    pub fn new(access_token: impl Into<String>, token_type: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: token_type.into(),
            refresh_token: None,
            expires_at: None,
            scope: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_refresh_token(mut self, refresh_token: Option<String>) -> Self {
        self.refresh_token = refresh_token;
        self
    }

    #[must_use]
    pub fn with_expires_in(mut self, expires_in: Option<Duration>) -> Self {
        self.expires_at = expires_in
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| Utc::now() + d);
        self
    }

    #[must_use]
    pub fn with_scope(mut self, scope: Vec<String>) -> Self {
        self.scope = scope;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// True iff an expiry is set and `now` is past it. No expiry never expires.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| now > exp)
    }

    /// True iff `now + buffer` is past the expiry.
    #[must_use]
    pub fn is_expired_with_buffer(&self, buffer: Duration) -> bool {
        self.is_expired_with_buffer_at(Utc::now(), buffer)
    }

    #[must_use]
    pub fn is_expired_with_buffer_at(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        let buffer = chrono::Duration::from_std(buffer).unwrap_or(chrono::Duration::MAX);
        match self.expires_at {
            None => false,
            Some(exp) => now.checked_add_signed(buffer).is_none_or(|t| t > exp),
        }
    }

    /// Remaining lifetime, `None` for tokens without expiry.
    #[must_use]
    pub fn time_to_expiry(&self) -> Option<Duration> {
        self.expires_at
            .map(|exp| (exp - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }
}

/// Derive the opaque tenant identifier for a raw tenant secret (lowercase hex SHA-256).
#[must_use]
pub fn hash_tenant_secret(secret: &str) -> String {
    hex::encode(sha2::Sha256::digest(secret.as_bytes()))
}

/// Cache key: one credential per (tenant, service).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenKey {
    pub tenant_hash: String,
    pub service_name: String,
}

impl TokenKey {
    #[must_use]
    pub fn new(tenant_hash: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            tenant_hash: tenant_hash.into(),
            service_name: service_name.into(),
        }
    }

    /// Key used in the persistent store.
    #[must_use]
    pub fn storage_key(&self) -> String {
        format!("token:{}:{}", self.tenant_hash, self.service_name)
    }
}

impl fmt::Display for TokenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_hash, self.service_name)
    }
}

/// Who is calling which service, for one request.
#[derive(Debug, Clone)]
pub struct TenantContext {
    pub tenant_hash: String,
    pub service_name: String,
    pub request_id: String,
    pub created_at: DateTime<Utc>,
}

impl TenantContext {
    #[must_use]
    pub fn new(tenant_hash: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            tenant_hash: tenant_hash.into(),
            service_name: service_name.into(),
            request_id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
        }
    }

    /// Build a context from a raw tenant secret; only its hash is kept.
    #[must_use]
    pub fn from_secret(secret: &str, service_name: impl Into<String>) -> Self {
        Self::new(hash_tenant_secret(secret), service_name)
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    #[must_use]
    pub fn key(&self) -> TokenKey {
        TokenKey::new(self.tenant_hash.clone(), self.service_name.clone())
    }

    /// Same tenant, different service.
    #[must_use]
    pub fn for_service(&self, service_name: impl Into<String>) -> Self {
        Self {
            tenant_hash: self.tenant_hash.clone(),
            service_name: service_name.into(),
            request_id: self.request_id.clone(),
            created_at: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    fn token_expiring_at(exp: DateTime<Utc>) -> TokenInfo {
        TokenInfo {
            expires_at: Some(exp),
            ..TokenInfo::new("t", DEFAULT_TOKEN_TYPE)
        }
    }

    #[test]
    fn no_expiry_never_expires() {
        let t = TokenInfo::new("t", DEFAULT_TOKEN_TYPE);
        assert!(!t.is_expired());
        assert!(!t.is_expired_with_buffer(Duration::from_secs(3600 * 24 * 365)));
    }

    #[test]
    fn expiry_is_strictly_after() {
        let exp = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let t = token_expiring_at(exp);
        assert!(!t.is_expired_at(exp));
        assert!(t.is_expired_at(exp + chrono::Duration::seconds(1)));
        assert!(!t.is_expired_at(exp - chrono::Duration::seconds(1)));
    }

    #[test]
    fn buffer_shifts_the_boundary() {
        let exp = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let t = token_expiring_at(exp);
        let buffer = Duration::from_secs(300);
        let just_outside = exp - chrono::Duration::seconds(301);
        let just_inside = exp - chrono::Duration::seconds(299);
        assert!(!t.is_expired_with_buffer_at(just_outside, buffer));
        assert!(t.is_expired_with_buffer_at(just_inside, buffer));
    }

    #[test]
    fn metadata_round_trips_through_json() {
        let t = TokenInfo::new("secret", "Bearer")
            .with_refresh_token(Some("r".to_string()))
            .with_scope(vec!["read".to_string(), "write".to_string()])
            .with_metadata("location", "cookie")
            .with_metadata("format", "{tokenType} {token}");
        let json = serde_json::to_string(&t).expect("serialize");
        let back: TokenInfo = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, t);
    }

    #[test]
    fn debug_redacts_secrets() {
        let t = TokenInfo::new("super-secret", "Bearer").with_refresh_token(Some("r-secret".into()));
        let dbg = format!("{t:?}");
        assert!(!dbg.contains("super-secret"));
        assert!(!dbg.contains("r-secret"));
    }

    #[test]
    fn tenant_context_hashes_secret() {
        let ctx = TenantContext::from_secret("tenant-api-key", "github");
        assert_eq!(ctx.tenant_hash.len(), 64);
        assert_ne!(ctx.tenant_hash, "tenant-api-key");
        assert_eq!(ctx.key(), TokenKey::new(hash_tenant_secret("tenant-api-key"), "github"));
        assert_eq!(ctx.for_service("jira").key().service_name, "jira");
    }
}
