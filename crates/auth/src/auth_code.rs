//! Short-lived, single-use codes that let an external tool provision a tenant's credentials.

use crate::error::{AuthError, Result};
use crate::token::TokenKey;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_AUTH_CODE_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthCodeGrant {
    pub code: String,
    pub tenant_hash: String,
    pub service_name: String,
    pub expires_at: DateTime<Utc>,
}

impl AuthCodeGrant {
    #[must_use]
    pub fn key(&self) -> TokenKey {
        TokenKey::new(self.tenant_hash.clone(), self.service_name.clone())
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// What the provisioning tool receives: where to redeem, which code, for which service.
///
/// Encoded as base64url (no padding) JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthCodeEnvelope {
    #[serde(rename = "externalURL")]
    pub external_url: String,
    pub code: String,
    #[serde(rename = "serviceName")]
    pub service_name: String,
}

impl AuthCodeEnvelope {
    #[must_use]
    pub fn new(external_url: impl Into<String>, grant: &AuthCodeGrant) -> Self {
        Self {
            external_url: external_url.into(),
            code: grant.code.clone(),
            service_name: grant.service_name.clone(),
        }
    }

    /// # Errors
    ///
    /// Returns [`AuthError::AuthCode`] if serialization fails.
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self)
            .map_err(|e| AuthError::AuthCode(format!("encode envelope: {e}")))?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    /// Accepts padded input as well.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::AuthCode`] if the input is not a valid envelope.
    pub fn decode(encoded: &str) -> Result<Self> {
        let raw = URL_SAFE_NO_PAD
            .decode(encoded.trim().trim_end_matches('='))
            .map_err(|_| AuthError::AuthCode("invalid envelope encoding".into()))?;
        serde_json::from_slice(&raw)
            .map_err(|e| AuthError::AuthCode(format!("invalid envelope payload: {e}")))
    }
}

/// In-process registry of outstanding codes.
#[derive(Default)]
pub(crate) struct AuthCodeRegistry {
    codes: Mutex<HashMap<String, AuthCodeGrant>>,
}

impl AuthCodeRegistry {
    pub(crate) fn issue(&self, tenant_hash: &str, service_name: &str, ttl: Duration) -> AuthCodeGrant {
        let bytes: [u8; 32] = rand::random();
        let now = Utc::now();
        let grant = AuthCodeGrant {
            code: URL_SAFE_NO_PAD.encode(bytes),
            tenant_hash: tenant_hash.to_string(),
            service_name: service_name.to_string(),
            expires_at: now
                + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()),
        };

        let mut codes = self.codes.lock();
        codes.retain(|_, g| !g.is_expired_at(now));
        codes.insert(grant.code.clone(), grant.clone());
        grant
    }

    /// Consume a code. A code is usable once; expired codes are rejected.
    pub(crate) fn take(&self, code: &str) -> Result<AuthCodeGrant> {
        let grant = self
            .codes
            .lock()
            .remove(code.trim())
            .ok_or_else(|| AuthError::AuthCode("unknown or already used code".into()))?;
        if grant.is_expired_at(Utc::now()) {
            return Err(AuthError::AuthCode("code expired".into()));
        }
        Ok(grant)
    }

    /// Put back a grant whose redemption failed after [`Self::take`].
    pub(crate) fn restore(&self, grant: AuthCodeGrant) {
        self.codes.lock().insert(grant.code.clone(), grant);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.codes.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_single_use() {
        let registry = AuthCodeRegistry::default();
        let grant = registry.issue("tenant", "github", DEFAULT_AUTH_CODE_TTL);
        assert_eq!(registry.len(), 1);

        let taken = registry.take(&grant.code).expect("first use");
        assert_eq!(taken, grant);
        assert!(registry.take(&grant.code).is_err());

        registry.restore(taken);
        assert_eq!(registry.take(&grant.code).expect("restored"), grant);
    }

    #[test]
    fn expired_codes_are_rejected_and_purged() {
        let registry = AuthCodeRegistry::default();
        let stale = registry.issue("tenant", "github", Duration::ZERO);
        assert!(matches!(registry.take(&stale.code), Err(AuthError::AuthCode(_))));

        registry.issue("tenant", "a", Duration::ZERO);
        registry.issue("tenant", "b", DEFAULT_AUTH_CODE_TTL);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn envelope_uses_wire_field_names() {
        let registry = AuthCodeRegistry::default();
        let grant = registry.issue("tenant", "github", DEFAULT_AUTH_CODE_TTL);
        let envelope = AuthCodeEnvelope::new("https://apiwire.example.com", &grant);
        let encoded = envelope.encode().expect("encode");
        assert!(!encoded.contains('='));

        let json: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(&encoded).expect("b64")).expect("json");
        assert_eq!(json["externalURL"], "https://apiwire.example.com");
        assert_eq!(json["serviceName"], "github");
        assert_eq!(json["code"], grant.code.as_str());

        assert_eq!(AuthCodeEnvelope::decode(&encoded).expect("decode"), envelope);
        assert!(AuthCodeEnvelope::decode("not-base64!").is_err());
    }
}
