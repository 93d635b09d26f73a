//! Per-tenant secrets provisioned out of band and injected field by field.

use super::{AuthOutcome, AuthStrategy, CredentialLocation, provisioning_required};
use crate::config::{AuthConfig, AuthType};
use crate::error::{AuthError, Result};
use crate::token::{TenantContext, TokenInfo};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;

fn default_value_format() -> String {
    "{value}".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialField {
    /// Key in the provisioned credentials (and in token metadata).
    field: String,
    #[serde(default)]
    location: CredentialLocation,
    /// Header/cookie/query name; defaults to `field`.
    #[serde(default)]
    name: Option<String>,
    #[serde(default = "default_value_format")]
    format: String,
}

impl CredentialField {
    fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.field)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserCredentialsConfig {
    #[serde(default)]
    fields: Vec<CredentialField>,
}

pub struct UserCredentialsStrategy;

#[async_trait]
impl AuthStrategy for UserCredentialsStrategy {
    fn auth_type(&self) -> AuthType {
        AuthType::UserCredentials
    }

    fn validate_config(&self, config: &AuthConfig) -> Result<()> {
        let cfg: UserCredentialsConfig = config.typed()?;
        if cfg.fields.is_empty() {
            return Err(AuthError::Config(
                "'user_credentials' auth requires at least one entry in 'fields'".into(),
            ));
        }
        if let Some(f) = cfg.fields.iter().find(|f| f.field.trim().is_empty()) {
            return Err(AuthError::Config(format!(
                "'user_credentials' field with name '{}' has an empty 'field'",
                f.name()
            )));
        }
        Ok(())
    }

    async fn authenticate(&self, ctx: &TenantContext, _config: &AuthConfig) -> Result<AuthOutcome> {
        Err(provisioning_required(ctx, AuthType::UserCredentials))
    }

    fn apply_auth(
        &self,
        request: &mut reqwest::Request,
        token: &TokenInfo,
        config: &AuthConfig,
    ) -> Result<()> {
        let cfg: UserCredentialsConfig = config.typed()?;
        for f in &cfg.fields {
            let value = token.metadata(&f.field).ok_or_else(|| {
                AuthError::Config(format!("credential field '{}' is not provisioned", f.field))
            })?;
            let rendered = f.format.replace("{value}", value);
            f.location.inject(request, f.name(), &rendered)?;
        }
        Ok(())
    }

    fn token_from_credentials(
        &self,
        credentials: &HashMap<String, String>,
        config: &AuthConfig,
    ) -> Result<TokenInfo> {
        let cfg: UserCredentialsConfig = config.typed()?;
        let mut values = Vec::with_capacity(cfg.fields.len());
        for f in &cfg.fields {
            let v = credentials
                .get(&f.field)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| AuthError::Config(format!("missing credential field '{}'", f.field)))?;
            values.push((f.field.clone(), v.clone()));
        }
        let Some((_, first)) = values.first() else {
            return Err(AuthError::Config(
                "'user_credentials' auth requires at least one entry in 'fields'".into(),
            ));
        };

        let mut token = TokenInfo::new(first.clone(), "UserCredentials");
        for (k, v) in values {
            token = token.with_metadata(k, v);
        }
        Ok(token)
    }
}
