//! Multi-tenant credential orchestration: strategy registry, cache waterfall, invalidation and
//! out-of-band provisioning.

use crate::auth_code::{AuthCodeEnvelope, AuthCodeGrant, AuthCodeRegistry, DEFAULT_AUTH_CODE_TTL};
use crate::config::{AuthConfig, AuthType};
use crate::error::{AuthError, Result};
use crate::store::TokenStore;
use crate::strategies::{
    ApiKeyStrategy, AuthOutcome, AuthStrategy, BasicStrategy, BearerStrategy,
    OAuth2DeviceFlowStrategy, OAuth2ExternalStrategy, SessionJwtStrategy, UserCredentialsStrategy,
};
use crate::token::{TenantContext, TokenInfo, TokenKey};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_REFRESH_BUFFER: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct AuthManagerOptions {
    /// Disables direct credential input for static strategies.
    pub multi_tenant: bool,
    /// Cached tokens expiring within this window are refreshed or re-acquired.
    pub refresh_buffer: Duration,
    /// Base URL printed into auth-code envelopes.
    pub external_url: Option<String>,
    pub auth_code_ttl: Duration,
    pub max_device_poll: Duration,
}

impl Default for AuthManagerOptions {
    fn default() -> Self {
        Self {
            multi_tenant: false,
            refresh_buffer: DEFAULT_REFRESH_BUFFER,
            external_url: None,
            auth_code_ttl: DEFAULT_AUTH_CODE_TTL,
            max_device_poll: crate::strategies::DEFAULT_MAX_POLL_DURATION,
        }
    }
}

/// Owns the token cache and the strategy registry for all tenants of one process.
///
/// Cheap to clone; all clones share state. Dropping the last clone cancels background pollers.
#[derive(Clone)]
pub struct MultiTenantAuthManager {
    inner: Arc<Inner>,
}

struct Inner {
    options: AuthManagerOptions,
    tokens: TokenStore,
    strategies: RwLock<HashMap<AuthType, Arc<dyn AuthStrategy>>>,
    auth_codes: AuthCodeRegistry,
    shutdown: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl MultiTenantAuthManager {
    /// A manager with every built-in strategy registered.
    #[must_use]
    pub fn new(http: reqwest::Client, tokens: TokenStore, options: AuthManagerOptions) -> Self {
        let shutdown = CancellationToken::new();
        let mt = options.multi_tenant;
        let builtin: Vec<Arc<dyn AuthStrategy>> = vec![
            Arc::new(BearerStrategy::new(mt)),
            Arc::new(ApiKeyStrategy::new(mt)),
            Arc::new(BasicStrategy::new(mt)),
            Arc::new(SessionJwtStrategy::new(http.clone())),
            Arc::new(UserCredentialsStrategy),
            Arc::new(OAuth2ExternalStrategy::new(http.clone())),
            Arc::new(
                OAuth2DeviceFlowStrategy::new(http, tokens.clone(), shutdown.clone())
                    .with_max_poll_duration(options.max_device_poll),
            ),
        ];
        let strategies = builtin.into_iter().map(|s| (s.auth_type(), s)).collect();

        Self {
            inner: Arc::new(Inner {
                options,
                tokens,
                strategies: RwLock::new(strategies),
                auth_codes: AuthCodeRegistry::default(),
                shutdown,
            }),
        }
    }

    #[must_use]
    pub fn options(&self) -> &AuthManagerOptions {
        &self.inner.options
    }

    #[must_use]
    pub fn token_store(&self) -> &TokenStore {
        &self.inner.tokens
    }

    /// Register (or replace) the strategy for its auth type.
    pub fn register_strategy(&self, strategy: Arc<dyn AuthStrategy>) {
        let auth_type = strategy.auth_type();
        debug!(auth_type = %auth_type, "registering auth strategy");
        self.inner.strategies.write().insert(auth_type, strategy);
    }

    #[must_use]
    pub fn registered_strategies(&self) -> Vec<AuthType> {
        let mut types: Vec<AuthType> = self.inner.strategies.read().keys().copied().collect();
        types.sort();
        types
    }

    #[must_use]
    pub fn has_strategy(&self, auth_type: AuthType) -> bool {
        self.inner.strategies.read().contains_key(&auth_type)
    }

    fn strategy(&self, auth_type: AuthType) -> Result<Arc<dyn AuthStrategy>> {
        self.inner
            .strategies
            .read()
            .get(&auth_type)
            .cloned()
            .ok_or(AuthError::UnknownStrategy(auth_type))
    }

    /// Fatal configuration checks for one auth block.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Config`] or [`AuthError::UnknownStrategy`].
    pub fn validate_config(&self, config: &AuthConfig) -> Result<()> {
        if config.token_invalidation.status_codes.is_empty() {
            return Err(AuthError::Config(
                "tokenInvalidation.statusCodes must not be empty".into(),
            ));
        }
        self.strategy(config.auth_type)?.validate_config(config)
    }

    /// Return a usable credential for the caller's (tenant, service).
    ///
    /// 1. a cached token not expiring within the refresh buffer is returned as-is;
    /// 2. an expiring token with a refresh token is refreshed when the strategy supports it;
    /// 3. otherwise the strategy authenticates. A device-authorization prompt surfaces as
    ///    [`AuthError::DeviceCodePending`] and is never cached;
    /// 4. if that fails while the cached token has not actually expired yet, it is still used.
    ///
    /// # Errors
    ///
    /// [`AuthError::DeviceCodePending`] when the user must authorize first, or the failure of the
    /// last step attempted. A bare `authorization_pending` from a custom strategy is returned
    /// unchanged and never falls back to the cached token.
    pub async fn get_token(&self, ctx: &TenantContext, config: &AuthConfig) -> Result<TokenInfo> {
        let strategy = self.strategy(config.auth_type)?;
        let key = ctx.key();
        let buffer = self.inner.options.refresh_buffer;

        let cached = self.inner.tokens.get(&key).await?;
        if let Some(token) = &cached {
            if !token.is_expired_with_buffer(buffer) {
                debug!(service = %ctx.service_name, tenant = %ctx.tenant_hash, "using cached token");
                return Ok(token.clone());
            }
            if strategy.supports_refresh() && token.refresh_token.is_some() {
                match strategy.refresh_token(ctx, token, config).await {
                    Ok(fresh) => {
                        info!(service = %ctx.service_name, tenant = %ctx.tenant_hash, "token refreshed");
                        self.inner.tokens.put(&key, fresh.clone()).await?;
                        return Ok(fresh);
                    }
                    Err(e) => {
                        warn!(
                            service = %ctx.service_name,
                            tenant = %ctx.tenant_hash,
                            error = %e,
                            "token refresh failed; re-authenticating"
                        );
                    }
                }
            }
        }

        match strategy.authenticate(ctx, config).await {
            Ok(AuthOutcome::Token(token)) => {
                debug!(service = %ctx.service_name, tenant = %ctx.tenant_hash, "authenticated");
                self.inner.tokens.put(&key, token.clone()).await?;
                Ok(token)
            }
            Ok(AuthOutcome::Pending(prompt)) => Err(AuthError::DeviceCodePending(prompt)),
            // A strategy that reports `authorization_pending` without a prompt is passed through
            // as-is; callers detect both forms with `AuthError::is_device_code_pending`.
            Err(e) if e.is_device_code_pending() => Err(e),
            Err(e) => match cached.filter(|t| !t.is_expired()) {
                Some(still_valid) => {
                    warn!(
                        service = %ctx.service_name,
                        tenant = %ctx.tenant_hash,
                        error = %e,
                        "re-authentication failed; using token inside its refresh window"
                    );
                    Ok(still_valid)
                }
                None => Err(e),
            },
        }
    }

    /// Acquire a credential and place it on `request`.
    ///
    /// # Errors
    ///
    /// Anything [`Self::get_token`] or the strategy's `apply_auth` returns.
    pub async fn apply_authentication(
        &self,
        request: &mut reqwest::Request,
        ctx: &TenantContext,
        config: &AuthConfig,
    ) -> Result<()> {
        let token = self.get_token(ctx, config).await?;
        self.strategy(config.auth_type)?
            .apply_auth(request, &token, config)
    }

    /// Evict the caller's credential from every cache layer.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Store`] if the persistent layer fails.
    pub async fn invalidate_token(&self, ctx: &TenantContext) -> Result<()> {
        info!(service = %ctx.service_name, tenant = %ctx.tenant_hash, "invalidating cached token");
        self.inner.tokens.remove(&ctx.key()).await
    }

    #[must_use]
    pub fn should_invalidate(&self, config: &AuthConfig, status: u16) -> bool {
        config.token_invalidation.matches(status)
    }

    /// Issue a single-use provisioning code for (tenant, service). `ttl = None` uses the
    /// configured default.
    #[must_use]
    pub fn create_auth_code(
        &self,
        tenant_hash: &str,
        service_name: &str,
        ttl: Option<Duration>,
    ) -> AuthCodeGrant {
        let ttl = ttl.unwrap_or(self.inner.options.auth_code_ttl);
        let grant = self.inner.auth_codes.issue(tenant_hash, service_name, ttl);
        info!(service = %service_name, tenant = %tenant_hash, "auth code issued");
        grant
    }

    /// Shareable envelope for a grant.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Config`] when no external URL is configured.
    pub fn auth_code_envelope(&self, grant: &AuthCodeGrant) -> Result<String> {
        let external_url = self.inner.options.external_url.as_deref().ok_or_else(|| {
            AuthError::Config("an external URL is required to share auth codes".into())
        })?;
        AuthCodeEnvelope::new(external_url, grant).encode()
    }

    /// Consume `code` and store the credential built from `credentials` under the code's
    /// (tenant, service).
    ///
    /// # Errors
    ///
    /// [`AuthError::AuthCode`] for unknown, used or expired codes; strategy errors for
    /// incomplete credentials. The code stays redeemable when the credentials are rejected or
    /// the store fails.
    pub async fn redeem_auth_code(
        &self,
        code: &str,
        credentials: &HashMap<String, String>,
        config: &AuthConfig,
    ) -> Result<TokenKey> {
        let strategy = self.strategy(config.auth_type)?;
        let token = strategy.token_from_credentials(credentials, config)?;
        let grant = self.inner.auth_codes.take(code)?;
        let key = grant.key();
        if let Err(e) = self.inner.tokens.put(&key, token).await {
            self.inner.auth_codes.restore(grant);
            return Err(e);
        }
        info!(service = %key.service_name, tenant = %key.tenant_hash, "credentials provisioned");
        Ok(key)
    }

    /// Stop background device-flow pollers. Cached tokens are kept.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}
