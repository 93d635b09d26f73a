//! OAuth2 device authorization grant (RFC 8628) with background polling.
//!
//! `authenticate` requests a device code, spawns a detached poller and returns
//! [`AuthOutcome::Pending`]. The poller writes the token into the shared [`TokenStore`] once the
//! user approves; the next foreground call then finds it in the cache.

use super::oauth2::{
    GrantError, META_CLIENT_ID, META_TOKEN_URL, OAuthClientConfig, TokenResponse,
    oauth_token_from_credentials, post_form, refresh_grant,
};
use super::{AuthOutcome, AuthStrategy, authorization_value, set_authorization};
use crate::config::{AuthConfig, AuthType};
use crate::error::{AuthError, DeviceCodeError, OAuthErrorCode, Result};
use crate::store::TokenStore;
use crate::token::{TenantContext, TokenInfo, TokenKey};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Local cap on how long one device code is polled, whatever the server allows.
pub const DEFAULT_MAX_POLL_DURATION: Duration = Duration::from_secs(10 * 60);

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
const DEFAULT_INTERVAL_SECS: u64 = 5;
const SLOW_DOWN_STEP: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceFlowConfig {
    device_authorization_url: String,
    #[serde(flatten)]
    client: OAuthClientConfig,
}

impl DeviceFlowConfig {
    fn parse(config: &AuthConfig) -> Result<Self> {
        let cfg: Self = config.typed()?;
        if cfg.device_authorization_url.trim().is_empty() {
            return Err(AuthError::Config(
                "'oauth2_device_flow' auth requires 'deviceAuthorizationUrl'".into(),
            ));
        }
        if cfg.client.token_url.as_deref().is_none_or(|u| u.trim().is_empty()) {
            return Err(AuthError::Config("'oauth2_device_flow' auth requires 'tokenUrl'".into()));
        }
        if cfg.client.client_id.as_deref().is_none_or(|c| c.trim().is_empty()) {
            return Err(AuthError::Config("'oauth2_device_flow' auth requires 'clientId'".into()));
        }
        Ok(cfg)
    }
}

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_SECS
}

/// RFC 8628 §3.2 response. Some providers say `verification_url`.
#[derive(Debug, Deserialize)]
struct DeviceAuthorizationResponse {
    device_code: String,
    user_code: String,
    #[serde(alias = "verification_url")]
    verification_uri: String,
    #[serde(default)]
    verification_uri_complete: Option<String>,
    expires_in: u64,
    #[serde(default = "default_interval")]
    interval: u64,
}

/// A device code handed out and still being polled.
#[derive(Debug, Clone)]
struct PendingDeviceCode {
    device_code: String,
    signal: DeviceCodeError,
}

type Slot = Arc<tokio::sync::Mutex<Option<PendingDeviceCode>>>;

/// One slot per identity. The async slot lock serializes device-code issuance per identity, so
/// concurrent callers get the same pending signal instead of each requesting a code.
#[derive(Default)]
struct PendingCodes {
    slots: Mutex<HashMap<TokenKey, Slot>>,
}

impl PendingCodes {
    fn slot(&self, key: &TokenKey) -> Slot {
        self.slots.lock().entry(key.clone()).or_default().clone()
    }

    fn is_current(&self, key: &TokenKey, slot: &Slot) -> bool {
        self.slots
            .lock()
            .get(key)
            .is_some_and(|s| Arc::ptr_eq(s, slot))
    }

    /// Lock the identity's slot, retrying if it was retired while we waited.
    async fn acquire(&self, key: &TokenKey) -> (Slot, OwnedMutexGuard<Option<PendingDeviceCode>>) {
        loop {
            let slot = self.slot(key);
            let guard = slot.clone().lock_owned().await;
            if self.is_current(key, &slot) {
                return (slot, guard);
            }
        }
    }

    /// Clear and retire the slot if it still holds `device_code`.
    async fn release(&self, key: &TokenKey, slot: &Slot, device_code: &str) {
        let mut guard = slot.lock().await;
        if guard.as_ref().is_some_and(|p| p.device_code == device_code) {
            *guard = None;
            let mut slots = self.slots.lock();
            if slots.get(key).is_some_and(|s| Arc::ptr_eq(s, slot)) {
                slots.remove(key);
            }
        }
    }

    /// Slots holding a code, or locked because one is being issued.
    fn outstanding(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|s| s.try_lock().map_or(true, |g| g.is_some()))
            .count()
    }
}

pub struct OAuth2DeviceFlowStrategy {
    http: reqwest::Client,
    tokens: TokenStore,
    shutdown: CancellationToken,
    max_poll: Duration,
    pending: Arc<PendingCodes>,
}

impl OAuth2DeviceFlowStrategy {
    /// Pollers write into `tokens` and stop when `shutdown` is cancelled.
    #[must_use]
    pub fn new(http: reqwest::Client, tokens: TokenStore, shutdown: CancellationToken) -> Self {
        Self {
            http,
            tokens,
            shutdown,
            max_poll: DEFAULT_MAX_POLL_DURATION,
            pending: Arc::new(PendingCodes::default()),
        }
    }

    #[must_use]
    pub fn with_max_poll_duration(mut self, max_poll: Duration) -> Self {
        self.max_poll = max_poll;
        self
    }

    /// Number of identities with an outstanding device code.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.outstanding()
    }

    async fn request_device_code(
        &self,
        service: &str,
        cfg: &DeviceFlowConfig,
    ) -> Result<DeviceAuthorizationResponse> {
        let client_id = cfg.client.client_id.as_deref().unwrap_or_default();
        let scope = cfg.client.scopes.join(" ");
        let mut form = vec![("client_id", client_id)];
        if !scope.is_empty() {
            form.push(("scope", scope.as_str()));
        }
        post_form(&self.http, &cfg.device_authorization_url, &form)
            .await
            .map_err(|e| e.into_auth_error(service))
    }
}

#[async_trait]
impl AuthStrategy for OAuth2DeviceFlowStrategy {
    fn auth_type(&self) -> AuthType {
        AuthType::OAuth2DeviceFlow
    }

    fn supports_refresh(&self) -> bool {
        true
    }

    fn validate_config(&self, config: &AuthConfig) -> Result<()> {
        DeviceFlowConfig::parse(config).map(|_| ())
    }

    async fn authenticate(&self, ctx: &TenantContext, config: &AuthConfig) -> Result<AuthOutcome> {
        let cfg = DeviceFlowConfig::parse(config)?;
        let key = ctx.key();
        let (slot, mut guard) = self.pending.acquire(&key).await;

        if let Some(p) = guard.as_ref() {
            if Utc::now() < p.signal.expires_at {
                debug!(service = %ctx.service_name, tenant = %ctx.tenant_hash, "device code already pending");
                return Ok(AuthOutcome::Pending(p.signal.clone()));
            }
        }
        // The poller may have finished between the caller's cache lookup and taking the slot.
        if let Some(token) = self.tokens.cached(&key).filter(|t| !t.is_expired()) {
            return Ok(AuthOutcome::Token(token));
        }

        let device = self.request_device_code(&ctx.service_name, &cfg).await?;
        let lifetime = Duration::from_secs(device.expires_in).min(self.max_poll);
        let expires_at = Utc::now()
            + chrono::Duration::from_std(lifetime).unwrap_or(chrono::Duration::zero());
        let signal = DeviceCodeError {
            service: ctx.service_name.clone(),
            verification_uri: device.verification_uri,
            verification_uri_complete: device.verification_uri_complete,
            user_code: device.user_code,
            expires_at,
            interval_secs: device.interval.max(1),
        };
        *guard = Some(PendingDeviceCode {
            device_code: device.device_code.clone(),
            signal: signal.clone(),
        });
        drop(guard);

        info!(
            service = %ctx.service_name,
            tenant = %ctx.tenant_hash,
            expires_in_secs = lifetime.as_secs(),
            "device authorization started"
        );

        let poller = Poller {
            http: self.http.clone(),
            tokens: self.tokens.clone(),
            pending: self.pending.clone(),
            slot,
            key,
            device_code: device.device_code,
            client: cfg.client,
            interval: Duration::from_secs(signal.interval_secs),
            lifetime,
            cancel: self.shutdown.child_token(),
        };
        tokio::spawn(poller.run());

        Ok(AuthOutcome::Pending(signal))
    }

    async fn refresh_token(
        &self,
        ctx: &TenantContext,
        token: &TokenInfo,
        config: &AuthConfig,
    ) -> Result<TokenInfo> {
        let client: OAuthClientConfig = config.typed()?;
        refresh_grant(&self.http, ctx, token, &client).await
    }

    fn apply_auth(
        &self,
        request: &mut reqwest::Request,
        token: &TokenInfo,
        _config: &AuthConfig,
    ) -> Result<()> {
        set_authorization(request, &authorization_value(token))
    }

    fn token_from_credentials(
        &self,
        credentials: &HashMap<String, String>,
        config: &AuthConfig,
    ) -> Result<TokenInfo> {
        let client: OAuthClientConfig = config.typed()?;
        oauth_token_from_credentials(AuthType::OAuth2DeviceFlow, credentials, &client)
    }
}

enum PollStep {
    Continue,
    Done,
}

/// Background task polling the token endpoint for one device code.
struct Poller {
    http: reqwest::Client,
    tokens: TokenStore,
    pending: Arc<PendingCodes>,
    slot: Slot,
    key: TokenKey,
    device_code: String,
    client: OAuthClientConfig,
    interval: Duration,
    lifetime: Duration,
    cancel: CancellationToken,
}

impl Poller {
    async fn run(mut self) {
        let deadline = tokio::time::Instant::now() + self.lifetime;
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    debug!(key = %self.key, "device flow poller cancelled");
                    break;
                }
                () = tokio::time::sleep(self.interval) => {}
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(key = %self.key, "device code expired before authorization completed");
                break;
            }
            if let PollStep::Done = self.poll_once().await {
                break;
            }
        }
        self.pending
            .release(&self.key, &self.slot, &self.device_code)
            .await;
    }

    async fn poll_once(&mut self) -> PollStep {
        let token_url = self.client.token_url.clone().unwrap_or_default();
        let client_id = self.client.client_id.clone().unwrap_or_default();
        let mut form = vec![
            ("grant_type", DEVICE_CODE_GRANT),
            ("device_code", self.device_code.as_str()),
            ("client_id", client_id.as_str()),
        ];
        if let Some(secret) = self.client.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }

        match post_form::<TokenResponse>(&self.http, &token_url, &form).await {
            Ok(resp) => {
                let token = resp
                    .into_token_info(None)
                    .with_metadata(META_CLIENT_ID, client_id.as_str())
                    .with_metadata(META_TOKEN_URL, token_url.as_str());
                match self.tokens.put(&self.key, token).await {
                    Ok(()) => info!(key = %self.key, "device authorization completed"),
                    Err(e) => warn!(key = %self.key, error = %e, "failed to store device-flow token"),
                }
                PollStep::Done
            }
            Err(GrantError::OAuth { code, .. }) => match code {
                OAuthErrorCode::AuthorizationPending => PollStep::Continue,
                OAuthErrorCode::SlowDown => {
                    self.interval += SLOW_DOWN_STEP;
                    debug!(key = %self.key, interval_secs = self.interval.as_secs(), "device flow asked to slow down");
                    PollStep::Continue
                }
                OAuthErrorCode::ExpiredToken => {
                    warn!(key = %self.key, "device code expired");
                    PollStep::Done
                }
                OAuthErrorCode::AccessDenied => {
                    warn!(key = %self.key, "device authorization declined by user");
                    PollStep::Done
                }
                other => {
                    warn!(key = %self.key, code = %other, "device flow poll failed; retrying");
                    PollStep::Continue
                }
            },
            Err(e) => {
                warn!(key = %self.key, error = %e.into_auth_error(&self.key.service_name), "device flow poll failed; retrying");
                PollStep::Continue
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apiwire_test_support::{MockServer, wait_until};
    use axum::{Form, Json, Router, extract::State, routing::post};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct OAuthServer {
        device_requests: Arc<AtomicUsize>,
        polls: Arc<AtomicUsize>,
        /// Polls answered with a non-OAuth 503 before anything else.
        transient_polls: usize,
        /// Polls answered `authorization_pending` before the outcome.
        pending_polls: usize,
        /// `None` issues a token.
        final_error: Option<&'static str>,
    }

    async fn device(State(s): State<OAuthServer>) -> Json<serde_json::Value> {
        s.device_requests.fetch_add(1, Ordering::SeqCst);
        Json(json!({
            "device_code": "dc-1",
            "user_code": "WDJB-MJHT",
            "verification_uri": "https://example.com/device",
            "expires_in": 900,
            "interval": 1
        }))
    }

    async fn token(
        State(s): State<OAuthServer>,
        Form(form): Form<HashMap<String, String>>,
    ) -> (axum::http::StatusCode, Json<serde_json::Value>) {
        assert_eq!(form.get("grant_type").map(String::as_str), Some(DEVICE_CODE_GRANT));
        let n = s.polls.fetch_add(1, Ordering::SeqCst);
        if n < s.transient_polls {
            return (
                axum::http::StatusCode::SERVICE_UNAVAILABLE,
                Json(json!("upstream busy")),
            );
        }
        if n - s.transient_polls < s.pending_polls {
            return (
                axum::http::StatusCode::BAD_REQUEST,
                Json(json!({ "error": "authorization_pending" })),
            );
        }
        match s.final_error {
            Some(code) => (
                axum::http::StatusCode::BAD_REQUEST,
                Json(json!({ "error": code })),
            ),
            None => (
                axum::http::StatusCode::OK,
                Json(json!({
                    "access_token": "device-at",
                    "token_type": "bearer",
                    "refresh_token": "device-rt",
                    "expires_in": 3600
                })),
            ),
        }
    }

    async fn start(state: OAuthServer) -> MockServer {
        let app = Router::new()
            .route("/device", post(device))
            .route("/token", post(token))
            .with_state(state);
        MockServer::start(app).await
    }

    fn config(server: &MockServer) -> AuthConfig {
        AuthConfig::new(
            AuthType::OAuth2DeviceFlow,
            json!({
                "deviceAuthorizationUrl": server.url("/device"),
                "tokenUrl": server.url("/token"),
                "clientId": "cid",
                "scopes": ["repo", "read:user"]
            }),
        )
    }

    #[tokio::test]
    async fn concurrent_authenticate_shares_one_device_code() {
        let state = OAuthServer {
            pending_polls: usize::MAX,
            ..OAuthServer::default()
        };
        let server = start(state.clone()).await;
        let shutdown = CancellationToken::new();
        let strategy = Arc::new(OAuth2DeviceFlowStrategy::new(
            reqwest::Client::new(),
            TokenStore::in_memory(),
            shutdown.clone(),
        ));
        let config = config(&server);
        let ctx = TenantContext::new("tenant", "github");

        let (a, b) = tokio::join!(
            strategy.authenticate(&ctx, &config),
            strategy.authenticate(&ctx, &config)
        );
        let (AuthOutcome::Pending(a), AuthOutcome::Pending(b)) =
            (a.expect("first"), b.expect("second"))
        else {
            panic!("expected pending signals");
        };
        assert_eq!(a, b);
        assert_eq!(a.user_code, "WDJB-MJHT");
        assert_eq!(state.device_requests.load(Ordering::SeqCst), 1);
        assert_eq!(strategy.pending_count(), 1);

        shutdown.cancel();
        wait_until(Duration::from_secs(2), || {
            let strategy = strategy.clone();
            async move { strategy.pending_count() == 0 }
        })
        .await
        .expect("poller stops on shutdown");
    }

    #[tokio::test]
    async fn poller_stores_token_after_approval() {
        let state = OAuthServer {
            pending_polls: 1,
            ..OAuthServer::default()
        };
        let server = start(state.clone()).await;
        let tokens = TokenStore::in_memory();
        let strategy = OAuth2DeviceFlowStrategy::new(
            reqwest::Client::new(),
            tokens.clone(),
            CancellationToken::new(),
        );
        let ctx = TenantContext::new("tenant", "github");

        let outcome = strategy
            .authenticate(&ctx, &config(&server))
            .await
            .expect("authenticate");
        assert!(matches!(outcome, AuthOutcome::Pending(_)));

        let key = ctx.key();
        wait_until(Duration::from_secs(5), || {
            let tokens = tokens.clone();
            let key = key.clone();
            async move { tokens.cached(&key).is_some() }
        })
        .await
        .expect("token stored by poller");

        let stored = tokens.cached(&key).expect("token");
        assert_eq!(stored.access_token, "device-at");
        assert_eq!(stored.metadata("client_id"), Some("cid"));
        assert_eq!(stored.metadata("token_url"), Some(server.url("/token").as_str()));
        assert_eq!(state.polls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn declined_authorization_releases_the_identity() {
        let state = OAuthServer {
            final_error: Some("access_denied"),
            ..OAuthServer::default()
        };
        let server = start(state.clone()).await;
        let tokens = TokenStore::in_memory();
        let strategy = Arc::new(OAuth2DeviceFlowStrategy::new(
            reqwest::Client::new(),
            tokens.clone(),
            CancellationToken::new(),
        ));
        let ctx = TenantContext::new("tenant", "github");
        let config = config(&server);

        strategy.authenticate(&ctx, &config).await.expect("authenticate");
        wait_until(Duration::from_secs(5), || {
            let strategy = strategy.clone();
            async move { strategy.pending_count() == 0 }
        })
        .await
        .expect("poller terminates");
        assert!(tokens.is_empty());

        // A new attempt issues a fresh device code.
        strategy.authenticate(&ctx, &config).await.expect("retry");
        assert_eq!(state.device_requests.load(Ordering::SeqCst), 2);
    }

    fn poller_for(server: &MockServer, tokens: TokenStore) -> Poller {
        let key = TokenKey::new("tenant", "github");
        let pending = Arc::new(PendingCodes::default());
        Poller {
            http: reqwest::Client::new(),
            tokens,
            slot: pending.slot(&key),
            pending,
            key,
            device_code: "dc-1".to_string(),
            client: OAuthClientConfig {
                token_url: Some(server.url("/token")),
                client_id: Some("cid".to_string()),
                ..OAuthClientConfig::default()
            },
            interval: Duration::from_secs(1),
            lifetime: Duration::from_secs(60),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn slow_down_widens_the_poll_interval() {
        let server = start(OAuthServer {
            final_error: Some("slow_down"),
            ..OAuthServer::default()
        })
        .await;
        let mut poller = poller_for(&server, TokenStore::in_memory());

        assert!(matches!(poller.poll_once().await, PollStep::Continue));
        assert_eq!(poller.interval, Duration::from_secs(6));
        assert!(matches!(poller.poll_once().await, PollStep::Continue));
        assert_eq!(poller.interval, Duration::from_secs(11));
    }

    #[tokio::test]
    async fn expired_device_code_ends_polling() {
        let server = start(OAuthServer {
            final_error: Some("expired_token"),
            ..OAuthServer::default()
        })
        .await;
        let tokens = TokenStore::in_memory();
        let mut poller = poller_for(&server, tokens.clone());

        assert!(matches!(poller.poll_once().await, PollStep::Done));
        assert!(tokens.is_empty());
    }

    #[tokio::test]
    async fn transient_poll_failures_keep_polling() {
        let state = OAuthServer {
            transient_polls: 1,
            ..OAuthServer::default()
        };
        let server = start(state.clone()).await;
        let tokens = TokenStore::in_memory();
        let mut poller = poller_for(&server, tokens.clone());

        assert!(matches!(poller.poll_once().await, PollStep::Continue));
        assert!(tokens.is_empty());
        assert_eq!(state.polls.load(Ordering::SeqCst), 1);
        assert!(matches!(poller.poll_once().await, PollStep::Done));
        assert_eq!(
            tokens.cached(&poller.key).map(|t| t.access_token),
            Some("device-at".to_string())
        );

        let mut unreachable = poller_for(&server, tokens);
        unreachable.client.token_url = Some("http://127.0.0.1:9/token".to_string());
        assert!(matches!(unreachable.poll_once().await, PollStep::Continue));
    }

    #[tokio::test]
    async fn local_poll_cap_ends_the_poller() {
        let state = OAuthServer {
            pending_polls: usize::MAX,
            ..OAuthServer::default()
        };
        let server = start(state.clone()).await;
        let tokens = TokenStore::in_memory();
        let strategy = Arc::new(
            OAuth2DeviceFlowStrategy::new(
                reqwest::Client::new(),
                tokens.clone(),
                CancellationToken::new(),
            )
            .with_max_poll_duration(Duration::from_millis(1500)),
        );
        let ctx = TenantContext::new("tenant", "github");

        let AuthOutcome::Pending(signal) = strategy
            .authenticate(&ctx, &config(&server))
            .await
            .expect("authenticate")
        else {
            panic!("expected pending signal");
        };
        assert!(signal.expires_at <= Utc::now() + chrono::Duration::seconds(2));
        assert_eq!(strategy.pending_count(), 1);

        wait_until(Duration::from_secs(5), || {
            let strategy = strategy.clone();
            async move { strategy.pending_count() == 0 }
        })
        .await
        .expect("poller gives up at the local cap");
        assert!(tokens.is_empty());
        assert!(state.polls.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn config_requires_endpoints_and_client() {
        let strategy = OAuth2DeviceFlowStrategy::new(
            reqwest::Client::new(),
            TokenStore::in_memory(),
            CancellationToken::new(),
        );
        let missing = AuthConfig::new(
            AuthType::OAuth2DeviceFlow,
            json!({ "deviceAuthorizationUrl": "https://a/device", "tokenUrl": "https://a/token" }),
        );
        assert!(matches!(
            strategy.validate_config(&missing),
            Err(AuthError::Config(_))
        ));
    }
}
