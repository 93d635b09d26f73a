use anyhow::Context as _;
use apiwire_auth::{AuthManagerOptions, MultiTenantAuthManager, TenantContext, TokenStore};
use apiwire_http_tools::{
    ApiDescription, HttpTransport, OperationError, OperationExecutor, TransportOptions,
};
use apiwire_resilience::CallError;
use apiwire_test_support::MockServer;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn executor(description: Value) -> anyhow::Result<OperationExecutor> {
    let description = ApiDescription::from_json_str(&description.to_string())?;
    let transport = HttpTransport::new(TransportOptions::default())?;
    let auth = MultiTenantAuthManager::new(
        transport.client(),
        TokenStore::in_memory(),
        AuthManagerOptions::default(),
    );
    Ok(OperationExecutor::new(description, auth, transport)?)
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() -> anyhow::Result<()> {
    let hits = Arc::new(AtomicUsize::new(0));
    let seen_auth = Arc::new(parking_lot::Mutex::new(Vec::<Option<String>>::new()));

    let app = Router::new()
        .route(
            "/users/{login}",
            get(
                |State((hits, seen)): State<(Arc<AtomicUsize>, Arc<parking_lot::Mutex<Vec<Option<String>>>>)>,
                 Path(login): Path<String>,
                 headers: HeaderMap| async move {
                    seen.lock().push(bearer(&headers));
                    if hits.fetch_add(1, Ordering::SeqCst) < 2 {
                        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "boom"})));
                    }
                    (StatusCode::OK, Json(json!({"login": login})))
                },
            ),
        )
        .with_state((hits.clone(), seen_auth.clone()));
    let server = MockServer::start(app).await;

    let executor = executor(json!({
        "services": { "github": {
            "baseUrl": server.base_url(),
            "auth": { "type": "bearer", "config": { "token": "static-token" } },
            "retry": { "maxAttempts": 3, "baseDelay": "10ms", "jitter": false },
            "operations": { "getUser": { "path": "/users/{login}" } }
        } }
    }))?;

    let ctx = TenantContext::from_secret("tenant-a", "github");
    let response = executor
        .call(&ctx, "getUser", &json!({"login": "octocat"}), &CancellationToken::new())
        .await
        .context("call getUser")?;

    assert_eq!(response.status, 200);
    assert_eq!(response.body, json!({"login": "octocat"}));
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert!(
        seen_auth
            .lock()
            .iter()
            .all(|h| h.as_deref() == Some("Bearer static-token"))
    );

    let metrics = executor.retry_metrics();
    assert_eq!(metrics["github"].attempts, 3);
    assert_eq!(metrics["github"].retries, 2);
    Ok(())
}

#[tokio::test]
async fn client_errors_are_not_retried() -> anyhow::Result<()> {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route(
            "/items",
            post(|State(hits): State<Arc<AtomicUsize>>, Json(_body): Json<Value>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                (StatusCode::BAD_REQUEST, "name is required")
            }),
        )
        .with_state(hits.clone());
    let server = MockServer::start(app).await;

    let executor = executor(json!({
        "services": { "shop": {
            "baseUrl": server.base_url(),
            "retry": { "maxAttempts": 5, "baseDelay": "10ms" },
            "operations": { "createItem": { "method": "POST", "path": "/items" } }
        } }
    }))?;

    let err = executor
        .call(
            &TenantContext::new("t", "shop"),
            "createItem",
            &json!({"price": 3}),
            &CancellationToken::new(),
        )
        .await
        .expect_err("400 is terminal");

    assert_eq!(err.status(), Some(400));
    assert!(err.to_string().contains("name is required"));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    Ok(())
}

#[derive(Clone, Default)]
struct SessionApi {
    logins: Arc<AtomicUsize>,
    api_calls: Arc<AtomicUsize>,
}

async fn login(State(s): State<SessionApi>, Json(body): Json<Value>) -> Json<Value> {
    assert_eq!(body["username"], "svc");
    let n = s.logins.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({ "data": { "token": format!("session-{n}") } }))
}

async fn profile(State(s): State<SessionApi>, headers: HeaderMap) -> (StatusCode, Json<Value>) {
    s.api_calls.fetch_add(1, Ordering::SeqCst);
    match bearer(&headers).as_deref() {
        Some("Bearer session-1") => (StatusCode::UNAUTHORIZED, Json(json!({"error": "expired session"}))),
        Some(other) => (StatusCode::OK, Json(json!({ "auth": other }))),
        None => (StatusCode::UNAUTHORIZED, Json(json!({"error": "missing"}))),
    }
}

fn session_description(server: &MockServer, retry_on_invalidation: bool) -> Value {
    json!({
        "services": { "crm": {
            "baseUrl": server.base_url(),
            "auth": {
                "type": "session_jwt",
                "config": {
                    "loginUrl": server.url("/login"),
                    "credentials": { "username": "svc", "password": "pw" },
                    "tokenPath": "data.token"
                },
                "tokenInvalidation": {
                    "statusCodes": [401],
                    "retryOnInvalidation": retry_on_invalidation,
                    "retryDelay": "10ms"
                }
            },
            "retry": { "maxAttempts": 3, "baseDelay": "10ms" },
            "operations": { "me": { "path": "/me" } }
        } }
    })
}

#[tokio::test]
async fn rejected_credential_is_evicted_and_call_retried_once() -> anyhow::Result<()> {
    let state = SessionApi::default();
    let app = Router::new()
        .route("/login", post(login))
        .route("/me", get(profile))
        .with_state(state.clone());
    let server = MockServer::start(app).await;
    let executor = executor(session_description(&server, true))?;
    let ctx = TenantContext::new("tenant-hash", "crm");

    let response = executor
        .call(&ctx, "me", &Value::Null, &CancellationToken::new())
        .await
        .context("call after re-authentication")?;

    assert_eq!(response.body, json!({"auth": "Bearer session-2"}));
    assert_eq!(state.logins.load(Ordering::SeqCst), 2);
    assert_eq!(state.api_calls.load(Ordering::SeqCst), 2);

    let cached = executor
        .auth_manager()
        .token_store()
        .cached(&ctx.key())
        .context("fresh token cached")?;
    assert_eq!(cached.access_token, "session-2");
    Ok(())
}

#[tokio::test]
async fn invalidation_without_retry_evicts_and_fails() -> anyhow::Result<()> {
    let state = SessionApi::default();
    let app = Router::new()
        .route("/login", post(login))
        .route("/me", get(profile))
        .with_state(state.clone());
    let server = MockServer::start(app).await;
    let executor = executor(session_description(&server, false))?;
    let ctx = TenantContext::new("tenant-hash", "crm");

    let err = executor
        .call(&ctx, "me", &Value::Null, &CancellationToken::new())
        .await
        .expect_err("401 surfaces");
    assert_eq!(err.status(), Some(401));
    assert!(!err.to_string().contains("expired session"));
    assert!(executor.auth_manager().token_store().cached(&ctx.key()).is_none());
    assert_eq!(state.api_calls.load(Ordering::SeqCst), 1);

    // The evicted token is never handed out again.
    let response = executor
        .call(&ctx, "me", &Value::Null, &CancellationToken::new())
        .await?;
    assert_eq!(response.body, json!({"auth": "Bearer session-2"}));
    Ok(())
}

#[tokio::test]
async fn breaker_opens_and_rejects_without_calling_upstream() -> anyhow::Result<()> {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route(
            "/health",
            get(|State(hits): State<Arc<AtomicUsize>>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                StatusCode::SERVICE_UNAVAILABLE
            }),
        )
        .with_state(hits.clone());
    let server = MockServer::start(app).await;

    let executor = executor(json!({
        "services": { "flaky": {
            "baseUrl": server.base_url(),
            "retry": { "enabled": false },
            "circuitBreaker": { "failureThreshold": 2, "resetTimeout": "1h" },
            "operations": { "health": { "path": "/health" } }
        } }
    }))?;
    let ctx = TenantContext::new("t", "flaky");
    let cancel = CancellationToken::new();

    for _ in 0..2 {
        let err = executor
            .call(&ctx, "health", &Value::Null, &cancel)
            .await
            .expect_err("503");
        assert_eq!(err.status(), Some(503));
    }

    let err = executor
        .call(&ctx, "health", &Value::Null, &cancel)
        .await
        .expect_err("breaker open");
    assert!(matches!(err, OperationError::Call(ref e) if e.is_circuit_open()));
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    let metrics = executor.circuit_breaker_metrics();
    assert_eq!(metrics["flaky"].total_rejections, 1);
    Ok(())
}

#[tokio::test]
async fn cancellation_interrupts_retry_wait() -> anyhow::Result<()> {
    let app = Router::new().route("/slow", get(|| async { StatusCode::BAD_GATEWAY }));
    let server = MockServer::start(app).await;

    let executor = executor(json!({
        "services": { "s": {
            "baseUrl": server.base_url(),
            "retry": { "maxAttempts": 5, "baseDelay": "30s", "jitter": false },
            "operations": { "slow": { "path": "/slow" } }
        } }
    }))?;

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let err = tokio::time::timeout(
        Duration::from_secs(5),
        executor.call(&TenantContext::new("t", "s"), "slow", &Value::Null, &cancel),
    )
    .await
    .context("cancellation should end the call promptly")?
    .expect_err("cancelled");
    assert!(matches!(err, OperationError::Call(CallError::Cancelled)));
    Ok(())
}

#[derive(Clone, Default)]
struct DeviceProvider {
    device_requests: Arc<AtomicUsize>,
    polls: Arc<AtomicUsize>,
    api_calls: Arc<AtomicUsize>,
}

async fn device_code(State(s): State<DeviceProvider>) -> Json<Value> {
    s.device_requests.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "device_code": "dc-42",
        "user_code": "ABCD-EFGH",
        "verification_uri": "https://provider.example.com/activate",
        "expires_in": 600,
        "interval": 1
    }))
}

async fn device_token(
    State(s): State<DeviceProvider>,
    Form(form): Form<HashMap<String, String>>,
) -> (StatusCode, Json<Value>) {
    assert_eq!(form.get("device_code").map(String::as_str), Some("dc-42"));
    if s.polls.fetch_add(1, Ordering::SeqCst) == 0 {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "authorization_pending"})));
    }
    (
        StatusCode::OK,
        Json(json!({"access_token": "device-token", "token_type": "Bearer", "expires_in": 3600})),
    )
}

async fn repos(State(s): State<DeviceProvider>, headers: HeaderMap) -> (StatusCode, Json<Value>) {
    s.api_calls.fetch_add(1, Ordering::SeqCst);
    if bearer(&headers).as_deref() == Some("Bearer device-token") {
        (StatusCode::OK, Json(json!([{"name": "apiwire"}])))
    } else {
        (StatusCode::UNAUTHORIZED, Json(json!({})))
    }
}

#[tokio::test]
async fn device_flow_pending_is_surfaced_then_completes() -> anyhow::Result<()> {
    let state = DeviceProvider::default();
    let app = Router::new()
        .route("/device/code", post(device_code))
        .route("/oauth/token", post(device_token))
        .route("/user/repos", get(repos))
        .with_state(state.clone());
    let server = MockServer::start(app).await;

    let executor = executor(json!({
        "services": { "github": {
            "baseUrl": server.base_url(),
            "auth": {
                "type": "oauth2_device_flow",
                "config": {
                    "deviceAuthorizationUrl": server.url("/device/code"),
                    "tokenUrl": server.url("/oauth/token"),
                    "clientId": "apiwire-cli",
                    "scopes": ["repo"]
                }
            },
            "operations": { "listRepos": { "path": "/user/repos" } }
        } }
    }))?;
    let ctx = TenantContext::from_secret("tenant-secret", "github");
    let cancel = CancellationToken::new();

    let err = executor
        .call(&ctx, "listRepos", &Value::Null, &cancel)
        .await
        .expect_err("authorization pending");
    assert!(err.is_device_code_pending());
    let OperationError::Auth(apiwire_auth::AuthError::DeviceCodePending(pending)) = &err else {
        anyhow::bail!("unexpected error: {err}");
    };
    assert_eq!(pending.user_code, "ABCD-EFGH");
    assert!(pending.instructions().contains("https://provider.example.com/activate"));

    // A second call while the user hasn't approved yet reuses the same code.
    let again = executor
        .call(&ctx, "listRepos", &Value::Null, &cancel)
        .await
        .expect_err("still pending");
    assert!(again.is_device_code_pending());
    assert_eq!(state.device_requests.load(Ordering::SeqCst), 1);
    assert_eq!(state.api_calls.load(Ordering::SeqCst), 0);

    let store = executor.auth_manager().token_store().clone();
    let key = ctx.key();
    apiwire_test_support::wait_until(Duration::from_secs(10), move || {
        let store = store.clone();
        let key = key.clone();
        async move { store.cached(&key).is_some() }
    })
    .await?;

    let response = executor.call(&ctx, "listRepos", &Value::Null, &cancel).await?;
    assert_eq!(response.body, json!([{"name": "apiwire"}]));
    assert_eq!(state.api_calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn oversized_and_slow_responses_fail() -> anyhow::Result<()> {
    let app = Router::new()
        .route("/big", get(|| async { "x".repeat(4096) }))
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );
    let server = MockServer::start(app).await;

    let executor = executor(json!({
        "services": { "s": {
            "baseUrl": server.base_url(),
            "timeout": "100ms",
            "retry": { "enabled": false },
            "operations": {
                "big": { "path": "/big" },
                "slow": { "path": "/slow" }
            }
        } }
    }))?
    .with_max_response_bytes(Some(1024));
    let ctx = TenantContext::new("t", "s");
    let cancel = CancellationToken::new();

    let err = executor
        .call(&ctx, "big", &Value::Null, &cancel)
        .await
        .expect_err("body over the limit");
    assert!(matches!(err, OperationError::ResponseTooLarge(_)));

    let err = executor
        .call(&ctx, "slow", &Value::Null, &cancel)
        .await
        .expect_err("request timeout");
    assert!(matches!(err, OperationError::Call(CallError::Network(_))));
    Ok(())
}

#[tokio::test]
async fn timed_out_attempt_is_retried_inside_breaker_budget() -> anyhow::Result<()> {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route(
            "/report",
            get(|State(hits): State<Arc<AtomicUsize>>| async move {
                if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Json(json!({"ready": true}))
            }),
        )
        .with_state(hits.clone());
    let server = MockServer::start(app).await;

    // Request timeout and breaker timeout are equal, as with the defaults.
    let executor = executor(json!({
        "services": { "reports": {
            "baseUrl": server.base_url(),
            "timeout": "300ms",
            "retry": { "maxAttempts": 3, "baseDelay": "10ms", "jitter": false },
            "circuitBreaker": { "timeout": "300ms" },
            "operations": { "latest": { "path": "/report" } }
        } }
    }))?;

    let response = executor
        .call(
            &TenantContext::new("t", "reports"),
            "latest",
            &Value::Null,
            &CancellationToken::new(),
        )
        .await
        .context("second attempt answers in time")?;

    assert_eq!(response.body, json!({"ready": true}));
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(executor.retry_metrics()["reports"].retries, 1);
    let breaker = &executor.circuit_breaker_metrics()["reports"];
    assert_eq!(breaker.total_calls, 1);
    assert_eq!(breaker.total_failures, 0);
    Ok(())
}
