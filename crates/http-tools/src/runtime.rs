//! Runtime for executing declared operations.
//!
//! One call is `auth → CircuitBreaker(RetryExecutor(request))`, with the breaker's timeout
//! bounding each attempt rather than the whole retry loop. When the upstream answers with a
//! status in the service's invalidation policy, the cached credential is evicted and, unless the
//! policy says otherwise, the call is repeated once with a fresh credential.

use crate::config::{ApiDescription, OperationConfig, ParamLocation, ServiceConfig};
use crate::transport::HttpTransport;
use apiwire_auth::{AuthConfig, AuthError, MultiTenantAuthManager, TenantContext};
use apiwire_resilience::redact::{redact_url, sanitize_reqwest_error};
use apiwire_resilience::{
    CallError, CircuitBreaker, CircuitBreakerMetrics, CircuitBreakerRegistry, RetryExecutor,
    RetryMetrics, RetryMetricsSnapshot,
};
use base64::Engine as _;
use mime::Mime;
use reqwest::Method;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum OperationError {
    #[error("config error: {0}")]
    Config(String),
    #[error("unknown service '{0}'")]
    UnknownService(String),
    #[error("unknown operation '{operation}' for service '{service}'")]
    UnknownOperation { service: String, operation: String },
    #[error("missing required argument '{0}'")]
    MissingArgument(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Call(#[from] CallError),
    #[error("response too large: {0}")]
    ResponseTooLarge(String),
    #[error("http transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, OperationError>;

impl From<reqwest::Error> for OperationError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport(sanitize_reqwest_error(&value))
    }
}

impl OperationError {
    /// Authorization is waiting on the user (device flow); not a failure.
    #[must_use]
    pub fn is_device_code_pending(&self) -> bool {
        matches!(self, Self::Auth(e) if e.is_device_code_pending())
    }

    /// Upstream HTTP status, when the failure came from one.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Call(e) => e.status(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationResponse {
    pub status: u16,
    /// JSON bodies are parsed; other UTF-8 is a string; binary is `{encoding, mimeType, data}`.
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueryPair {
    key: String,
    value: String,
}

#[derive(Debug, Default)]
struct RequestParts {
    path: String,
    query_params: Vec<QueryPair>,
    headers: Vec<(String, String)>,
    body_fields: Map<String, Value>,
    body_payload: Option<Value>,
}

/// Everything one attempt needs, resolved once per call.
struct PreparedCall<'a> {
    service_name: &'a str,
    operation: &'a str,
    service: &'a ServiceConfig,
    op: &'a OperationConfig,
    method: Method,
    url: Url,
    parts: RequestParts,
    retry: RetryExecutor,
    breaker: Arc<CircuitBreaker>,
}

pub struct OperationExecutor {
    description: ApiDescription,
    auth: MultiTenantAuthManager,
    transport: HttpTransport,
    breakers: CircuitBreakerRegistry,
    retry_metrics: BTreeMap<String, Arc<RetryMetrics>>,
    default_timeout: Duration,
    max_response_bytes: Option<usize>,
}

impl OperationExecutor {
    /// # Errors
    ///
    /// Returns [`OperationError::Config`] if the description or any service's auth block is
    /// invalid.
    pub fn new(
        description: ApiDescription,
        auth: MultiTenantAuthManager,
        transport: HttpTransport,
    ) -> Result<Self> {
        description.validate()?;
        for (name, service) in &description.services {
            if let Some(cfg) = &service.auth {
                auth.validate_config(cfg)
                    .map_err(|e| OperationError::Config(format!("service '{name}': {e}")))?;
            }
        }

        let retry_metrics = description
            .services
            .keys()
            .map(|name| (name.clone(), Arc::new(RetryMetrics::default())))
            .collect();

        Ok(Self {
            description,
            auth,
            transport,
            breakers: CircuitBreakerRegistry::new(),
            retry_metrics,
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_response_bytes: Some(DEFAULT_MAX_RESPONSE_BYTES),
        })
    }

    /// `None` reads bodies of any size.
    #[must_use]
    pub fn with_max_response_bytes(mut self, max: Option<usize>) -> Self {
        self.max_response_bytes = max;
        self
    }

    #[must_use]
    pub fn description(&self) -> &ApiDescription {
        &self.description
    }

    #[must_use]
    pub fn auth_manager(&self) -> &MultiTenantAuthManager {
        &self.auth
    }

    #[must_use]
    pub fn circuit_breaker_metrics(&self) -> BTreeMap<String, CircuitBreakerMetrics> {
        self.breakers.metrics()
    }

    #[must_use]
    pub fn retry_metrics(&self) -> BTreeMap<String, RetryMetricsSnapshot> {
        self.retry_metrics
            .iter()
            .map(|(name, m)| (name.clone(), m.snapshot()))
            .collect()
    }

    /// Run `operation` of `ctx.service_name` on behalf of the tenant in `ctx`.
    ///
    /// # Errors
    ///
    /// - [`OperationError::Auth`] when no credential can be obtained, including the
    ///   device-flow pending signal (see [`OperationError::is_device_code_pending`]);
    /// - [`OperationError::Call`] for upstream, network, breaker and cancellation failures;
    /// - argument and lookup errors before anything is sent.
    pub async fn call(
        &self,
        ctx: &TenantContext,
        operation: &str,
        args: &Value,
        cancel: &CancellationToken,
    ) -> Result<OperationResponse> {
        let prepared = self.prepare(&ctx.service_name, operation, args)?;
        debug!(
            service = %prepared.service_name,
            operation = %prepared.operation,
            method = %prepared.method,
            url = %redact_url(&prepared.url),
            "calling operation"
        );

        match self.attempt(ctx, &prepared, cancel).await {
            Err(OperationError::Call(e)) => {
                let Some(auth) = prepared.service.auth.as_ref() else {
                    return Err(e.into());
                };
                let Some(status) = e.status().filter(|s| self.auth.should_invalidate(auth, *s))
                else {
                    return Err(e.into());
                };
                self.retry_after_invalidation(ctx, &prepared, auth, status, e, cancel)
                    .await
            }
            other => other,
        }
    }

    async fn retry_after_invalidation(
        &self,
        ctx: &TenantContext,
        prepared: &PreparedCall<'_>,
        auth: &AuthConfig,
        status: u16,
        original: CallError,
        cancel: &CancellationToken,
    ) -> Result<OperationResponse> {
        info!(
            service = %prepared.service_name,
            tenant = %ctx.tenant_hash,
            status,
            "upstream rejected credential; evicting cached token"
        );
        self.auth.invalidate_token(ctx).await?;

        if !auth.token_invalidation.retry_on_invalidation {
            return Err(original.into());
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(CallError::Cancelled.into()),
            () = tokio::time::sleep(auth.token_invalidation.effective_retry_delay()) => {}
        }
        debug!(service = %prepared.service_name, "retrying with a fresh credential");
        self.attempt(ctx, prepared, cancel).await
    }

    fn prepare<'a>(
        &'a self,
        service_name: &'a str,
        operation: &'a str,
        args: &Value,
    ) -> Result<PreparedCall<'a>> {
        let service = self
            .description
            .services
            .get(service_name)
            .ok_or_else(|| OperationError::UnknownService(service_name.to_string()))?;
        let op = service.operations.get(operation).ok_or_else(|| {
            OperationError::UnknownOperation {
                service: service_name.to_string(),
                operation: operation.to_string(),
            }
        })?;
        let method = op.http_method()?;
        let parts = build_request_parts(op, &method, args)?;
        let url = build_url(&service.base_url, &parts.path, &parts.query_params)?;

        let metrics = self
            .retry_metrics
            .get(service_name)
            .cloned()
            .unwrap_or_default();
        let breaker = self
            .breakers
            .get_or_create(service_name, &service.circuit_breaker_config(op));
        let retry = RetryExecutor::new(service.retry_config(op))
            .with_metrics(metrics)
            .with_attempt_timeout(breaker.attempt_timeout());

        Ok(PreparedCall {
            service_name,
            operation,
            service,
            op,
            method,
            url,
            parts,
            retry,
            breaker,
        })
    }

    async fn attempt(
        &self,
        ctx: &TenantContext,
        prepared: &PreparedCall<'_>,
        cancel: &CancellationToken,
    ) -> Result<OperationResponse> {
        let client = self.transport.client();
        let mut request = self.build_request(&client, prepared)?;
        if let Some(auth) = &prepared.service.auth {
            self.auth
                .apply_authentication(&mut request, ctx, auth)
                .await?;
        }

        let retry = &prepared.retry;
        let response = prepared
            .breaker
            .execute_attempts(|| retry.execute(cancel, &client, &request))
            .await?;
        self.read_response(response).await
    }

    fn build_request(
        &self,
        client: &reqwest::Client,
        prepared: &PreparedCall<'_>,
    ) -> Result<reqwest::Request> {
        let mut request = client.request(prepared.method.clone(), prepared.url.clone());
        request = apply_headers(prepared.service, prepared.op, request, &prepared.parts.headers);
        request = apply_body(
            request,
            prepared.parts.body_payload.as_ref(),
            &prepared.parts.body_fields,
        );
        let timeout = match prepared.service.timeout {
            Some(t) if t.is_zero() => None,
            Some(t) => Some(t),
            None => Some(self.default_timeout),
        };
        if let Some(t) = timeout {
            request = request.timeout(t);
        }
        request.build().map_err(|e| {
            OperationError::Config(format!(
                "cannot build request for {}.{}: {}",
                prepared.service_name,
                prepared.operation,
                sanitize_reqwest_error(&e)
            ))
        })
    }

    async fn read_response(&self, response: reqwest::Response) -> Result<OperationResponse> {
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(std::string::ToString::to_string);
        let bytes = read_response_body_limited_bytes(response, self.max_response_bytes).await?;
        Ok(OperationResponse {
            status,
            body: decode_body(&bytes, content_type.as_deref()),
        })
    }
}

async fn read_response_body_limited_bytes(
    mut response: reqwest::Response,
    max_bytes: Option<usize>,
) -> Result<Vec<u8>> {
    let Some(max) = max_bytes else {
        let bytes = response.bytes().await?;
        return Ok(bytes.to_vec());
    };

    if let Some(len) = response.content_length()
        && len > max as u64
    {
        return Err(OperationError::ResponseTooLarge(format!(
            "{len} bytes (limit {max})"
        )));
    }

    let mut out: Vec<u8> = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        if out.len().saturating_add(chunk.len()) > max {
            return Err(OperationError::ResponseTooLarge(format!(
                "exceeded {max} bytes"
            )));
        }
        out.extend_from_slice(&chunk);
    }

    Ok(out)
}

fn is_json_content_type(content_type: Option<&str>) -> bool {
    let Some(m) = content_type.and_then(|ct| ct.parse::<Mime>().ok()) else {
        return false;
    };
    m.subtype() == mime::JSON || m.suffix() == Some(mime::JSON)
}

fn decode_body(bytes: &[u8], content_type: Option<&str>) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    let Ok(text) = std::str::from_utf8(bytes) else {
        return json!({
            "encoding": "base64",
            "mimeType": content_type,
            "data": base64::engine::general_purpose::STANDARD.encode(bytes),
        });
    };
    if is_json_content_type(content_type)
        && let Ok(v) = serde_json::from_str(text)
    {
        return v;
    }
    Value::String(text.to_string())
}

fn build_request_parts(op: &OperationConfig, method: &Method, arguments: &Value) -> Result<RequestParts> {
    let args = match arguments {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            return Err(OperationError::InvalidArguments(format!(
                "expected a JSON object, got {other}"
            )));
        }
    };

    let mut path = op.path.clone();
    if !path.starts_with('/') {
        path = format!("/{path}");
    }
    let mut parts = RequestParts::default();

    for (arg_name, param) in &op.params {
        let wire = param.name.as_deref().unwrap_or(arg_name);
        let value = args.get(arg_name).cloned().or_else(|| param.default.clone());

        if param.is_required() && value.is_none() {
            return Err(OperationError::MissingArgument(arg_name.clone()));
        }

        let value = match value {
            Some(Value::Null) | None => continue,
            Some(v) => v,
        };

        match param.location {
            ParamLocation::Path => {
                path = path.replace(&format!("{{{wire}}}"), &encode_component(&value_to_string(&value)));
            }
            ParamLocation::Query => parts.query_params.extend(serialize_query_param(wire, &value)),
            ParamLocation::Header => parts.headers.push((wire.to_string(), value_to_string(&value))),
            ParamLocation::Body => {
                if arg_name == "body" && wire == "body" {
                    parts.body_payload = Some(value);
                } else {
                    parts.body_fields.insert(wire.to_string(), value);
                }
            }
        }
    }

    let declared: HashSet<&str> = op.params.keys().map(String::as_str).collect();
    let query_by_default = [Method::GET, Method::HEAD, Method::DELETE].contains(method);
    for (name, value) in &args {
        if declared.contains(name.as_str()) || value.is_null() {
            continue;
        }
        let placeholder = format!("{{{name}}}");
        if path.contains(&placeholder) {
            path = path.replace(&placeholder, &encode_component(&value_to_string(value)));
        } else if query_by_default {
            parts.query_params.extend(serialize_query_param(name, value));
        } else if name == "body" {
            parts.body_payload = Some(value.clone());
        } else {
            parts.body_fields.insert(name.clone(), value.clone());
        }
    }

    if let Some(missing) = unfilled_placeholder(&path) {
        return Err(OperationError::MissingArgument(missing.to_string()));
    }
    parts.path = path;
    Ok(parts)
}

fn unfilled_placeholder(path: &str) -> Option<&str> {
    let start = path.find('{')?;
    let len = path[start + 1..].find('}')?;
    Some(&path[start + 1..start + 1 + len])
}

/// Arrays repeat the key (`tag=a&tag=b`); objects are sent as JSON.
fn serialize_query_param(name: &str, value: &Value) -> Vec<QueryPair> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter(|v| !v.is_null())
            .map(|v| QueryPair {
                key: name.to_string(),
                value: value_to_string(v),
            })
            .collect(),
        other => vec![QueryPair {
            key: name.to_string(),
            value: value_to_string(other),
        }],
    }
}

fn build_url(base_url: &str, path: &str, query_params: &[QueryPair]) -> Result<Url> {
    let url = format!("{}{}", base_url.trim_end_matches('/'), path);
    let mut url =
        Url::parse(&url).map_err(|e| OperationError::Config(format!("invalid URL: {e}")))?;

    if !query_params.is_empty() {
        let mut query = String::new();
        for (i, p) in query_params.iter().enumerate() {
            if i > 0 {
                query.push('&');
            }
            query.push_str(&encode_component(&p.key));
            query.push('=');
            query.push_str(&encode_component(&p.value));
        }
        url.set_query(Some(&query));
    }

    Ok(url)
}

fn apply_headers(
    service: &ServiceConfig,
    op: &OperationConfig,
    mut request: reqwest::RequestBuilder,
    headers: &[(String, String)],
) -> reqwest::RequestBuilder {
    for (key, value) in service.headers.iter().chain(op.headers.iter()) {
        request = request.header(key, value);
    }
    for (key, value) in headers {
        request = request.header(key, value);
    }
    request
}

fn apply_body(
    mut request: reqwest::RequestBuilder,
    body_payload: Option<&Value>,
    body_fields: &Map<String, Value>,
) -> reqwest::RequestBuilder {
    if let Some(payload) = body_payload {
        request = request.json(payload);
    } else if !body_fields.is_empty() {
        request = request.json(body_fields);
    }
    request
}

fn encode_component(s: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        if is_unreserved(b) {
            out.push(b as char);
        } else {
            out.push('%');
            out.push(HEX[(b >> 4) as usize] as char);
            out.push(HEX[(b & 0x0F) as usize] as char);
        }
    }
    out
}

fn is_unreserved(b: u8) -> bool {
    matches!(b, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~')
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        _ => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParamConfig;

    fn op(method: &str, path: &str, params: Vec<(&str, ParamConfig)>) -> OperationConfig {
        OperationConfig {
            method: method.to_string(),
            path: path.to_string(),
            description: None,
            headers: BTreeMap::new(),
            params: params
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            retry: None,
            circuit_breaker: None,
        }
    }

    fn param(location: ParamLocation, name: Option<&str>) -> ParamConfig {
        ParamConfig {
            location,
            name: name.map(str::to_string),
            required: None,
            default: None,
        }
    }

    #[test]
    fn declared_params_go_where_configured() {
        let op = op(
            "POST",
            "/repos/{owner}/issues",
            vec![
                ("owner", param(ParamLocation::Path, None)),
                ("trace", param(ParamLocation::Header, Some("x-trace-id"))),
                ("labels", param(ParamLocation::Query, Some("label"))),
                ("title", param(ParamLocation::Body, None)),
            ],
        );
        let parts = build_request_parts(
            &op,
            &Method::POST,
            &json!({
                "owner": "a b/c",
                "trace": "t-1",
                "labels": ["bug", "p1"],
                "title": "Broken",
                "extra": 3
            }),
        )
        .expect("parts");

        assert_eq!(parts.path, "/repos/a%20b%2Fc/issues");
        assert_eq!(parts.headers, vec![("x-trace-id".to_string(), "t-1".to_string())]);
        assert_eq!(
            parts.query_params,
            vec![
                QueryPair { key: "label".into(), value: "bug".into() },
                QueryPair { key: "label".into(), value: "p1".into() },
            ]
        );
        assert_eq!(parts.body_fields.get("title"), Some(&json!("Broken")));
        assert_eq!(parts.body_fields.get("extra"), Some(&json!(3)));
    }

    #[test]
    fn undeclared_args_fill_path_then_query_for_get() {
        let op = op("GET", "users/{login}", vec![]);
        let parts = build_request_parts(&op, &Method::GET, &json!({"login": "octo", "per_page": 5}))
            .expect("parts");
        assert_eq!(parts.path, "/users/octo");
        assert_eq!(
            parts.query_params,
            vec![QueryPair { key: "per_page".into(), value: "5".into() }]
        );
        assert!(parts.body_fields.is_empty());
    }

    #[test]
    fn missing_path_values_are_reported() {
        let declared = op("GET", "/users/{login}", vec![("login", param(ParamLocation::Path, None))]);
        assert!(matches!(
            build_request_parts(&declared, &Method::GET, &json!({})),
            Err(OperationError::MissingArgument(name)) if name == "login"
        ));

        let implicit = op("GET", "/users/{login}", vec![]);
        assert!(matches!(
            build_request_parts(&implicit, &Method::GET, &Value::Null),
            Err(OperationError::MissingArgument(name)) if name == "login"
        ));

        assert!(matches!(
            build_request_parts(&implicit, &Method::GET, &json!([1])),
            Err(OperationError::InvalidArguments(_))
        ));
    }

    #[test]
    fn defaults_fill_absent_arguments() {
        let mut p = param(ParamLocation::Query, None);
        p.default = Some(json!(30));
        let op = op("GET", "/items", vec![("limit", p)]);
        let parts = build_request_parts(&op, &Method::GET, &json!({})).expect("parts");
        let url = build_url("https://api.example.com/v1/", &parts.path, &parts.query_params)
            .expect("url");
        assert_eq!(url.as_str(), "https://api.example.com/v1/items?limit=30");
    }

    #[test]
    fn bodies_decode_by_content_type() {
        assert_eq!(decode_body(b"", None), Value::Null);
        assert_eq!(
            decode_body(br#"{"a":1}"#, Some("application/json; charset=utf-8")),
            json!({"a": 1})
        );
        assert_eq!(
            decode_body(br#"{"a":1}"#, Some("application/problem+json")),
            json!({"a": 1})
        );
        assert_eq!(decode_body(b"{not json", Some("application/json")), json!("{not json"));
        assert_eq!(decode_body(b"plain", Some("text/plain")), json!("plain"));

        let binary = decode_body(&[0xff, 0xfe, 0x00], Some("application/octet-stream"));
        assert_eq!(binary["encoding"], "base64");
        assert_eq!(binary["mimeType"], "application/octet-stream");
    }
}
