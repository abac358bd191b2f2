//! API middleware for request tracing, logging, authentication and rate
//! limiting.

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header::HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn, Span};
use uuid::Uuid;

use crate::error::Error;
use crate::metrics;
use crate::resilience::{RateLimitDecision, RateLimiter};

// ============================================================================
// Request ID Middleware
// ============================================================================

/// Header name for request ID.
pub static REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Middleware that ensures every request has a unique request ID.
///
/// If the incoming request has an `X-Request-ID` header and
/// `WFG_TRUST_REQUEST_ID=true`, it is preserved. Otherwise a new UUID is
/// generated. The request ID is added to the response headers and recorded
/// in the tracing span for log correlation.
pub async fn request_id_middleware(mut request: Request<Body>, next: Next) -> Response {
    let trust_incoming = std::env::var("WFG_TRUST_REQUEST_ID")
        .map(|v| v.to_lowercase() == "true")
        .unwrap_or(false);

    let request_id = if trust_incoming {
        request
            .headers()
            .get(&REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    } else {
        Uuid::new_v4().to_string()
    };

    Span::current().record("request_id", request_id.as_str());
    request
        .extensions_mut()
        .insert(RequestId(request_id.clone()));

    let mut response = next.run(request).await;

    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(REQUEST_ID_HEADER.clone(), header_value);
    }

    response
}

/// Request ID extension for extracting in handlers.
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

// ============================================================================
// Structured Access Logging Middleware
// ============================================================================

/// Middleware that logs each request/response in structured form.
///
/// Environment:
/// - WFG_ACCESS_LOG: Set to "false" to disable access logging (default: true)
pub async fn access_log_middleware(request: Request<Body>, next: Next) -> Response {
    let enabled = std::env::var("WFG_ACCESS_LOG")
        .map(|v| v.to_lowercase() != "false")
        .unwrap_or(true);

    if !enabled {
        return next.run(request).await;
    }

    let start = Instant::now();

    let method = request.method().clone();
    let uri = request.uri().clone();
    let path = uri.path().to_string();
    let query = uri.query().map(|q| q.to_string());

    let user_agent = request
        .headers()
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let client_ip = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string());

    let request_id = request.extensions().get::<RequestId>().map(|r| r.0.clone());

    let response = next.run(request).await;

    let duration_ms = start.elapsed().as_millis() as u64;
    let status = response.status().as_u16();

    info!(
        target: "workflowguard::access",
        method = %method,
        path = %path,
        query = ?query,
        status = status,
        duration_ms = duration_ms,
        request_id = ?request_id,
        user_agent = ?user_agent,
        client_ip = ?client_ip,
        "request completed"
    );

    response
}

// ============================================================================
// API Key Authentication Middleware
// ============================================================================

/// Configuration for API-wide authentication.
#[derive(Clone)]
pub struct ApiAuthConfig {
    /// API key required for API access. None means no auth required.
    pub api_key: Option<String>,
}

impl Default for ApiAuthConfig {
    fn default() -> Self {
        Self {
            api_key: std::env::var("WFG_API_KEY").ok().filter(|k| !k.is_empty()),
        }
    }
}

/// Public paths that bypass API authentication.
///
/// `/api/ws` authenticates with its own channel token (browsers cannot set
/// headers on WebSocket upgrades), and `/webhooks/*` carries an HMAC
/// signature instead.
const API_AUTH_PUBLIC_PATHS: &[&str] = &["/api/health", "/api/metrics", "/api/ws"];

/// Middleware that requires an API key for `/api/*` endpoints when
/// `WFG_API_KEY` is set.
///
/// Supported header formats:
/// - `Authorization: Bearer <api_key>`
/// - `Authorization: ApiKey <api_key>`
pub async fn api_auth_middleware(
    State(config): State<ApiAuthConfig>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let api_key = match &config.api_key {
        Some(key) => key,
        None => return next.run(request).await,
    };

    let path = request.uri().path();

    // Webhooks authenticate with their own signature
    if !path.starts_with("/api/") {
        return next.run(request).await;
    }

    if API_AUTH_PUBLIC_PATHS.iter().any(|p| path.starts_with(p)) {
        return next.run(request).await;
    }

    let auth_header = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let is_authorized = match auth_header {
        Some(header) => {
            let token = header
                .strip_prefix("Bearer ")
                .or_else(|| header.strip_prefix("ApiKey "))
                .unwrap_or("");

            // Constant-time comparison to prevent timing attacks
            use subtle::ConstantTimeEq;
            token.as_bytes().ct_eq(api_key.as_bytes()).into()
        }
        None => false,
    };

    if is_authorized {
        next.run(request).await
    } else {
        warn!(
            path = %path,
            "Unauthorized API access attempt"
        );
        (
            StatusCode::UNAUTHORIZED,
            [(axum::http::header::WWW_AUTHENTICATE, "Bearer")],
            "Unauthorized",
        )
            .into_response()
    }
}

// ============================================================================
// Rate Limit Middleware
// ============================================================================

/// Shared rate limiter state, carried explicitly rather than as a global.
#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: Arc<RateLimiter>,
}

/// Derive the rate limit key for a request.
///
/// Authenticated requests are keyed by a hash of their bearer token so the
/// limit follows the credential; anonymous requests fall back to the first
/// `x-forwarded-for` hop.
fn rate_limit_key(request: &Request<Body>) -> String {
    if let Some(token) = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        return format!("token:{:016x}", hasher.finish());
    }

    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| format!("ip:{}", s.trim()))
        .unwrap_or_else(|| "ip:unknown".to_string())
}

/// Per-client rate limiting for `/api/*` routes.
///
/// Health and metrics probes are exempt so monitoring never trips the limit.
pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if !path.starts_with("/api/") || path == "/api/health" || path == "/api/metrics" {
        return next.run(request).await;
    }

    let key = rate_limit_key(&request);
    match state.limiter.check(&key) {
        RateLimitDecision::Allowed { .. } => next.run(request).await,
        RateLimitDecision::Rejected { retry_after_secs } => {
            warn!(path = %path, "Rate limit exceeded");
            metrics::record_rate_limited(&path);

            let error = Error::RateLimited { retry_after_secs };
            let body = error.to_external_json();
            (
                StatusCode::TOO_MANY_REQUESTS,
                [
                    (
                        axum::http::header::RETRY_AFTER,
                        retry_after_secs.to_string(),
                    ),
                    (
                        axum::http::header::CONTENT_TYPE,
                        "application/json".to_string(),
                    ),
                ],
                body.to_string(),
            )
                .into_response()
        }
    }
}
