//! HTTP API server for WorkflowGuard.

pub mod middleware;
mod websocket;

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::billing;
use crate::diff;
use crate::error::Error;
use crate::hubspot::HubSpotClient;
use crate::metrics;
use crate::resilience::RateLimiter;
use crate::snapshot;
use crate::storage::{SnapshotType, SqliteStorage, TicketStatus};

pub use websocket::{ws_handler, Broadcaster, WsEvent};

/// Default maximum request body size (1 MiB). Workflow definitions are JSON
/// and should never approach this.
const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Default maximum concurrent requests.
const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 100;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub storage: SqliteStorage,
    pub hubspot: HubSpotClient,
    pub broadcaster: Arc<Broadcaster>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl Error {
    fn into_api_response(self) -> axum::response::Response {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!("API error: {:?}", self);
        }
        (status, Json(self.to_external_json())).into_response()
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        self.into_api_response()
    }
}

type ApiResult<T> = std::result::Result<T, Error>;

/// Create CORS layer based on environment configuration.
///
/// - WFG_CORS_ORIGINS: Comma-separated list of allowed origins (default: http://localhost:3000)
/// - WFG_CORS_ALLOW_ALL: Set to "true" to allow all origins (NOT recommended for production)
pub fn create_cors_layer() -> CorsLayer {
    let allow_all = std::env::var("WFG_CORS_ALLOW_ALL")
        .map(|v| v.to_lowercase() == "true")
        .unwrap_or(false);

    if allow_all {
        warn!("CORS configured to allow all origins - this is NOT secure for production!");
        return CorsLayer::very_permissive();
    }

    let origins_str =
        std::env::var("WFG_CORS_ORIGINS").unwrap_or_else(|_| "http://localhost:3000".to_string());

    let origins: Vec<HeaderValue> = origins_str
        .split(',')
        .filter_map(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            match trimmed.parse::<HeaderValue>() {
                Ok(hv) => Some(hv),
                Err(e) => {
                    warn!("Invalid CORS origin '{}': {}", trimmed, e);
                    None
                }
            }
        })
        .collect();

    let origins = if origins.is_empty() {
        warn!("No valid CORS origins configured, using localhost:3000");
        vec!["http://localhost:3000".parse::<HeaderValue>().unwrap()]
    } else {
        origins
    };

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
        ])
}

/// Get the maximum concurrent requests limit from environment.
///
/// - WFG_MAX_CONCURRENT_REQUESTS: Maximum concurrent requests (default: 100)
pub fn get_max_concurrent_requests() -> usize {
    std::env::var("WFG_MAX_CONCURRENT_REQUESTS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MAX_CONCURRENT_REQUESTS)
}

/// Create a concurrency limit layer to prevent resource exhaustion.
pub fn create_concurrency_limit() -> tower::limit::ConcurrencyLimitLayer {
    tower::limit::ConcurrencyLimitLayer::new(get_max_concurrent_requests())
}

/// Create the API router (without state applied - call with_state on the result).
pub fn create_api_routes() -> Router<AppState> {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/metrics", get(metrics_endpoint))
        .route("/api/workflows", get(list_workflows))
        .route("/api/workflows/{id}", get(get_workflow))
        .route("/api/workflows/{id}/protect", post(protect_workflow))
        .route("/api/workflows/{id}/protect", delete(unprotect_workflow))
        .route("/api/workflows/{id}/sync", post(sync_workflow))
        .route("/api/workflows/{id}/versions", get(list_versions))
        .route("/api/workflows/{id}/versions/{version}", get(get_version))
        .route("/api/workflows/{id}/compare", get(compare_versions))
        .route("/api/workflows/{id}/rollback", post(rollback_workflow))
        .route("/api/audit", get(list_audit))
        .route("/api/support", post(create_ticket).get(list_tickets))
        .route("/api/support/{id}", get(get_ticket).patch(update_ticket))
        .route("/api/ws", get(websocket::ws_handler))
        .route("/webhooks/billing", post(billing_webhook))
}

/// Create the complete API router with middleware and state.
pub fn create_router(state: AppState) -> Router {
    let rate_limit_state = middleware::RateLimitState {
        limiter: Arc::clone(&state.rate_limiter),
    };

    create_api_routes()
        .layer(axum::middleware::from_fn_with_state(
            rate_limit_state,
            middleware::rate_limit_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(
            middleware::ApiAuthConfig::default(),
            middleware::api_auth_middleware,
        ))
        .layer(axum::middleware::from_fn(middleware::access_log_middleware))
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
        .layer(create_concurrency_limit())
        .layer(RequestBodyLimitLayer::new(DEFAULT_MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(create_cors_layer())
        .with_state(state)
}

/// Resolve the acting user from the `x-actor` header.
fn require_actor(headers: &HeaderMap) -> ApiResult<String> {
    headers
        .get("x-actor")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Validation("Missing x-actor header".to_string()))
}

/// Actor for audit entries on workflow mutations; falls back to "api" when
/// the caller did not identify itself.
fn audit_actor(headers: &HeaderMap) -> String {
    require_actor(headers).unwrap_or_else(|_| "api".to_string())
}

// ============================================================================
// Health and Metrics
// ============================================================================

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.storage.check_health().await {
        Ok(health) => {
            let breaker = state
                .hubspot
                .breaker_registry()
                .state("hubspot")
                .map(|s| s.as_str())
                .unwrap_or("closed");
            Json(json!({
                "status": "ok",
                "foreign_keys_enabled": health.foreign_keys_enabled,
                "integrity_check": health.integrity_check,
                "foreign_key_violations": health.foreign_key_violations,
                "orphaned_workflow_versions": health.orphaned_workflow_versions,
                "journal_mode": health.journal_mode,
                "busy_timeout_ms": health.busy_timeout_ms,
                "hubspot_circuit": breaker,
                "ws_subscribers": state.broadcaster.subscriber_count(),
            }))
            .into_response()
        }
        Err(e) => {
            error!("Health check failed: {:?}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": "error", "message": "Health check failed"})),
            )
                .into_response()
        }
    }
}

async fn metrics_endpoint() -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render_metrics(),
    )
}

// ============================================================================
// Workflow Endpoints
// ============================================================================

fn workflow_summary(w: &crate::storage::StoredWorkflow) -> Value {
    json!({
        "id": w.id,
        "hubspot_id": w.hubspot_id,
        "name": w.name,
        "protected": w.protected,
        "created_at": w.created_at.to_rfc3339(),
        "updated_at": w.updated_at.to_rfc3339(),
    })
}

async fn list_workflows(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let workflows = state.storage.list_workflows().await?;
    let summaries: Vec<Value> = workflows.iter().map(workflow_summary).collect();
    Ok(Json(json!({"workflows": summaries})))
}

async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let workflow = state
        .storage
        .get_workflow(&id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Workflow not found: {}", id)))?;

    let definition: Value = serde_json::from_str(&workflow.definition).unwrap_or(Value::Null);
    let mut body = workflow_summary(&workflow);
    body["definition"] = definition;
    Ok(Json(body))
}

async fn protect_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let actor = audit_actor(&headers);

    let now = chrono::Utc::now();
    let subscription = billing::get_or_start_trial(&state.storage, &actor, now).await?;
    let protected_count = state.storage.count_protected_workflows().await?;
    billing::enforce_protection_limit(Some(&subscription), protected_count, now)?;

    let workflow = state.storage.set_protected(&id, true).await?;
    state
        .storage
        .record_audit(
            &actor,
            "workflow.protect",
            "workflow",
            Some(&workflow.id),
            json!({"name": workflow.name}),
        )
        .await?;

    info!(workflow_id = %workflow.id, %actor, "Workflow protected");
    Ok(Json(workflow_summary(&workflow)))
}

async fn unprotect_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let actor = audit_actor(&headers);
    let workflow = state.storage.set_protected(&id, false).await?;
    state
        .storage
        .record_audit(
            &actor,
            "workflow.unprotect",
            "workflow",
            Some(&workflow.id),
            json!({"name": workflow.name}),
        )
        .await?;

    Ok(Json(workflow_summary(&workflow)))
}

async fn sync_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    // Accepts either a stored workflow id or, for not-yet-synced workflows,
    // the HubSpot id itself.
    let hubspot_id = match state.storage.get_workflow(&id).await? {
        Some(w) => w.hubspot_id,
        None => id,
    };

    let actor = audit_actor(&headers);
    let (workflow, version) = snapshot::sync_workflow(
        &state.storage,
        &state.hubspot,
        &state.broadcaster,
        &hubspot_id,
        SnapshotType::Manual,
    )
    .await?;

    state
        .storage
        .record_audit(
            &actor,
            "workflow.sync",
            "workflow",
            Some(&workflow.id),
            json!({"version_recorded": version.is_some()}),
        )
        .await?;

    Ok(Json(json!({
        "workflow": workflow_summary(&workflow),
        "version": version.map(|v| v.version),
    })))
}

// ============================================================================
// Version Endpoints
// ============================================================================

fn version_summary(v: &crate::storage::WorkflowVersion) -> Value {
    json!({
        "id": v.id,
        "workflow_id": v.workflow_id,
        "workflow_name": v.workflow_name,
        "version": v.version,
        "snapshot_type": v.snapshot_type.to_string(),
        "created_at": v.created_at.to_rfc3339(),
        "created_by": v.created_by,
        "changelog": v.changelog,
        "checksum": v.checksum,
    })
}

async fn list_versions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    if state.storage.get_workflow(&id).await?.is_none() {
        return Err(Error::NotFound(format!("Workflow not found: {}", id)));
    }
    let versions = state.storage.list_workflow_versions(&id).await?;
    let summaries: Vec<Value> = versions.iter().map(version_summary).collect();
    Ok(Json(json!({"versions": summaries})))
}

async fn get_version(
    State(state): State<AppState>,
    Path((id, version)): Path<(String, u32)>,
) -> ApiResult<Json<Value>> {
    let record = state
        .storage
        .get_workflow_version(&id, version)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Version {} of workflow {}", version, id)))?;

    let definition: Value = serde_json::from_str(&record.definition).unwrap_or(Value::Null);
    let mut body = version_summary(&record);
    body["definition"] = definition;
    Ok(Json(body))
}

#[derive(Deserialize)]
struct CompareQuery {
    from: u32,
    to: u32,
}

async fn compare_versions(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<CompareQuery>,
) -> ApiResult<Json<Value>> {
    let from = state
        .storage
        .get_workflow_version(&id, query.from)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Version {} of workflow {}", query.from, id)))?;
    let to = state
        .storage
        .get_workflow_version(&id, query.to)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Version {} of workflow {}", query.to, id)))?;

    let old: Value = serde_json::from_str(&from.definition)?;
    let new: Value = serde_json::from_str(&to.definition)?;
    let report = diff::compare(&old, &new);

    Ok(Json(json!({
        "workflow_id": id,
        "from": query.from,
        "to": query.to,
        "change_count": report.change_count(),
        "diff": report,
    })))
}

#[derive(Deserialize)]
struct RollbackRequest {
    version: u32,
}

async fn rollback_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<RollbackRequest>,
) -> ApiResult<Json<Value>> {
    let actor = audit_actor(&headers);

    let workflow = state
        .storage
        .get_workflow(&id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Workflow not found: {}", id)))?;
    let target = state
        .storage
        .get_workflow_version(&id, request.version)
        .await?
        .ok_or_else(|| {
            Error::NotFound(format!("Version {} of workflow {}", request.version, id))
        })?;

    // Push to HubSpot first; local history only changes once the live
    // workflow actually reverted.
    let definition: Value = serde_json::from_str(&target.definition)?;
    if let Err(e) = state
        .hubspot
        .update_workflow(&workflow.hubspot_id, &definition)
        .await
    {
        metrics::record_rollback("error");
        return Err(e);
    }

    let (workflow, version) = state
        .storage
        .rollback_workflow(&id, request.version, Some(&actor))
        .await?;

    state
        .storage
        .record_audit(
            &actor,
            "workflow.rollback",
            "workflow",
            Some(&workflow.id),
            json!({
                "target_version": request.version,
                "recorded_version": version.version,
            }),
        )
        .await?;

    state.broadcaster.workflow_updated(&workflow.id, &workflow.name);
    metrics::record_rollback("success");
    info!(
        workflow_id = %workflow.id,
        target_version = request.version,
        %actor,
        "Workflow rolled back"
    );

    Ok(Json(json!({
        "workflow": workflow_summary(&workflow),
        "version": version_summary(&version),
    })))
}

// ============================================================================
// Audit Endpoints
// ============================================================================

#[derive(Deserialize)]
struct AuditQuery {
    #[serde(default)]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

async fn list_audit(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Json<Value>> {
    let entries = state.storage.list_audit_logs(query.limit, query.offset).await?;
    Ok(Json(json!({"entries": entries})))
}

// ============================================================================
// Support Ticket Endpoints
// ============================================================================

#[derive(Deserialize)]
struct CreateTicketRequest {
    subject: String,
    body: String,
}

async fn create_ticket(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateTicketRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let actor = require_actor(&headers)?;
    if request.subject.trim().is_empty() {
        return Err(Error::Validation("Ticket subject must not be empty".to_string()));
    }

    let ticket = state
        .storage
        .create_ticket(&actor, request.subject.trim(), &request.body)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({"ticket": ticket}))))
}

async fn list_tickets(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let actor = require_actor(&headers)?;
    let tickets = state.storage.list_tickets(&actor).await?;
    Ok(Json(json!({"tickets": tickets})))
}

async fn get_ticket(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let actor = require_actor(&headers)?;
    let ticket = state.storage.get_ticket(&id, &actor).await?;
    Ok(Json(json!({"ticket": ticket})))
}

#[derive(Deserialize)]
struct UpdateTicketRequest {
    status: TicketStatus,
}

async fn update_ticket(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<UpdateTicketRequest>,
) -> ApiResult<Json<Value>> {
    let actor = require_actor(&headers)?;
    let ticket = state
        .storage
        .update_ticket_status(&id, &actor, request.status)
        .await?;
    Ok(Json(json!({"ticket": ticket})))
}

// ============================================================================
// Billing Webhook
// ============================================================================

async fn billing_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let secret = std::env::var("WFG_BILLING_WEBHOOK_SECRET").map_err(|_| {
        Error::Config("WFG_BILLING_WEBHOOK_SECRET not configured".to_string())
    })?;

    let signature = headers
        .get(billing::SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            Error::Validation(format!("Missing {} header", billing::SIGNATURE_HEADER))
        })?;

    billing::verify_signature(&secret, signature, &body)?;

    let event: billing::BillingEvent = serde_json::from_slice(&body)?;
    let subscription = billing::apply_event(&state.storage, &event).await?;

    info!(
        event = %event.event,
        actor = %subscription.actor,
        plan = %subscription.plan,
        "Billing event applied"
    );
    Ok(Json(json!({"status": "ok"})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{CircuitBreakerConfig, RetryPolicy};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let hubspot = HubSpotClient::with_settings(
            "http://127.0.0.1:9".to_string(),
            "test-token".to_string(),
            Duration::from_secs(1),
            RetryPolicy {
                retries: 1,
                ..Default::default()
            },
            CircuitBreakerConfig::default(),
        )
        .unwrap();
        AppState {
            storage,
            hubspot,
            broadcaster: Arc::new(Broadcaster::new()),
            rate_limiter: Arc::new(RateLimiter::new()),
        }
    }

    fn app(state: &AppState) -> Router {
        create_api_routes().with_state(state.clone())
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let state = test_state();
        let response = app(&state)
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["foreign_keys_enabled"], true);
    }

    #[tokio::test]
    async fn test_get_workflow_not_found() {
        let state = test_state();
        let response = app(&state)
            .oneshot(
                Request::builder()
                    .uri("/api/workflows/missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_list_workflows() {
        let state = test_state();
        state
            .storage
            .upsert_workflow("101", "Lead Routing", r#"{"actions":[]}"#, SnapshotType::Manual, None)
            .await
            .unwrap();

        let response = app(&state)
            .oneshot(
                Request::builder()
                    .uri("/api/workflows")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["workflows"].as_array().unwrap().len(), 1);
        assert_eq!(body["workflows"][0]["name"], "Lead Routing");
    }

    #[tokio::test]
    async fn test_protect_workflow_and_plan_limit() {
        let state = test_state();
        // Trial allows 10 protected workflows
        for i in 0..11 {
            state
                .storage
                .upsert_workflow(
                    &format!("wf-{}", i),
                    &format!("Workflow {}", i),
                    "{}",
                    SnapshotType::Manual,
                    None,
                )
                .await
                .unwrap();
        }
        let workflows = state.storage.list_workflows().await.unwrap();

        for workflow in workflows.iter().take(10) {
            let response = app(&state)
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri(format!("/api/workflows/{}/protect", workflow.id))
                        .header("x-actor", "acct-1")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app(&state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/workflows/{}/protect", workflows[10].id))
                    .header("x-actor", "acct-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "PLAN_LIMIT");
    }

    #[tokio::test]
    async fn test_first_protect_persists_trial_subscription() {
        let state = test_state();
        state
            .storage
            .upsert_workflow("101", "Lead Routing", "{}", SnapshotType::Manual, None)
            .await
            .unwrap();
        let workflow = &state.storage.list_workflows().await.unwrap()[0];

        let response = app(&state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/workflows/{}/protect", workflow.id))
                    .header("x-actor", "acct-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let subscription = state
            .storage
            .get_subscription("acct-1")
            .await
            .unwrap()
            .expect("trial subscription persisted on first protect");
        assert_eq!(subscription.plan, crate::storage::Plan::Trial);
        assert!(subscription.trial_ends_at.is_some());
    }

    #[tokio::test]
    async fn test_protect_blocked_after_trial_expiry() {
        let state = test_state();
        state
            .storage
            .upsert_workflow("101", "Lead Routing", "{}", SnapshotType::Manual, None)
            .await
            .unwrap();
        let workflow = &state.storage.list_workflows().await.unwrap()[0];

        // Trial that started long enough ago to have run out
        let started = chrono::Utc::now() - chrono::Duration::days(billing::TRIAL_DAYS + 1);
        let expired = billing::default_trial("acct-1", started);
        state.storage.upsert_subscription(&expired).await.unwrap();

        let response = app(&state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/workflows/{}/protect", workflow.id))
                    .header("x-actor", "acct-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "PLAN_LIMIT");
    }

    #[tokio::test]
    async fn test_unprotect_workflow() {
        let state = test_state();
        let (workflow, _) = state
            .storage
            .upsert_workflow("101", "Lead Routing", "{}", SnapshotType::Manual, None)
            .await
            .unwrap();
        state.storage.set_protected(&workflow.id, true).await.unwrap();

        let response = app(&state)
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/workflows/{}/protect", workflow.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["protected"], false);
    }

    #[tokio::test]
    async fn test_compare_versions() {
        let state = test_state();
        let (workflow, _) = state
            .storage
            .upsert_workflow(
                "101",
                "Lead Routing",
                r#"{"enabled":true}"#,
                SnapshotType::Manual,
                None,
            )
            .await
            .unwrap();
        state
            .storage
            .upsert_workflow(
                "101",
                "Lead Routing",
                r#"{"enabled":false}"#,
                SnapshotType::Manual,
                None,
            )
            .await
            .unwrap();

        let response = app(&state)
            .oneshot(
                Request::builder()
                    .uri(format!(
                        "/api/workflows/{}/compare?from=1&to=2",
                        workflow.id
                    ))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["change_count"], 1);
        assert_eq!(body["diff"]["changed"][0]["path"], "enabled");
    }

    #[tokio::test]
    async fn test_support_ticket_requires_actor() {
        let state = test_state();
        let response = app(&state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/support")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"subject":"Help","body":"It broke"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_support_ticket_lifecycle() {
        let state = test_state();
        let response = app(&state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/support")
                    .header("x-actor", "acct-1")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"subject":"Help","body":"It broke"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        let ticket_id = body["ticket"]["id"].as_str().unwrap().to_string();

        // Another actor cannot read it
        let response = app(&state)
            .oneshot(
                Request::builder()
                    .uri(format!("/api/support/{}", ticket_id))
                    .header("x-actor", "acct-2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        // The owner can close it
        let response = app(&state)
            .oneshot(
                Request::builder()
                    .method("PATCH")
                    .uri(format!("/api/support/{}", ticket_id))
                    .header("x-actor", "acct-1")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"status":"closed"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["ticket"]["status"], "closed");
    }

    #[tokio::test]
    async fn test_billing_webhook_rejects_bad_signature() {
        let state = test_state();
        std::env::set_var("WFG_BILLING_WEBHOOK_SECRET", "whsec_test");

        let response = app(&state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhooks/billing")
                    .header(billing::SIGNATURE_HEADER, "deadbeef")
                    .body(Body::from(r#"{"event":"subscription.activated"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_audit_log_listing() {
        let state = test_state();
        state
            .storage
            .record_audit("acct-1", "workflow.protect", "workflow", Some("wf-1"), json!({}))
            .await
            .unwrap();

        let response = app(&state)
            .oneshot(
                Request::builder()
                    .uri("/api/audit?limit=10")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["entries"].as_array().unwrap().len(), 1);
        assert_eq!(body["entries"][0]["action"], "workflow.protect");
    }
}
