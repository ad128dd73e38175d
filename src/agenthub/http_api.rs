//! The HTTP surface: orchestration, session, and registry endpoints.
//!
//! JSON bodies throughout; every state-changing endpoint requires a
//! verified bearer. Errors use one consistent shape:
//!
//! ```json
//! { "error": "not_found", "message": "agent 'x' not found", "details": null }
//! ```
//!
//! # Endpoints
//!
//! | Method | Path | Purpose |
//! |--------|------|---------|
//! | POST   | `/invoke` | run one orchestrated request |
//! | GET    | `/health` | liveness of both stores |
//! | POST   | `/sessions` | create a session |
//! | GET    | `/sessions/{id}` | full session snapshot |
//! | POST   | `/sessions/{id}/history` | append a message |
//! | POST   | `/sessions/{id}/invocations` | record an invocation |
//! | PATCH  | `/sessions/{id}/status` | change session status |
//! | DELETE | `/sessions/{id}` | delete (cascades) |
//! | POST   | `/agents` | register local agent |
//! | POST   | `/agents/remote` | register remote agent (pending) |
//! | POST   | `/agents/discover` | card preview, nothing persisted |
//! | GET    | `/agents` | list with filters |
//! | GET    | `/agents/stats` | catalog counts |
//! | GET    | `/agents/{name}` | one record |
//! | PUT    | `/agents/{name}/capabilities` | replace capabilities |
//! | PATCH  | `/agents/{name}/status` | approval transition (admin) |
//! | PATCH  | `/agents/{name}/enabled` | enable/disable |
//! | DELETE | `/agents/{name}` | remove record |
//!
//! Approval transitions require the admin role; other mutations require
//! the record's owner or an admin.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::agenthub::agent_record::{AgentKind, AgentRecord, ConstructorRef, RemoteStatus};
use crate::agenthub::auth::{AuthClaims, AuthError, TokenVerifier};
use crate::agenthub::capability::Capability;
use crate::agenthub::orchestrator::{Orchestrator, OrchestratorError};
use crate::agenthub::registry::{
    normalize_tags, parse_tag_filter, AgentRegistry, RegistryError, RemoteRegistration,
};
use crate::agenthub::session_store::{
    MessageRole, SessionSnapshot, SessionStatus, SessionStore, SessionStoreError,
};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub registry: Arc<AgentRegistry>,
    pub sessions: Arc<SessionStore>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub admin_role: String,
}

/// Build the full application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/invoke", post(invoke))
        .route("/health", get(health))
        .route("/sessions", post(create_session))
        .route("/sessions/{id}", get(get_session).delete(delete_session))
        .route("/sessions/{id}/history", post(append_history))
        .route("/sessions/{id}/invocations", post(record_invocation))
        .route("/sessions/{id}/status", patch(set_session_status))
        .route("/agents", post(register_local).get(list_agents))
        .route("/agents/remote", post(register_remote))
        .route("/agents/discover", post(discover_agent))
        .route("/agents/stats", get(agent_stats))
        .route("/agents/{name}", get(get_agent).delete(delete_agent))
        .route("/agents/{name}/capabilities", put(update_capabilities))
        .route("/agents/{name}/status", patch(set_agent_status))
        .route("/agents/{name}/enabled", patch(set_agent_enabled))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Error envelope
// ---------------------------------------------------------------------------

/// Uniform HTTP error: `{error, message, details?}` with a status code.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", message)
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.code,
            "message": self.message,
            "details": self.details,
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Unauthorized(msg) => ApiError::unauthorized(msg),
            AuthError::Upstream(msg) => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "auth_unavailable",
                msg,
            ),
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::Unauthorized(msg) => ApiError::unauthorized(msg),
            OrchestratorError::NotFound(msg) => {
                ApiError::new(StatusCode::NOT_FOUND, "not_found", msg)
            }
            OrchestratorError::BadRequest(msg) => ApiError::bad_request(msg),
            OrchestratorError::SessionWrite(msg) => {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "session_write_failed", msg)
            }
            OrchestratorError::UpstreamTimeout(msg) => {
                ApiError::new(StatusCode::GATEWAY_TIMEOUT, "upstream_timeout", msg)
            }
            OrchestratorError::Internal(msg) => {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", msg)
            }
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match &e {
            RegistryError::DuplicateName(_) => {
                ApiError::new(StatusCode::CONFLICT, "duplicate_name", e.to_string())
            }
            RegistryError::NotFound(_) => {
                ApiError::new(StatusCode::NOT_FOUND, "not_found", e.to_string())
            }
            RegistryError::IllegalTransition { .. } => {
                ApiError::new(StatusCode::CONFLICT, "illegal_transition", e.to_string())
            }
            RegistryError::RemoteOnly(_) => ApiError::bad_request(e.to_string()),
            RegistryError::Card(card) => ApiError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "card_invalid",
                e.to_string(),
            )
            .with_details(json!({ "reason": card.reason_code() })),
            RegistryError::PersistFailed(_) => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "persist_failed",
                e.to_string(),
            ),
        }
    }
}

impl From<SessionStoreError> for ApiError {
    fn from(e: SessionStoreError) -> Self {
        match e {
            SessionStoreError::NotFound(_) => {
                ApiError::new(StatusCode::NOT_FOUND, "not_found", e.to_string())
            }
            SessionStoreError::Storage(msg) => {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "storage", msg)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Auth helpers
// ---------------------------------------------------------------------------

fn bearer_token(headers: &HeaderMap) -> Result<String, ApiError> {
    let raw = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("missing Authorization header"))?;
    raw.strip_prefix("Bearer ")
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::unauthorized("expected 'Bearer <token>'"))
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<AuthClaims, ApiError> {
    let bearer = bearer_token(headers)?;
    Ok(state.verifier.verify(&bearer).await?)
}

fn require_admin(state: &AppState, claims: &AuthClaims) -> Result<(), ApiError> {
    if claims.role == state.admin_role {
        Ok(())
    } else {
        Err(ApiError::forbidden("admin role required"))
    }
}

/// Owner-or-admin check for record mutations. Records without an owner
/// annotation are mutable by any authenticated caller.
fn can_mutate(state: &AppState, claims: &AuthClaims, record: &AgentRecord) -> Result<(), ApiError> {
    if claims.role == state.admin_role {
        return Ok(());
    }
    match record.metadata.get("owner") {
        Some(owner) if owner != &claims.user_id => {
            Err(ApiError::forbidden("not the owner of this agent"))
        }
        _ => Ok(()),
    }
}

fn session_owner_check(claims: &AuthClaims, snapshot: &SessionSnapshot, admin_role: &str) -> Result<(), ApiError> {
    if claims.role == admin_role || snapshot.meta.user_id == claims.user_id {
        Ok(())
    } else {
        // A foreign session reads as absent.
        Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("session not found: {}", snapshot.meta.session_id),
        ))
    }
}

// ---------------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct InvokeRequest {
    query: Option<String>,
    session_id: Option<String>,
}

#[derive(Serialize)]
struct InvokeResponse {
    response: String,
    session_id: String,
}

async fn invoke(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<InvokeRequest>,
) -> Result<Json<InvokeResponse>, ApiError> {
    let bearer = bearer_token(&headers)?;
    let query = body
        .query
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("missing query"))?;

    let outcome = state
        .orchestrator
        .handle(&query, &bearer, body.session_id.as_deref())
        .await?;

    Ok(Json(InvokeResponse {
        response: outcome.response,
        session_id: outcome.session_id,
    }))
}

async fn health(State(state): State<AppState>) -> Response {
    let registry_ok = state.registry.store_healthy();
    let sessions_ok = state.sessions.is_healthy();
    if registry_ok && sessions_ok {
        (StatusCode::OK, Json(json!({ "status": "healthy" }))).into_response()
    } else {
        let body = json!({
            "error": "unhealthy",
            "message": "one or more stores are unreachable",
            "details": { "registry": registry_ok, "sessions": sessions_ok },
        });
        (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct MessageView {
    seq: i64,
    role: &'static str,
    content: String,
    timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
struct InvocationView {
    agent_name: String,
    query: String,
    response: Option<String>,
    success: bool,
    error_message: Option<String>,
    duration_ms: i64,
    timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
struct ContextView {
    last_agent_called: Option<String>,
    last_query: Option<String>,
    last_response: Option<String>,
    updated_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct SessionView {
    session_id: String,
    user_id: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    status: &'static str,
    metadata: Option<Value>,
    history: Vec<MessageView>,
    invocations: Vec<InvocationView>,
    context: Option<ContextView>,
}

impl From<SessionSnapshot> for SessionView {
    fn from(snapshot: SessionSnapshot) -> Self {
        Self {
            session_id: snapshot.meta.session_id,
            user_id: snapshot.meta.user_id,
            created_at: snapshot.meta.created_at,
            updated_at: snapshot.meta.updated_at,
            status: snapshot.meta.status.as_str(),
            metadata: snapshot.meta.metadata,
            history: snapshot
                .history
                .into_iter()
                .map(|m| MessageView {
                    seq: m.seq,
                    role: m.role.as_str(),
                    content: m.content,
                    timestamp: m.timestamp,
                })
                .collect(),
            invocations: snapshot
                .invocations
                .into_iter()
                .map(|i| InvocationView {
                    agent_name: i.agent_name,
                    query: i.query,
                    response: i.response,
                    success: i.success,
                    error_message: i.error_message,
                    duration_ms: i.duration_ms,
                    timestamp: i.timestamp,
                })
                .collect(),
            context: snapshot.context.map(|c| ContextView {
                last_agent_called: c.last_agent_called,
                last_query: c.last_query,
                last_response: c.last_response,
                updated_at: c.updated_at,
            }),
        }
    }
}

async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let claims = authenticate(&state, &headers).await?;
    let session_id = state.sessions.create_session(&claims.user_id)?;
    Ok((StatusCode::CREATED, Json(json!({ "session_id": session_id }))))
}

async fn get_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
    let claims = authenticate(&state, &headers).await?;
    let snapshot = state.sessions.get_session(&id)?;
    session_owner_check(&claims, &snapshot, &state.admin_role)?;
    Ok(Json(snapshot.into()))
}

#[derive(Deserialize)]
struct AppendMessageRequest {
    role: String,
    content: String,
}

async fn append_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<AppendMessageRequest>,
) -> Result<Json<Value>, ApiError> {
    let claims = authenticate(&state, &headers).await?;
    let snapshot = state.sessions.get_session(&id)?;
    session_owner_check(&claims, &snapshot, &state.admin_role)?;

    let role = MessageRole::parse(&body.role)
        .ok_or_else(|| ApiError::bad_request(format!("unknown role '{}'", body.role)))?;
    let seq = state.sessions.append_message(&id, role, &body.content)?;
    Ok(Json(json!({ "seq": seq })))
}

#[derive(Deserialize)]
struct RecordInvocationRequest {
    agent_name: String,
    query: String,
    response: Option<String>,
    success: bool,
    error_message: Option<String>,
    #[serde(default)]
    duration_ms: u64,
}

async fn record_invocation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<RecordInvocationRequest>,
) -> Result<StatusCode, ApiError> {
    let claims = authenticate(&state, &headers).await?;
    let snapshot = state.sessions.get_session(&id)?;
    session_owner_check(&claims, &snapshot, &state.admin_role)?;

    state.sessions.record_invocation(
        &id,
        &body.agent_name,
        &body.query,
        body.response.as_deref(),
        body.success,
        body.error_message.as_deref(),
        body.duration_ms,
    )?;
    Ok(StatusCode::CREATED)
}

#[derive(Deserialize)]
struct SessionStatusRequest {
    status: String,
}

async fn set_session_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<SessionStatusRequest>,
) -> Result<StatusCode, ApiError> {
    let claims = authenticate(&state, &headers).await?;
    let snapshot = state.sessions.get_session(&id)?;
    session_owner_check(&claims, &snapshot, &state.admin_role)?;

    let status = SessionStatus::parse(&body.status)
        .ok_or_else(|| ApiError::bad_request(format!("unknown status '{}'", body.status)))?;
    state.sessions.set_status(&id, status)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let claims = authenticate(&state, &headers).await?;
    let snapshot = state.sessions.get_session(&id)?;
    session_owner_check(&claims, &snapshot, &state.admin_role)?;

    state.sessions.delete(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RegisterLocalRequest {
    name: String,
    description: String,
    #[serde(default)]
    capabilities: Capability,
    constructor_ref: ConstructorRef,
    #[serde(default)]
    tags: Vec<String>,
}

async fn register_local(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RegisterLocalRequest>,
) -> Result<(StatusCode, Json<AgentRecord>), ApiError> {
    let claims = authenticate(&state, &headers).await?;

    let record = AgentRecord::new_local(
        body.name,
        body.description,
        body.capabilities,
        body.constructor_ref,
    )
    .with_tags(normalize_tags(body.tags))
    .with_metadata("owner", claims.user_id);

    state.registry.insert_record(record.clone()).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn register_remote(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut body): Json<RemoteRegistration>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let claims = authenticate(&state, &headers).await?;
    body.owner = Some(claims.user_id);
    body.tags = normalize_tags(body.tags);

    let outcome = state.registry.register_remote(body).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": outcome.status.as_str(),
            "agent_name": outcome.agent_name,
            "registration_id": outcome.registration_id,
        })),
    ))
}

#[derive(Deserialize)]
struct DiscoverRequest {
    agent_card_url: String,
}

async fn discover_agent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<DiscoverRequest>,
) -> Result<Json<Value>, ApiError> {
    authenticate(&state, &headers).await?;
    let preview = state.registry.discover(&body.agent_card_url).await?;
    Ok(Json(serde_json::to_value(preview).unwrap_or_default()))
}

#[derive(Deserialize)]
struct ListAgentsParams {
    kind: Option<String>,
    enabled: Option<bool>,
    status: Option<String>,
    tags: Option<String>,
}

async fn list_agents(
    State(state): State<AppState>,
    Query(params): Query<ListAgentsParams>,
) -> Result<Json<Vec<AgentRecord>>, ApiError> {
    let tags = parse_tag_filter(params.tags.as_deref());
    let mut records = state
        .registry
        .list(params.enabled.unwrap_or(false), tags.as_deref())
        .await;

    if let Some(kind) = &params.kind {
        let kind = match kind.as_str() {
            "local" => AgentKind::Local,
            "remote" => AgentKind::Remote,
            other => return Err(ApiError::bad_request(format!("unknown kind '{}'", other))),
        };
        records.retain(|r| r.kind == kind);
    }
    if let Some(status) = &params.status {
        let status = parse_remote_status(status)?;
        records.retain(|r| r.status == Some(status));
    }
    if let Some(enabled) = params.enabled {
        records.retain(|r| r.enabled == enabled);
    }
    Ok(Json(records))
}

async fn agent_stats(State(state): State<AppState>) -> Json<Value> {
    let stats = state.registry.stats().await;
    Json(serde_json::to_value(stats).unwrap_or_default())
}

async fn get_agent(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<AgentRecord>, ApiError> {
    Ok(Json(state.registry.get(&name).await?))
}

async fn update_capabilities(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(capabilities): Json<Capability>,
) -> Result<StatusCode, ApiError> {
    let claims = authenticate(&state, &headers).await?;
    let record = state.registry.get(&name).await?;
    can_mutate(&state, &claims, &record)?;

    state.registry.update_capabilities(&name, capabilities).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct AgentStatusRequest {
    status: String,
}

async fn set_agent_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(body): Json<AgentStatusRequest>,
) -> Result<StatusCode, ApiError> {
    let claims = authenticate(&state, &headers).await?;
    require_admin(&state, &claims)?;

    let status = parse_remote_status(&body.status)?;
    state.registry.set_status(&name, status).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct AgentEnabledRequest {
    enabled: bool,
}

async fn set_agent_enabled(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(body): Json<AgentEnabledRequest>,
) -> Result<StatusCode, ApiError> {
    let claims = authenticate(&state, &headers).await?;
    let record = state.registry.get(&name).await?;
    can_mutate(&state, &claims, &record)?;

    state.registry.set_enabled(&name, body.enabled).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_agent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    let claims = authenticate(&state, &headers).await?;
    let record = state.registry.get(&name).await?;
    can_mutate(&state, &claims, &record)?;

    state.registry.delete(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn parse_remote_status(raw: &str) -> Result<RemoteStatus, ApiError> {
    match raw {
        "pending" => Ok(RemoteStatus::Pending),
        "approved" => Ok(RemoteStatus::Approved),
        "suspended" => Ok(RemoteStatus::Suspended),
        "rejected" => Ok(RemoteStatus::Rejected),
        other => Err(ApiError::bad_request(format!("unknown status '{}'", other))),
    }
}
