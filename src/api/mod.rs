//! REST API for the call engine
//!
//! Thin axum layer over [`CallEngine`]: handlers validate and deserialize,
//! the engine owns all state. `NoReaderAvailable` during intake is not an
//! HTTP error — the session is accepted and escalates internally.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

use crate::audit::AuditEntry;
use crate::error::CallEngineError;
use crate::escalation::EscalationReason;
use crate::orchestrator::{CallEngine, EngineStats};
use crate::reader::ReaderId;
use crate::session::{CallSession, CallType, ClientId, SessionId};

pub fn create_router(engine: Arc<CallEngine>) -> Router {
    Router::new()
        .route("/emergency-calls", post(create_emergency_call))
        .route("/calls/:session_id", get(get_call))
        .route("/calls/:session_id/answer", post(answer_call))
        .route("/calls/:session_id/end", post(end_call))
        .route("/calls/:session_id/escalate", post(escalate_call))
        .route("/calls/:session_id/history", get(call_history))
        .route("/readers/:reader_id/presence", post(report_presence))
        .route("/readers/:reader_id/offline", post(mark_reader_offline))
        .route("/stats", get(get_stats))
        .with_state(engine)
}

/// Error envelope returned on every non-2xx response
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

pub struct ApiError(CallEngineError);

impl From<CallEngineError> for ApiError {
    fn from(e: CallEngineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CallEngineError::Validation(_) => StatusCode::BAD_REQUEST,
            CallEngineError::InvalidTransition { .. } => StatusCode::CONFLICT,
            CallEngineError::SessionNotFound(_) | CallEngineError::ReaderNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            CallEngineError::Persistence(_)
            | CallEngineError::Dispatch(_)
            | CallEngineError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", self.0);
        }
        let body = ErrorBody {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateCallRequest {
    pub client_id: String,
    #[serde(default = "default_call_type")]
    pub call_type: String,
    #[serde(default = "default_true")]
    pub is_emergency: bool,
    /// Planned call length, if the client booked a slot
    #[serde(default)]
    pub scheduled_duration_secs: Option<i64>,
}

fn default_call_type() -> String {
    "voice".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session: CallSession,
}

async fn create_emergency_call(
    State(engine): State<Arc<CallEngine>>,
    Json(request): Json<CreateCallRequest>,
) -> Result<(StatusCode, Json<SessionResponse>), ApiError> {
    if request.client_id.trim().is_empty() {
        return Err(CallEngineError::Validation("client_id must not be empty".to_string()).into());
    }
    let call_type = CallType::parse(&request.call_type).ok_or_else(|| {
        CallEngineError::Validation(format!("unknown call_type: {}", request.call_type))
    })?;
    if matches!(request.scheduled_duration_secs, Some(d) if d <= 0) {
        return Err(
            CallEngineError::Validation("scheduled_duration_secs must be positive".to_string())
                .into(),
        );
    }

    let session = engine
        .create_call(
            ClientId(request.client_id),
            call_type,
            request.is_emergency,
            request.scheduled_duration_secs,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(SessionResponse { session })))
}

async fn get_call(
    State(engine): State<Arc<CallEngine>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = engine.get_session(&SessionId(session_id)).await?;
    Ok(Json(SessionResponse { session }))
}

#[derive(Debug, Deserialize)]
pub struct AnswerRequest {
    pub reader_id: String,
}

async fn answer_call(
    State(engine): State<Arc<CallEngine>>,
    Path(session_id): Path<String>,
    Json(request): Json<AnswerRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    if request.reader_id.trim().is_empty() {
        return Err(CallEngineError::Validation("reader_id must not be empty".to_string()).into());
    }
    let session = engine
        .answer(&SessionId(session_id), &ReaderId(request.reader_id))
        .await?;
    Ok(Json(SessionResponse { session }))
}

async fn end_call(
    State(engine): State<Arc<CallEngine>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = engine.end(&SessionId(session_id)).await?;
    Ok(Json(SessionResponse { session }))
}

#[derive(Debug, Deserialize)]
pub struct EscalateRequest {
    pub admin_id: String,
    #[serde(default = "default_reason")]
    pub reason: String,
}

fn default_reason() -> String {
    "manual".to_string()
}

async fn escalate_call(
    State(engine): State<Arc<CallEngine>>,
    Path(session_id): Path<String>,
    Json(request): Json<EscalateRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    if request.admin_id.trim().is_empty() {
        return Err(CallEngineError::Validation("admin_id must not be empty".to_string()).into());
    }
    let reason = EscalationReason::parse(&request.reason).ok_or_else(|| {
        CallEngineError::Validation(format!("unknown escalation reason: {}", request.reason))
    })?;

    let session = engine
        .escalate_manual(&SessionId(session_id), &request.admin_id, reason)
        .await?;
    Ok(Json(SessionResponse { session }))
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub entries: Vec<AuditEntry>,
}

async fn call_history(
    State(engine): State<Arc<CallEngine>>,
    Path(session_id): Path<String>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let session_id = SessionId(session_id);
    // 404 for unknown sessions rather than an empty history
    engine.get_session(&session_id).await?;
    Ok(Json(HistoryResponse {
        entries: engine.session_history(&session_id),
    }))
}

#[derive(Debug, Deserialize)]
pub struct PresenceRequest {
    #[serde(default = "default_true")]
    pub is_online: bool,
    #[serde(default = "default_true")]
    pub is_available_for_emergency: bool,
    /// Defaults to the configured reader capacity when omitted
    pub max_concurrent_calls: Option<u32>,
    pub status_message: Option<String>,
}

async fn report_presence(
    State(engine): State<Arc<CallEngine>>,
    Path(reader_id): Path<String>,
    Json(request): Json<PresenceRequest>,
) -> Result<StatusCode, ApiError> {
    if reader_id.trim().is_empty() {
        return Err(CallEngineError::Validation("reader_id must not be empty".to_string()).into());
    }
    let max_concurrent = request
        .max_concurrent_calls
        .unwrap_or(engine.config().readers.default_max_concurrent_calls);

    engine
        .registry()
        .upsert_presence(
            &ReaderId(reader_id),
            request.is_online,
            request.is_available_for_emergency,
            max_concurrent,
            request.status_message.as_deref(),
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn mark_reader_offline(
    State(engine): State<Arc<CallEngine>>,
    Path(reader_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let reader_id = ReaderId(reader_id);
    if engine.registry().get(&reader_id).await?.is_none() {
        return Err(CallEngineError::ReaderNotFound(reader_id.to_string()).into());
    }
    engine.registry().mark_offline(&reader_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_stats(
    State(engine): State<Arc<CallEngine>>,
) -> Result<Json<EngineStats>, ApiError> {
    Ok(Json(engine.get_stats().await?))
}
