//! HTTP request/response handlers.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use relaydesk_core::ids::{AgentId, SessionId, UserId};
use relaydesk_core::session::{Availability, SessionStatus};
use relaydesk_core::RelayError;
use relaydesk_store::{MessageRow, SessionRow, SessionSummary, StoreError};

use crate::coordinator::HandoffOutcome;
use crate::health::{self, HealthResponse};
use crate::server::AppState;

/// A [`RelayError`] rendered as `{"error": {"code", "message"}}`.
#[derive(Debug)]
pub struct ApiError(pub RelayError);

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        Self(e)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self(e.into())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            RelayError::NotFound(_) | RelayError::NoSessionAvailable => StatusCode::NOT_FOUND,
            RelayError::SessionClosed(_)
            | RelayError::AlreadyAssigned(_)
            | RelayError::AgentUnavailable(_) => StatusCode::CONFLICT,
            RelayError::NotParticipant { .. } => StatusCode::FORBIDDEN,
            RelayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::ConnectionLost(_) | RelayError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if self.0.is_fatal() {
            error!(error = %self.0, "request failed");
        } else {
            debug!(error = %self.0, code = self.0.error_kind(), "request rejected");
        }
        let body = serde_json::json!({
            "error": {
                "code": self.0.error_kind(),
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn required(value: Option<String>, name: &str) -> Result<String, ApiError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(RelayError::InvalidRequest(format!("{name} is required")).into()),
    }
}

fn parse_status_filter(raw: Option<String>) -> Result<Option<SessionStatus>, ApiError> {
    match raw.as_deref() {
        None | Some("") | Some("all") => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|e: String| RelayError::InvalidRequest(e).into()),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    pub user_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionQuery {
    pub session_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserQuery {
    pub user_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StatusQuery {
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TakeoverRequest {
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityRequest {
    pub agent_id: Option<String>,
    /// `"available"` / `"busy"` (legacy `"online"`, `"away"`, `"offline"`).
    pub status: Option<String>,
    pub available: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSessionResponse {
    pub has_active_session: bool,
    pub session: Option<SessionRow>,
}

#[derive(Debug, Serialize)]
pub struct SessionList {
    pub sessions: Vec<SessionSummary>,
}

#[derive(Debug, Serialize)]
pub struct AgentSessions {
    pub assigned: Vec<SessionSummary>,
    pub pool: Vec<SessionSummary>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityResponse {
    pub agent_id: AgentId,
    pub availability: Availability,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageList {
    pub session_id: SessionId,
    pub messages: Vec<MessageRow>,
}

/// POST /api/session/start
pub async fn start_session(
    State(state): State<AppState>,
    Json(req): Json<StartSessionRequest>,
) -> ApiResult<SessionRow> {
    let user_id = UserId::from_raw(required(req.user_id, "userId")?);
    Ok(Json(state.coordinator.start_session(&user_id)?))
}

/// GET /api/session/info?sessionId=
pub async fn session_info(
    State(state): State<AppState>,
    Query(q): Query<SessionQuery>,
) -> ApiResult<SessionRow> {
    let session_id = SessionId::from_raw(required(q.session_id, "sessionId")?);
    Ok(Json(state.sessions.get(&session_id)?))
}

/// GET /api/session/user/active?userId=
pub async fn active_session(
    State(state): State<AppState>,
    Query(q): Query<UserQuery>,
) -> ApiResult<ActiveSessionResponse> {
    let user_id = UserId::from_raw(required(q.user_id, "userId")?);
    let session = state.sessions.active_for_user(&user_id)?;
    Ok(Json(ActiveSessionResponse {
        has_active_session: session.is_some(),
        session,
    }))
}

/// GET /api/session/user/{userId}?status=
pub async fn user_sessions(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(q): Query<StatusQuery>,
) -> ApiResult<SessionList> {
    let status = parse_status_filter(q.status)?;
    let sessions = state
        .sessions
        .list_by_user(&UserId::from_raw(user_id), status)?;
    Ok(Json(SessionList { sessions }))
}

/// GET /api/session/agent/{agentId} (alias: GET /api/agent/active-sessions/{agentId})
pub async fn agent_sessions(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> ApiResult<AgentSessions> {
    let agent_id = AgentId::from_raw(agent_id);
    let assigned = state.sessions.list_by_agent(&agent_id, None)?;
    let pool = state.sessions.list_assistant_mode_sessions()?;
    Ok(Json(AgentSessions { assigned, pool }))
}

/// GET /api/sessions/ai
pub async fn assistant_sessions(State(state): State<AppState>) -> ApiResult<SessionList> {
    let sessions = state.sessions.list_assistant_mode_sessions()?;
    Ok(Json(SessionList { sessions }))
}

/// POST /api/agent/takeover
pub async fn agent_takeover(
    State(state): State<AppState>,
    Json(req): Json<TakeoverRequest>,
) -> ApiResult<HandoffOutcome> {
    let agent_id = AgentId::from_raw(required(req.agent_id, "agentId")?);
    let session_id = req
        .session_id
        .filter(|s| !s.trim().is_empty())
        .map(SessionId::from_raw);
    let outcome = state
        .coordinator
        .takeover(&agent_id, session_id.as_ref())
        .await?;
    Ok(Json(outcome))
}

/// POST /api/agent/assign-session (alias: POST /api/session/transfer)
pub async fn assign_session(
    State(state): State<AppState>,
    Json(req): Json<TakeoverRequest>,
) -> ApiResult<HandoffOutcome> {
    let agent_id = AgentId::from_raw(required(req.agent_id, "agentId")?);
    let session_id = SessionId::from_raw(required(req.session_id, "sessionId")?);
    Ok(Json(state.coordinator.assign(&agent_id, &session_id).await?))
}

/// POST /api/agent/status
pub async fn set_availability(
    State(state): State<AppState>,
    Json(req): Json<AvailabilityRequest>,
) -> ApiResult<AvailabilityResponse> {
    let agent_id = AgentId::from_raw(required(req.agent_id, "agentId")?);
    let availability = match (req.status.as_deref(), req.available) {
        (Some(s), _) => s.parse::<Availability>().map_err(RelayError::InvalidRequest)?,
        (None, Some(true)) => Availability::Available,
        (None, Some(false)) => Availability::Busy,
        (None, None) => {
            return Err(RelayError::InvalidRequest("status or available is required".into()).into())
        }
    };
    state.coordinator.set_availability(&agent_id, availability);
    Ok(Json(AvailabilityResponse {
        agent_id,
        availability,
    }))
}

/// POST /api/session/end
pub async fn end_session(
    State(state): State<AppState>,
    Json(req): Json<SessionQuery>,
) -> ApiResult<SessionRow> {
    let session_id = SessionId::from_raw(required(req.session_id, "sessionId")?);
    Ok(Json(state.coordinator.end(&session_id).await?))
}

/// GET /api/session/messages?sessionId=
pub async fn session_messages(
    State(state): State<AppState>,
    Query(q): Query<SessionQuery>,
) -> ApiResult<MessageList> {
    let session_id = SessionId::from_raw(required(q.session_id, "sessionId")?);
    let messages = state.messages.list(&session_id)?;
    Ok(Json(MessageList {
        session_id,
        messages,
    }))
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.presence.connection_count(),
        state.presence.available_agents().len(),
    ))
}

/// GET /metrics
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render_prometheus(),
    )
}
