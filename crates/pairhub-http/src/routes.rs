//! HTTP route handlers for the session API.
//!
//! Successful mutations answer `{"message": ...}`; failures answer with the
//! same shape and a status code derived from [`SessionError`].

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use pairhub_core::{QrStatus, SessionError, SessionSnapshot, SessionStatus, StartOutcome};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::SharedState;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    fn new(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            message: message.into(),
        })
    }
}

/// A [`SessionError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub SessionError);

impl From<SessionError> for ApiError {
    fn from(error: SessionError) -> Self {
        Self(error)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0 {
            SessionError::Validation(_) => StatusCode::BAD_REQUEST,
            SessionError::NotFound(_) => StatusCode::NOT_FOUND,
            SessionError::NotReady { .. } => StatusCode::CONFLICT,
            SessionError::Transport(_) => StatusCode::BAD_GATEWAY,
            SessionError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("Request failed: {}", self.0);
        } else {
            log::debug!("Request rejected ({}): {}", status, self.0);
        }
        (status, MessageResponse::new(self.0.to_string())).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    #[serde(default)]
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct StartQuery {
    #[serde(default)]
    pub session_id: String,
    pub admin_number: Option<String>,
}

/// Missing fields surface as validation errors instead of extractor rejections.
#[derive(Debug, Deserialize)]
pub struct SendRequest {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub number: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct DisconnectRequest {
    #[serde(default)]
    pub session_id: String,
}

/// Handler for GET /api/start
pub async fn start(
    State(state): State<Arc<SharedState>>,
    Query(query): Query<StartQuery>,
) -> ApiResult<Json<MessageResponse>> {
    match state
        .orchestrator
        .start(&query.session_id, query.admin_number.as_deref())?
    {
        StartOutcome::Created => log::info!("[{}] Start requested", query.session_id.trim()),
        StartOutcome::AlreadyExists(session_state) => log::debug!(
            "[{}] Start requested for existing session ({})",
            query.session_id.trim(),
            session_state
        ),
        StartOutcome::ShuttingDown => log::warn!(
            "[{}] Start requested during shutdown; ignored",
            query.session_id.trim()
        ),
    }
    Ok(MessageResponse::new("Session started"))
}

/// Handler for GET /api/qr
pub async fn qr(
    State(state): State<Arc<SharedState>>,
    Query(query): Query<SessionQuery>,
) -> ApiResult<Json<QrStatus>> {
    Ok(Json(state.orchestrator.qr(&query.session_id)?))
}

/// Handler for GET /api/status
pub async fn status(
    State(state): State<Arc<SharedState>>,
    Query(query): Query<SessionQuery>,
) -> ApiResult<Json<SessionStatus>> {
    Ok(Json(state.orchestrator.status(&query.session_id).await?))
}

/// Handler for POST /api/send
pub async fn send(
    State(state): State<Arc<SharedState>>,
    Json(request): Json<SendRequest>,
) -> ApiResult<Json<MessageResponse>> {
    state
        .orchestrator
        .send(&request.session_id, &request.number, &request.message)
        .await?;
    Ok(MessageResponse::new("Message sent"))
}

/// Handler for POST /api/disconnect
pub async fn disconnect(
    State(state): State<Arc<SharedState>>,
    Json(request): Json<DisconnectRequest>,
) -> ApiResult<Json<MessageResponse>> {
    state.orchestrator.disconnect(&request.session_id).await?;
    Ok(MessageResponse::new("Session disconnected"))
}

/// Handler for GET /api/sessions
pub async fn sessions(State(state): State<Arc<SharedState>>) -> Json<Vec<SessionSnapshot>> {
    Json(state.orchestrator.list())
}
