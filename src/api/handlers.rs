use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::session::{BridgeSlot, ConnectionParams, Session, DEFAULT_PORT};

use super::error::ApiError;
use super::AppState;

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
}

pub(super) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct CreateSessionRequest {
    host: String,
    #[serde(default)]
    port: Option<u16>,
    username: String,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    identity_file: Option<PathBuf>,
}

impl CreateSessionRequest {
    fn into_params(self) -> ConnectionParams {
        let mut params = ConnectionParams::new(self.host, self.username).with_port(self.port.unwrap_or(DEFAULT_PORT));
        if let Some(password) = self.password {
            params = params.with_credential(password);
        }
        if let Some(identity) = self.identity_file {
            params = params.with_identity_file(identity);
        }
        params
    }
}

/// Session as reported by the API. The credential is never included.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub has_credential: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,
    /// Unix seconds.
    pub created_at: u64,
    pub attached: bool,
    /// Unix seconds at which the live bridge claimed the session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attached_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

impl From<&Session> for SessionInfo {
    fn from(session: &Session) -> Self {
        let params = &session.params;
        let (attached_at, pid) = match &session.bridge {
            BridgeSlot::Occupied(handle) => (Some(unix_secs(handle.attached_at())), handle.pid()),
            BridgeSlot::Vacant => (None, None),
        };
        Self {
            id: session.id.clone(),
            host: params.host.clone(),
            port: params.port,
            username: params.username.clone(),
            has_credential: !params.credential.is_empty(),
            identity_file: params.identity_file.clone(),
            created_at: unix_secs(session.created_at),
            attached: session.bridge.is_occupied(),
            attached_at,
            pid,
        }
    }
}

pub(super) async fn session_create(
    State(state): State<AppState>,
    body: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SessionInfo>), ApiError> {
    let Json(req) = body.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;
    let params = req.into_params();
    params.validate()?;
    let session = state.sessions.create(params);
    Ok((StatusCode::CREATED, Json(SessionInfo::from(&session))))
}

pub(super) async fn session_list(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.sessions.list().iter().map(SessionInfo::from).collect())
}

pub(super) async fn session_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    state
        .sessions
        .lookup(&id)
        .map(|session| Json(SessionInfo::from(&session)))
        .ok_or(ApiError::SessionNotFound(id))
}

/// Remove a session, killing its process if attached. Idempotent.
pub(super) async fn session_delete(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    if state.sessions.remove(&id).is_none() {
        tracing::debug!(session = %id, "delete of unknown session");
    }
    StatusCode::NO_CONTENT
}

pub(super) async fn not_found() -> ApiError {
    ApiError::NotFound
}
