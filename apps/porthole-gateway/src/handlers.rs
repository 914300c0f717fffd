use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

use porthole_core::exec::{AuditAction, AuditEvent, AuditSink, TargetRef};
use porthole_core::upload::UploadOutcome;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
    active_sessions: usize,
}

/// GET /health - liveness probe with the live session count.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        active_sessions: state.sessions.active(),
    })
}

#[derive(Debug, Serialize)]
pub struct VersionInfo {
    name: &'static str,
    version: &'static str,
}

/// GET /version - build identification.
pub async fn version() -> Json<VersionInfo> {
    Json(VersionInfo {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Debug, Serialize)]
pub struct ExistsResponse {
    exists: bool,
}

/// GET /api/targets/:namespace/:name/exists - cached existence probe.
/// A failed backend query reads as "does not exist" and caches nothing.
pub async fn target_exists(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Json<ExistsResponse> {
    let target = TargetRef::new(namespace, name);
    let exists = match state.cache.exists(&target).await {
        Ok(exists) => exists,
        Err(err) => {
            warn!("existence query for {} failed: {}", target, err);
            false
        }
    };
    Json(ExistsResponse { exists })
}

#[derive(Debug, Deserialize)]
pub struct UploadParams {
    filename: String,
    #[serde(default = "default_user")]
    user: String,
}

fn default_user() -> String {
    "unknown_user".to_string()
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

/// POST /upload/:namespace/:name?filename=NAME - raw request body delivered
/// to the target's upload directory. 404 for unknown targets, 400 for bad
/// file names, 502 when the transfer itself fails.
pub async fn upload(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> Result<Json<UploadResponse>, ApiError> {
    let target = TargetRef::new(namespace, name);
    if !state.cache.exists(&target).await.unwrap_or(false) {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("target {target} does not exist"),
        ));
    }

    let session = state.sessions.find_open(&target);
    let task = state
        .uploads
        .upload(&target, &params.filename, body, session)
        .map_err(|err| ApiError::new(StatusCode::BAD_REQUEST, err.to_string()))?;

    match task.wait().await {
        UploadOutcome::Success { remote_path } => {
            let audit = state.audit.clone();
            let event = AuditEvent::now(&target, &params.user, AuditAction::Uploaded);
            tokio::spawn(async move { audit.record(event).await });
            Ok(Json(UploadResponse {
                message: remote_path,
            }))
        }
        UploadOutcome::Failure { reason } => Err(ApiError::new(StatusCode::BAD_GATEWAY, reason)),
    }
}
