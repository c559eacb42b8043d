use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::info;

use super::http::AppState;
use crate::stream::FailureReason;
use crate::{DisplayDescriptor, StartError, StreamConfig, StreamerError};

/// A [`StreamerError`] on its way to an HTTP client.
pub struct ApiError(StreamerError);

impl From<StreamerError> for ApiError {
    fn from(err: StreamerError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            StreamerError::Config(_) => StatusCode::BAD_REQUEST,
            StreamerError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            StreamerError::SessionBusy { .. } | StreamerError::DisplayLost(_) => StatusCode::CONFLICT,
            StreamerError::Start(StartError::BinaryMissing(_)) => StatusCode::SERVICE_UNAVAILABLE,
            StreamerError::Start(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let reason = FailureReason::from(&self.0);
        let body = json!({
            "success": false,
            "error": self.0.to_string(),
            "code": reason.code,
        });
        (self.status(), Json(body)).into_response()
    }
}

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

fn display_json(display: &DisplayDescriptor) -> serde_json::Value {
    json!({
        "id": display.id,
        "name": display.display_name(),
        "label": display.label,
        "geometry": display.geometry,
        "is_primary": display.is_primary,
        "connected": display.connected,
    })
}

pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let active = state
        .controller
        .statuses()
        .iter()
        .filter(|s| s.state.is_active())
        .count();
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "q8-streamer",
            "version": env!("CARGO_PKG_VERSION"),
            "active_sessions": active,
        })),
    )
}

// Display endpoints
pub async fn list_displays(State(state): State<AppState>) -> ApiResult {
    let displays = state.controller.list_displays().await;
    let external: Vec<_> = state
        .controller
        .registry()
        .external_displays()
        .await
        .iter()
        .map(|d| d.id)
        .collect();
    Ok(Json(json!({
        "displays": displays.iter().map(display_json).collect::<Vec<_>>(),
        "external": external,
    })))
}

pub async fn refresh_displays(State(state): State<AppState>) -> ApiResult {
    let changes = state.controller.registry().refresh().await;
    let displays = state.controller.list_displays().await;
    Ok(Json(json!({
        "changes": changes,
        "displays": displays.iter().map(display_json).collect::<Vec<_>>(),
    })))
}

// Stream endpoints
pub async fn list_streams(State(state): State<AppState>) -> ApiResult {
    Ok(Json(json!({ "streams": state.controller.statuses() })))
}

pub async fn get_stream(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    let status = state
        .controller
        .status(&name)
        .ok_or(StreamerError::SessionNotFound(name))?;
    Ok(Json(json!({ "stream": status })))
}

pub async fn start_stream(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(mut config): Json<StreamConfig>,
) -> ApiResult {
    // The path names the session.
    config.name = name.clone();
    info!("Starting stream '{}' ({})", name, config.target.kind());

    state.controller.start(config).await?;
    Ok(Json(json!({
        "success": true,
        "stream": state.controller.status(&name),
    })))
}

pub async fn stop_stream(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    info!("Stopping stream '{}'", name);
    state.controller.stop(&name).await?;
    Ok(Json(json!({
        "success": true,
        "stream": state.controller.status(&name),
    })))
}
