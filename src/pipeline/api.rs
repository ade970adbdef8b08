use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::bridge::QueueBridge;
use super::intake::IntakeCoordinator;
use super::models::DeploymentId;
use crate::errors::BridgeError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub intake: IntakeCoordinator,
    pub bridge: QueueBridge,
    /// Fired on shutdown; aborts in-flight clones and uploads.
    pub shutdown: CancellationToken,
}

pub type SharedState = Arc<AppState>;

// ── Request / response payloads ───────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    pub repo: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeployResponse {
    pub id: String,
}

// ── Error handling ────────────────────────────────────────────────────

/// Handler failures. Bodies are plain text.
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, message).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/deploy", post(deploy))
        .route("/status/{id}", get(get_status))
        .route("/health_check", get(health_check))
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn deploy(
    State(state): State<SharedState>,
    payload: Result<Json<DeployRequest>, JsonRejection>,
) -> Result<Json<DeployResponse>, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let receipt = state
        .intake
        .submit(&request.repo, &state.shutdown)
        .await
        .map_err(|e| {
            error!(repo = %request.repo, error = %e, "deploy failed");
            ApiError::Internal(e.to_string())
        })?;

    info!(deployment = %receipt.id, repo = %request.repo, "deploy accepted");
    Ok(Json(DeployResponse {
        id: receipt.id.to_string(),
    }))
}

async fn get_status(
    State(state): State<SharedState>,
    Path(raw_id): Path<String>,
) -> Result<String, ApiError> {
    let id = DeploymentId::parse(&raw_id)
        .ok_or_else(|| ApiError::NotFound(format!("No deployment {raw_id}")))?;

    match state.bridge.get_status(&id).await {
        Ok(status) => Ok(status.to_string()),
        Err(e @ BridgeError::StatusNotFound { .. }) => Err(ApiError::NotFound(e.to_string())),
        Err(e) => {
            error!(deployment = %id, error = %e, "status lookup failed");
            Err(ApiError::Internal(e.to_string()))
        }
    }
}
