//! REST API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use netwatch_core::AddressRange;
use netwatch_discovery::DiscoveryError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::ipv4_interfaces;
use crate::state::AppState;

/// API error response
#[derive(Serialize)]
struct ApiError {
    error: String,
}

impl ApiError {
    fn new(msg: impl Into<String>) -> Self {
        Self { error: msg.into() }
    }
}

fn internal(e: impl std::fmt::Display) -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiError::new(e.to_string())),
    )
        .into_response()
}

/// List all discovered devices
pub async fn list_devices(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.devices().await {
        Ok(devices) => Json(devices).into_response(),
        Err(e) => internal(e),
    }
}

/// Get a specific device by ID
pub async fn get_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.get_device(&id).await {
        Ok(Some(device)) => Json(device).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ApiError::new("Device not found")),
        )
            .into_response(),
        Err(e) => internal(e),
    }
}

/// Trigger a discovery scan and wait for it
pub async fn trigger_scan(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    info!("Manual scan triggered");

    match state.scanner.scan_once().await {
        Ok(summary) => Json(summary).into_response(),
        Err(e @ DiscoveryError::CycleInProgress(_)) => {
            (StatusCode::CONFLICT, Json(ApiError::new(e.to_string()))).into_response()
        }
        Err(e) => {
            warn!(error = %e, "Manual scan failed");
            internal(format!("Scan failed: {}", e))
        }
    }
}

/// Whether a discovery cycle is running for the configured range
pub async fn scan_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "scanning": state.scanner.is_scanning().await,
        "range": state.range().await.to_string(),
    }))
}

/// Get current configuration
pub async fn get_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.config.clone())
}

/// List available network interfaces
pub async fn list_interfaces() -> impl IntoResponse {
    Json(ipv4_interfaces())
}

/// Request to change the scan range
#[derive(Deserialize)]
pub struct UpdateRangeRequest {
    pub range: String,
}

/// Update the scan range; the next cycle uses it
pub async fn update_range(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UpdateRangeRequest>,
) -> impl IntoResponse {
    let range: AddressRange = match req.range.parse() {
        Ok(range) => range,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiError::new(format!("Invalid range: {}", e))),
            )
                .into_response();
        }
    };

    state.scanner.update_range(range).await;

    Json(serde_json::json!({
        "status": "updated",
        "range": range.to_string(),
    }))
    .into_response()
}
