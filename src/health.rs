//! Liveness endpoint.
//!
//! Answers without auth and without touching the app directory or the blob
//! store, so a slow dependency never takes the instance out of rotation.

use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub data: HealthData,
}

#[derive(Debug, Serialize)]
pub struct HealthData {
    pub status: HealthStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET <health_path>` handler.  Always 200 while the process serves HTTP.
pub async fn health_handler() -> impl IntoResponse {
    let body = HealthResponse {
        data: HealthData {
            status: HealthStatus::Healthy,
        },
    };
    (StatusCode::OK, Json(body))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
