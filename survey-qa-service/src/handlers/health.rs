use crate::startup::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

/// Root banner.
///
/// GET /
pub async fn root() -> impl IntoResponse {
    Json(json!({
        "message": "Server is running. You may direct queries to api"
    }))
}

/// Liveness probe.
///
/// GET /health
pub async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "survey-qa-service",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Readiness probe: the survey database must answer when one is configured.
///
/// GET /ready
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let Some(db) = &state.db else {
        return StatusCode::OK;
    };

    match db.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
