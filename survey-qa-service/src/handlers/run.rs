use crate::models::{RunRequest, RunResponse};
use crate::services::HarnessError;
use crate::startup::AppState;
use axum::{extract::State, Json};
use service_core::error::AppError;
use std::time::Duration;
use tracing::instrument;
use validator::Validate;

/// Answer a question with the collaborator, bounded by `timeout` seconds.
///
/// POST /run
#[instrument(skip_all)]
pub async fn run(
    State(state): State<AppState>,
    Json(req): Json<RunRequest>,
) -> Result<Json<RunResponse>, AppError> {
    req.validate()?;

    let timeout = req
        .timeout
        .map(|secs| Duration::from_secs(secs.unsigned_abs()))
        .unwrap_or(state.default_timeout);

    tracing::info!(
        prompt_chars = req.prompt.chars().count(),
        timeout_secs = timeout.as_secs(),
        "Run requested"
    );

    let report = state
        .harness
        .run(req.prompt, timeout)
        .await
        .map_err(|e| match e {
            HarnessError::Collaborator(err) => AppError::InternalError(err),
            other => AppError::InternalError(anyhow::Error::new(other)),
        })?;

    Ok(Json(report.into()))
}
