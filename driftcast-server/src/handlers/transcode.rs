use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use driftcast_model::{HwAccel, JobSnapshot, TranscodeMode, TranscodeRequest};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::registry::RegistryError;
use crate::errors::{AppError, AppResult};
use crate::state::AppState;

/// How long a delete waits for an implicitly cancelled job to land.
const DELETE_CANCEL_WAIT: Duration = Duration::from_secs(10);

/// POST /api/transcode/start
pub async fn start_transcode_handler(
    State(state): State<AppState>,
    Json(request): Json<TranscodeRequest>,
) -> AppResult<Json<JobSnapshot>> {
    validate_request(&state, &request)?;

    let sample = state.monitor.latest();
    let active = state.registry.active_count();
    if state.admission.refuse_intake(&sample, active) {
        return Err(AppError::capacity(
            format!("load factor {:.2}, not accepting new jobs", sample.load_factor),
            10,
        ));
    }

    let snapshot = state
        .registry
        .submit(request, &state.config.transcoding.temp_directory)
        .map_err(|err| match err {
            RegistryError::Full => AppError::capacity("job table is full", 30),
            err => AppError::internal(err.to_string()),
        })?;
    state.engine.poke();
    info!(job = %snapshot.job_id, mode = snapshot.mode.as_str(), "job accepted");
    Ok(Json(snapshot))
}

fn validate_request(state: &AppState, request: &TranscodeRequest) -> AppResult<()> {
    if request.source.trim().is_empty() {
        return Err(AppError::validation("source must not be empty"));
    }
    if request.mode == TranscodeMode::Abr && !state.config.transcoding.enable_abr {
        return Err(AppError::validation("abr mode is disabled on this server"));
    }
    // An explicitly requested encoder family that is known to be missing is
    // rejected here rather than failing the job later.
    let hw = request.output.hw_accel;
    if !matches!(hw, HwAccel::Auto | HwAccel::Software) && !state.capabilities.family_available(hw)
    {
        return Err(AppError::validation(format!(
            "hw_accel '{}' is not available on this machine",
            hw.as_str()
        )));
    }
    if request.start_time < 0.0 || !request.start_time.is_finite() {
        return Err(AppError::validation("start_time must be a non-negative number"));
    }
    for track in &request.subtitles {
        if track.lang.is_empty()
            || !track
                .lang
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(AppError::validation(format!(
                "invalid subtitle language tag '{}'",
                track.lang
            )));
        }
    }
    Ok(())
}

/// GET /api/transcode/{id}/status
pub async fn transcode_status_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<JobSnapshot>> {
    state
        .registry
        .get(id)
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("job {id} not found")))
}

/// POST /api/transcode/{id}/cancel
pub async fn cancel_transcode_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Value>> {
    state.registry.cancel(id).map_err(map_registry_error)?;
    state.engine.poke();
    Ok(Json(json!({ "status": "cancelled", "job_id": id })))
}

/// DELETE /api/transcode/{id}
///
/// Deleting an active job cancels it first and waits for the worker to land
/// before tearing the record and working directory down.
pub async fn delete_transcode_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let snapshot = state
        .registry
        .get(id)
        .ok_or_else(|| AppError::not_found(format!("job {id} not found")))?;

    if !snapshot.status.is_terminal() {
        state.registry.cancel(id).map_err(map_registry_error)?;
        wait_for_terminal(&state, id).await;
    }

    let working_dir = state.registry.delete(id).map_err(map_registry_error)?;
    if let Err(err) = tokio::fs::remove_dir_all(&working_dir).await
        && err.kind() != std::io::ErrorKind::NotFound
    {
        warn!(job = %id, error = %err, "working directory removal failed");
    }
    info!(job = %id, "job deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn wait_for_terminal(state: &AppState, id: Uuid) {
    let deadline = tokio::time::Instant::now() + DELETE_CANCEL_WAIT;
    while tokio::time::Instant::now() < deadline {
        match state.registry.get(id) {
            Some(snapshot) if !snapshot.status.is_terminal() => {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            _ => return,
        }
    }
    warn!(job = %id, "job did not land within the delete grace period");
}

fn map_registry_error(err: RegistryError) -> AppError {
    match err {
        RegistryError::NotFound(id) => AppError::not_found(format!("job {id} not found")),
        RegistryError::AlreadyTerminal(id) => {
            AppError::conflict(format!("job {id} is already terminal"))
        }
        RegistryError::NotTerminal(id) => {
            AppError::conflict(format!("job {id} is still active"))
        }
        RegistryError::Full => AppError::capacity("job table is full", 30),
    }
}
