use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::errors::AppError;
use crate::state::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Shared-token guard for the REST surface. Health stays open for probes and
/// the stream tree stays open for HLS players, so this layer is applied to
/// the API sub-router only.
pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = &state.config.security.api_key else {
        return next.run(request).await;
    };
    let provided = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());
    if provided == Some(expected.as_str()) {
        next.run(request).await
    } else {
        AppError::unauthorized("missing or invalid api key").into_response()
    }
}
