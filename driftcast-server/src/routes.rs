use axum::{
    Router,
    http::{HeaderValue, Method},
    middleware,
    routing::{delete, get, post},
};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::auth;
use crate::handlers::{stream, system, transcode, ws};
use crate::state::AppState;

/// Assemble the full router: REST API behind the shared-token guard and a
/// request timeout, the stream tree and websocket endpoint open for players.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/capabilities", get(system::capabilities_handler))
        .route("/api/stats", get(system::stats_handler))
        .route("/api/status", get(system::status_handler))
        .route(
            "/api/transcode/start",
            post(transcode::start_transcode_handler),
        )
        .route(
            "/api/transcode/{id}/status",
            get(transcode::transcode_status_handler),
        )
        .route(
            "/api/transcode/{id}/cancel",
            post(transcode::cancel_transcode_handler),
        )
        .route(
            "/api/transcode/{id}",
            delete(transcode::delete_transcode_handler),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ))
        // Health stays unauthenticated for probes.
        .route("/api/health", get(system::health_handler))
        .layer(TimeoutLayer::new(state.config.request_timeout()));

    let origins = &state.config.server.cors_allowed_origins;
    let allow_origin = if origins.iter().any(|origin| origin == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(
            origins
                .iter()
                .filter_map(|origin| HeaderValue::from_str(origin).ok()),
        )
    };
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_origin(allow_origin)
        .allow_headers(tower_http::cors::Any);

    Router::new()
        .merge(api)
        .route("/stream/{id}/{*artifact}", get(stream::serve_artifact_handler))
        .route("/ws/progress", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
