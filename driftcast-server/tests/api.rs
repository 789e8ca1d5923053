//! Router-level integration tests. No encoder subprocess is ever spawned:
//! the dispatcher is left unstarted, so submitted jobs stay queued.

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use driftcast_model::{Capabilities, HardwareTier, HwAccel, HwEncoderGroup, RealtimeSample};
use driftcast_server::config::Config;
use driftcast_server::engine::TranscodeEngine;
use driftcast_server::engine::registry::JobRegistry;
use driftcast_server::events::ProgressBus;
use driftcast_server::hardware::{AdmissionController, LoadMonitor};
use driftcast_server::routes::build_router;
use driftcast_server::state::AppState;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower::util::ServiceExt;

fn software_only_capabilities() -> Capabilities {
    Capabilities {
        hw_encoders: vec![],
        software_encoders: vec!["libx264".into(), "libx265".into()],
        containers: vec!["mp4".into(), "mkv".into(), "webm".into()],
        tier: HardwareTier::Minimal,
        max_height: 480,
        max_bitrate_kbps: 2_000,
        suggested_max_jobs: 1,
        gpu_name: None,
        gpu_vram_mb: None,
        discrete_gpu: false,
        laptop: false,
        ffmpeg_version: Some("6.1".into()),
        os: "linux".into(),
    }
}

fn nvenc_capabilities() -> Capabilities {
    Capabilities {
        hw_encoders: vec![HwEncoderGroup {
            family: HwAccel::Nvenc,
            encoders: vec!["h264_nvenc".into(), "hevc_nvenc".into()],
        }],
        tier: HardwareTier::Ultra,
        max_height: 2160,
        max_bitrate_kbps: 25_000,
        suggested_max_jobs: 4,
        discrete_gpu: true,
        gpu_vram_mb: Some(12_288),
        ..software_only_capabilities()
    }
}

struct TestApp {
    router: Router,
    state: AppState,
    _temp: tempfile::TempDir,
}

fn build_app(capabilities: Capabilities, api_key: Option<String>) -> TestApp {
    let temp = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.transcoding.temp_directory = temp.path().to_path_buf();
    config.security.api_key = api_key;
    let config = Arc::new(config);

    let capabilities = Arc::new(capabilities);
    let monitor = LoadMonitor::fixed(RealtimeSample::default());
    let admission = Arc::new(AdmissionController::new(
        capabilities.clone(),
        config.transcoding.max_concurrent_jobs,
    ));
    let bus = Arc::new(ProgressBus::new());
    let registry = Arc::new(JobRegistry::new(bus.clone(), Duration::from_secs(120)));
    let engine = TranscodeEngine::new(
        config.clone(),
        capabilities.clone(),
        registry.clone(),
        monitor.clone(),
        admission.clone(),
    );

    let state = AppState {
        config,
        capabilities,
        monitor,
        admission,
        registry,
        engine,
        bus,
        started_at: Instant::now(),
    };
    TestApp {
        router: build_router(state.clone()),
        state,
        _temp: temp,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn get(path: &str) -> Request<Body> {
    Request::builder().uri(path).body(Body::empty()).unwrap()
}

fn post_json(path: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_reports_queue_depths() {
    let app = build_app(software_only_capabilities(), None);
    let (status, body) = send(&app.router, get("/api/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["current_jobs"], 0);
    assert_eq!(body["queued_jobs"], 0);
    assert!(body["version"].is_string());
    assert!(body["uptime_seconds"].is_number());
}

#[tokio::test]
async fn capabilities_exposes_tier_and_encoders() {
    let app = build_app(nvenc_capabilities(), None);
    let (status, body) = send(&app.router, get("/api/capabilities")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tier"], "ultra");
    assert_eq!(body["hw_encoders"][0]["family"], "nvenc");
    assert_eq!(body["suggested_max_jobs"], 4);
}

#[tokio::test]
async fn submit_returns_queued_job_with_stream_url() {
    let app = build_app(software_only_capabilities(), None);
    let (status, body) = send(
        &app.router,
        post_json(
            "/api/transcode/start",
            json!({
                "source": "http://host/v.mkv",
                "mode": "stream",
                "output": {"resolution": "720p", "video_codec": "h264"}
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "queued");
    let job_id = body["job_id"].as_str().unwrap();
    assert_eq!(
        body["stream_url"].as_str().unwrap(),
        format!("/stream/{job_id}/master.m3u8")
    );
}

#[tokio::test]
async fn explicit_unavailable_hw_accel_is_rejected_at_submit() {
    let app = build_app(software_only_capabilities(), None);
    let (status, body) = send(
        &app.router,
        post_json(
            "/api/transcode/start",
            json!({"source": "http://host/v.mkv", "output": {"hw_accel": "nvenc"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation");
}

#[tokio::test]
async fn auto_hw_accel_succeeds_on_software_only_machine() {
    let app = build_app(software_only_capabilities(), None);
    let (status, _) = send(
        &app.router,
        post_json(
            "/api/transcode/start",
            json!({"source": "http://host/v.mkv", "output": {"hw_accel": "auto"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let app = build_app(software_only_capabilities(), None);
    let (status, body) = send(
        &app.router,
        get("/api/transcode/00000000-0000-0000-0000-000000000000/status"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn submit_cancel_delete_leaves_no_files() {
    let app = build_app(software_only_capabilities(), None);
    let (_, body) = send(
        &app.router,
        post_json("/api/transcode/start", json!({"source": "http://host/v.mkv"})),
    )
    .await;
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &app.router,
        post_json(&format!("/api/transcode/{job_id}/cancel"), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "cancelled");

    let (status, _) = send(
        &app.router,
        Request::builder()
            .method("DELETE")
            .uri(format!("/api/transcode/{job_id}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let working_dir = app
        .state
        .config
        .transcoding
        .temp_directory
        .join(&job_id);
    assert!(!working_dir.exists());
    // And the record itself is gone.
    let (status, _) = send(&app.router, get(&format!("/api/transcode/{job_id}/status"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn stream_tree_is_scoped_to_known_jobs() {
    let app = build_app(software_only_capabilities(), None);
    let (status, _) = send(
        &app.router,
        get("/stream/00000000-0000-0000-0000-000000000000/master.m3u8"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn api_key_guards_api_but_not_health() {
    let app = build_app(software_only_capabilities(), Some("secret".into()));

    let (status, body) = send(&app.router, get("/api/stats")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "unauthorized");

    let (status, _) = send(
        &app.router,
        Request::builder()
            .uri("/api/stats")
            .header("x-api-key", "secret")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&app.router, get("/api/health")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn stats_counts_submissions() {
    let app = build_app(software_only_capabilities(), None);
    send(
        &app.router,
        post_json("/api/transcode/start", json!({"source": "http://host/v.mkv"})),
    )
    .await;
    let (status, body) = send(&app.router, get("/api/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["jobs"]["submitted"], 1);
    assert_eq!(body["jobs"]["queued"], 1);
    assert_eq!(body["subscribers"], 0);
}

#[tokio::test]
async fn status_is_a_composite_view() {
    let app = build_app(nvenc_capabilities(), None);
    let (status, body) = send(&app.router, get("/api/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["hardware"]["tier"], "ultra");
    assert!(body["realtime"]["load_factor"].is_number());
    assert!(body["admission"]["allow"].is_boolean());
    assert!(body["jobs"].is_array());
}
