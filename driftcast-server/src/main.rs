use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use driftcast_server::config::Config;
use driftcast_server::engine::TranscodeEngine;
use driftcast_server::engine::registry::JobRegistry;
use driftcast_server::events::ProgressBus;
use driftcast_server::hardware::{AdmissionController, HardwareProfiler, LoadMonitor};
use driftcast_server::routes;
use driftcast_server::state::AppState;

/// Command line arguments for the Driftcast transcoding server
#[derive(Parser, Debug)]
#[command(name = "driftcast-server")]
#[command(about = "Video transcoding server with adaptive scheduling and live HLS output")]
struct Args {
    /// Server port (overrides config)
    #[arg(short, long, env = "DRIFTCAST_PORT")]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long, env = "DRIFTCAST_HOST")]
    host: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "driftcast_server=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!("failed to load configuration: {err:#}");
            std::process::exit(1);
        }
    };
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    if let Err(err) = config
        .ensure_directories()
        .and_then(|_| config.normalize_paths())
    {
        error!("failed to prepare directories: {err:#}");
        std::process::exit(1);
    }
    let config = Arc::new(config);
    info!(
        temp_dir = %config.transcoding.temp_directory.display(),
        "configuration loaded"
    );

    // Startup-only probe. A missing encoder tool is the one fatal outcome;
    // everything else degrades to a software-only profile.
    let profiler = HardwareProfiler::new(config.transcoding.ffmpeg_path.clone());
    let capabilities = match profiler.probe().await {
        Ok(capabilities) => Arc::new(capabilities),
        Err(err) => {
            error!("{err}");
            std::process::exit(2);
        }
    };
    info!(
        tier = capabilities.tier.as_str(),
        max_jobs = capabilities.suggested_max_jobs,
        "hardware tier classified"
    );

    let monitor = LoadMonitor::spawn();
    let admission = Arc::new(AdmissionController::new(
        capabilities.clone(),
        config.transcoding.max_concurrent_jobs,
    ));

    let bus = Arc::new(ProgressBus::new());
    bus.spawn_keepalive();

    let registry = Arc::new(JobRegistry::new(
        bus.clone(),
        Duration::from_secs(config.transcoding.retention_s),
    ));
    registry.spawn_janitor();

    let engine = TranscodeEngine::new(
        config.clone(),
        capabilities.clone(),
        registry.clone(),
        monitor.clone(),
        admission.clone(),
    );
    engine.spawn_dispatcher();

    let state = AppState {
        config: config.clone(),
        capabilities,
        monitor,
        admission,
        registry: registry.clone(),
        engine,
        bus,
        started_at: Instant::now(),
    };
    let router = routes::build_router(state);

    let addr: SocketAddr = match format!("{}:{}", config.server.host, config.server.port).parse() {
        Ok(addr) => addr,
        Err(err) => {
            error!("invalid listen address: {err}");
            std::process::exit(1);
        }
    };
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {addr}: {err}");
            std::process::exit(1);
        }
    };
    info!("listening on {addr}");

    let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested, cancelling active jobs");
        registry.cancel_all_active();
    });

    if let Err(err) = serve.await {
        error!("server error: {err}");
        std::process::exit(1);
    }
}
