use chrono::{DateTime, Utc};
use driftcast_model::{HwAccel, JobSnapshot, JobStatus, TranscodeMode, TranscodeRequest};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// The authoritative in-memory job record. Owned by the registry; once a
/// worker claims the job, every mutation flows through
/// [`crate::engine::registry::JobRegistry::apply`] from that worker alone.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: Uuid,
    pub request: TranscodeRequest,
    pub status: JobStatus,
    pub progress: f32,
    pub current_time_s: f64,
    pub duration_s: Option<f64>,
    pub speed: Option<f32>,
    pub fps: Option<f32>,
    pub frame: Option<u64>,
    pub eta_s: Option<f64>,
    pub hw_accel_used: Option<HwAccel>,
    pub stream_url: Option<String>,
    pub download_url: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempt: u32,
    pub working_dir: PathBuf,
    pub cancel: CancellationToken,
}

impl JobRecord {
    pub fn new(request: TranscodeRequest, temp_root: &Path) -> Self {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let working_dir = temp_root.join(id.to_string());
        // HLS modes hand out their stream URL at submission; the path is
        // fully determined by the id.
        let stream_url = matches!(request.mode, TranscodeMode::Stream | TranscodeMode::Abr)
            .then(|| format!("/stream/{id}/master.m3u8"));
        Self {
            id,
            request,
            status: JobStatus::Queued,
            progress: 0.0,
            current_time_s: 0.0,
            duration_s: None,
            speed: None,
            fps: None,
            frame: None,
            eta_s: None,
            hw_accel_used: None,
            stream_url,
            download_url: None,
            error_message: None,
            created_at: now,
            started_at: None,
            updated_at: now,
            finished_at: None,
            attempt: 0,
            working_dir,
            cancel: CancellationToken::new(),
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.id,
            status: self.status,
            mode: self.request.mode,
            source: self.request.source.clone(),
            progress: self.progress,
            current_time_s: self.current_time_s,
            duration_s: self.duration_s,
            speed: self.speed,
            fps: self.fps,
            frame: self.frame,
            eta_s: self.eta_s,
            hw_accel_used: self.hw_accel_used,
            stream_url: self.stream_url.clone(),
            download_url: self.download_url.clone(),
            error_message: self.error_message.clone(),
            attempt: self.attempt,
            created_at: self.created_at,
            started_at: self.started_at,
            updated_at: self.updated_at,
            finished_at: self.finished_at,
        }
    }
}

/// Latest encoder telemetry for one job, already normalized by the progress
/// parser.
#[derive(Debug, Clone, Default)]
pub struct TelemetryUpdate {
    pub progress: f32,
    pub current_time_s: f64,
    pub speed: Option<f32>,
    pub fps: Option<f32>,
    pub frame: Option<u64>,
    pub eta_s: Option<f64>,
}

/// Typed mutation applied through the registry. Each variant corresponds to
/// one worker-side event; the registry enforces state-machine legality and
/// progress monotonicity.
#[derive(Debug, Clone)]
pub enum JobUpdate {
    /// Queued -> Processing. Fires before probing; the encoder family lands
    /// separately once planning resolves it.
    Started,
    /// The attempt's encoder family was resolved by the planner.
    EncoderSelected { hw_accel: HwAccel },
    /// Source duration became known from probing.
    DurationKnown(f64),
    /// Encoder telemetry for the current attempt.
    Telemetry(TelemetryUpdate),
    /// Internal retry: telemetry resets, attempt increments, status stays
    /// `Processing` as far as observers are concerned.
    RetryStarted { attempt: u32 },
    /// Replanned onto a different encoder family mid-job.
    HwFallback { hw_accel: HwAccel },
    /// Processing -> Ready.
    Completed { download_url: Option<String> },
    /// Processing -> Error.
    Failed { message: String },
    /// Queued/Processing -> Cancelled.
    Cancelled,
}
