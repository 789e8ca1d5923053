//! Per-job worker: spawns the encoder, supervises it, and drives the job
//! record through its lifecycle.
//!
//! One worker owns one job from dispatch to terminal status. Progress reading
//! and the stall/cancel watchdogs run as branches of a single select loop
//! around the child process; retries and hardware fallback replan from the
//! original request with a wiped working directory.

use anyhow::{Context, Result};
use driftcast_model::{HwAccel, TranscodeMode, TranscodeRequest};
use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::job::{JobUpdate, TelemetryUpdate};
use super::planner::EncodePlan;
use super::playlist::{self, PlaylistPublisher};
use super::probe::{self, SourceInfo};
use super::progress::{ProgressParser, eta_seconds, percent_complete};
use super::subtitles;
use crate::engine::TranscodeEngine;

/// Grace period between the polite stop request and the hard kill.
const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(5);
/// Progress events are rate limited to one per job per this window.
const PROGRESS_EVENT_INTERVAL: Duration = Duration::from_millis(500);
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);
/// Bound on the stderr tail kept for error reporting.
const STDERR_TAIL_BYTES: usize = 2048;
const PUBLISH_INTERVAL: Duration = Duration::from_secs(1);
const CALLBACK_TIMEOUT: Duration = Duration::from_secs(5);

/// How one encoder pass ended.
enum PassOutcome {
    Success,
    Cancelled,
    Stalled,
    Failed { exit_code: i32, stderr_tail: String },
}

/// Failure classes that drive the recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorClass {
    Transient,
    Hardware,
    Fatal,
}

/// Run one job to a terminal status. Never panics the process; every failure
/// lands in the job record.
pub async fn run_job(engine: &TranscodeEngine, job_id: Uuid) {
    let Some(request) = engine.registry.request(job_id) else {
        return;
    };
    let Some(cancel) = engine.registry.cancel_token(job_id) else {
        return;
    };
    let Some(working_dir) = engine.registry.working_dir(job_id) else {
        return;
    };

    if let Err(err) = drive(engine, job_id, &request, &cancel, &working_dir).await {
        error!(job = %job_id, error = %err, "worker failed outside the encoder");
        let _ = engine.registry.apply(
            job_id,
            JobUpdate::Failed {
                message: bounded_tail(&err.to_string()),
            },
        );
        send_callback(engine, job_id, &request).await;
    }
}

async fn drive(
    engine: &TranscodeEngine,
    job_id: Uuid,
    request: &TranscodeRequest,
    cancel: &CancellationToken,
    working_dir: &Path,
) -> Result<()> {
    let config = &engine.config.transcoding;

    // The working directory must exist before the job is observable as
    // `processing`.
    reset_working_dir(working_dir).await?;
    engine.registry.apply(job_id, JobUpdate::Started)?;

    let source = match probe::probe_source(&config.ffprobe_path, &request.source).await {
        Ok(source) => source,
        Err(err) => {
            engine.registry.apply(
                job_id,
                JobUpdate::Failed {
                    message: bounded_tail(&format!("source probe failed: {err}")),
                },
            )?;
            send_callback(engine, job_id, request).await;
            return Ok(());
        }
    };
    if let Some(duration) = source.duration_s {
        engine
            .registry
            .apply(job_id, JobUpdate::DurationKnown(duration))?;
    }

    let mut attempt: u32 = 0;
    let mut force_software = false;
    let mut first_attempt = true;

    loop {
        if cancel.is_cancelled() {
            engine.registry.apply(job_id, JobUpdate::Cancelled)?;
            return Ok(());
        }

        // Only the working directory root survives between attempts.
        if !first_attempt {
            reset_working_dir(working_dir).await?;
        }

        let sample = engine.monitor.latest();
        let decision = engine
            .admission
            .decide(&sample, engine.registry.active_count());
        let plan = match engine.planner.plan(
            request,
            &source,
            decision.quality_factor,
            working_dir,
            force_software,
        ) {
            Ok(plan) => plan,
            Err(err) => {
                engine.registry.apply(
                    job_id,
                    JobUpdate::Failed {
                        message: bounded_tail(&err.to_string()),
                    },
                )?;
                send_callback(engine, job_id, request).await;
                return Ok(());
            }
        };

        for rendition in &plan.renditions {
            tokio::fs::create_dir_all(working_dir.join(&rendition.name))
                .await
                .context("failed to create rendition directory")?;
        }

        let fetched = subtitles::fetch_tracks(&engine.http, working_dir, &request.subtitles)
            .await
            .unwrap_or_default();
        let media_master = request.mode == TranscodeMode::Stream && fetched.is_empty();
        if !plan.renditions.is_empty() {
            if !media_master {
                playlist::write_master(working_dir, &plan.renditions, &fetched).await?;
            }
            if !fetched.is_empty() {
                playlist::write_subtitle_playlists(
                    working_dir,
                    &fetched,
                    source.duration_s.unwrap_or_default().max(0.0)
                        - request.start_time.max(0.0),
                )
                .await?;
            }
        }

        engine.registry.apply(
            job_id,
            JobUpdate::EncoderSelected {
                hw_accel: plan.family,
            },
        )?;
        if first_attempt {
            info!(job = %job_id, family = plan.family.as_str(), "encoding started");
            first_attempt = false;
        }

        let publisher = (!plan.renditions.is_empty()).then(|| {
            PlaylistPublisher::new(
                working_dir.to_path_buf(),
                plan.renditions.clone(),
                config.segment_duration_s,
                media_master,
            )
        });
        if let Some(publisher) = &publisher {
            publisher.publish_empty().await?;
        }

        let outcome = run_passes(engine, job_id, request, &source, &plan, cancel, publisher.as_ref())
            .await?;

        if cancel.is_cancelled() {
            // Cancellation may race the exit; it always wins. Artifacts stay
            // on disk until an explicit delete.
            engine.registry.apply(job_id, JobUpdate::Cancelled)?;
            return Ok(());
        }

        match outcome {
            PassOutcome::Success => {
                if let Some(publisher) = &publisher {
                    publisher.publish(true).await?;
                }
                let download_url = plan.output_file.as_ref().and_then(|path| {
                    path.file_name()
                        .map(|name| format!("/stream/{job_id}/{}", name.to_string_lossy()))
                });
                engine
                    .registry
                    .apply(job_id, JobUpdate::Completed { download_url })?;
                info!(job = %job_id, "encoding complete");
                send_callback(engine, job_id, request).await;
                return Ok(());
            }
            PassOutcome::Cancelled => {
                engine.registry.apply(job_id, JobUpdate::Cancelled)?;
                return Ok(());
            }
            PassOutcome::Stalled => {
                let message = format!(
                    "stalled: no encoder progress within {}s",
                    config.stall_timeout_s
                );
                if attempt < config.retry_count {
                    attempt += 1;
                    warn!(job = %job_id, attempt, "encoder stalled, retrying");
                    if !backoff(attempt, cancel).await {
                        continue;
                    }
                    engine
                        .registry
                        .apply(job_id, JobUpdate::RetryStarted { attempt })?;
                    continue;
                }
                engine.registry.apply(
                    job_id,
                    JobUpdate::Failed {
                        message: bounded_tail(&message),
                    },
                )?;
                send_callback(engine, job_id, request).await;
                return Ok(());
            }
            PassOutcome::Failed {
                exit_code,
                stderr_tail,
            } => {
                let class = classify_error(&stderr_tail);
                debug!(job = %job_id, exit_code, ?class, "encoder exited with failure");

                if class == ErrorClass::Hardware
                    && !force_software
                    && plan.family != HwAccel::Software
                    && engine.config.hardware.fallback_to_software
                    && !engine.capabilities.software_encoders.is_empty()
                {
                    warn!(job = %job_id, family = plan.family.as_str(), "hardware encoder failed, replanning on software");
                    force_software = true;
                    attempt = 0;
                    engine.registry.apply(
                        job_id,
                        JobUpdate::HwFallback {
                            hw_accel: HwAccel::Software,
                        },
                    )?;
                    continue;
                }

                if class == ErrorClass::Transient && attempt < config.retry_count {
                    attempt += 1;
                    warn!(job = %job_id, attempt, exit_code, "transient encoder failure, retrying");
                    if !backoff(attempt, cancel).await {
                        continue;
                    }
                    engine
                        .registry
                        .apply(job_id, JobUpdate::RetryStarted { attempt })?;
                    continue;
                }

                engine.registry.apply(
                    job_id,
                    JobUpdate::Failed {
                        message: bounded_tail(&format!(
                            "encoder exited with code {exit_code}: {stderr_tail}"
                        )),
                    },
                )?;
                send_callback(engine, job_id, request).await;
                return Ok(());
            }
        }
    }
}

/// Run the plan's passes in order; the first non-success outcome wins. For
/// two-pass batch encodes the analysis pass maps onto the first half of the
/// progress range.
async fn run_passes(
    engine: &TranscodeEngine,
    job_id: Uuid,
    request: &TranscodeRequest,
    source: &SourceInfo,
    plan: &EncodePlan,
    cancel: &CancellationToken,
    publisher: Option<&PlaylistPublisher>,
) -> Result<PassOutcome> {
    if let Some(first_pass) = &plan.first_pass_args {
        let outcome = supervise(
            engine, job_id, request, source, first_pass, cancel, None, 0.0, 50.0,
        )
        .await?;
        if !matches!(outcome, PassOutcome::Success) {
            return Ok(outcome);
        }
        return supervise(
            engine, job_id, request, source, &plan.args, cancel, publisher, 50.0, 50.0,
        )
        .await;
    }
    supervise(
        engine, job_id, request, source, &plan.args, cancel, publisher, 0.0, 100.0,
    )
    .await
}

/// Spawn one encoder invocation and supervise it: parse the progress stream,
/// keep the stderr tail, publish playlists, and enforce the stall and cancel
/// watchdogs.
#[allow(clippy::too_many_arguments)]
async fn supervise(
    engine: &TranscodeEngine,
    job_id: Uuid,
    request: &TranscodeRequest,
    source: &SourceInfo,
    args: &[String],
    cancel: &CancellationToken,
    publisher: Option<&PlaylistPublisher>,
    progress_base: f32,
    progress_scale: f32,
) -> Result<PassOutcome> {
    let config = &engine.config.transcoding;
    debug!(job = %job_id, ?args, "spawning encoder");

    let mut child = Command::new(&config.ffmpeg_path)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .context("failed to spawn encoder")?;

    let stdout = child.stdout.take().context("encoder has no stdout")?;
    let stderr = child.stderr.take().context("encoder has no stderr")?;
    let mut stdin = child.stdin.take();

    let mut progress_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();
    let mut parser = ProgressParser::new();
    let mut tail: VecDeque<String> = VecDeque::new();
    let mut tail_bytes = 0usize;

    let stall_timeout = engine.config.stall_timeout();
    let mut last_advance = Instant::now();
    let mut last_out_time = -1.0_f64;
    let mut last_event: Option<Instant> = None;

    let mut watchdog = tokio::time::interval(Duration::from_secs(1));
    watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut publish_tick = tokio::time::interval(PUBLISH_INTERVAL);
    publish_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut stdout_open = true;
    let mut stderr_open = true;

    // Both pipes close when the encoder exits; reaping happens after the
    // loop so no branch needs the child while another polls it.
    while stdout_open || stderr_open {
        tokio::select! {
            _ = cancel.cancelled() => {
                stop_child(&mut child, &mut stdin).await;
                return Ok(PassOutcome::Cancelled);
            }

            _ = watchdog.tick() => {
                if last_advance.elapsed() > stall_timeout {
                    warn!(job = %job_id, "stall watchdog fired, terminating encoder");
                    stop_child(&mut child, &mut stdin).await;
                    return Ok(PassOutcome::Stalled);
                }
            }

            _ = publish_tick.tick(), if publisher.is_some() => {
                if let Some(publisher) = publisher
                    && let Err(err) = publisher.publish(false).await
                {
                    warn!(job = %job_id, error = %err, "playlist publish failed");
                }
            }

            line = progress_lines.next_line(), if stdout_open => {
                match line {
                    Ok(Some(line)) => {
                        if let Some(record) = parser.feed_line(&line) {
                            if let Some(out_time) = record.out_time_s
                                && out_time > last_out_time
                            {
                                last_out_time = out_time;
                                last_advance = Instant::now();
                            }
                            let due = last_event
                                .is_none_or(|at| at.elapsed() >= PROGRESS_EVENT_INTERVAL);
                            // One final event always lands at termination.
                            if due || record.end {
                                let out_time = record.out_time_s.unwrap_or(last_out_time.max(0.0));
                                let percent = progress_base
                                    + progress_scale / 100.0
                                        * percent_complete(
                                            out_time,
                                            request.start_time,
                                            source.duration_s,
                                        );
                                let update = TelemetryUpdate {
                                    progress: percent,
                                    current_time_s: request.start_time + out_time,
                                    speed: record.speed,
                                    fps: record.fps,
                                    frame: record.frame,
                                    eta_s: eta_seconds(
                                        out_time,
                                        request.start_time,
                                        source.duration_s,
                                        record.speed,
                                    ),
                                };
                                let _ = engine
                                    .registry
                                    .apply(job_id, JobUpdate::Telemetry(update));
                                last_event = Some(Instant::now());
                            }
                        }
                    }
                    Ok(None) | Err(_) => stdout_open = false,
                }
            }

            line = stderr_lines.next_line(), if stderr_open => {
                match line {
                    Ok(Some(line)) => {
                        tail_bytes += line.len() + 1;
                        tail.push_back(line);
                        while tail_bytes > STDERR_TAIL_BYTES {
                            if let Some(evicted) = tail.pop_front() {
                                tail_bytes -= evicted.len() + 1;
                            } else {
                                break;
                            }
                        }
                    }
                    Ok(None) | Err(_) => stderr_open = false,
                }
            }
        }
    }

    // Pipes are closed; the process is exiting or already gone. Give it the
    // same grace window before forcing the issue.
    let status = match tokio::time::timeout(GRACEFUL_STOP_TIMEOUT, child.wait()).await {
        Ok(status) => status.context("failed to reap encoder")?,
        Err(_) => {
            let _ = child.kill().await;
            child.wait().await.context("failed to reap encoder")?
        }
    };
    if let Some(publisher) = publisher {
        let _ = publisher.publish(false).await;
    }
    if status.success() {
        return Ok(PassOutcome::Success);
    }
    let stderr_tail: String = tail.into_iter().collect::<Vec<_>>().join("\n");
    Ok(PassOutcome::Failed {
        exit_code: status.code().unwrap_or(-1),
        stderr_tail,
    })
}

/// Termination sequence: polite quit on stdin first, hard kill after the
/// grace period. The worker owns the only handle, so the subprocess is gone
/// when this returns.
async fn stop_child(child: &mut Child, stdin: &mut Option<tokio::process::ChildStdin>) {
    if let Some(mut stdin) = stdin.take() {
        let _ = stdin.write_all(b"q\n").await;
        let _ = stdin.flush().await;
    }
    match tokio::time::timeout(GRACEFUL_STOP_TIMEOUT, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
    }
}

/// Exponential backoff before a retry, cut short by cancellation. Returns
/// `false` when the wait was interrupted.
async fn backoff(attempt: u32, cancel: &CancellationToken) -> bool {
    let secs = 2u64.saturating_pow(attempt).min(MAX_RETRY_BACKOFF.as_secs());
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(secs)) => true,
        _ = cancel.cancelled() => false,
    }
}

/// Wipe and recreate the working directory. Nothing from a previous attempt
/// is trusted except the root itself.
async fn reset_working_dir(working_dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(working_dir).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).context("failed to clear working directory"),
    }
    tokio::fs::create_dir_all(working_dir)
        .await
        .context("failed to create working directory")?;
    Ok(())
}

/// Classify an encoder failure from its stderr tail.
fn classify_error(stderr_tail: &str) -> ErrorClass {
    let tail = stderr_tail.to_lowercase();

    const HARDWARE: &[&str] = &[
        "device creation failed",
        "no device available",
        "cannot load nvcuda",
        "cannot load libcuda",
        "failed to initialise",
        "failed to initialize",
        "driver does not support",
        "no capable devices found",
        "generic error in an external library",
        "out of memory",
        "no nvenc capable devices",
        "incompatible driver",
        "operation not permitted",
    ];
    const TRANSIENT: &[&str] = &[
        "connection refused",
        "connection reset",
        "connection timed out",
        "timed out",
        "temporarily unavailable",
        "input/output error",
        "network is unreachable",
        "server returned 5",
        "broken pipe",
    ];

    if HARDWARE.iter().any(|needle| tail.contains(needle)) {
        ErrorClass::Hardware
    } else if TRANSIENT.iter().any(|needle| tail.contains(needle)) {
        ErrorClass::Transient
    } else {
        ErrorClass::Fatal
    }
}

/// Clamp an error message to the documented stderr tail bound.
fn bounded_tail(message: &str) -> String {
    if message.len() <= STDERR_TAIL_BYTES {
        return message.to_string();
    }
    let start = message.len() - STDERR_TAIL_BYTES;
    // Round forward to a character boundary.
    let start = (start..message.len())
        .find(|idx| message.is_char_boundary(*idx))
        .unwrap_or(start);
    message[start..].to_string()
}

/// Best-effort completion callback: one POST of the final snapshot.
async fn send_callback(engine: &TranscodeEngine, job_id: Uuid, request: &TranscodeRequest) {
    let Some(url) = &request.callback_url else {
        return;
    };
    let Some(snapshot) = engine.registry.get(job_id) else {
        return;
    };
    match engine
        .http
        .post(url)
        .timeout(CALLBACK_TIMEOUT)
        .json(&snapshot)
        .send()
        .await
    {
        Ok(response) => debug!(job = %job_id, status = %response.status(), "completion callback sent"),
        Err(err) => warn!(job = %job_id, error = %err, "completion callback failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_errors_are_classified() {
        assert_eq!(
            classify_error("[h264_nvenc] Cannot load nvcuda.dll"),
            ErrorClass::Hardware
        );
        assert_eq!(
            classify_error("Device creation failed: -542398533."),
            ErrorClass::Hardware
        );
        assert_eq!(
            classify_error("Generic error in an external library"),
            ErrorClass::Hardware
        );
    }

    #[test]
    fn network_errors_are_transient() {
        assert_eq!(
            classify_error("tcp://host:8080: Connection refused"),
            ErrorClass::Transient
        );
        assert_eq!(
            classify_error("error reading header: Input/output error"),
            ErrorClass::Transient
        );
    }

    #[test]
    fn unknown_errors_are_fatal() {
        assert_eq!(
            classify_error("Invalid data found when processing input"),
            ErrorClass::Fatal
        );
        assert_eq!(classify_error(""), ErrorClass::Fatal);
    }

    #[test]
    fn tail_is_bounded_to_two_kib() {
        let long = "x".repeat(5000);
        let bounded = bounded_tail(&long);
        assert_eq!(bounded.len(), STDERR_TAIL_BYTES);

        let short = "short message";
        assert_eq!(bounded_tail(short), short);
    }

    #[test]
    fn backoff_schedule_is_capped() {
        // min(2^attempt, 30): 2, 4, 8, 16, 30, 30 ...
        let schedule: Vec<u64> = (1..=6)
            .map(|attempt: u32| {
                2u64.saturating_pow(attempt)
                    .min(MAX_RETRY_BACKOFF.as_secs())
            })
            .collect();
        assert_eq!(schedule, vec![2, 4, 8, 16, 30, 30]);
    }

    #[tokio::test]
    async fn reset_working_dir_wipes_previous_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let job_dir = dir.path().join("job");
        std::fs::create_dir_all(job_dir.join("720p")).unwrap();
        std::fs::write(job_dir.join("720p/segment_00000.ts"), b"stale").unwrap();

        reset_working_dir(&job_dir).await.unwrap();
        assert!(job_dir.exists());
        assert!(!job_dir.join("720p").exists());
    }
}
