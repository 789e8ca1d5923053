use chrono::Utc;
use dashmap::DashMap;
use driftcast_model::{HwAccel, JobSnapshot, JobStatus, ServerMessage, TranscodeRequest};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::job::{JobRecord, JobUpdate};
use crate::events::ProgressBus;

/// Hard cap on records held at once, active and retained alike.
const MAX_JOBS: usize = 50;
/// Hard cap on terminal-but-retained records; oldest evicted first.
const MAX_TERMINAL: usize = 10;
const JANITOR_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("job table is full")]
    Full,
    #[error("job {0} is already terminal")]
    AlreadyTerminal(Uuid),
    #[error("job {0} is still active")]
    NotTerminal(Uuid),
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub active: usize,
    pub queued: usize,
    pub retained: usize,
    pub hw_accel_usage: HashMap<String, u64>,
}

/// Authoritative in-memory job store. Lookups take snapshots; mutations go
/// through [`JobRegistry::apply`], called only by the worker that owns the
/// job. Status transitions fan out to the progress bus.
pub struct JobRegistry {
    jobs: DashMap<Uuid, JobRecord>,
    queue: Mutex<VecDeque<Uuid>>,
    counters: Counters,
    hw_usage: Mutex<HashMap<HwAccel, u64>>,
    bus: Arc<ProgressBus>,
    retention: Duration,
}

impl JobRegistry {
    pub fn new(bus: Arc<ProgressBus>, retention: Duration) -> Self {
        Self {
            jobs: DashMap::new(),
            queue: Mutex::new(VecDeque::new()),
            counters: Counters::default(),
            hw_usage: Mutex::new(HashMap::new()),
            bus,
            retention,
        }
    }

    /// Register a new job and append it to the queue.
    pub fn submit(
        &self,
        request: TranscodeRequest,
        temp_root: &Path,
    ) -> Result<JobSnapshot, RegistryError> {
        if self.jobs.len() >= MAX_JOBS {
            // Make room from retained terminal records before refusing.
            self.evict_terminal(self.jobs.len() + 1 - MAX_JOBS);
            if self.jobs.len() >= MAX_JOBS {
                return Err(RegistryError::Full);
            }
        }

        let record = JobRecord::new(request, temp_root);
        let snapshot = record.snapshot();
        self.jobs.insert(record.id, record);
        self.queue.lock().push_back(snapshot.job_id);
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        debug!(job = %snapshot.job_id, "job submitted");
        Ok(snapshot)
    }

    pub fn get(&self, id: Uuid) -> Option<JobSnapshot> {
        self.jobs.get(&id).map(|record| record.snapshot())
    }

    pub fn cancel_token(&self, id: Uuid) -> Option<tokio_util::sync::CancellationToken> {
        self.jobs.get(&id).map(|record| record.cancel.clone())
    }

    pub fn request(&self, id: Uuid) -> Option<TranscodeRequest> {
        self.jobs.get(&id).map(|record| record.request.clone())
    }

    pub fn working_dir(&self, id: Uuid) -> Option<PathBuf> {
        self.jobs.get(&id).map(|record| record.working_dir.clone())
    }

    /// Apply a typed mutation. Illegal transitions are rejected with a
    /// warning rather than corrupting the record; telemetry obeys the
    /// monotonicity rule within an attempt.
    pub fn apply(&self, id: Uuid, update: JobUpdate) -> Result<(), RegistryError> {
        let event = {
            let mut record = self.jobs.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
            let now = Utc::now();
            record.updated_at = now;

            match update {
                JobUpdate::Started => {
                    if !record.status.can_transition_to(JobStatus::Processing) {
                        warn!(job = %id, from = record.status.as_str(), "ignoring illegal start");
                        return Ok(());
                    }
                    record.status = JobStatus::Processing;
                    record.started_at = Some(now);
                    Some(ServerMessage::StatusChange {
                        job_id: id,
                        status: JobStatus::Processing,
                        error_message: None,
                    })
                }
                JobUpdate::EncoderSelected { hw_accel } => {
                    if record.hw_accel_used != Some(hw_accel) {
                        record.hw_accel_used = Some(hw_accel);
                        *self.hw_usage.lock().entry(hw_accel).or_insert(0) += 1;
                    }
                    None
                }
                JobUpdate::DurationKnown(duration) => {
                    record.duration_s = Some(duration);
                    None
                }
                JobUpdate::Telemetry(update) => {
                    if record.status != JobStatus::Processing {
                        return Ok(());
                    }
                    // Monotonic within one attempt; stale parses never move
                    // the needle backwards.
                    record.progress = record.progress.max(update.progress).min(100.0);
                    record.current_time_s = record.current_time_s.max(update.current_time_s);
                    record.speed = update.speed.or(record.speed);
                    record.fps = update.fps.or(record.fps);
                    record.frame = update.frame.or(record.frame);
                    record.eta_s = update.eta_s;
                    Some(ServerMessage::Progress {
                        job_id: id,
                        progress: record.progress,
                        frame: record.frame,
                        fps: record.fps,
                        time: record.current_time_s,
                        speed: record.speed,
                    })
                }
                JobUpdate::RetryStarted { attempt } => {
                    if record.status != JobStatus::Processing {
                        return Ok(());
                    }
                    record.attempt = attempt;
                    record.progress = 0.0;
                    record.current_time_s = 0.0;
                    record.speed = None;
                    record.fps = None;
                    record.frame = None;
                    record.eta_s = None;
                    // Externally the job never left `processing`; the event
                    // tells subscribers the telemetry reset is deliberate.
                    Some(ServerMessage::StatusChange {
                        job_id: id,
                        status: JobStatus::Processing,
                        error_message: None,
                    })
                }
                JobUpdate::HwFallback { hw_accel } => {
                    // A fallback replan is a fresh attempt chain on a new
                    // encoder; telemetry restarts but no status event fires,
                    // so observers see one uninterrupted `processing` phase.
                    record.hw_accel_used = Some(hw_accel);
                    record.attempt = 0;
                    record.progress = 0.0;
                    record.current_time_s = 0.0;
                    record.speed = None;
                    record.fps = None;
                    record.frame = None;
                    record.eta_s = None;
                    *self.hw_usage.lock().entry(hw_accel).or_insert(0) += 1;
                    None
                }
                JobUpdate::Completed { download_url } => {
                    if !record.status.can_transition_to(JobStatus::Ready) {
                        warn!(job = %id, from = record.status.as_str(), "ignoring illegal completion");
                        return Ok(());
                    }
                    record.status = JobStatus::Ready;
                    record.progress = 100.0;
                    record.download_url = download_url;
                    record.finished_at = Some(now);
                    self.counters.completed.fetch_add(1, Ordering::Relaxed);
                    Some(ServerMessage::StatusChange {
                        job_id: id,
                        status: JobStatus::Ready,
                        error_message: None,
                    })
                }
                JobUpdate::Failed { message } => {
                    if !record.status.can_transition_to(JobStatus::Error) {
                        warn!(job = %id, from = record.status.as_str(), "ignoring illegal failure");
                        return Ok(());
                    }
                    record.status = JobStatus::Error;
                    record.error_message = Some(message.clone());
                    record.finished_at = Some(now);
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    Some(ServerMessage::StatusChange {
                        job_id: id,
                        status: JobStatus::Error,
                        error_message: Some(message),
                    })
                }
                JobUpdate::Cancelled => {
                    if !record.status.can_transition_to(JobStatus::Cancelled) {
                        return Ok(());
                    }
                    record.status = JobStatus::Cancelled;
                    record.finished_at = Some(now);
                    self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                    Some(ServerMessage::StatusChange {
                        job_id: id,
                        status: JobStatus::Cancelled,
                        error_message: None,
                    })
                }
            }
        };

        // The record lock is released before fan-out.
        if let Some(event) = event {
            self.bus.publish(event);
        }
        Ok(())
    }

    /// Cancel a job. Queued jobs flip synchronously; processing jobs get
    /// their cancel signal fired and terminate cooperatively.
    pub fn cancel(&self, id: Uuid) -> Result<JobStatus, RegistryError> {
        let status = self
            .jobs
            .get(&id)
            .map(|record| record.status)
            .ok_or(RegistryError::NotFound(id))?;

        match status {
            JobStatus::Queued => {
                self.queue.lock().retain(|queued| *queued != id);
                self.apply(id, JobUpdate::Cancelled)?;
                Ok(JobStatus::Cancelled)
            }
            JobStatus::Processing => {
                if let Some(record) = self.jobs.get(&id) {
                    record.cancel.cancel();
                }
                Ok(JobStatus::Processing)
            }
            JobStatus::Cancelled => Ok(JobStatus::Cancelled),
            _ => Err(RegistryError::AlreadyTerminal(id)),
        }
    }

    /// Remove a terminal job record, handing back its working directory for
    /// teardown.
    pub fn delete(&self, id: Uuid) -> Result<PathBuf, RegistryError> {
        let terminal = self
            .jobs
            .get(&id)
            .map(|record| record.status.is_terminal())
            .ok_or(RegistryError::NotFound(id))?;
        if !terminal {
            return Err(RegistryError::NotTerminal(id));
        }
        let (_, record) = self.jobs.remove(&id).ok_or(RegistryError::NotFound(id))?;
        Ok(record.working_dir)
    }

    /// Pop the oldest queued job id, skipping entries that were cancelled or
    /// deleted while waiting.
    pub fn next_queued(&self) -> Option<Uuid> {
        let mut queue = self.queue.lock();
        while let Some(id) = queue.pop_front() {
            if self
                .jobs
                .get(&id)
                .is_some_and(|record| record.status == JobStatus::Queued)
            {
                return Some(id);
            }
        }
        None
    }

    pub fn active_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|record| record.status == JobStatus::Processing)
            .count()
    }

    pub fn queued_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|record| record.status == JobStatus::Queued)
            .count()
    }

    pub fn list(&self) -> Vec<JobSnapshot> {
        let mut jobs: Vec<JobSnapshot> = self.jobs.iter().map(|r| r.snapshot()).collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    pub fn stats(&self) -> RegistryStats {
        let hw_accel_usage = self
            .hw_usage
            .lock()
            .iter()
            .map(|(family, count)| (family.as_str().to_string(), *count))
            .collect();
        RegistryStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            active: self.active_count(),
            queued: self.queued_count(),
            retained: self.jobs.len(),
            hw_accel_usage,
        }
    }

    /// Fire every active job's cancel signal. Used during shutdown.
    pub fn cancel_all_active(&self) {
        for record in self.jobs.iter() {
            if !record.status.is_terminal() {
                record.cancel.cancel();
            }
        }
    }

    /// One janitor sweep: evict terminal records past the retention window,
    /// then enforce the terminal retention cap oldest-first.
    pub fn janitor_pass(&self) -> usize {
        let now = Utc::now();
        let mut evicted = 0;

        let expired: Vec<Uuid> = self
            .jobs
            .iter()
            .filter(|record| {
                record.status.is_terminal()
                    && record.finished_at.is_some_and(|finished| {
                        (now - finished).to_std().unwrap_or_default() > self.retention
                    })
            })
            .map(|record| record.id)
            .collect();
        for id in expired {
            if self.jobs.remove(&id).is_some() {
                evicted += 1;
            }
        }

        let terminal_count = self
            .jobs
            .iter()
            .filter(|record| record.status.is_terminal())
            .count();
        if terminal_count > MAX_TERMINAL {
            evicted += self.evict_terminal(terminal_count - MAX_TERMINAL);
        }

        if evicted > 0 {
            info!(evicted, "janitor evicted terminal jobs");
        }
        evicted
    }

    /// Evict up to `count` terminal records, oldest finish first.
    fn evict_terminal(&self, count: usize) -> usize {
        let mut terminal: Vec<(Uuid, chrono::DateTime<Utc>)> = self
            .jobs
            .iter()
            .filter(|record| record.status.is_terminal())
            .map(|record| (record.id, record.finished_at.unwrap_or(record.updated_at)))
            .collect();
        terminal.sort_by_key(|(_, finished)| *finished);

        let mut evicted = 0;
        for (id, _) in terminal.into_iter().take(count) {
            if self.jobs.remove(&id).is_some() {
                evicted += 1;
            }
        }
        evicted
    }

    pub fn spawn_janitor(self: &Arc<Self>) {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(JANITOR_PERIOD);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                registry.janitor_pass();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::job::TelemetryUpdate;
    use driftcast_model::TranscodeRequest;

    fn registry() -> JobRegistry {
        JobRegistry::new(Arc::new(ProgressBus::new()), Duration::from_secs(120))
    }

    fn request() -> TranscodeRequest {
        serde_json::from_str(r#"{"source":"http://host/v.mkv"}"#).unwrap()
    }

    fn submit(registry: &JobRegistry) -> Uuid {
        registry
            .submit(request(), Path::new("/tmp/driftcast-test"))
            .unwrap()
            .job_id
    }

    #[tokio::test]
    async fn submit_round_trips_the_request() {
        let registry = registry();
        let id = submit(&registry);
        let snapshot = registry.get(id).unwrap();
        assert_eq!(snapshot.status, JobStatus::Queued);
        assert_eq!(snapshot.source, "http://host/v.mkv");
        assert_eq!(registry.request(id).unwrap(), request());
    }

    #[tokio::test]
    async fn progress_is_monotonic_within_attempt() {
        let registry = registry();
        let id = submit(&registry);
        registry
            .apply(id, JobUpdate::Started)
            .unwrap();

        let telemetry = |progress| {
            JobUpdate::Telemetry(TelemetryUpdate {
                progress,
                ..TelemetryUpdate::default()
            })
        };
        registry.apply(id, telemetry(40.0)).unwrap();
        registry.apply(id, telemetry(30.0)).unwrap();
        assert_eq!(registry.get(id).unwrap().progress, 40.0);

        registry.apply(id, JobUpdate::RetryStarted { attempt: 1 }).unwrap();
        let snapshot = registry.get(id).unwrap();
        assert_eq!(snapshot.progress, 0.0);
        assert_eq!(snapshot.attempt, 1);
        assert_eq!(snapshot.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn illegal_transitions_are_ignored() {
        let registry = registry();
        let id = submit(&registry);
        // Completion without ever starting is not a legal path.
        registry
            .apply(id, JobUpdate::Completed { download_url: None })
            .unwrap();
        assert_eq!(registry.get(id).unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn cancel_queued_is_synchronous() {
        let registry = registry();
        let id = submit(&registry);
        registry.cancel(id).unwrap();
        assert_eq!(registry.get(id).unwrap().status, JobStatus::Cancelled);
        assert!(registry.next_queued().is_none());
    }

    #[tokio::test]
    async fn cancel_processing_fires_token() {
        let registry = registry();
        let id = submit(&registry);
        registry
            .apply(id, JobUpdate::Started)
            .unwrap();
        let token = registry.cancel_token(id).unwrap();
        assert!(!token.is_cancelled());
        registry.cancel(id).unwrap();
        assert!(token.is_cancelled());
        // Status flips only when the worker lands the cancellation.
        assert_eq!(registry.get(id).unwrap().status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn delete_requires_terminal() {
        let registry = registry();
        let id = submit(&registry);
        assert!(matches!(
            registry.delete(id),
            Err(RegistryError::NotTerminal(_))
        ));
        registry.cancel(id).unwrap();
        registry.delete(id).unwrap();
        assert!(registry.get(id).is_none());
    }

    #[tokio::test]
    async fn janitor_enforces_terminal_cap() {
        let registry = registry();
        let mut ids = Vec::new();
        for _ in 0..(MAX_TERMINAL + 5) {
            let id = submit(&registry);
            registry.cancel(id).unwrap();
            ids.push(id);
        }
        registry.janitor_pass();
        let remaining = registry.list().len();
        assert_eq!(remaining, MAX_TERMINAL);
        // Oldest went first.
        assert!(registry.get(ids[0]).is_none());
        assert!(registry.get(*ids.last().unwrap()).is_some());
    }

    #[tokio::test]
    async fn submit_cap_evicts_retained_terminal_first() {
        let registry = registry();
        for _ in 0..MAX_JOBS {
            let id = submit(&registry);
            registry.cancel(id).unwrap();
        }
        // Table is at the cap, but every record is terminal; the next submit
        // must still succeed.
        assert!(registry.submit(request(), Path::new("/tmp/x")).is_ok());
    }

    #[tokio::test]
    async fn queue_pops_oldest_first() {
        let registry = registry();
        let first = submit(&registry);
        let second = submit(&registry);
        assert_eq!(registry.next_queued(), Some(first));
        assert_eq!(registry.next_queued(), Some(second));
        assert_eq!(registry.next_queued(), None);
    }
}
