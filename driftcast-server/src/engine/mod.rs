//! The transcode engine: job records, planning, dispatch, and supervision.

pub mod job;
pub mod planner;
pub mod playlist;
pub mod probe;
pub mod progress;
pub mod registry;
pub mod subtitles;
pub mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info};

use driftcast_model::Capabilities;

use crate::config::Config;
use crate::hardware::{AdmissionController, LoadMonitor};
use planner::Planner;
use registry::JobRegistry;

/// How often the dispatcher re-checks admission even without queue activity;
/// load and thermal state move on their own.
const DISPATCH_RECHECK: Duration = Duration::from_secs(2);

/// Shared engine state: everything a worker needs, plus the dispatcher that
/// hands queued jobs to workers under the admission ceiling.
pub struct TranscodeEngine {
    pub config: Arc<Config>,
    pub capabilities: Arc<Capabilities>,
    pub registry: Arc<JobRegistry>,
    pub monitor: LoadMonitor,
    pub admission: Arc<AdmissionController>,
    pub planner: Planner,
    pub http: reqwest::Client,
    notify: Notify,
    active_workers: AtomicUsize,
}

impl TranscodeEngine {
    pub fn new(
        config: Arc<Config>,
        capabilities: Arc<Capabilities>,
        registry: Arc<JobRegistry>,
        monitor: LoadMonitor,
        admission: Arc<AdmissionController>,
    ) -> Arc<Self> {
        let planner = Planner::new(capabilities.clone(), config.clone());
        Arc::new(Self {
            config,
            capabilities,
            registry,
            monitor,
            admission,
            planner,
            http: reqwest::Client::new(),
            notify: Notify::new(),
            active_workers: AtomicUsize::new(0),
        })
    }

    /// Wake the dispatcher; called after submissions and cancellations.
    pub fn poke(&self) {
        self.notify.notify_one();
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::Relaxed)
    }

    /// Single coordinator pulling from the queue. Workers are spawned one per
    /// job; a tightening ceiling only affects new admissions, never running
    /// workers.
    pub fn spawn_dispatcher(self: &Arc<Self>) {
        let engine = self.clone();
        tokio::spawn(async move {
            info!("dispatcher started");
            let mut recheck = tokio::time::interval(DISPATCH_RECHECK);
            recheck.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = engine.notify.notified() => {}
                    _ = recheck.tick() => {}
                }

                loop {
                    let active = engine.active_workers();
                    let sample = engine.monitor.latest();
                    let decision = engine.admission.decide(&sample, active);
                    if !decision.allow {
                        debug!(reason = %decision.reason, active, "admission holding queue");
                        break;
                    }
                    let Some(job_id) = engine.registry.next_queued() else {
                        break;
                    };
                    engine.active_workers.fetch_add(1, Ordering::Relaxed);
                    debug!(job = %job_id, active = active + 1, "dispatching job");
                    let worker_engine = engine.clone();
                    tokio::spawn(async move {
                        worker::run_job(&worker_engine, job_id).await;
                        worker_engine.active_workers.fetch_sub(1, Ordering::Relaxed);
                        worker_engine.poke();
                    });
                }
            }
        });
    }
}
