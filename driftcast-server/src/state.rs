use std::sync::Arc;
use std::time::Instant;

use driftcast_model::Capabilities;

use crate::config::Config;
use crate::engine::TranscodeEngine;
use crate::engine::registry::JobRegistry;
use crate::events::ProgressBus;
use crate::hardware::{AdmissionController, LoadMonitor};

/// Shared server state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub capabilities: Arc<Capabilities>,
    pub monitor: LoadMonitor,
    pub admission: Arc<AdmissionController>,
    pub registry: Arc<JobRegistry>,
    pub engine: Arc<TranscodeEngine>,
    pub bus: Arc<ProgressBus>,
    pub started_at: Instant,
}

impl AppState {
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
