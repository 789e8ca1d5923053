//! Live load telemetry and admission decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadTrend {
    Rising,
    Falling,
    #[default]
    Stable,
}

/// One smoothed sample from the load monitor. Metrics whose collector is
/// unavailable are `None` and excluded from the load factor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeSample {
    pub cpu_percent: Option<f32>,
    pub gpu_percent: Option<f32>,
    pub gpu_temp_c: Option<f32>,
    pub memory_percent: Option<f32>,
    pub on_battery: bool,
    pub ac_power: bool,
    /// Exponentially smoothed `max(cpu, gpu) / 100`.
    pub load_factor: f32,
    pub trend: LoadTrend,
    pub sampled_at: DateTime<Utc>,
}

impl Default for RealtimeSample {
    fn default() -> Self {
        Self {
            cpu_percent: None,
            gpu_percent: None,
            gpu_temp_c: None,
            memory_percent: None,
            on_battery: false,
            ac_power: true,
            load_factor: 0.0,
            trend: LoadTrend::Stable,
            sampled_at: Utc::now(),
        }
    }
}

/// Outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionDecision {
    pub allow: bool,
    pub effective_max_jobs: usize,
    /// Multiplicative downscaling hint in (0, 1] for resolution and bitrate.
    pub quality_factor: f32,
    pub reason: String,
}
