use chrono::Utc;
use driftcast_model::{LoadTrend, RealtimeSample};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::System;
use tokio::process::Command;
use tracing::debug;

/// Sampling period. The trend window holds 30 s of history on top of it.
const SAMPLE_INTERVAL: Duration = Duration::from_secs(2);
const TREND_WINDOW: Duration = Duration::from_secs(30);
/// Exponential smoothing weight for the load factor.
const SMOOTHING_ALPHA: f32 = 0.3;
/// Slope magnitude (percent per second) below which load counts as stable.
const STABLE_SLOPE: f64 = 0.5;
/// External collectors get this long before their reading is skipped.
const COLLECTOR_TIMEOUT: Duration = Duration::from_secs(1);

/// Continuously samples CPU/GPU/memory/power state and publishes a smoothed
/// [`RealtimeSample`]. Readers never wait on a collector; they get whatever
/// the last completed sampling round produced.
#[derive(Clone)]
pub struct LoadMonitor {
    latest: Arc<RwLock<RealtimeSample>>,
}

impl LoadMonitor {
    /// Start the background sampler and return a handle to its output slot.
    pub fn spawn() -> Self {
        let latest = Arc::new(RwLock::new(RealtimeSample::default()));
        let slot = latest.clone();

        tokio::spawn(async move {
            let mut sys = System::new();
            let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let started = Instant::now();
            let mut history: VecDeque<(f64, f32)> = VecDeque::new();
            let mut smoothed = 0.0_f32;
            let mut first = true;

            loop {
                interval.tick().await;

                sys.refresh_cpu_usage();
                sys.refresh_memory();

                let cpus = sys.cpus();
                let cpu_percent = if cpus.is_empty() {
                    None
                } else {
                    Some(cpus.iter().map(|c| c.cpu_usage()).sum::<f32>() / cpus.len() as f32)
                };
                let memory_percent = match sys.total_memory() {
                    0 => None,
                    total => Some(sys.used_memory() as f32 / total as f32 * 100.0),
                };

                let gpu = sample_nvidia_gpu().await;
                let (gpu_percent, gpu_temp_c) = match gpu {
                    Some(gpu) => (Some(gpu.0), Some(gpu.1)),
                    None => (None, None),
                };

                let (on_battery, ac_power) = sample_power_state();

                // Missing metrics are excluded from the max rather than
                // treated as zero load.
                let instant_load = [cpu_percent, gpu_percent]
                    .into_iter()
                    .flatten()
                    .fold(0.0_f32, f32::max)
                    / 100.0;
                smoothed = if first {
                    first = false;
                    instant_load
                } else {
                    SMOOTHING_ALPHA * instant_load + (1.0 - SMOOTHING_ALPHA) * smoothed
                };

                let t = started.elapsed().as_secs_f64();
                history.push_back((t, smoothed * 100.0));
                while let Some(&(oldest, _)) = history.front() {
                    if t - oldest > TREND_WINDOW.as_secs_f64() {
                        history.pop_front();
                    } else {
                        break;
                    }
                }
                let trend = trend_of(history.make_contiguous());

                let sample = RealtimeSample {
                    cpu_percent,
                    gpu_percent,
                    gpu_temp_c,
                    memory_percent,
                    on_battery,
                    ac_power,
                    load_factor: smoothed.clamp(0.0, 1.0),
                    trend,
                    sampled_at: Utc::now(),
                };
                debug!(
                    load = sample.load_factor,
                    trend = ?sample.trend,
                    cpu = ?cpu_percent,
                    gpu = ?gpu_percent,
                    "load sample"
                );
                *slot.write() = sample;
            }
        });

        Self { latest }
    }

    /// Handle that always reports the given sample. Used where no sampler
    /// task should run (router construction in tests).
    pub fn fixed(sample: RealtimeSample) -> Self {
        Self {
            latest: Arc::new(RwLock::new(sample)),
        }
    }

    pub fn latest(&self) -> RealtimeSample {
        self.latest.read().clone()
    }
}

/// GPU utilization and temperature via nvidia-smi, bounded by
/// [`COLLECTOR_TIMEOUT`] so a wedged vendor tool cannot stall the sampler.
async fn sample_nvidia_gpu() -> Option<(f32, f32)> {
    let output = tokio::time::timeout(
        COLLECTOR_TIMEOUT,
        Command::new("nvidia-smi")
            .arg("--query-gpu=utilization.gpu,temperature.gpu")
            .arg("--format=csv,noheader,nounits")
            .output(),
    )
    .await
    .ok()?
    .ok()
    .filter(|output| output.status.success())?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout.lines().next()?;
    let mut parts = line.split(',').map(str::trim);
    let util = parts.next()?.parse().ok()?;
    let temp = parts.next()?.parse().ok()?;
    Some((util, temp))
}

/// Battery/AC state from /sys/class/power_supply. Desktops and non-Linux
/// hosts report mains power.
fn sample_power_state() -> (bool, bool) {
    #[cfg(target_os = "linux")]
    {
        let mut on_battery = false;
        let mut ac_power = false;
        let mut saw_battery = false;
        if let Ok(entries) = std::fs::read_dir("/sys/class/power_supply") {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with("BAT") {
                    saw_battery = true;
                    if let Ok(status) = std::fs::read_to_string(entry.path().join("status")) {
                        on_battery |= status.trim() == "Discharging";
                    }
                } else if let Ok(online) = std::fs::read_to_string(entry.path().join("online")) {
                    ac_power |= online.trim() == "1";
                }
            }
        }
        if !saw_battery {
            return (false, true);
        }
        (on_battery, ac_power || !on_battery)
    }
    #[cfg(not(target_os = "linux"))]
    {
        (false, true)
    }
}

/// Slope of the least-squares linear fit over `(seconds, load-percent)`
/// samples, classified against [`STABLE_SLOPE`].
fn trend_of(samples: &[(f64, f32)]) -> LoadTrend {
    if samples.len() < 3 {
        return LoadTrend::Stable;
    }
    let n = samples.len() as f64;
    let mean_x = samples.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = samples.iter().map(|(_, y)| *y as f64).sum::<f64>() / n;
    let mut num = 0.0;
    let mut den = 0.0;
    for (x, y) in samples {
        num += (x - mean_x) * (*y as f64 - mean_y);
        den += (x - mean_x) * (x - mean_x);
    }
    if den == 0.0 {
        return LoadTrend::Stable;
    }
    let slope = num / den;
    if slope.abs() < STABLE_SLOPE {
        LoadTrend::Stable
    } else if slope > 0.0 {
        LoadTrend::Rising
    } else {
        LoadTrend::Falling
    }
}
