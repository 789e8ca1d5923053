use driftcast_model::{AdmissionDecision, Capabilities, LoadTrend, RealtimeSample};
use std::sync::Arc;

/// Pressure thresholds for the admission rules.
const THERMAL_LIMIT_C: f32 = 80.0;
const SATURATION_LOAD: f32 = 0.85;
const FREEZE_LOAD: f32 = 0.7;
const BATTERY_QUALITY: f32 = 0.6;
const THERMAL_QUALITY: f32 = 0.75;

/// Decides, for every queue pull and every ambiguous output parameter,
/// whether a job may start now and how aggressively it may encode. Pure over
/// its inputs; the controller itself holds only the static base ceiling.
pub struct AdmissionController {
    capabilities: Arc<Capabilities>,
    /// Configured ceiling, or the tier suggestion when unset.
    base_max_jobs: usize,
}

impl AdmissionController {
    pub fn new(capabilities: Arc<Capabilities>, configured_max_jobs: Option<usize>) -> Self {
        let base_max_jobs = configured_max_jobs
            .unwrap_or(capabilities.suggested_max_jobs)
            .max(1);
        Self {
            capabilities,
            base_max_jobs,
        }
    }

    pub fn base_max_jobs(&self) -> usize {
        self.base_max_jobs
    }

    /// Whether a new submission should be refused outright instead of
    /// queued: the saturation rule, which also blocks queue pulls.
    pub fn refuse_intake(&self, sample: &RealtimeSample, active_jobs: usize) -> bool {
        sample.load_factor >= SATURATION_LOAD && active_jobs > 0
    }

    /// Evaluate the admission rules in order. Earlier rules bind the reason;
    /// later rules may only tighten the ceiling and quality further.
    pub fn decide(&self, sample: &RealtimeSample, active_jobs: usize) -> AdmissionDecision {
        let mut effective_max_jobs = self.base_max_jobs;
        let mut quality_factor = 1.0_f32;
        let mut allow = true;
        let mut reason: Option<String> = None;

        if sample.on_battery {
            effective_max_jobs = effective_max_jobs.min(1);
            quality_factor = quality_factor.min(BATTERY_QUALITY);
            reason.get_or_insert_with(|| "on battery power".to_string());
        }

        if sample.gpu_temp_c.is_some_and(|t| t >= THERMAL_LIMIT_C) {
            effective_max_jobs = effective_max_jobs.saturating_sub(1).max(1);
            quality_factor = quality_factor.min(THERMAL_QUALITY);
            reason.get_or_insert_with(|| {
                format!("gpu at {:.0}C", sample.gpu_temp_c.unwrap_or_default())
            });
        }

        if sample.load_factor >= SATURATION_LOAD && active_jobs > 0 {
            allow = false;
            reason.get_or_insert_with(|| {
                format!("load factor {:.2} saturated", sample.load_factor)
            });
        }

        if sample.trend == LoadTrend::Rising && sample.load_factor >= FREEZE_LOAD {
            effective_max_jobs = effective_max_jobs.min(active_jobs);
            reason.get_or_insert_with(|| {
                format!("load {:.2} and rising, ceiling frozen", sample.load_factor)
            });
        }

        allow = allow && active_jobs < effective_max_jobs;

        AdmissionDecision {
            allow,
            effective_max_jobs,
            quality_factor,
            reason: reason.unwrap_or_else(|| {
                format!(
                    "within capacity ({} tier)",
                    self.capabilities.tier.as_str()
                )
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftcast_model::{HardwareTier, HwAccel, HwEncoderGroup};

    fn caps(suggested: usize) -> Arc<Capabilities> {
        Arc::new(Capabilities {
            hw_encoders: vec![HwEncoderGroup {
                family: HwAccel::Nvenc,
                encoders: vec!["h264_nvenc".into()],
            }],
            software_encoders: vec!["libx264".into()],
            containers: vec!["mp4".into()],
            tier: HardwareTier::High,
            max_height: 1440,
            max_bitrate_kbps: 15_000,
            suggested_max_jobs: suggested,
            gpu_name: None,
            gpu_vram_mb: Some(8_192),
            discrete_gpu: true,
            laptop: false,
            ffmpeg_version: None,
            os: "linux".into(),
        })
    }

    fn idle_sample() -> RealtimeSample {
        RealtimeSample {
            cpu_percent: Some(10.0),
            gpu_percent: Some(5.0),
            gpu_temp_c: Some(45.0),
            load_factor: 0.1,
            ..RealtimeSample::default()
        }
    }

    #[test]
    fn idle_machine_uses_tier_ceiling() {
        let controller = AdmissionController::new(caps(3), None);
        let decision = controller.decide(&idle_sample(), 0);
        assert!(decision.allow);
        assert_eq!(decision.effective_max_jobs, 3);
        assert_eq!(decision.quality_factor, 1.0);
    }

    #[test]
    fn configured_ceiling_overrides_tier() {
        let controller = AdmissionController::new(caps(3), Some(2));
        let decision = controller.decide(&idle_sample(), 0);
        assert_eq!(decision.effective_max_jobs, 2);
    }

    #[test]
    fn battery_caps_to_one_job_and_degrades_quality() {
        let controller = AdmissionController::new(caps(4), None);
        let sample = RealtimeSample {
            on_battery: true,
            ac_power: false,
            ..idle_sample()
        };
        let decision = controller.decide(&sample, 0);
        assert!(decision.allow);
        assert_eq!(decision.effective_max_jobs, 1);
        assert!(decision.quality_factor <= 0.6);

        let decision = controller.decide(&sample, 1);
        assert!(!decision.allow);
    }

    #[test]
    fn hot_gpu_sheds_one_slot_with_floor() {
        let controller = AdmissionController::new(caps(3), None);
        let sample = RealtimeSample {
            gpu_temp_c: Some(83.0),
            ..idle_sample()
        };
        let decision = controller.decide(&sample, 0);
        assert_eq!(decision.effective_max_jobs, 2);
        assert!(decision.quality_factor <= 0.75);

        let one_job = AdmissionController::new(caps(1), None);
        assert_eq!(one_job.decide(&sample, 0).effective_max_jobs, 1);
    }

    #[test]
    fn saturation_refuses_unless_idle() {
        let controller = AdmissionController::new(caps(3), None);
        let sample = RealtimeSample {
            load_factor: 0.9,
            ..idle_sample()
        };
        assert!(!controller.decide(&sample, 1).allow);
        // First job is always admitted even under external load.
        assert!(controller.decide(&sample, 0).allow);
    }

    #[test]
    fn rising_load_freezes_ceiling_at_active() {
        let controller = AdmissionController::new(caps(4), None);
        let sample = RealtimeSample {
            load_factor: 0.75,
            trend: LoadTrend::Rising,
            ..idle_sample()
        };
        let decision = controller.decide(&sample, 2);
        assert_eq!(decision.effective_max_jobs, 2);
        assert!(!decision.allow);
    }

    #[test]
    fn rules_compound_battery_then_thermal() {
        let controller = AdmissionController::new(caps(4), None);
        let sample = RealtimeSample {
            on_battery: true,
            ac_power: false,
            gpu_temp_c: Some(85.0),
            ..idle_sample()
        };
        let decision = controller.decide(&sample, 0);
        assert_eq!(decision.effective_max_jobs, 1);
        assert!(decision.quality_factor <= 0.6);
        assert!(decision.reason.contains("battery"));
    }
}
