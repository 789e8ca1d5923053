use driftcast_model::{Capabilities, HardwareTier, HwAccel, HwEncoderGroup};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Startup probing failed in a way the server cannot run without.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("encoder tool not found at '{path}': {source}")]
    EncoderToolMissing {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// One-shot system prober. Everything here runs exactly once at startup; the
/// resulting [`Capabilities`] snapshot is immutable afterwards.
pub struct HardwareProfiler {
    ffmpeg_path: String,
}

impl HardwareProfiler {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    /// Probe the machine. Only a missing encoder tool is fatal; every other
    /// collector degrades silently to "not available".
    pub async fn probe(&self) -> Result<Capabilities, ProbeError> {
        let encoders_output = match Command::new(&self.ffmpeg_path)
            .arg("-hide_banner")
            .arg("-encoders")
            .output()
            .await
        {
            Ok(output) => String::from_utf8_lossy(&output.stdout).into_owned(),
            Err(source) => {
                return Err(ProbeError::EncoderToolMissing {
                    path: self.ffmpeg_path.clone(),
                    source,
                });
            }
        };

        let (hw_encoders, software_encoders) = parse_encoder_list(&encoders_output);
        let ffmpeg_version = self.detect_version().await;
        let gpu = detect_nvidia_gpu().await;
        let laptop = detect_laptop();

        let discrete_gpu = gpu.is_some();
        let (gpu_name, gpu_vram_mb) = match gpu {
            Some(gpu) => (Some(gpu.name), Some(gpu.vram_mb)),
            None => (None, None),
        };

        let tier = classify_tier(&hw_encoders, discrete_gpu, gpu_vram_mb);
        let limits = tier.limits();

        info!(
            tier = tier.as_str(),
            hw_families = hw_encoders.len(),
            gpu = gpu_name.as_deref().unwrap_or("none"),
            laptop,
            "hardware profile complete"
        );
        for group in &hw_encoders {
            debug!(family = group.family.as_str(), encoders = ?group.encoders, "hardware encoder family");
        }

        Ok(Capabilities {
            hw_encoders,
            software_encoders,
            containers: vec!["mp4".into(), "mkv".into(), "webm".into()],
            tier,
            max_height: limits.max_height,
            max_bitrate_kbps: limits.max_bitrate_kbps,
            suggested_max_jobs: limits.suggested_max_jobs,
            gpu_name,
            gpu_vram_mb,
            discrete_gpu,
            laptop,
            ffmpeg_version,
            os: std::env::consts::OS.to_string(),
        })
    }

    async fn detect_version(&self) -> Option<String> {
        let output = Command::new(&self.ffmpeg_path)
            .arg("-version")
            .output()
            .await
            .ok()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .next()
            .and_then(|line| line.strip_prefix("ffmpeg version "))
            .map(|rest| rest.split_whitespace().next().unwrap_or(rest).to_string())
    }
}

/// Parse `ffmpeg -encoders` output into hardware families and the software
/// encoder list. Lines look like ` V....D h264_nvenc    NVIDIA NVENC ...`.
fn parse_encoder_list(output: &str) -> (Vec<HwEncoderGroup>, Vec<String>) {
    let mut groups: Vec<HwEncoderGroup> = Vec::new();
    let mut software = Vec::new();

    let mut push = |family: HwAccel, name: &str| {
        match groups.iter_mut().find(|g| g.family == family) {
            Some(group) => group.encoders.push(name.to_string()),
            None => groups.push(HwEncoderGroup {
                family,
                encoders: vec![name.to_string()],
            }),
        }
    };

    for line in output.lines() {
        let mut fields = line.split_whitespace();
        let Some(flags) = fields.next() else { continue };
        // Video encoders only; the flags column starts with 'V'.
        if !flags.starts_with('V') {
            continue;
        }
        let Some(name) = fields.next() else { continue };

        if let Some(family) = family_of_encoder(name) {
            push(family, name);
        } else if matches!(name, "libx264" | "libx265") {
            software.push(name.to_string());
        }
    }

    (groups, software)
}

fn family_of_encoder(name: &str) -> Option<HwAccel> {
    // Only H.264/H.265 encoders count toward a usable family.
    if !name.starts_with("h264_") && !name.starts_with("hevc_") {
        return None;
    }
    if name.ends_with("_nvenc") {
        Some(HwAccel::Nvenc)
    } else if name.ends_with("_qsv") {
        Some(HwAccel::Qsv)
    } else if name.ends_with("_vaapi") {
        Some(HwAccel::Vaapi)
    } else if name.ends_with("_amf") {
        Some(HwAccel::Amf)
    } else if name.ends_with("_videotoolbox") {
        Some(HwAccel::Videotoolbox)
    } else {
        None
    }
}

struct NvidiaGpu {
    name: String,
    vram_mb: u64,
}

/// Query GPU identity and VRAM through nvidia-smi. Absence of the tool means
/// no discrete NVIDIA GPU as far as the profiler is concerned.
async fn detect_nvidia_gpu() -> Option<NvidiaGpu> {
    let output = Command::new("nvidia-smi")
        .arg("--query-gpu=name,memory.total")
        .arg("--format=csv,noheader,nounits")
        .output()
        .await
        .ok()
        .filter(|output| output.status.success())?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout.lines().next()?;
    let mut parts = line.split(',').map(str::trim);
    let name = parts.next()?.to_string();
    let vram_mb = parts.next()?.parse().ok()?;
    Some(NvidiaGpu { name, vram_mb })
}

/// Chassis and battery hints. Linux-only heuristics; elsewhere the machine is
/// treated as a desktop.
fn detect_laptop() -> bool {
    #[cfg(target_os = "linux")]
    {
        if let Ok(entries) = std::fs::read_dir("/sys/class/power_supply") {
            for entry in entries.flatten() {
                if entry.file_name().to_string_lossy().starts_with("BAT") {
                    return true;
                }
            }
        }
        if let Ok(chassis) = std::fs::read_to_string("/sys/class/dmi/id/chassis_type") {
            // 9 = laptop, 10 = notebook, 14 = sub-notebook
            return matches!(chassis.trim(), "9" | "10" | "14");
        }
        false
    }
    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

/// First-match tier rules over the probed facts.
fn classify_tier(
    hw_encoders: &[HwEncoderGroup],
    discrete_gpu: bool,
    gpu_vram_mb: Option<u64>,
) -> HardwareTier {
    let has_hw = !hw_encoders.is_empty();
    let vram = gpu_vram_mb.unwrap_or(0);

    if discrete_gpu && vram >= 8_192 && has_hw {
        HardwareTier::Ultra
    } else if vram >= 6_144 && has_hw {
        HardwareTier::High
    } else if vram >= 4_096 && has_hw {
        HardwareTier::Medium
    } else if has_hw {
        HardwareTier::Low
    } else {
        HardwareTier::Minimal
    }
}
