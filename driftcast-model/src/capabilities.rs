//! Static hardware capabilities captured once at startup.

use serde::{Deserialize, Serialize};

use crate::request::{HwAccel, VideoCodec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareTier {
    Ultra,
    High,
    Medium,
    Low,
    Minimal,
}

impl HardwareTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ultra => "ultra",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Minimal => "minimal",
        }
    }

    /// Fixed limits table: max height, max video bitrate, suggested ceiling.
    pub fn limits(&self) -> TierLimits {
        match self {
            Self::Ultra => TierLimits {
                max_height: 2160,
                max_bitrate_kbps: 25_000,
                suggested_max_jobs: 4,
            },
            Self::High => TierLimits {
                max_height: 1440,
                max_bitrate_kbps: 15_000,
                suggested_max_jobs: 3,
            },
            Self::Medium => TierLimits {
                max_height: 1080,
                max_bitrate_kbps: 8_000,
                suggested_max_jobs: 2,
            },
            Self::Low => TierLimits {
                max_height: 720,
                max_bitrate_kbps: 4_000,
                suggested_max_jobs: 1,
            },
            Self::Minimal => TierLimits {
                max_height: 480,
                max_bitrate_kbps: 2_000,
                suggested_max_jobs: 1,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    pub max_height: u32,
    pub max_bitrate_kbps: u32,
    pub suggested_max_jobs: usize,
}

/// One available hardware encoder family and its concrete encoder names as
/// advertised by the encoder tool (for example `h264_nvenc`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HwEncoderGroup {
    pub family: HwAccel,
    pub encoders: Vec<String>,
}

impl HwEncoderGroup {
    pub fn encoder_for(&self, codec: VideoCodec) -> Option<&str> {
        let prefix = match codec {
            VideoCodec::H264 => "h264_",
            VideoCodec::H265 => "hevc_",
        };
        self.encoders
            .iter()
            .find(|e| e.starts_with(prefix))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub hw_encoders: Vec<HwEncoderGroup>,
    pub software_encoders: Vec<String>,
    pub containers: Vec<String>,
    pub tier: HardwareTier,
    pub max_height: u32,
    pub max_bitrate_kbps: u32,
    pub suggested_max_jobs: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_vram_mb: Option<u64>,
    pub discrete_gpu: bool,
    pub laptop: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ffmpeg_version: Option<String>,
    pub os: String,
}

impl Capabilities {
    pub fn family_available(&self, family: HwAccel) -> bool {
        match family {
            HwAccel::Software => !self.software_encoders.is_empty(),
            HwAccel::Auto => true,
            _ => self.hw_encoders.iter().any(|g| g.family == family),
        }
    }

    pub fn family_group(&self, family: HwAccel) -> Option<&HwEncoderGroup> {
        self.hw_encoders.iter().find(|g| g.family == family)
    }

    pub fn any_hw_family(&self) -> bool {
        !self.hw_encoders.is_empty()
    }
}
