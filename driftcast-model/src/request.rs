//! Transcode request types.
//!
//! Every option is an enumerated value with an explicit default so that a
//! request body of `{"source": "..."}` is already complete.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TranscodeMode {
    /// Single-rendition HLS, playable while encoding.
    #[default]
    Stream,
    /// Adaptive bitrate ladder with a master playlist.
    Abr,
    /// Single-file output in the requested container.
    Batch,
}

impl TranscodeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Abr => "abr",
            Self::Batch => "batch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Resolved at plan time from the source and the current quality factor.
    #[default]
    Auto,
    #[serde(rename = "2160p")]
    R2160p,
    #[serde(rename = "1440p")]
    R1440p,
    #[serde(rename = "1080p")]
    R1080p,
    #[serde(rename = "720p")]
    R720p,
    #[serde(rename = "480p")]
    R480p,
    #[serde(rename = "360p")]
    R360p,
}

impl Resolution {
    /// Target frame height, or `None` for `auto`.
    pub fn height(&self) -> Option<u32> {
        match self {
            Self::Auto => None,
            Self::R2160p => Some(2160),
            Self::R1440p => Some(1440),
            Self::R1080p => Some(1080),
            Self::R720p => Some(720),
            Self::R480p => Some(480),
            Self::R360p => Some(360),
        }
    }

    /// 16:9 frame dimensions for this rung.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        match self {
            Self::Auto => None,
            Self::R2160p => Some((3840, 2160)),
            Self::R1440p => Some((2560, 1440)),
            Self::R1080p => Some((1920, 1080)),
            Self::R720p => Some((1280, 720)),
            Self::R480p => Some((854, 480)),
            Self::R360p => Some((640, 360)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::R2160p => "2160p",
            Self::R1440p => "1440p",
            Self::R1080p => "1080p",
            Self::R720p => "720p",
            Self::R480p => "480p",
            Self::R360p => "360p",
        }
    }

    /// The largest fixed rung whose height does not exceed `height`.
    pub fn nearest_at_or_below(height: u32) -> Option<Resolution> {
        [
            Self::R2160p,
            Self::R1440p,
            Self::R1080p,
            Self::R720p,
            Self::R480p,
            Self::R360p,
        ]
        .into_iter()
        .find(|r| r.height().is_some_and(|h| h <= height))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VideoCodec {
    #[default]
    H264,
    H265,
}

impl VideoCodec {
    /// Software encoder name for this codec.
    pub fn software_encoder(&self) -> &'static str {
        match self {
            Self::H264 => "libx264",
            Self::H265 => "libx265",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::H264 => "h264",
            Self::H265 => "h265",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AudioCodec {
    #[default]
    Aac,
    Opus,
    Copy,
}

impl AudioCodec {
    pub fn encoder(&self) -> &'static str {
        match self {
            Self::Aac => "aac",
            Self::Opus => "libopus",
            Self::Copy => "copy",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Container {
    #[default]
    Mp4,
    Mkv,
    Webm,
}

impl Container {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Mkv => "mkv",
            Self::Webm => "webm",
        }
    }
}

/// Encoder family. `Auto` resolves against the machine's capabilities in the
/// preference order NVENC, QSV, VAAPI, AMF, VideoToolbox, software.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum HwAccel {
    #[default]
    Auto,
    Nvenc,
    Qsv,
    Vaapi,
    Amf,
    Videotoolbox,
    Software,
}

impl HwAccel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Nvenc => "nvenc",
            Self::Qsv => "qsv",
            Self::Vaapi => "vaapi",
            Self::Amf => "amf",
            Self::Videotoolbox => "videotoolbox",
            Self::Software => "software",
        }
    }

    /// Concrete hardware families, in fallback preference order.
    pub const PREFERENCE_ORDER: [HwAccel; 5] = [
        Self::Nvenc,
        Self::Qsv,
        Self::Vaapi,
        Self::Amf,
        Self::Videotoolbox,
    ];
}

fn default_audio_channels() -> u8 {
    2
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub resolution: Resolution,
    pub video_codec: VideoCodec,
    pub audio_codec: AudioCodec,
    /// Container for batch mode output; ignored for HLS modes.
    pub container: Container,
    /// Explicit video bitrate; when absent the planner derives one from the
    /// rung table and the hardware tier.
    pub video_bitrate_kbps: Option<u32>,
    #[serde(default = "default_audio_channels")]
    pub max_audio_channels: u8,
    pub hw_accel: HwAccel,
    /// Two sequential encoder invocations sharing a stats log (batch only).
    pub two_pass: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            resolution: Resolution::Auto,
            video_codec: VideoCodec::H264,
            audio_codec: AudioCodec::Aac,
            container: Container::Mp4,
            video_bitrate_kbps: None,
            max_audio_channels: default_audio_channels(),
            hw_accel: HwAccel::Auto,
            two_pass: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleTrack {
    pub url: String,
    /// BCP-47 style language tag; also names the fetched sidecar file.
    pub lang: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub default: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeRequest {
    /// Source media URL or local path. Fetching is the encoder's job.
    pub source: String,
    #[serde(default)]
    pub mode: TranscodeMode,
    #[serde(default)]
    pub output: OutputConfig,
    /// Input-side seek offset in seconds.
    #[serde(default)]
    pub start_time: f64,
    #[serde(default)]
    pub subtitles: Vec<SubtitleTrack>,
    /// POSTed a single job status snapshot on completion, best effort.
    #[serde(default)]
    pub callback_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_request_fills_defaults() {
        let req: TranscodeRequest =
            serde_json::from_str(r#"{"source":"http://host/v.mkv"}"#).unwrap();
        assert_eq!(req.mode, TranscodeMode::Stream);
        assert_eq!(req.output.resolution, Resolution::Auto);
        assert_eq!(req.output.hw_accel, HwAccel::Auto);
        assert_eq!(req.output.max_audio_channels, 2);
        assert_eq!(req.start_time, 0.0);
        assert!(req.subtitles.is_empty());
    }

    #[test]
    fn resolution_uses_numeric_names() {
        let res: Resolution = serde_json::from_str(r#""720p""#).unwrap();
        assert_eq!(res, Resolution::R720p);
        assert_eq!(serde_json::to_string(&Resolution::R1080p).unwrap(), r#""1080p""#);
    }

    #[test]
    fn nearest_rung_never_exceeds_source() {
        assert_eq!(Resolution::nearest_at_or_below(800), Some(Resolution::R720p));
        assert_eq!(Resolution::nearest_at_or_below(360), Some(Resolution::R360p));
        assert_eq!(Resolution::nearest_at_or_below(200), None);
    }
}
