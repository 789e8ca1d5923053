use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

/// Source stream facts the planner needs: dimensions for the never-upscale
/// rule, duration for progress math, color metadata for HDR detection.
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub duration_s: Option<f64>,
    pub width: u32,
    pub height: u32,
    pub fps: Option<f64>,
    pub pix_fmt: Option<String>,
    pub color_transfer: Option<String>,
    pub color_primaries: Option<String>,
    pub audio_channels: Option<u32>,
}

impl SourceInfo {
    /// Bit depth inferred from the pixel format name (`yuv420p10le` -> 10).
    pub fn bit_depth(&self) -> u32 {
        let Some(pix_fmt) = &self.pix_fmt else {
            return 8;
        };
        if pix_fmt.contains("16") {
            16
        } else if pix_fmt.contains("12") {
            12
        } else if pix_fmt.contains("10") {
            10
        } else {
            8
        }
    }

    /// HDR when the transfer function is PQ/HLG, or the stream is 10-bit+
    /// wide-gamut.
    pub fn is_hdr(&self) -> bool {
        if matches!(
            self.color_transfer.as_deref(),
            Some("smpte2084") | Some("arib-std-b67")
        ) {
            return true;
        }
        self.bit_depth() >= 10 && self.color_primaries.as_deref() == Some("bt2020")
    }
}

/// Probe the source with ffprobe's JSON output. Failure here is a per-job
/// fatal error, never a process fault.
pub async fn probe_source(ffprobe_path: &str, source: &str) -> Result<SourceInfo> {
    let output = Command::new(ffprobe_path)
        .arg("-v")
        .arg("quiet")
        .arg("-print_format")
        .arg("json")
        .arg("-show_format")
        .arg("-show_streams")
        .arg(source)
        .output()
        .await
        .with_context(|| format!("failed to run {ffprobe_path}"))?;

    if !output.status.success() {
        return Err(anyhow!(
            "ffprobe could not open source: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }

    let doc: Value =
        serde_json::from_slice(&output.stdout).context("ffprobe produced invalid json")?;
    parse_probe_output(&doc)
}

fn parse_probe_output(doc: &Value) -> Result<SourceInfo> {
    let streams = doc["streams"]
        .as_array()
        .ok_or_else(|| anyhow!("ffprobe output has no streams"))?;

    let video = streams
        .iter()
        .find(|s| s["codec_type"].as_str() == Some("video"))
        .ok_or_else(|| anyhow!("source has no video stream"))?;

    let width = video["width"].as_u64().unwrap_or(0) as u32;
    let height = video["height"].as_u64().unwrap_or(0) as u32;
    if width == 0 || height == 0 {
        return Err(anyhow!("source reports no frame dimensions"));
    }

    let fps = video["avg_frame_rate"]
        .as_str()
        .and_then(parse_frame_rate)
        .filter(|fps| *fps > 0.0);

    let duration_s = doc["format"]["duration"]
        .as_str()
        .and_then(|d| d.parse::<f64>().ok())
        .or_else(|| {
            video["duration"]
                .as_str()
                .and_then(|d| d.parse::<f64>().ok())
        })
        .filter(|d| *d > 0.0);

    let audio_channels = streams
        .iter()
        .find(|s| s["codec_type"].as_str() == Some("audio"))
        .and_then(|s| s["channels"].as_u64())
        .map(|c| c as u32);

    let info = SourceInfo {
        duration_s,
        width,
        height,
        fps,
        pix_fmt: video["pix_fmt"].as_str().map(str::to_string),
        color_transfer: video["color_transfer"].as_str().map(str::to_string),
        color_primaries: video["color_primaries"].as_str().map(str::to_string),
        audio_channels,
    };
    debug!(?info, "source probed");
    Ok(info)
}

/// ffprobe reports frame rates as a ratio like `24000/1001`.
fn parse_frame_rate(raw: &str) -> Option<f64> {
    match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().ok()?;
            let den: f64 = den.parse().ok()?;
            if den == 0.0 { None } else { Some(num / den) }
        }
        None => raw.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn probe_doc(video: Value) -> Value {
        json!({
            "format": {"duration": "3600.5"},
            "streams": [
                video,
                {"codec_type": "audio", "channels": 6}
            ]
        })
    }

    #[test]
    fn parses_video_and_audio_facts() {
        let doc = probe_doc(json!({
            "codec_type": "video",
            "width": 1920,
            "height": 1080,
            "avg_frame_rate": "24000/1001",
            "pix_fmt": "yuv420p",
        }));
        let info = parse_probe_output(&doc).unwrap();
        assert_eq!(info.width, 1920);
        assert_eq!(info.height, 1080);
        assert_eq!(info.duration_s, Some(3600.5));
        assert_eq!(info.audio_channels, Some(6));
        assert!((info.fps.unwrap() - 23.976).abs() < 0.001);
        assert!(!info.is_hdr());
    }

    #[test]
    fn pq_transfer_is_hdr() {
        let doc = probe_doc(json!({
            "codec_type": "video",
            "width": 3840,
            "height": 2160,
            "pix_fmt": "yuv420p10le",
            "color_transfer": "smpte2084",
        }));
        assert!(parse_probe_output(&doc).unwrap().is_hdr());
    }

    #[test]
    fn ten_bit_wide_gamut_is_hdr() {
        let doc = probe_doc(json!({
            "codec_type": "video",
            "width": 3840,
            "height": 2160,
            "pix_fmt": "yuv420p10le",
            "color_primaries": "bt2020",
        }));
        let info = parse_probe_output(&doc).unwrap();
        assert_eq!(info.bit_depth(), 10);
        assert!(info.is_hdr());
    }

    #[test]
    fn missing_video_stream_is_an_error() {
        let doc = json!({"format": {}, "streams": [{"codec_type": "audio"}]});
        assert!(parse_probe_output(&doc).is_err());
    }
}
