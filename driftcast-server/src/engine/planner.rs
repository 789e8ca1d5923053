use driftcast_model::{
    Capabilities, HwAccel, OutputConfig, TranscodeMode, TranscodeRequest, VideoCodec,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use super::probe::SourceInfo;
use crate::config::Config;

/// Fixed ABR ladder: height and video bitrate per rung. Rungs above the
/// source or the tier cap are pruned.
const ABR_LADDER: [(u32, u32); 5] = [
    (2160, 20_000),
    (1080, 8_000),
    (720, 4_000),
    (480, 1_500),
    (360, 800),
];

const AUDIO_BITRATE_KBPS: u32 = 128;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("hw_accel '{val}' is not available on this machine", val = .0.as_str())]
    FamilyUnavailable(HwAccel),
    #[error("no suitable encoder for codec '{0}'")]
    NoEncoder(String),
}

/// One output rendition of an HLS plan. Drives the master playlist and the
/// live-playlist publisher.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendition {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub bandwidth_bps: u64,
}

/// A fully resolved encoder invocation.
#[derive(Debug, Clone)]
pub struct EncodePlan {
    /// Concrete family; never `Auto`.
    pub family: HwAccel,
    pub renditions: Vec<Rendition>,
    /// Arguments for the (main) encoder invocation.
    pub args: Vec<String>,
    /// Analysis-pass arguments for two-pass batch encodes; output discarded.
    pub first_pass_args: Option<Vec<String>>,
    /// Final artifact for batch mode.
    pub output_file: Option<PathBuf>,
}

/// Builds encoder invocations from a request, the probed source, and the
/// admission controller's quality hint.
pub struct Planner {
    capabilities: Arc<Capabilities>,
    config: Arc<Config>,
}

impl Planner {
    pub fn new(capabilities: Arc<Capabilities>, config: Arc<Config>) -> Self {
        Self {
            capabilities,
            config,
        }
    }

    /// Resolve the encoder family for a request. `force_software` is the
    /// hardware-fallback replan.
    pub fn select_family(
        &self,
        requested: HwAccel,
        codec: VideoCodec,
        force_software: bool,
    ) -> Result<HwAccel, PlanError> {
        if force_software || requested == HwAccel::Software {
            return Ok(HwAccel::Software);
        }
        match requested {
            HwAccel::Auto => {
                if self.config.hardware.prefer_hw_accel {
                    for family in HwAccel::PREFERENCE_ORDER {
                        if self
                            .capabilities
                            .family_group(family)
                            .is_some_and(|group| group.encoder_for(codec).is_some())
                        {
                            return Ok(family);
                        }
                    }
                }
                Ok(HwAccel::Software)
            }
            family => {
                if self
                    .capabilities
                    .family_group(family)
                    .is_some_and(|group| group.encoder_for(codec).is_some())
                {
                    Ok(family)
                } else {
                    Err(PlanError::FamilyUnavailable(family))
                }
            }
        }
    }

    pub fn plan(
        &self,
        request: &TranscodeRequest,
        source: &SourceInfo,
        quality_factor: f32,
        working_dir: &Path,
        force_software: bool,
    ) -> Result<EncodePlan, PlanError> {
        let family = self.select_family(
            request.output.hw_accel,
            request.output.video_codec,
            force_software,
        )?;
        let encoder = self.encoder_name(family, request.output.video_codec)?;
        let tone_map = self.config.transcoding.tone_map_hdr
            && source.is_hdr()
            && source.bit_depth() >= 8;

        let plan = match request.mode {
            TranscodeMode::Stream => self.plan_stream(
                request, source, quality_factor, working_dir, family, &encoder, tone_map,
            ),
            TranscodeMode::Abr => self.plan_abr(
                request, source, quality_factor, working_dir, family, &encoder, tone_map,
            ),
            TranscodeMode::Batch => self.plan_batch(
                request, source, quality_factor, working_dir, family, &encoder, tone_map,
                force_software,
            ),
        };
        debug!(
            family = family.as_str(),
            mode = request.mode.as_str(),
            renditions = plan.renditions.len(),
            tone_map,
            "invocation planned"
        );
        Ok(plan)
    }

    #[allow(clippy::too_many_arguments)]
    fn plan_stream(
        &self,
        request: &TranscodeRequest,
        source: &SourceInfo,
        quality_factor: f32,
        working_dir: &Path,
        family: HwAccel,
        encoder: &str,
        tone_map: bool,
    ) -> EncodePlan {
        let (width, height) = self.resolve_dimensions(&request.output, source, quality_factor);
        let bitrate = self.resolve_bitrate(&request.output, height, quality_factor);
        let rendition = Rendition {
            name: rendition_name(height),
            width,
            height,
            bandwidth_bps: bandwidth_of(bitrate),
        };

        let mut args = self.common_prefix(request, family, tone_map);
        args.extend(["-map".into(), "0:v:0".into()]);
        if source.audio_channels.is_some() {
            args.extend(["-map".into(), "0:a:0".into()]);
        }
        args.extend(["-c:v".into(), encoder.to_string()]);
        self.push_preset(&mut args, family, encoder);
        args.extend(["-b:v".into(), format!("{bitrate}k")]);

        let scale = (height < source.height).then_some(height);
        if let Some(filter) = self.video_filter(family, scale, tone_map) {
            args.extend(["-vf".into(), filter]);
        }
        self.push_audio(&mut args, request, source);
        self.push_hls_output(&mut args, working_dir, &rendition.name, None);

        EncodePlan {
            family,
            renditions: vec![rendition],
            args,
            first_pass_args: None,
            output_file: None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn plan_abr(
        &self,
        request: &TranscodeRequest,
        source: &SourceInfo,
        quality_factor: f32,
        working_dir: &Path,
        family: HwAccel,
        encoder: &str,
        tone_map: bool,
    ) -> EncodePlan {
        let rungs = self.ladder(source, quality_factor);
        let renditions: Vec<Rendition> = rungs
            .iter()
            .map(|(height, bitrate)| Rendition {
                name: rendition_name(*height),
                width: even_width(source, *height),
                height: *height,
                bandwidth_bps: bandwidth_of(*bitrate),
            })
            .collect();

        let mut args = self.common_prefix(request, family, tone_map);

        // All rungs come out of one invocation: split the decoded stream,
        // scale each branch, and let the muxer group them by name.
        let mut filter = String::new();
        let head_label = if tone_map {
            filter.push_str(&format!("[0:v]{}[sdr];", tone_map_filter()));
            "sdr"
        } else {
            "0:v"
        };
        filter.push_str(&format!("[{head_label}]split={}", rungs.len()));
        for idx in 0..rungs.len() {
            filter.push_str(&format!("[s{idx}]"));
        }
        for (idx, (height, _)) in rungs.iter().enumerate() {
            filter.push(';');
            if *height < source.height {
                filter.push_str(&format!("[s{idx}]scale=-2:{height}[v{idx}]"));
            } else {
                filter.push_str(&format!("[s{idx}]copy[v{idx}]"));
            }
        }
        args.extend(["-filter_complex".into(), filter]);

        let audio = source.audio_channels.is_some();
        for (idx, (_, bitrate)) in rungs.iter().enumerate() {
            args.extend(["-map".into(), format!("[v{idx}]")]);
            args.extend([format!("-c:v:{idx}"), encoder.to_string()]);
            args.extend([format!("-b:v:{idx}"), format!("{bitrate}k")]);
            if audio {
                args.extend(["-map".into(), "0:a:0".into()]);
            }
        }
        self.push_preset(&mut args, family, encoder);
        if audio {
            self.push_audio(&mut args, request, source);
        }

        let var_stream_map = rungs
            .iter()
            .enumerate()
            .map(|(idx, (height, _))| {
                if audio {
                    format!("v:{idx},a:{idx},name:{}", rendition_name(*height))
                } else {
                    format!("v:{idx},name:{}", rendition_name(*height))
                }
            })
            .collect::<Vec<_>>()
            .join(" ");
        self.push_hls_output(&mut args, working_dir, "%v", Some(&var_stream_map));

        EncodePlan {
            family,
            renditions,
            args,
            first_pass_args: None,
            output_file: None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn plan_batch(
        &self,
        request: &TranscodeRequest,
        source: &SourceInfo,
        quality_factor: f32,
        working_dir: &Path,
        family: HwAccel,
        encoder: &str,
        tone_map: bool,
        force_software: bool,
    ) -> EncodePlan {
        let (_, height) = self.resolve_dimensions(&request.output, source, quality_factor);
        let bitrate = self.resolve_bitrate(&request.output, height, quality_factor);
        let output_file =
            working_dir.join(format!("output.{}", request.output.container.extension()));

        let mut tail = Vec::new();
        tail.extend(["-map".into(), "0:v:0".into()]);
        if source.audio_channels.is_some() {
            tail.extend(["-map".into(), "0:a:0".into()]);
        }
        tail.extend(["-c:v".into(), encoder.to_string()]);
        self.push_preset(&mut tail, family, encoder);
        tail.extend(["-b:v".into(), format!("{bitrate}k")]);
        let scale = (height < source.height).then_some(height);
        if let Some(filter) = self.video_filter(family, scale, tone_map) {
            tail.extend(["-vf".into(), filter]);
        }

        // Two-pass needs the encoder's stats log; a software fallback replan
        // drops it rather than paying the analysis pass twice.
        let two_pass = request.output.two_pass && !force_software;
        let passlog = working_dir.join("ffpass").to_string_lossy().into_owned();

        let prefix = self.common_prefix(request, family, tone_map);

        let first_pass_args = two_pass.then(|| {
            let mut args = prefix.clone();
            args.extend(tail.clone());
            args.extend(["-pass".into(), "1".into()]);
            args.extend(["-passlogfile".into(), passlog.clone()]);
            // Analysis only: no audio, output discarded.
            args.extend(["-an".into(), "-f".into(), "null".into(), "-".into()]);
            args
        });

        let mut args = prefix;
        args.extend(tail);
        if two_pass {
            args.extend(["-pass".into(), "2".into()]);
            args.extend(["-passlogfile".into(), passlog]);
        }
        self.push_audio(&mut args, request, source);
        if request.output.container == driftcast_model::Container::Mp4 {
            args.extend(["-movflags".into(), "+faststart".into()]);
        }
        args.push(output_file.to_string_lossy().into_owned());

        EncodePlan {
            family,
            renditions: Vec::new(),
            args,
            first_pass_args,
            output_file: Some(output_file),
        }
    }

    /// Global flags, hardware decode setup, input seek, and the input itself.
    /// Hardware acceleration flags must precede `-i`.
    fn common_prefix(
        &self,
        request: &TranscodeRequest,
        family: HwAccel,
        tone_map: bool,
    ) -> Vec<String> {
        let mut args = vec![
            "-hide_banner".into(),
            "-y".into(),
            "-loglevel".into(),
            "warning".into(),
            "-nostats".into(),
            "-progress".into(),
            "pipe:1".into(),
        ];
        // Tone mapping runs in the software filter graph, so the decoder must
        // hand over system-memory frames.
        if !tone_map {
            match family {
                HwAccel::Nvenc => {
                    args.extend(["-hwaccel".into(), "cuda".into()]);
                    args.extend(["-hwaccel_output_format".into(), "cuda".into()]);
                }
                HwAccel::Qsv => {
                    args.extend(["-hwaccel".into(), "qsv".into()]);
                }
                HwAccel::Vaapi => {
                    args.extend(["-hwaccel".into(), "vaapi".into()]);
                    args.extend(["-hwaccel_device".into(), "/dev/dri/renderD128".into()]);
                    args.extend(["-hwaccel_output_format".into(), "vaapi".into()]);
                }
                HwAccel::Videotoolbox => {
                    args.extend(["-hwaccel".into(), "videotoolbox".into()]);
                }
                HwAccel::Amf => {
                    args.extend(["-hwaccel".into(), "d3d11va".into()]);
                }
                HwAccel::Auto | HwAccel::Software => {}
            }
        }
        if request.start_time > 0.0 {
            args.extend(["-ss".into(), format!("{:.3}", request.start_time)]);
        }
        args.extend(["-i".into(), request.source.clone()]);
        args
    }

    fn encoder_name(&self, family: HwAccel, codec: VideoCodec) -> Result<String, PlanError> {
        match family {
            HwAccel::Software => Ok(codec.software_encoder().to_string()),
            HwAccel::Auto => Err(PlanError::NoEncoder(codec.as_str().to_string())),
            family => self
                .capabilities
                .family_group(family)
                .and_then(|group| group.encoder_for(codec))
                .map(str::to_string)
                .ok_or_else(|| PlanError::NoEncoder(codec.as_str().to_string())),
        }
    }

    fn push_preset(&self, args: &mut Vec<String>, family: HwAccel, encoder: &str) {
        match family {
            HwAccel::Nvenc => {
                args.extend(["-preset".into(), self.config.hardware.nvenc_preset.clone()]);
            }
            HwAccel::Software if encoder.contains("264") || encoder.contains("265") => {
                args.extend(["-preset".into(), "fast".into()]);
            }
            _ => {}
        }
    }

    fn push_audio(&self, args: &mut Vec<String>, request: &TranscodeRequest, source: &SourceInfo) {
        let Some(channels) = source.audio_channels else {
            return;
        };
        args.extend(["-c:a".into(), request.output.audio_codec.encoder().into()]);
        if request.output.audio_codec != driftcast_model::AudioCodec::Copy {
            args.extend(["-b:a".into(), format!("{AUDIO_BITRATE_KBPS}k")]);
            let downmix = channels.min(request.output.max_audio_channels as u32);
            args.extend(["-ac".into(), downmix.to_string()]);
        }
    }

    fn push_hls_output(
        &self,
        args: &mut Vec<String>,
        working_dir: &Path,
        variant_dir: &str,
        var_stream_map: Option<&str>,
    ) {
        let segment = self.config.transcoding.segment_duration_s;
        args.extend(["-f".into(), "hls".into()]);
        args.extend(["-hls_time".into(), segment.to_string()]);
        args.extend(["-hls_list_size".into(), "0".into()]);
        args.extend(["-hls_segment_type".into(), "mpegts".into()]);
        args.extend(["-hls_playlist_type".into(), "event".into()]);
        args.extend(["-start_number".into(), "0".into()]);
        args.extend([
            "-force_key_frames".into(),
            format!("expr:gte(t,n_forced*{segment})"),
        ]);
        if let Some(map) = var_stream_map {
            args.extend(["-var_stream_map".into(), map.to_string()]);
        }
        args.extend([
            "-hls_segment_filename".into(),
            working_dir
                .join(variant_dir)
                .join("segment_%05d.ts")
                .to_string_lossy()
                .into_owned(),
        ]);
        args.push(
            working_dir
                .join(variant_dir)
                .join("live.m3u8")
                .to_string_lossy()
                .into_owned(),
        );
    }

    fn video_filter(&self, family: HwAccel, scale_to: Option<u32>, tone_map: bool) -> Option<String> {
        let mut stages = Vec::new();
        if tone_map {
            stages.push(tone_map_filter());
            if let Some(height) = scale_to {
                stages.push(format!("scale=-2:{height}"));
            }
            // The graph produced software frames; VAAPI encoders want them
            // uploaded back to the device.
            if family == HwAccel::Vaapi {
                stages.push("format=nv12,hwupload".into());
            }
        } else if let Some(height) = scale_to {
            let scale = match family {
                HwAccel::Nvenc => format!("scale_cuda=-2:{height}"),
                HwAccel::Qsv => format!("scale_qsv=-1:{height}"),
                HwAccel::Vaapi => format!("scale_vaapi=-2:{height}"),
                _ => format!("scale=-2:{height}"),
            };
            stages.push(scale);
        }
        if stages.is_empty() {
            None
        } else {
            Some(stages.join(","))
        }
    }

    /// Target dimensions for single-rendition modes: the requested rung, or
    /// `auto` resolved from the tier cap and quality factor, never above the
    /// source.
    fn resolve_dimensions(
        &self,
        output: &OutputConfig,
        source: &SourceInfo,
        quality_factor: f32,
    ) -> (u32, u32) {
        let tier_cap = scaled_cap(self.capabilities.max_height, quality_factor);
        let requested = output.resolution.height().unwrap_or(tier_cap);
        let height = requested.min(tier_cap).min(source.height);
        // Snap to a standard rung when one fits; tiny sources keep their size.
        let height = driftcast_model::Resolution::nearest_at_or_below(height)
            .and_then(|r| r.height())
            .unwrap_or(source.height)
            .min(source.height);
        (even_width(source, height), height)
    }

    fn resolve_bitrate(&self, output: &OutputConfig, height: u32, quality_factor: f32) -> u32 {
        let base = output
            .video_bitrate_kbps
            .unwrap_or_else(|| default_bitrate_for(height));
        let capped = base.min(self.capabilities.max_bitrate_kbps);
        ((capped as f32 * quality_factor) as u32).max(250)
    }

    /// ABR rungs for this source under the current quality factor.
    fn ladder(&self, source: &SourceInfo, quality_factor: f32) -> Vec<(u32, u32)> {
        let cap = scaled_cap(self.capabilities.max_height, quality_factor).min(source.height);
        let mut rungs: Vec<(u32, u32)> = ABR_LADDER
            .iter()
            .filter(|(height, _)| *height <= cap)
            .map(|(height, bitrate)| {
                (*height, ((*bitrate as f32 * quality_factor) as u32).max(250))
            })
            .collect();
        if rungs.is_empty() {
            // Source is smaller than every rung: one rendition at the source
            // height keeps the master playlist non-empty.
            rungs.push((
                source.height,
                ((default_bitrate_for(source.height) as f32 * quality_factor) as u32).max(250),
            ));
        }
        rungs.truncate(self.config.transcoding.abr_max_variants.max(1));
        rungs
    }
}

fn scaled_cap(max_height: u32, quality_factor: f32) -> u32 {
    ((max_height as f32 * quality_factor) as u32).max(240)
}

fn default_bitrate_for(height: u32) -> u32 {
    match height {
        h if h >= 2160 => 20_000,
        h if h >= 1440 => 12_000,
        h if h >= 1080 => 8_000,
        h if h >= 720 => 4_000,
        h if h >= 480 => 1_500,
        _ => 800,
    }
}

fn rendition_name(height: u32) -> String {
    format!("{height}p")
}

/// Peak bandwidth advertised in the master playlist: video plus audio with
/// container overhead headroom.
fn bandwidth_of(video_kbps: u32) -> u64 {
    (video_kbps as u64 + AUDIO_BITRATE_KBPS as u64) * 1_100
}

/// Width preserving the source aspect ratio, rounded to an even value the
/// way the `scale=-2:h` filter does.
fn even_width(source: &SourceInfo, height: u32) -> u32 {
    if source.height == 0 {
        return height * 16 / 9;
    }
    let width = (source.width as u64 * height as u64) / source.height as u64;
    (width as u32 + 1) & !1
}

/// Software tone-mapping chain for HDR sources targeting 8-bit SDR output.
fn tone_map_filter() -> String {
    "zscale=t=linear:npl=100,tonemap=hable:desat=0,zscale=p=bt709:t=bt709:m=bt709,format=yuv420p"
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftcast_model::{HardwareTier, HwEncoderGroup, Resolution};

    fn caps(tier: HardwareTier, families: Vec<HwEncoderGroup>) -> Arc<Capabilities> {
        let limits = tier.limits();
        Arc::new(Capabilities {
            hw_encoders: families,
            software_encoders: vec!["libx264".into(), "libx265".into()],
            containers: vec!["mp4".into()],
            tier,
            max_height: limits.max_height,
            max_bitrate_kbps: limits.max_bitrate_kbps,
            suggested_max_jobs: limits.suggested_max_jobs,
            gpu_name: None,
            gpu_vram_mb: None,
            discrete_gpu: false,
            laptop: false,
            ffmpeg_version: None,
            os: "linux".into(),
        })
    }

    fn nvenc_group() -> HwEncoderGroup {
        HwEncoderGroup {
            family: HwAccel::Nvenc,
            encoders: vec!["h264_nvenc".into(), "hevc_nvenc".into()],
        }
    }

    fn planner(tier: HardwareTier, families: Vec<HwEncoderGroup>) -> Planner {
        Planner::new(caps(tier, families), Arc::new(Config::default()))
    }

    fn source(width: u32, height: u32) -> SourceInfo {
        SourceInfo {
            duration_s: Some(600.0),
            width,
            height,
            fps: Some(25.0),
            pix_fmt: Some("yuv420p".into()),
            color_transfer: None,
            color_primaries: None,
            audio_channels: Some(2),
        }
    }

    fn request(mode: TranscodeMode) -> TranscodeRequest {
        TranscodeRequest {
            source: "http://host/v.mkv".into(),
            mode,
            output: OutputConfig::default(),
            start_time: 0.0,
            subtitles: vec![],
            callback_url: None,
        }
    }

    #[test]
    fn auto_prefers_nvenc_then_software() {
        let planner = planner(HardwareTier::Ultra, vec![nvenc_group()]);
        assert_eq!(
            planner
                .select_family(HwAccel::Auto, VideoCodec::H264, false)
                .unwrap(),
            HwAccel::Nvenc
        );
        let sw_only = planner_minimal();
        assert_eq!(
            sw_only
                .select_family(HwAccel::Auto, VideoCodec::H264, false)
                .unwrap(),
            HwAccel::Software
        );
    }

    fn planner_minimal() -> Planner {
        planner(HardwareTier::Minimal, vec![])
    }

    #[test]
    fn explicit_unavailable_family_is_rejected() {
        let planner = planner_minimal();
        assert!(matches!(
            planner.select_family(HwAccel::Nvenc, VideoCodec::H264, false),
            Err(PlanError::FamilyUnavailable(HwAccel::Nvenc))
        ));
    }

    #[test]
    fn fallback_forces_software_over_explicit_request() {
        let planner = planner(HardwareTier::Ultra, vec![nvenc_group()]);
        assert_eq!(
            planner
                .select_family(HwAccel::Nvenc, VideoCodec::H264, true)
                .unwrap(),
            HwAccel::Software
        );
    }

    #[test]
    fn hwaccel_flags_precede_input() {
        let planner = planner(HardwareTier::Ultra, vec![nvenc_group()]);
        let plan = planner
            .plan(
                &request(TranscodeMode::Stream),
                &source(3840, 2160),
                1.0,
                Path::new("/tmp/job"),
                false,
            )
            .unwrap();
        let hwaccel = plan.args.iter().position(|a| a == "-hwaccel").unwrap();
        let input = plan.args.iter().position(|a| a == "-i").unwrap();
        assert!(hwaccel < input);
        assert!(plan.args.contains(&"h264_nvenc".to_string()));
    }

    #[test]
    fn stream_plan_never_upscales() {
        let planner = planner(HardwareTier::Ultra, vec![]);
        let mut req = request(TranscodeMode::Stream);
        req.output.resolution = Resolution::R1080p;
        let plan = planner
            .plan(&req, &source(1280, 720), 1.0, Path::new("/tmp/job"), false)
            .unwrap();
        assert_eq!(plan.renditions[0].height, 720);
        // Source already at target height, so no scale filter at all.
        assert!(!plan.args.iter().any(|a| a.starts_with("scale")));
    }

    #[test]
    fn quality_factor_tightens_auto_resolution() {
        let planner = planner(HardwareTier::Ultra, vec![]);
        let plan = planner
            .plan(
                &request(TranscodeMode::Stream),
                &source(3840, 2160),
                0.6,
                Path::new("/tmp/job"),
                false,
            )
            .unwrap();
        // 2160 * 0.6 = 1296, snapped down to the 1080p rung.
        assert_eq!(plan.renditions[0].height, 1080);
    }

    #[test]
    fn abr_ladder_prunes_rungs_above_source_and_tier() {
        let plan = planner(HardwareTier::Ultra, vec![]);
        let rungs = plan.ladder(&source(1920, 1080), 1.0);
        let heights: Vec<u32> = rungs.iter().map(|(h, _)| *h).collect();
        assert_eq!(heights, vec![1080, 720, 480, 360]);

        let medium = planner(HardwareTier::Medium, vec![]);
        let rungs = medium.ladder(&source(3840, 2160), 1.0);
        let heights: Vec<u32> = rungs.iter().map(|(h, _)| *h).collect();
        assert_eq!(heights, vec![1080, 720, 480, 360]);
    }

    #[test]
    fn tiny_source_still_gets_one_rung() {
        let planner = planner(HardwareTier::Ultra, vec![]);
        let rungs = planner.ladder(&source(320, 240), 1.0);
        assert_eq!(rungs.len(), 1);
        assert_eq!(rungs[0].0, 240);
    }

    #[test]
    fn abr_plan_emits_var_stream_map() {
        let planner = planner(HardwareTier::Ultra, vec![]);
        let plan = planner
            .plan(
                &request(TranscodeMode::Abr),
                &source(1920, 1080),
                1.0,
                Path::new("/tmp/job"),
                false,
            )
            .unwrap();
        let map_idx = plan
            .args
            .iter()
            .position(|a| a == "-var_stream_map")
            .unwrap();
        let map = &plan.args[map_idx + 1];
        assert!(map.contains("name:1080p"));
        assert!(map.contains("name:360p"));
        assert_eq!(plan.renditions.len(), 4);
    }

    #[test]
    fn hdr_source_gets_tone_map_stage() {
        let planner = planner(HardwareTier::Ultra, vec![]);
        let mut hdr = source(3840, 2160);
        hdr.pix_fmt = Some("yuv420p10le".into());
        hdr.color_transfer = Some("smpte2084".into());
        let plan = planner
            .plan(
                &request(TranscodeMode::Stream),
                &hdr,
                1.0,
                Path::new("/tmp/job"),
                false,
            )
            .unwrap();
        let vf = plan
            .args
            .iter()
            .position(|a| a == "-vf")
            .map(|idx| plan.args[idx + 1].clone())
            .unwrap();
        assert!(vf.contains("tonemap=hable"));
    }

    #[test]
    fn seek_offset_is_input_side() {
        let planner = planner(HardwareTier::Ultra, vec![]);
        let mut req = request(TranscodeMode::Stream);
        req.start_time = 90.0;
        let plan = planner
            .plan(&req, &source(1920, 1080), 1.0, Path::new("/tmp/job"), false)
            .unwrap();
        let ss = plan.args.iter().position(|a| a == "-ss").unwrap();
        let input = plan.args.iter().position(|a| a == "-i").unwrap();
        assert!(ss < input);
        assert_eq!(plan.args[ss + 1], "90.000");
    }

    #[test]
    fn two_pass_produces_analysis_pass() {
        let planner = planner(HardwareTier::Ultra, vec![]);
        let mut req = request(TranscodeMode::Batch);
        req.output.two_pass = true;
        let plan = planner
            .plan(&req, &source(1920, 1080), 1.0, Path::new("/tmp/job"), false)
            .unwrap();
        let first = plan.first_pass_args.unwrap();
        assert!(first.contains(&"null".to_string()));
        assert!(first.contains(&"-an".to_string()));
        assert!(plan.args.contains(&"-pass".to_string()));
        assert!(plan.output_file.unwrap().ends_with("output.mp4"));
    }

    #[test]
    fn two_pass_dropped_on_software_fallback() {
        let planner = planner(HardwareTier::Ultra, vec![nvenc_group()]);
        let mut req = request(TranscodeMode::Batch);
        req.output.two_pass = true;
        let plan = planner
            .plan(&req, &source(1920, 1080), 1.0, Path::new("/tmp/job"), true)
            .unwrap();
        assert!(plan.first_pass_args.is_none());
        assert!(!plan.args.contains(&"-pass".to_string()));
        assert_eq!(plan.family, HwAccel::Software);
    }

    #[test]
    fn audio_downmix_respects_channel_cap() {
        let planner = planner(HardwareTier::Ultra, vec![]);
        let mut src = source(1920, 1080);
        src.audio_channels = Some(6);
        let plan = planner
            .plan(
                &request(TranscodeMode::Stream),
                &src,
                1.0,
                Path::new("/tmp/job"),
                false,
            )
            .unwrap();
        let ac = plan.args.iter().position(|a| a == "-ac").unwrap();
        assert_eq!(plan.args[ac + 1], "2");
    }
}
