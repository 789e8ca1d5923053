//! Playlist generation for live-but-seekable HLS output.
//!
//! The encoder appends to its own `live.m3u8` as segments land. The publisher
//! rewrites that into a VOD-style `playlist.m3u8` (write-then-rename) so
//! clients always see a finite playlist holding a prefix of the segment
//! sequence, gaining the end-of-list marker when the encoder finishes.

use anyhow::{Context, Result};
use driftcast_model::SubtitleTrack;
use std::path::{Path, PathBuf};
use tokio::fs;

use super::planner::Rendition;

/// Write the master playlist advertising every rendition and subtitle track.
/// Emitted once at job start; URIs inside are relative.
pub async fn write_master(
    working_dir: &Path,
    renditions: &[Rendition],
    subtitles: &[SubtitleTrack],
) -> Result<()> {
    let mut master = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");

    for track in subtitles {
        let name = track.label.clone().unwrap_or_else(|| track.lang.clone());
        master.push_str(&format!(
            "#EXT-X-MEDIA:TYPE=SUBTITLES,GROUP-ID=\"subs\",NAME=\"{}\",LANGUAGE=\"{}\",DEFAULT={},AUTOSELECT=YES,URI=\"subs/{}.m3u8\"\n",
            name,
            track.lang,
            if track.default { "YES" } else { "NO" },
            track.lang,
        ));
    }

    let subs_attr = if subtitles.is_empty() {
        String::new()
    } else {
        ",SUBTITLES=\"subs\"".to_string()
    };
    for rendition in renditions {
        master.push_str(&format!(
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}x{}{}\n{}/playlist.m3u8\n",
            rendition.bandwidth_bps, rendition.width, rendition.height, subs_attr, rendition.name,
        ));
    }

    write_atomic(&working_dir.join("master.m3u8"), master.as_bytes()).await
}

/// Single-entry media playlists wrapping each fetched subtitle sidecar.
pub async fn write_subtitle_playlists(
    working_dir: &Path,
    subtitles: &[SubtitleTrack],
    duration_s: f64,
) -> Result<()> {
    let duration = duration_s.max(1.0);
    for track in subtitles {
        let playlist = format!(
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:{:.0}\n#EXT-X-MEDIA-SEQUENCE:0\n#EXT-X-PLAYLIST-TYPE:VOD\n#EXTINF:{:.3},\n{}.vtt\n#EXT-X-ENDLIST\n",
            duration.ceil(),
            duration,
            track.lang,
        );
        write_atomic(
            &working_dir.join("subs").join(format!("{}.m3u8", track.lang)),
            playlist.as_bytes(),
        )
        .await?;
    }
    Ok(())
}

/// Segment entries parsed out of the encoder's live playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentEntry {
    pub duration_s: f64,
    pub uri: String,
}

/// Extract the `(#EXTINF, uri)` pairs the encoder has committed so far. The
/// encoder writes each segment file before referencing it, so everything
/// returned here is complete on disk.
pub fn parse_live_playlist(content: &str) -> Vec<SegmentEntry> {
    let mut segments = Vec::new();
    let mut pending: Option<f64> = None;
    for line in content.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            pending = rest
                .split(',')
                .next()
                .and_then(|d| d.parse::<f64>().ok());
        } else if !line.is_empty() && !line.starts_with('#') {
            if let Some(duration_s) = pending.take() {
                segments.push(SegmentEntry {
                    duration_s,
                    uri: line.to_string(),
                });
            }
        }
    }
    segments
}

/// Render the published VOD-style playlist from a segment prefix.
pub fn render_vod_playlist(segments: &[SegmentEntry], target_duration: u32, finished: bool) -> String {
    let mut playlist = format!(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:{target_duration}\n#EXT-X-MEDIA-SEQUENCE:0\n#EXT-X-PLAYLIST-TYPE:VOD\n"
    );
    for segment in segments {
        playlist.push_str(&format!("#EXTINF:{:.5},\n{}\n", segment.duration_s, segment.uri));
    }
    if finished {
        playlist.push_str("#EXT-X-ENDLIST\n");
    }
    playlist
}

/// Mirrors each rendition's live playlist into the published one. Runs
/// periodically while the encoder works and once more after it exits.
pub struct PlaylistPublisher {
    working_dir: PathBuf,
    renditions: Vec<Rendition>,
    target_duration: u32,
    /// Single-rendition jobs with no subtitle tracks publish the media
    /// playlist directly at `master.m3u8`, with segment URIs prefixed by the
    /// rendition directory.
    media_master: bool,
}

impl PlaylistPublisher {
    pub fn new(
        working_dir: PathBuf,
        renditions: Vec<Rendition>,
        target_duration: u32,
        media_master: bool,
    ) -> Self {
        Self {
            working_dir,
            renditions,
            target_duration,
            media_master,
        }
    }

    /// Publish empty playlists before the encoder has produced anything, so
    /// a handed-out stream URL resolves immediately after `processing`.
    pub async fn publish_empty(&self) -> Result<()> {
        let rendered = render_vod_playlist(&[], self.target_duration, false);
        for rendition in &self.renditions {
            write_atomic(
                &self.working_dir.join(&rendition.name).join("playlist.m3u8"),
                rendered.as_bytes(),
            )
            .await?;
        }
        if self.media_master {
            write_atomic(&self.working_dir.join("master.m3u8"), rendered.as_bytes()).await?;
        }
        Ok(())
    }

    pub async fn publish(&self, finished: bool) -> Result<()> {
        for rendition in &self.renditions {
            let dir = self.working_dir.join(&rendition.name);
            let live = match fs::read_to_string(dir.join("live.m3u8")).await {
                Ok(content) => content,
                // The encoder has not created this rendition's playlist yet.
                Err(_) => continue,
            };
            let segments = parse_live_playlist(&live);
            let rendered = render_vod_playlist(&segments, self.target_duration, finished);
            write_atomic(&dir.join("playlist.m3u8"), rendered.as_bytes()).await?;

            if self.media_master && self.renditions.len() == 1 {
                let prefixed: Vec<SegmentEntry> = segments
                    .into_iter()
                    .map(|segment| SegmentEntry {
                        duration_s: segment.duration_s,
                        uri: format!("{}/{}", rendition.name, segment.uri),
                    })
                    .collect();
                let rendered = render_vod_playlist(&prefixed, self.target_duration, finished);
                write_atomic(&self.working_dir.join("master.m3u8"), rendered.as_bytes()).await?;
            }
        }
        Ok(())
    }
}

/// Write then rename, so readers only ever observe complete playlists.
async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("m3u8.tmp");
    fs::write(&tmp, contents)
        .await
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("failed to publish {}", path.display()))?;
    Ok(())
}
