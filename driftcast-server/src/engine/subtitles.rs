//! Subtitle sidecar fetching.

use anyhow::{Context, Result, anyhow};
use driftcast_model::SubtitleTrack;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, warn};

const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Fetch every declared subtitle track into `{working_dir}/subs/{lang}.vtt`.
/// A track that cannot be fetched is skipped with a warning; the playlist
/// writer only advertises tracks that landed.
pub async fn fetch_tracks(
    client: &reqwest::Client,
    working_dir: &Path,
    tracks: &[SubtitleTrack],
) -> Result<Vec<SubtitleTrack>> {
    if tracks.is_empty() {
        return Ok(Vec::new());
    }
    let subs_dir = working_dir.join("subs");
    fs::create_dir_all(&subs_dir)
        .await
        .context("failed to create subtitle directory")?;

    let mut fetched = Vec::new();
    for track in tracks {
        match fetch_one(client, &subs_dir, track).await {
            Ok(()) => fetched.push(track.clone()),
            Err(err) => {
                warn!(lang = %track.lang, url = %track.url, error = %err, "subtitle fetch failed");
            }
        }
    }
    Ok(fetched)
}

async fn fetch_one(client: &reqwest::Client, subs_dir: &Path, track: &SubtitleTrack) -> Result<()> {
    let response = client
        .get(&track.url)
        .timeout(FETCH_TIMEOUT)
        .send()
        .await
        .context("request failed")?;
    if !response.status().is_success() {
        return Err(anyhow!("server returned {}", response.status()));
    }
    let body = response.bytes().await.context("body read failed")?;
    let path = subs_dir.join(format!("{}.vtt", track.lang));
    fs::write(&path, &body)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    debug!(lang = %track.lang, bytes = body.len(), "subtitle fetched");
    Ok(())
}
