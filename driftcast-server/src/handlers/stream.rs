use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::Response,
};
use std::path::{Component, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::state::AppState;

/// GET /stream/{id}/{*path}: read-only view of a job's working directory.
///
/// Readers follow the playlist-then-segment contract: playlists are served
/// uncacheable so clients re-fetch the growing list, and a segment that the
/// playlist does not yet reference simply is not on disk, yielding 404.
pub async fn serve_artifact_handler(
    State(state): State<AppState>,
    Path((id, artifact)): Path<(Uuid, String)>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let working_dir = state
        .registry
        .working_dir(id)
        .ok_or_else(|| AppError::not_found(format!("job {id} not found")))?;

    let relative = sanitize(&artifact)
        .ok_or_else(|| AppError::validation("invalid artifact path"))?;
    let path = working_dir.join(relative);

    let mut file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(_) => return Err(AppError::not_found("artifact not available yet")),
    };
    let metadata = file
        .metadata()
        .await
        .map_err(|err| AppError::internal(err.to_string()))?;
    if !metadata.is_file() {
        return Err(AppError::not_found("artifact not available yet"));
    }
    let total_len = metadata.len();

    let content_type = content_type_of(&artifact);
    let cache_control = if artifact.ends_with(".m3u8") {
        "no-cache, no-store"
    } else {
        "public, max-age=31536000"
    };

    // Single-range requests on media files get a 206; everything else is a
    // full-body response.
    if let Some((start, end)) = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| parse_range(raw, total_len))
    {
        let len = end - start + 1;
        file.seek(std::io::SeekFrom::Start(start))
            .await
            .map_err(|err| AppError::internal(err.to_string()))?;
        let stream = ReaderStream::new(file.take(len));
        let response = Response::builder()
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::CACHE_CONTROL, cache_control)
            .header(header::ACCEPT_RANGES, "bytes")
            .header(
                header::CONTENT_RANGE,
                format!("bytes {start}-{end}/{total_len}"),
            )
            .header(header::CONTENT_LENGTH, len)
            .body(Body::from_stream(stream))
            .map_err(|err| AppError::internal(err.to_string()))?;
        return Ok(response);
    }

    let stream = ReaderStream::new(file);
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, cache_control)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, total_len)
        .body(Body::from_stream(stream))
        .map_err(|err| AppError::internal(err.to_string()))?;
    Ok(response)
}

/// Reject traversal and absolute components; the result stays inside the
/// working directory.
fn sanitize(artifact: &str) -> Option<PathBuf> {
    let path = std::path::Path::new(artifact);
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            _ => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        return None;
    }
    Some(clean)
}

fn content_type_of(artifact: &str) -> &'static str {
    if artifact.ends_with(".m3u8") {
        "application/vnd.apple.mpegurl"
    } else if artifact.ends_with(".ts") {
        "video/mp2t"
    } else if artifact.ends_with(".vtt") {
        "text/vtt"
    } else if artifact.ends_with(".mp4") {
        "video/mp4"
    } else if artifact.ends_with(".mkv") {
        "video/x-matroska"
    } else if artifact.ends_with(".webm") {
        "video/webm"
    } else {
        "application/octet-stream"
    }
}

/// Parse a single-range `bytes=` header against the file length.
fn parse_range(raw: &str, total_len: u64) -> Option<(u64, u64)> {
    if total_len == 0 {
        return None;
    }
    let spec = raw.strip_prefix("bytes=")?;
    // Multi-range requests are served as a full response.
    if spec.contains(',') {
        return None;
    }
    let (start, end) = spec.split_once('-')?;
    match (start.is_empty(), end.is_empty()) {
        // bytes=a-b
        (false, false) => {
            let start: u64 = start.parse().ok()?;
            let end: u64 = end.parse().ok()?;
            (start <= end && start < total_len).then(|| (start, end.min(total_len - 1)))
        }
        // bytes=a-
        (false, true) => {
            let start: u64 = start.parse().ok()?;
            (start < total_len).then(|| (start, total_len - 1))
        }
        // bytes=-n (final n bytes)
        (true, false) => {
            let suffix: u64 = end.parse().ok()?;
            if suffix == 0 {
                return None;
            }
            Some((total_len.saturating_sub(suffix), total_len - 1))
        }
        (true, true) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traversal_paths_are_rejected() {
        assert!(sanitize("../secrets").is_none());
        assert!(sanitize("720p/../../etc/passwd").is_none());
        assert!(sanitize("/etc/passwd").is_none());
        assert!(sanitize("").is_none());
        assert_eq!(
            sanitize("720p/segment_00001.ts"),
            Some(PathBuf::from("720p/segment_00001.ts"))
        );
    }

    #[test]
    fn content_types_match_artifacts() {
        assert_eq!(content_type_of("master.m3u8"), "application/vnd.apple.mpegurl");
        assert_eq!(content_type_of("segment_00001.ts"), "video/mp2t");
        assert_eq!(content_type_of("subs/en.vtt"), "text/vtt");
        assert_eq!(content_type_of("output.mp4"), "video/mp4");
    }

    #[test]
    fn range_parsing_handles_the_common_forms() {
        assert_eq!(parse_range("bytes=0-99", 1000), Some((0, 99)));
        assert_eq!(parse_range("bytes=500-", 1000), Some((500, 999)));
        assert_eq!(parse_range("bytes=-100", 1000), Some((900, 999)));
        assert_eq!(parse_range("bytes=0-5000", 1000), Some((0, 999)));
        assert_eq!(parse_range("bytes=1000-", 1000), None);
        assert_eq!(parse_range("bytes=0-10,20-30", 1000), None);
        assert_eq!(parse_range("items=0-10", 1000), None);
    }
}
