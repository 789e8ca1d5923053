//! Parsing for the encoder's `-progress` key=value stream.

/// One completed progress block. ffmpeg emits key=value lines and terminates
/// each block with a `progress=continue` or `progress=end` line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressRecord {
    pub frame: Option<u64>,
    pub fps: Option<f32>,
    pub out_time_s: Option<f64>,
    pub speed: Option<f32>,
    pub end: bool,
}

/// Accumulates key=value lines until a block terminator arrives.
#[derive(Debug, Default)]
pub struct ProgressParser {
    current: ProgressRecord,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line; returns the finished record on a block terminator.
    pub fn feed_line(&mut self, line: &str) -> Option<ProgressRecord> {
        let (key, value) = line.trim().split_once('=')?;
        let value = value.trim();
        match key {
            "frame" => self.current.frame = value.parse().ok(),
            "fps" => self.current.fps = value.parse().ok(),
            "out_time_ms" => {
                // Despite the name this field is in microseconds.
                if let Ok(us) = value.parse::<i64>() {
                    self.current.out_time_s = Some(us.max(0) as f64 / 1_000_000.0);
                }
            }
            "out_time" => {
                if self.current.out_time_s.is_none() {
                    self.current.out_time_s = parse_clock_time(value);
                }
            }
            "speed" => {
                let trimmed = value.trim_end_matches('x');
                self.current.speed = trimmed.parse().ok();
            }
            "progress" => {
                let mut record = std::mem::take(&mut self.current);
                record.end = value.eq_ignore_ascii_case("end");
                return Some(record);
            }
            _ => {}
        }
        None
    }
}

/// `HH:MM:SS.micros` as emitted in `out_time`.
fn parse_clock_time(raw: &str) -> Option<f64> {
    let parts: Vec<&str> = raw.split(':').collect();
    if parts.len() != 3 {
        return raw.parse().ok();
    }
    let hours: f64 = parts[0].parse().ok()?;
    let minutes: f64 = parts[1].parse().ok()?;
    let seconds: f64 = parts[2].parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Percentage for a record, accounting for an input-side seek offset: the
/// encoder's clock starts at zero even when the job started mid-file.
pub fn percent_complete(out_time_s: f64, start_offset_s: f64, duration_s: Option<f64>) -> f32 {
    match duration_s {
        Some(total) if total > 0.0 => {
            let position = start_offset_s + out_time_s.max(0.0);
            ((position / total) * 100.0).clamp(0.0, 100.0) as f32
        }
        _ => 0.0,
    }
}

/// Remaining wall-clock estimate from encode speed.
pub fn eta_seconds(
    out_time_s: f64,
    start_offset_s: f64,
    duration_s: Option<f64>,
    speed: Option<f32>,
) -> Option<f64> {
    let total = duration_s?;
    let speed = speed.filter(|s| *s > 0.0)?;
    let position = start_offset_s + out_time_s;
    if position >= total {
        return Some(0.0);
    }
    Some((total - position) / speed as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_parses_on_terminator() {
        let mut parser = ProgressParser::new();
        assert_eq!(parser.feed_line("frame=120"), None);
        assert_eq!(parser.feed_line("fps=29.97"), None);
        assert_eq!(parser.feed_line("out_time_ms=4000000"), None);
        assert_eq!(parser.feed_line("speed=1.5x"), None);
        let record = parser.feed_line("progress=continue").unwrap();
        assert_eq!(record.frame, Some(120));
        assert_eq!(record.fps, Some(29.97));
        assert_eq!(record.out_time_s, Some(4.0));
        assert_eq!(record.speed, Some(1.5));
        assert!(!record.end);
    }

    #[test]
    fn end_block_is_flagged() {
        let mut parser = ProgressParser::new();
        parser.feed_line("out_time_ms=10000000");
        let record = parser.feed_line("progress=end").unwrap();
        assert!(record.end);
        // The parser is clean for the next block.
        let record = parser.feed_line("progress=continue").unwrap();
        assert_eq!(record.out_time_s, None);
    }

    #[test]
    fn out_time_fallback_uses_clock_format() {
        let mut parser = ProgressParser::new();
        parser.feed_line("out_time=00:01:30.500000");
        let record = parser.feed_line("progress=continue").unwrap();
        assert_eq!(record.out_time_s, Some(90.5));
    }

    #[test]
    fn na_values_stay_none() {
        let mut parser = ProgressParser::new();
        parser.feed_line("fps=N/A");
        parser.feed_line("speed=N/A");
        let record = parser.feed_line("progress=continue").unwrap();
        assert_eq!(record.fps, None);
        assert_eq!(record.speed, None);
    }

    #[test]
    fn percent_accounts_for_seek_offset() {
        assert_eq!(percent_complete(30.0, 0.0, Some(120.0)), 25.0);
        // Seeking 60 s into a 120 s file: 30 s encoded means 75 percent.
        assert_eq!(percent_complete(30.0, 60.0, Some(120.0)), 75.0);
        assert_eq!(percent_complete(500.0, 0.0, Some(120.0)), 100.0);
        assert_eq!(percent_complete(30.0, 0.0, None), 0.0);
    }

    #[test]
    fn eta_shrinks_with_speed() {
        assert_eq!(eta_seconds(60.0, 0.0, Some(120.0), Some(2.0)), Some(30.0));
        assert_eq!(eta_seconds(120.0, 0.0, Some(120.0), Some(1.0)), Some(0.0));
        assert_eq!(eta_seconds(60.0, 0.0, Some(120.0), None), None);
        assert_eq!(eta_seconds(60.0, 0.0, Some(120.0), Some(0.0)), None);
    }
}
