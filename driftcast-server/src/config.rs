use anyhow::{Context, anyhow};
use serde::Deserialize;
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

/// Server configuration loaded from environment variables, optionally seeded
/// by a TOML file (`DRIFTCAST_CONFIG_PATH` or `driftcast.toml` next to the
/// binary). Environment variables win over the file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub transcoding: TranscodingConfig,
    pub hardware: HardwareConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Per-request timeout for the REST surface, seconds.
    pub request_timeout_s: u64,
    pub cors_allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8765,
            request_timeout_s: 30,
            cors_allowed_origins: vec!["*".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TranscodingConfig {
    /// Concurrency ceiling override; `None` means the hardware tier decides.
    pub max_concurrent_jobs: Option<usize>,
    pub segment_duration_s: u32,
    pub temp_directory: PathBuf,
    pub enable_abr: bool,
    pub abr_max_variants: usize,
    pub tone_map_hdr: bool,
    pub retry_count: u32,
    pub stall_timeout_s: u64,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    /// Terminal records older than this are evicted by the janitor.
    pub retention_s: u64,
}

impl Default for TranscodingConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: None,
            segment_duration_s: 4,
            temp_directory: env::temp_dir().join("driftcast"),
            enable_abr: true,
            abr_max_variants: 4,
            tone_map_hdr: true,
            retry_count: 3,
            stall_timeout_s: 120,
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            retention_s: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub prefer_hw_accel: bool,
    pub fallback_to_software: bool,
    pub nvenc_preset: String,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            prefer_hw_accel: true,
            fallback_to_software: true,
            nvenc_preset: "p4".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Optional shared token; when set, API requests must carry `X-API-Key`.
    pub api_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            transcoding: TranscodingConfig::default(),
            hardware: HardwareConfig::default(),
            security: SecurityConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let mut config = match env::var("DRIFTCAST_CONFIG_PATH") {
            Ok(path) => Self::load_from_file(Path::new(&path))?,
            Err(_) => match Self::find_default_file() {
                Some(path) => Self::load_from_file(&path)?,
                None => Self::default(),
            },
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        toml::from_str(&contents)
            .map_err(|err| anyhow!("invalid config {}: {}", path.display(), err))
    }

    fn find_default_file() -> Option<PathBuf> {
        const CANDIDATES: &[&str] = &["driftcast.toml", "config/driftcast.toml"];
        CANDIDATES
            .iter()
            .map(Path::new)
            .find(|path| path.exists())
            .map(Path::to_path_buf)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = env::var("DRIFTCAST_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = env::var("DRIFTCAST_PORT")
            && let Ok(port) = port.parse()
        {
            self.server.port = port;
        }
        if let Ok(dir) = env::var("DRIFTCAST_TEMP_DIR") {
            self.transcoding.temp_directory = PathBuf::from(dir);
        }
        if let Ok(path) = env::var("FFMPEG_PATH") {
            self.transcoding.ffmpeg_path = path;
        }
        if let Ok(path) = env::var("FFPROBE_PATH") {
            self.transcoding.ffprobe_path = path;
        }
        if let Ok(jobs) = env::var("DRIFTCAST_MAX_CONCURRENT_JOBS")
            && let Ok(jobs) = jobs.parse()
        {
            self.transcoding.max_concurrent_jobs = Some(jobs);
        }
        if let Ok(key) = env::var("DRIFTCAST_API_KEY") {
            self.security.api_key = Some(key);
        }
    }

    /// Create the temp root. Called once during startup, before any job can
    /// claim a working directory beneath it.
    pub fn ensure_directories(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.transcoding.temp_directory).with_context(|| {
            format!(
                "failed to create temp directory {}",
                self.transcoding.temp_directory.display()
            )
        })?;
        Ok(())
    }

    /// Canonicalize the temp root so handlers and workers agree on absolute
    /// paths. Runs immediately after `ensure_directories`.
    pub fn normalize_paths(&mut self) -> anyhow::Result<()> {
        self.transcoding.temp_directory = fs::canonicalize(&self.transcoding.temp_directory)?;
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_s)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.transcoding.stall_timeout_s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8765);
        assert_eq!(config.transcoding.segment_duration_s, 4);
        assert_eq!(config.transcoding.retry_count, 3);
        assert_eq!(config.transcoding.stall_timeout_s, 120);
        assert_eq!(config.transcoding.abr_max_variants, 4);
        assert!(config.transcoding.enable_abr);
        assert!(config.transcoding.tone_map_hdr);
        assert!(config.hardware.prefer_hw_accel);
        assert!(config.hardware.fallback_to_software);
        assert_eq!(config.hardware.nvenc_preset, "p4");
        assert!(config.security.api_key.is_none());
    }

    #[test]
    fn partial_toml_keeps_section_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 9000

            [transcoding]
            retry_count = 1
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.transcoding.retry_count, 1);
        assert_eq!(config.transcoding.stall_timeout_s, 120);
    }
}
