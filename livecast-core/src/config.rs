use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub stream: StreamConfig,
    pub session: SessionConfig,
    pub pipeline: PipelineConfig,
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Encode parameters handed to the transport and the transcoder.
///
/// These stand in for transport-side capability negotiation; the defaults
/// match what a standard live channel accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: u32,
    pub max_bitrate_kbps: u32,
    pub frame_rate: u32,
    /// x264 speed preset (ultrafast..placebo)
    pub preset: String,
    pub read_at_native_fps: bool,
    pub hardware_acceleration: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            bitrate_kbps: 4000,
            max_bitrate_kbps: 4000,
            frame_rate: 30,
            preset: "medium".to_string(),
            read_at_native_fps: false,
            hardware_acceleration: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Upper bound on the join handshake.
    pub connect_timeout_ms: u64,
    /// Pause between a pipeline ending and connection teardown, letting
    /// the transport flush.
    pub drain_grace_ms: u64,
    /// Pause before reconnecting for the next queued item.
    pub switch_delay_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            drain_grace_ms: 1_500,
            switch_delay_ms: 1_500,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub const fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    #[must_use]
    pub const fn switch_delay(&self) -> Duration {
        Duration::from_millis(self.switch_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Path to the ffmpeg binary.
    pub ffmpeg_path: String,
    /// How many trailing stderr lines to keep for failure diagnostics.
    pub stderr_tail_lines: usize,
    /// Grace period between a stop request and the hard kill fallback.
    pub kill_after_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            stderr_tail_lines: 32,
            kill_after_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Largest datagram the reference UDP transport will emit.
    pub max_datagram_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_datagram_bytes: 1316,
        }
    }
}

const X264_PRESETS: &[&str] = &[
    "ultrafast", "superfast", "veryfast", "faster", "fast", "medium", "slow", "slower", "veryslow",
    "placebo",
];

impl Config {
    /// Load configuration from a file (TOML)
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let builder = ConfigBuilder::builder()
            .add_source(File::from(Path::new(path)))
            .add_source(Environment::with_prefix("LIVECAST").separator("__"))
            .build()?;
        builder.try_deserialize()
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        let builder = ConfigBuilder::builder()
            .add_source(Environment::with_prefix("LIVECAST").separator("__"))
            .build()?;
        builder.try_deserialize()
    }

    /// Validate the configuration, collecting every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.stream.width == 0 || self.stream.height == 0 {
            errors.push("stream.width and stream.height must be nonzero".to_string());
        }
        if self.stream.width % 2 != 0 || self.stream.height % 2 != 0 {
            errors.push("stream dimensions must be even (yuv420p chroma subsampling)".to_string());
        }
        if self.stream.frame_rate == 0 || self.stream.frame_rate > 120 {
            errors.push(format!(
                "stream.frame_rate {} out of range (1-120)",
                self.stream.frame_rate
            ));
        }
        if self.stream.bitrate_kbps == 0 {
            errors.push("stream.bitrate_kbps must be nonzero".to_string());
        }
        if self.stream.max_bitrate_kbps < self.stream.bitrate_kbps {
            errors.push(format!(
                "stream.max_bitrate_kbps {} below stream.bitrate_kbps {}",
                self.stream.max_bitrate_kbps, self.stream.bitrate_kbps
            ));
        }
        if !X264_PRESETS.contains(&self.stream.preset.as_str()) {
            errors.push(format!("unknown x264 preset: {}", self.stream.preset));
        }
        if self.session.connect_timeout_ms == 0 {
            errors.push("session.connect_timeout_ms must be nonzero".to_string());
        }
        if self.session.connect_timeout_ms > 120_000 {
            errors.push(format!(
                "session.connect_timeout_ms {} unreasonably large (max {})",
                self.session.connect_timeout_ms,
                humantime::format_duration(Duration::from_secs(120))
            ));
        }
        if self.pipeline.ffmpeg_path.is_empty() {
            errors.push("pipeline.ffmpeg_path must not be empty".to_string());
        }
        if self.pipeline.stderr_tail_lines == 0 {
            errors.push("pipeline.stderr_tail_lines must be nonzero".to_string());
        }
        if self.transport.max_datagram_bytes < 512 || self.transport.max_datagram_bytes > 65_507 {
            errors.push(format!(
                "transport.max_datagram_bytes {} out of range (512-65507)",
                self.transport.max_datagram_bytes
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Load configuration from config file or environment variables
///
/// Config file search order:
/// 1. `LIVECAST_CONFIG_PATH` environment variable (explicit path)
/// 2. ./livecast.toml (current working directory)
/// 3. Fall back to environment variables only
pub fn load_config() -> anyhow::Result<Config> {
    let config_path = std::env::var("LIVECAST_CONFIG_PATH")
        .ok()
        .filter(|p| Path::new(p).exists())
        .or_else(|| {
            let cwd = "livecast.toml";
            Path::new(cwd).exists().then(|| cwd.to_string())
        });

    let config = if let Some(path) = config_path {
        eprintln!("Loading config from {path}");
        Config::from_file(&path).map_err(|e| anyhow::anyhow!("failed to load {path}: {e}"))?
    } else {
        Config::from_env().unwrap_or_else(|e| {
            eprintln!("Failed to load config from environment: {e}");
            eprintln!("Using default configuration");
            Config::default()
        })
    };

    if let Err(errors) = config.validate() {
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn odd_dimensions_rejected() {
        let mut config = Config::default();
        config.stream.width = 1279;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("even")));
    }

    #[test]
    fn unknown_preset_rejected() {
        let mut config = Config::default();
        config.stream.preset = "warpspeed".to_string();
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("preset")));
    }

    #[test]
    fn max_bitrate_must_cover_bitrate() {
        let mut config = Config::default();
        config.stream.max_bitrate_kbps = config.stream.bitrate_kbps - 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_connect_timeout_rejected() {
        let mut config = Config::default();
        config.session.connect_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn collects_multiple_errors() {
        let mut config = Config::default();
        config.stream.width = 0;
        config.stream.bitrate_kbps = 0;
        config.pipeline.ffmpeg_path = String::new();
        let errors = config.validate().unwrap_err();
        assert!(errors.len() >= 3);
    }

    #[test]
    fn session_durations_convert() {
        let session = SessionConfig::default();
        assert_eq!(session.drain_grace(), Duration::from_millis(1_500));
        assert_eq!(session.connect_timeout(), Duration::from_secs(10));
    }
}
