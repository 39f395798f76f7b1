//! QSCAN runtime configuration handling
//!
//! Precedence, lowest first: built-in defaults, a TOML/YAML file, `QSCAN_*`
//! environment variables, then whatever the CLI applies on top.

use crate::acquisition::LoopSettings;
use crate::capture::{BackendKind, CaptureConfig, PixelFormat};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Top-level configuration structure persisted to disk or environment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QscanConfig {
    /// Device overrides applied to every capture profile
    pub camera: CameraOptions,
    /// Backend ranking and capture profiles
    pub capture: CaptureOptions,
    /// Failure handling and debounce tuning
    pub scan: ScanOptions,
    /// Logging configuration
    pub logging: LoggingOptions,
    /// Where reports go
    pub output: OutputOptions,
}

impl QscanConfig {
    /// Load configuration from an explicit path or fall back to discovered defaults.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = explicit_path {
            Self::from_file(path)?
        } else if let Some(path) = Self::discover_file()? {
            tracing::info!("Using configuration file: {}", path.display());
            Self::from_file(&path)?
        } else {
            tracing::debug!("No qscan.toml / qscan.yaml found, using defaults");
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn discover_file() -> Result<Option<PathBuf>> {
        let cwd =
            env::current_dir().map_err(|e| Error::Config(format!("Failed to read cwd: {e}")))?;
        for candidate in ["qscan.toml", "qscan.yaml", "qscan.yml"] {
            let path = cwd.join(candidate);
            if path.exists() {
                return Ok(Some(path));
            }
        }

        if let Some(xdg_config) = env::var_os("XDG_CONFIG_HOME") {
            let base = PathBuf::from(xdg_config).join("qscan");
            for candidate in ["config.toml", "config.yaml"] {
                let path = base.join(candidate);
                if path.exists() {
                    return Ok(Some(path));
                }
            }
        }

        Ok(None)
    }

    /// Read configuration from a concrete file path.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {e}", path.display())))?;

        match path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("")
            .to_ascii_lowercase()
            .as_str()
        {
            "toml" => Self::from_toml(&contents).map_err(|e| {
                Error::Config(format!("Failed to parse TOML {}: {e}", path.display()))
            }),
            "yaml" | "yml" => Self::from_yaml(&contents).map_err(|e| {
                Error::Config(format!("Failed to parse YAML {}: {e}", path.display()))
            }),
            other => Err(Error::Config(format!(
                "Unsupported config format '{other}', expected toml/yaml"
            ))),
        }
    }

    /// Parse a TOML document
    pub fn from_toml(contents: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Parse a YAML document
    pub fn from_yaml(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(contents)
    }

    fn apply_env_overrides(&mut self) {
        self.camera.apply_env_overrides();
        self.capture.apply_env_overrides();
        self.scan.apply_env_overrides();
        self.logging.apply_env_overrides();
        self.output.apply_env_overrides();
    }

    /// Reject combinations that cannot possibly start
    pub fn validate(&self) -> Result<()> {
        if self.capture.backends.is_empty() {
            return Err(Error::Config("capture.backends must not be empty".into()));
        }
        if self.capture.profiles.is_empty() {
            return Err(Error::Config("capture.profiles must not be empty".into()));
        }
        if self.capture.backends.contains(&BackendKind::Replay) && self.capture.replay_dir.is_none()
        {
            return Err(Error::Config(
                "capture.replay_dir is required when the replay backend is enabled".into(),
            ));
        }
        if self.scan.failure_threshold == 0 {
            return Err(Error::Config("scan.failure_threshold must be at least 1".into()));
        }
        if self.scan.probe_attempts == 0 {
            return Err(Error::Config("scan.probe_attempts must be at least 1".into()));
        }
        if self.scan.failure_backoff_ms == 0 {
            return Err(Error::Config("scan.failure_backoff_ms must be at least 1".into()));
        }
        if self.scan.probe_spacing_ms == 0 {
            return Err(Error::Config("scan.probe_spacing_ms must be at least 1".into()));
        }
        if !(1..=100).contains(&self.capture.quality) {
            return Err(Error::Config(format!(
                "capture.quality must be within 1..=100, got {}",
                self.capture.quality
            )));
        }
        Ok(())
    }

    /// Capture profiles in preference order with device overrides applied
    pub fn capture_profiles(&self) -> Result<Vec<CaptureConfig>> {
        self.capture
            .profiles
            .iter()
            .map(|profile| {
                let mut config = profile.resolve()?;
                config.quality = self.capture.quality;
                self.camera.apply_to(&mut config)?;
                Ok(config)
            })
            .collect()
    }

    /// Failure threshold and backoff for the acquisition loop
    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            failure_threshold: self.scan.failure_threshold.max(1),
            failure_backoff: Duration::from_millis(self.scan.failure_backoff_ms),
        }
    }

    /// Repeat suppression window
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.scan.debounce_window_ms)
    }
}

/// Device overrides merged on top of every capture profile
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraOptions {
    /// Numeric camera index (e.g. `2` for `/dev/video2`)
    pub device_index: Option<usize>,
    /// Frame width in pixels
    pub width: Option<u32>,
    /// Frame height in pixels
    pub height: Option<u32>,
    /// Frames per second
    pub fps: Option<u32>,
    /// Pixel format string (mjpeg/yuyv/rgb24/grey)
    pub format: Option<String>,
    /// Number of V4L2 buffers to allocate
    pub buffer_count: Option<u32>,
}

impl CameraOptions {
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Some(index) = env_parse::<usize>("QSCAN_CAMERA_INDEX") {
            self.device_index = Some(index);
        }
        if let Some(width) = env_parse::<u32>("QSCAN_CAMERA_WIDTH") {
            self.width = Some(width);
        }
        if let Some(height) = env_parse::<u32>("QSCAN_CAMERA_HEIGHT") {
            self.height = Some(height);
        }
        if let Some(fps) = env_parse::<u32>("QSCAN_CAMERA_FPS") {
            self.fps = Some(fps);
        }
        if let Ok(format) = env::var("QSCAN_CAMERA_FORMAT") {
            self.format = Some(format);
        }
        if let Some(buffers) = env_parse::<u32>("QSCAN_CAMERA_BUFFERS") {
            self.buffer_count = Some(buffers);
        }
    }

    /// Overwrite the fields of `config` that are set here
    pub fn apply_to(&self, config: &mut CaptureConfig) -> Result<()> {
        if let Some(index) = self.device_index {
            config.device_index = index;
        }
        if let Some(width) = self.width {
            config.width = width;
        }
        if let Some(height) = self.height {
            config.height = height;
        }
        if let Some(fps) = self.fps {
            config.fps = fps.max(1);
        }
        if let Some(format) = &self.format {
            config.format = parse_format(format)?;
        }
        if let Some(buffers) = self.buffer_count {
            config.buffer_count = buffers.max(1);
        }
        Ok(())
    }
}

fn parse_format(value: &str) -> Result<PixelFormat> {
    PixelFormat::parse(value).ok_or_else(|| {
        Error::Config(format!(
            "Unknown pixel format '{value}'. Use mjpeg, yuyv, rgb24 or grey"
        ))
    })
}

/// A capture profile: a named preset or a full table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProfileEntry {
    /// `embedded` or `compatible`
    Preset(String),
    /// Explicit settings
    Custom(CaptureConfig),
}

impl ProfileEntry {
    /// Resolve to concrete capture settings
    pub fn resolve(&self) -> Result<CaptureConfig> {
        match self {
            ProfileEntry::Custom(config) => Ok(config.clone()),
            ProfileEntry::Preset(name) => match name.to_ascii_lowercase().as_str() {
                "embedded" => Ok(CaptureConfig::embedded()),
                "compatible" => Ok(CaptureConfig::compatible()),
                other => Err(Error::Config(format!(
                    "Unknown capture profile '{other}', expected embedded or compatible"
                ))),
            },
        }
    }
}

/// Backend ranking and per-backend knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureOptions {
    /// Backends to try, most preferred first
    pub backends: Vec<BackendKind>,
    /// Capture profiles to try per backend, most preferred first
    pub profiles: Vec<ProfileEntry>,
    /// Kill a still-capture utility after this many seconds
    pub subprocess_timeout_secs: u64,
    /// Give up on a V4L2 buffer after this many seconds
    pub read_timeout_secs: u64,
    /// JPEG quality passed to still-capture utilities
    pub quality: u8,
    /// Directories searched for capture utilities instead of `$PATH`
    pub utility_search_path: Option<Vec<PathBuf>>,
    /// Directory where still-capture utilities write their output
    pub scratch_dir: Option<PathBuf>,
    /// Image directory for the replay backend
    pub replay_dir: Option<PathBuf>,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            backends: vec![BackendKind::V4l2, BackendKind::Subprocess],
            profiles: vec![
                ProfileEntry::Preset("embedded".into()),
                ProfileEntry::Preset("compatible".into()),
            ],
            subprocess_timeout_secs: 10,
            read_timeout_secs: 10,
            quality: 75,
            utility_search_path: None,
            scratch_dir: None,
            replay_dir: None,
        }
    }
}

impl CaptureOptions {
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Ok(backends) = env::var("QSCAN_BACKENDS") {
            let parsed: std::result::Result<Vec<BackendKind>, _> = split_list(&backends)
                .map(|name| BackendKind::from_str(&name))
                .collect();
            match parsed {
                Ok(list) if !list.is_empty() => self.backends = list,
                Ok(_) => {}
                Err(err) => tracing::warn!("Ignoring QSCAN_BACKENDS: {err}"),
            }
        }
        if let Some(secs) = env_parse::<u64>("QSCAN_SUBPROCESS_TIMEOUT") {
            self.subprocess_timeout_secs = secs;
        }
        if let Some(secs) = env_parse::<u64>("QSCAN_READ_TIMEOUT") {
            self.read_timeout_secs = secs;
        }
        if let Some(quality) = env_parse::<u8>("QSCAN_QUALITY") {
            self.quality = quality;
        }
        if let Ok(path) = env::var("QSCAN_UTILITY_PATH") {
            self.utility_search_path = Some(env::split_paths(&path).collect());
        }
        if let Ok(dir) = env::var("QSCAN_SCRATCH_DIR") {
            self.scratch_dir = Some(PathBuf::from(dir));
        }
        if let Ok(dir) = env::var("QSCAN_REPLAY_DIR") {
            self.replay_dir = Some(PathBuf::from(dir));
        }
    }

    /// Still-capture utility timeout
    pub fn subprocess_timeout(&self) -> Duration {
        Duration::from_secs(self.subprocess_timeout_secs.max(1))
    }

    /// V4L2 buffer read timeout
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs.max(1))
    }
}

/// Scan loop tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    /// Consecutive capture failures before re-selecting a backend
    pub failure_threshold: u32,
    /// Pause after a failed capture, in milliseconds
    pub failure_backoff_ms: u64,
    /// Repeat suppression window, in milliseconds
    pub debounce_window_ms: u64,
    /// Probe captures per backend candidate during selection
    pub probe_attempts: u32,
    /// Pause between probe captures, in milliseconds
    pub probe_spacing_ms: u64,
    /// Capture in a separate task and drop frames the decoder cannot keep up with
    pub pipelined: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            failure_backoff_ms: 300,
            debounce_window_ms: 2_000,
            probe_attempts: 3,
            probe_spacing_ms: 100,
            pipelined: false,
        }
    }
}

impl ScanOptions {
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Some(threshold) = env_parse::<u32>("QSCAN_FAILURE_THRESHOLD") {
            self.failure_threshold = threshold;
        }
        if let Some(backoff) = env_parse::<u64>("QSCAN_FAILURE_BACKOFF_MS") {
            self.failure_backoff_ms = backoff;
        }
        if let Some(window) = env_parse::<u64>("QSCAN_DEBOUNCE_MS") {
            self.debounce_window_ms = window;
        }
        if let Some(attempts) = env_parse::<u32>("QSCAN_PROBE_ATTEMPTS") {
            self.probe_attempts = attempts;
        }
        if let Some(pipelined) = env_flag("QSCAN_PIPELINED") {
            self.pipelined = pipelined;
        }
    }

    /// Pause between probe captures
    pub fn probe_spacing(&self) -> Duration {
        Duration::from_millis(self.probe_spacing_ms)
    }
}

/// Structured logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingOptions {
    /// Default log level (overridable via `QSCAN_LOG_LEVEL`)
    pub level: String,
    /// Optional log file path for teeing structured logs
    pub file: Option<PathBuf>,
    /// Force ANSI colors in terminal logging
    pub color: bool,
    /// Enable periodic metrics summaries over tracing
    pub metrics: bool,
    /// Interval in seconds for emitting aggregated metrics when enabled
    pub metrics_interval_secs: u64,
    /// Optional log rotation strategy applied to `file`
    pub rotation: Option<LogRotation>,
    /// Optional bind address for exposing runtime metrics over HTTP (e.g., "127.0.0.1:9900")
    pub metrics_endpoint: Option<String>,
    /// Output format for the metrics endpoint (`json` or `prometheus`)
    pub metrics_format: MetricsFormat,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            color: true,
            metrics: false,
            metrics_interval_secs: 60,
            rotation: None,
            metrics_endpoint: None,
            metrics_format: MetricsFormat::Json,
        }
    }
}

impl LoggingOptions {
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Ok(level) = env::var("QSCAN_LOG_LEVEL") {
            self.level = level;
        }
        if let Ok(file) = env::var("QSCAN_LOG_FILE") {
            self.file = Some(PathBuf::from(file));
        }
        if let Some(color) = env_flag("QSCAN_LOG_COLOR") {
            self.color = color;
        }
        if let Some(metrics) = env_flag("QSCAN_LOG_METRICS") {
            self.metrics = metrics;
        }
        if let Some(interval) = env_parse::<u64>("QSCAN_LOG_METRICS_INTERVAL") {
            self.metrics_interval_secs = interval.max(5);
        }
        if let Ok(rotation) = env::var("QSCAN_LOG_ROTATION") {
            if let Some(parsed) = LogRotation::parse(&rotation) {
                self.rotation = Some(parsed);
            }
        }
        if let Ok(endpoint) = env::var("QSCAN_METRICS_ENDPOINT") {
            self.metrics_endpoint = Some(endpoint);
        }
        if let Ok(format) = env::var("QSCAN_METRICS_FORMAT") {
            if let Ok(parsed) = format.parse::<MetricsFormat>() {
                self.metrics_format = parsed;
            }
        }
    }
}

/// Supported log rotation policies for file sinks
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    /// Rotate log files once per hour
    Hourly,
    /// Rotate log files once per day
    Daily,
}

impl LogRotation {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "hourly" => Some(Self::Hourly),
            "daily" => Some(Self::Daily),
            _ => None,
        }
    }
}

/// Supported serialization formats for the metrics endpoint
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MetricsFormat {
    /// Emit metrics as structured JSON
    Json,
    /// Emit metrics in Prometheus text exposition format
    Prometheus,
}

impl MetricsFormat {
    /// Parse a metrics format identifier (case-insensitive) from a string slice.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "prometheus" => Some(Self::Prometheus),
            _ => None,
        }
    }
}

impl FromStr for MetricsFormat {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(value).ok_or_else(|| {
            format!("Unsupported metrics format '{value}', expected 'json' or 'prometheus'")
        })
    }
}

/// Report delivery
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputOptions {
    /// Print reports as JSON lines instead of human-readable blocks
    pub json: bool,
    /// Optional Unix domain socket path for streaming reports
    pub unix_socket: Option<PathBuf>,
}

impl OutputOptions {
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Some(json) = env_flag("QSCAN_OUTPUT_JSON") {
            self.json = json;
        }
        if let Ok(socket) = env::var("QSCAN_UNIX_SOCKET") {
            if socket.trim().is_empty() {
                self.unix_socket = None;
            } else {
                self.unix_socket = Some(PathBuf::from(socket));
            }
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    match env::var(key).ok()?.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

fn split_list(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_embedded_friendly() {
        let config = QscanConfig::default();
        config.validate().unwrap();

        let profiles = config.capture_profiles().unwrap();
        assert_eq!(profiles, vec![CaptureConfig::embedded(), CaptureConfig::compatible()]);
        assert_eq!(config.capture.backends, vec![BackendKind::V4l2, BackendKind::Subprocess]);

        let settings = config.loop_settings();
        assert_eq!(settings.failure_threshold, 10);
        assert_eq!(settings.failure_backoff, Duration::from_millis(300));
        assert_eq!(config.debounce_window(), Duration::from_secs(2));
    }

    #[test]
    fn test_toml_with_presets_and_custom_profile() {
        let config = QscanConfig::from_toml(
            r#"
            [camera]
            device_index = 2

            [capture]
            backends = ["subprocess", "v4l2"]
            quality = 60

            [[capture.profiles]]
            width = 1280
            height = 720
            fps = 5
            buffer_count = 2
            format = "yuyv"
            quality = 90
            device_index = 0

            [scan]
            debounce_window_ms = 500
            "#,
        )
        .unwrap();

        let profiles = config.capture_profiles().unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].width, 1280);
        assert_eq!(profiles[0].format, PixelFormat::Yuyv);
        assert_eq!(profiles[0].device_index, 2, "camera override wins");
        assert_eq!(profiles[0].quality, 60, "capture quality applies to every profile");
        assert_eq!(config.capture.backends[0], BackendKind::Subprocess);
        assert_eq!(config.debounce_window(), Duration::from_millis(500));
    }

    #[test]
    fn test_yaml_presets() {
        let config = QscanConfig::from_yaml(
            "capture:\n  profiles: [compatible]\ncamera:\n  fps: 0\n",
        )
        .unwrap();
        let profiles = config.capture_profiles().unwrap();
        assert_eq!(profiles[0].width, 640);
        assert_eq!(profiles[0].fps, 1, "fps is clamped to at least 1");
    }

    #[test]
    fn test_unknown_preset_and_format_rejected() {
        let mut config = QscanConfig::default();
        config.capture.profiles = vec![ProfileEntry::Preset("cinema".into())];
        assert!(matches!(config.capture_profiles(), Err(Error::Config(_))));

        let mut config = QscanConfig::default();
        config.camera.format = Some("h264".into());
        assert!(matches!(config.capture_profiles(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validation() {
        let mut config = QscanConfig::default();
        config.capture.backends = vec![BackendKind::Replay];
        assert!(config.validate().is_err(), "replay without a directory");
        config.capture.replay_dir = Some(PathBuf::from("/tmp/frames"));
        assert!(config.validate().is_ok());

        config.scan.failure_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_delays_rejected() {
        let mut config = QscanConfig::default();
        config.scan.failure_backoff_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("failure_backoff_ms"), "{err}");

        let mut config = QscanConfig::default();
        config.scan.probe_spacing_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("probe_spacing_ms"), "{err}");
    }

    #[test]
    fn test_from_file_rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qscan.ini");
        fs::write(&path, "[scan]").unwrap();
        assert!(matches!(QscanConfig::from_file(&path), Err(Error::Config(_))));
    }
}
