//! Configuration management for the printlapse rig

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Session policy (interval, thresholds, printer coupling)
    #[serde(default)]
    pub timelapse: TimelapseConfig,

    /// Still camera driver
    #[serde(default)]
    pub camera: CameraConfig,

    /// Video encoder driver
    #[serde(default)]
    pub encoder: EncoderConfig,

    /// Indicator lights
    #[serde(default)]
    pub indicator: IndicatorConfig,

    /// Physical capture button
    #[serde(default)]
    pub button: ButtonConfig,

    /// Remote printer status polling
    #[serde(default)]
    pub printer: PrinterConfig,

    /// Remote operator command channel
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Periodic status reporting
    #[serde(default)]
    pub status: StatusConfig,

    /// Path to config file (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelapseConfig {
    /// Delay between captures while capturing (ms)
    #[serde(default = "default_capture_interval")]
    pub capture_interval_ms: u64,

    /// How often the orchestrator wakes up to check the capture schedule (ms)
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Consecutive capture failures before the session enters Error
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Start a session when the printer enters Printing
    #[serde(default = "default_true")]
    pub auto_start_on_print: bool,

    /// Pause/resume the session when the printer pauses/resumes
    #[serde(default = "default_true")]
    pub pause_with_printer: bool,

    /// Finalize the session when the printer leaves Printing
    #[serde(default = "default_true")]
    pub stop_with_printer: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Still capture program, writes one JPEG to stdout
    #[serde(default = "default_camera_program")]
    pub program: String,

    /// Arguments passed to the capture program
    #[serde(default = "default_camera_args")]
    pub args: Vec<String>,

    /// Upper bound for one capture (ms)
    #[serde(default = "default_capture_timeout")]
    pub capture_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Directory where per-session frames and videos are written
    #[serde(default = "default_output_directory_option")]
    pub output_directory: Option<PathBuf>,

    /// ffmpeg binary
    #[serde(default = "default_ffmpeg_program")]
    pub program: String,

    /// Playback frame rate of the finished timelapse
    #[serde(default = "default_fps")]
    pub fps: u32,

    /// Upper bound for stitching the video (ms)
    #[serde(default = "default_encode_timeout")]
    pub encode_timeout_ms: u64,

    /// Remove spooled frames once the video has been produced
    #[serde(default = "default_true")]
    pub delete_frames: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorConfig {
    /// Drive LEDs through sysfs GPIO; when false indicator changes are only logged
    #[serde(default)]
    pub gpio_enabled: bool,

    #[serde(default = "default_red_pin")]
    pub red_pin: u32,

    #[serde(default = "default_yellow_pin")]
    pub yellow_pin: u32,

    #[serde(default = "default_green_pin")]
    pub green_pin: u32,
}

/// Which backend delivers button edges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ButtonBackendKind {
    /// No physical button
    None,
    /// Linux input device (gpio-keys)
    Evdev,
    /// Keyboard key (development machines)
    Keyboard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ButtonConfig {
    #[serde(default = "default_button_backend")]
    pub backend: ButtonBackendKind,

    /// Input device for the evdev backend
    #[serde(default = "default_button_device")]
    pub device: PathBuf,

    /// Key code reported by the device (evdev) for the button
    #[serde(default = "default_button_key_code")]
    pub key_code: u16,

    /// Keyboard key name for the keyboard backend (e.g. "F9")
    #[serde(default = "default_button_key_name")]
    pub key_name: String,

    /// Minimum spacing between accepted edges (ms)
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterConfig {
    /// Status endpoint; polling is disabled when unset
    pub status_url: Option<String>,

    /// JSON pointer to the printer state string in the response
    #[serde(default = "default_state_pointer")]
    pub state_pointer: String,

    #[serde(default = "default_printer_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_printer_timeout")]
    pub request_timeout_ms: u64,

    /// Consecutive unreachable polls before the printer is reported Offline
    #[serde(default = "default_offline_after_polls")]
    pub offline_after_polls: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Listen address for the operator command channel; disabled when unset
    #[serde(default = "default_remote_listen")]
    pub listen: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    #[serde(default = "default_status_interval")]
    pub interval_ms: u64,

    /// Endpoint receiving JSON status reports
    pub endpoint: Option<String>,

    /// Linux IIO device directory of the temperature/humidity sensor
    pub sensor_path: Option<PathBuf>,

    /// Attach a downscaled JPEG of the latest frame to each report
    #[serde(default = "default_true")]
    pub include_preview: bool,

    /// Longest edge of the preview thumbnail (px)
    #[serde(default = "default_preview_size")]
    pub preview_size: u32,

    #[serde(default = "default_status_timeout")]
    pub request_timeout_ms: u64,
}

// Default value functions
fn default_capture_interval() -> u64 {
    10_000
}

fn default_tick_interval() -> u64 {
    250
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

fn default_camera_program() -> String {
    "rpicam-still".to_string()
}

fn default_camera_args() -> Vec<String> {
    ["--nopreview", "--immediate", "--encoding", "jpg", "-o", "-"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_capture_timeout() -> u64 {
    8_000
}

fn default_output_directory() -> PathBuf {
    std::env::temp_dir().join("printlapse-timelapses")
}

fn default_output_directory_option() -> Option<PathBuf> {
    Some(default_output_directory())
}

fn default_ffmpeg_program() -> String {
    "ffmpeg".to_string()
}

fn default_fps() -> u32 {
    24
}

fn default_encode_timeout() -> u64 {
    10 * 60 * 1000
}

fn default_red_pin() -> u32 {
    17
}

fn default_yellow_pin() -> u32 {
    23
}

fn default_green_pin() -> u32 {
    27
}

fn default_button_backend() -> ButtonBackendKind {
    ButtonBackendKind::None
}

fn default_button_device() -> PathBuf {
    PathBuf::from("/dev/input/by-path/platform-button@16-event")
}

fn default_button_key_code() -> u16 {
    // KEY_RECORD, the gpio-keys convention for a capture switch
    167
}

fn default_button_key_name() -> String {
    "F9".to_string()
}

fn default_debounce() -> u64 {
    50
}

fn default_state_pointer() -> String {
    "/result/status/print_stats/state".to_string()
}

fn default_printer_poll_interval() -> u64 {
    2_000
}

fn default_printer_timeout() -> u64 {
    3_000
}

fn default_offline_after_polls() -> u32 {
    3
}

fn default_remote_listen() -> Option<String> {
    Some("127.0.0.1:7878".to_string())
}

fn default_status_interval() -> u64 {
    30_000
}

fn default_preview_size() -> u32 {
    320
}

fn default_status_timeout() -> u64 {
    10_000
}

impl Default for TimelapseConfig {
    fn default() -> Self {
        Self {
            capture_interval_ms: default_capture_interval(),
            tick_interval_ms: default_tick_interval(),
            failure_threshold: default_failure_threshold(),
            auto_start_on_print: true,
            pause_with_printer: true,
            stop_with_printer: true,
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            program: default_camera_program(),
            args: default_camera_args(),
            capture_timeout_ms: default_capture_timeout(),
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            output_directory: Some(default_output_directory()),
            program: default_ffmpeg_program(),
            fps: default_fps(),
            encode_timeout_ms: default_encode_timeout(),
            delete_frames: true,
        }
    }
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            gpio_enabled: false,
            red_pin: default_red_pin(),
            yellow_pin: default_yellow_pin(),
            green_pin: default_green_pin(),
        }
    }
}

impl Default for ButtonConfig {
    fn default() -> Self {
        Self {
            backend: default_button_backend(),
            device: default_button_device(),
            key_code: default_button_key_code(),
            key_name: default_button_key_name(),
            debounce_ms: default_debounce(),
        }
    }
}

impl Default for PrinterConfig {
    fn default() -> Self {
        Self {
            status_url: None,
            state_pointer: default_state_pointer(),
            poll_interval_ms: default_printer_poll_interval(),
            request_timeout_ms: default_printer_timeout(),
            offline_after_polls: default_offline_after_polls(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            listen: default_remote_listen(),
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_status_interval(),
            endpoint: None,
            sensor_path: None,
            include_preview: true,
            preview_size: default_preview_size(),
            request_timeout_ms: default_status_timeout(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timelapse: TimelapseConfig::default(),
            camera: CameraConfig::default(),
            encoder: EncoderConfig::default(),
            indicator: IndicatorConfig::default(),
            button: ButtonConfig::default(),
            printer: PrinterConfig::default(),
            remote: RemoteConfig::default(),
            status: StatusConfig::default(),
            config_path: None,
        }
    }
}

impl Config {
    /// Load configuration from default location or create default
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_config_path()?)
    }

    /// Load configuration from an explicit path, writing defaults there if missing
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let mut config = if config_path.exists() {
            let contents = std::fs::read_to_string(config_path)
                .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

            toml::from_str::<Config>(&contents)
                .with_context(|| format!("Failed to parse config file: {:?}", config_path))?
        } else {
            let mut config = Config::default();
            config.config_path = Some(config_path.to_path_buf());
            config.save()?;
            config
        };

        config.config_path = Some(config_path.to_path_buf());
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = self.config_path()?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        Ok(())
    }

    /// Get the config file path
    pub fn config_path(&self) -> Result<PathBuf> {
        match &self.config_path {
            Some(path) => Ok(path.clone()),
            None => Self::default_config_path(),
        }
    }

    /// Get default config path
    fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("dev", "printlapse", "rig")
            .context("Failed to determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    /// Reject values the orchestrator cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.timelapse.capture_interval_ms == 0 {
            bail!("timelapse.capture_interval_ms must be greater than zero");
        }
        if self.timelapse.tick_interval_ms == 0 {
            bail!("timelapse.tick_interval_ms must be greater than zero");
        }
        if self.timelapse.failure_threshold == 0 {
            bail!("timelapse.failure_threshold must be greater than zero");
        }
        if self.printer.offline_after_polls == 0 {
            bail!("printer.offline_after_polls must be greater than zero");
        }
        if self.encoder.fps == 0 {
            bail!("encoder.fps must be greater than zero");
        }
        Ok(())
    }

    /// Directory receiving per-session output
    pub fn output_directory(&self) -> PathBuf {
        self.encoder
            .output_directory
            .clone()
            .unwrap_or_else(default_output_directory)
    }

    pub fn capture_interval(&self) -> Duration {
        Duration::from_millis(self.timelapse.capture_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.timelapse.tick_interval_ms)
    }
}
