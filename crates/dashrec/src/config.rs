//! Configuration management for dashrec.
//!
//! Configuration is loaded with figment from defaults, an optional TOML file
//! and `DASHREC_` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::camera::BackendKind;
use crate::clip::EventType;
use crate::error::{Error, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "dashrec";

/// Default clip directory name inside the data directory.
const CLIPS_DIR_NAME: &str = "clips";

/// Environment variable prefix.
const ENV_PREFIX: &str = "DASHREC_";

/// 20 GiB.
const DEFAULT_MAX_STORAGE_BYTES: u64 = 20 * 1024 * 1024 * 1024;

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (`DASHREC_<SECTION>__<KEY>`)
/// 2. TOML config file at `~/.config/dashrec/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Camera configuration.
    pub camera: CameraConfig,
    /// Frame buffer configuration.
    pub buffer: BufferConfig,
    /// Clip output and quota configuration.
    pub clips: ClipsConfig,
    /// Pre/post-roll per event type.
    pub events: EventsConfig,
    /// Sensor link configuration.
    pub sensor: SensorConfig,
    /// Upload server configuration.
    pub upload: UploadConfig,
}

/// Camera configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Which backend to open.
    pub backend: BackendKind,
    /// V4L2 device node for the generic USB backend.
    pub device: PathBuf,
    /// Program streaming the native camera.
    pub native_command: String,
    /// ffmpeg binary used by the generic USB backend.
    pub ffmpeg_path: String,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Target frames per second.
    pub frame_rate: u32,
    /// How long a single capture may take before it counts as stalled.
    pub capture_timeout_ms: u64,
}

/// Frame buffer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Seconds of video kept in memory.
    pub duration_seconds: u32,
}

/// Clip output configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClipsConfig {
    /// Clip directory. Defaults to `~/.local/share/dashrec/clips`.
    pub directory: Option<PathBuf>,
    /// Disk quota for the clip directory.
    pub max_storage_bytes: u64,
    /// Eviction stops once usage is at or below this fraction of the quota.
    pub eviction_target_ratio: f64,
    /// Extractions allowed to run at once; later ones queue.
    pub max_concurrent_extractions: usize,
    /// How long shutdown waits for in-flight extractions.
    pub shutdown_grace_seconds: u64,
    /// ffmpeg binary used to encode clips.
    pub ffmpeg_path: String,
}

/// Pre- and post-roll for one event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipWindow {
    /// Seconds of footage before the event.
    pub seconds_before: u32,
    /// Seconds of footage after the event.
    pub seconds_after: u32,
}

impl ClipWindow {
    /// Create a window.
    #[must_use]
    pub const fn new(seconds_before: u32, seconds_after: u32) -> Self {
        Self {
            seconds_before,
            seconds_after,
        }
    }

    /// Total seconds covered.
    #[must_use]
    pub const fn total_seconds(&self) -> u32 {
        self.seconds_before.saturating_add(self.seconds_after)
    }
}

/// Clip windows per event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Harsh braking.
    pub harsh_braking: ClipWindow,
    /// Follow distance violation.
    pub follow_distance: ClipWindow,
    /// Speeding.
    pub speeding: ClipWindow,
    /// Manual trigger.
    pub manual: ClipWindow,
}

impl EventsConfig {
    /// The window configured for `event_type`.
    #[must_use]
    pub fn window(&self, event_type: EventType) -> ClipWindow {
        match event_type {
            EventType::HarshBraking => self.harsh_braking,
            EventType::FollowDistance => self.follow_distance,
            EventType::Speeding => self.speeding,
            EventType::Manual => self.manual,
        }
    }
}

/// Sensor link configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Read telemetry from the sensor link.
    pub enabled: bool,
    /// Serial device node. The line must already be configured (baud rate,
    /// raw mode), e.g. with `stty`.
    pub port: PathBuf,
}

/// Upload server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Register clips and events with the server.
    pub enabled: bool,
    /// Base URL, e.g. `http://192.168.1.10:3000`.
    pub server_url: Option<String>,
    /// Per-request timeout.
    pub timeout_seconds: u64,
    /// Forward every sensor record as a `sensor_data` event.
    pub forward_telemetry: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            device: PathBuf::from("/dev/video0"),
            native_command: "rpicam-vid".to_string(),
            ffmpeg_path: "ffmpeg".to_string(),
            width: 1280,
            height: 720,
            frame_rate: 30,
            capture_timeout_ms: 500,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            duration_seconds: 30,
        }
    }
}

impl Default for ClipsConfig {
    fn default() -> Self {
        Self {
            directory: None, // Resolved at runtime
            max_storage_bytes: DEFAULT_MAX_STORAGE_BYTES,
            eviction_target_ratio: 0.8,
            max_concurrent_extractions: 4,
            shutdown_grace_seconds: 15,
            ffmpeg_path: "ffmpeg".to_string(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            harsh_braking: ClipWindow::new(5, 5),
            follow_distance: ClipWindow::new(3, 3),
            speeding: ClipWindow::new(5, 5),
            manual: ClipWindow::new(5, 5),
        }
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: PathBuf::from("/dev/ttyUSB0"),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server_url: None,
            timeout_seconds: 10,
            forward_telemetry: true,
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading, parsing or validation fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading, parsing or validation fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        let camera = &self.camera;
        if camera.frame_rate == 0 {
            return Err(Error::config("camera.frame_rate must be greater than 0"));
        }
        if camera.width == 0 || camera.height == 0 {
            return Err(Error::config(format!(
                "camera dimensions must be non-zero (got {}x{})",
                camera.width, camera.height
            )));
        }
        if camera.capture_timeout_ms == 0 {
            return Err(Error::config(
                "camera.capture_timeout_ms must be greater than 0",
            ));
        }

        if self.buffer.duration_seconds == 0 {
            return Err(Error::config(
                "buffer.duration_seconds must be greater than 0",
            ));
        }

        let clips = &self.clips;
        if clips.max_storage_bytes == 0 {
            return Err(Error::config("clips.max_storage_bytes must be greater than 0"));
        }
        if !(clips.eviction_target_ratio > 0.0 && clips.eviction_target_ratio <= 1.0) {
            return Err(Error::config(format!(
                "clips.eviction_target_ratio must be in (0, 1] (got {})",
                clips.eviction_target_ratio
            )));
        }
        if clips.max_concurrent_extractions == 0 {
            return Err(Error::config(
                "clips.max_concurrent_extractions must be greater than 0",
            ));
        }

        for event_type in EventType::ALL {
            let window = self.events.window(event_type);
            // The oldest pre-roll frame must still be buffered once the
            // post-roll has elapsed.
            if window.total_seconds() > self.buffer.duration_seconds {
                return Err(Error::config(format!(
                    "events.{event_type} window ({}s before + {}s after) exceeds buffer.duration_seconds ({})",
                    window.seconds_before, window.seconds_after, self.buffer.duration_seconds
                )));
            }
        }

        if self.upload.enabled && self.upload.server_url.is_none() {
            return Err(Error::config(
                "upload.server_url is required when upload is enabled",
            ));
        }

        Ok(())
    }

    /// Get the clip directory, resolving defaults if not set.
    #[must_use]
    pub fn clips_dir(&self) -> PathBuf {
        self.clips
            .directory
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(CLIPS_DIR_NAME))
    }

    /// Frame buffer capacity in frames.
    #[must_use]
    pub fn buffer_capacity(&self) -> usize {
        self.buffer.duration_seconds as usize * self.camera.frame_rate as usize
    }

    /// Target spacing between captured frames.
    #[must_use]
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.camera.frame_rate.max(1)
    }

    /// Get the capture timeout as a Duration.
    #[must_use]
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.camera.capture_timeout_ms)
    }

    /// Get the shutdown grace period as a Duration.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.clips.shutdown_grace_seconds)
    }

    /// Get the upload timeout as a Duration.
    #[must_use]
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload.timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.camera.backend, BackendKind::Auto);
        assert_eq!(config.camera.frame_rate, 30);
        assert_eq!(config.buffer.duration_seconds, 30);
        assert!(config.sensor.enabled);
        assert!(!config.upload.enabled);
    }

    #[test]
    fn test_default_camera_config() {
        let camera = CameraConfig::default();

        assert_eq!(camera.device, PathBuf::from("/dev/video0"));
        assert_eq!(camera.native_command, "rpicam-vid");
        assert_eq!((camera.width, camera.height), (1280, 720));
        assert_eq!(camera.capture_timeout_ms, 500);
    }

    #[test]
    fn test_default_clips_config() {
        let clips = ClipsConfig::default();

        assert!(clips.directory.is_none());
        assert_eq!(clips.max_storage_bytes, 20 * 1024 * 1024 * 1024);
        assert!((clips.eviction_target_ratio - 0.8).abs() < f64::EPSILON);
        assert_eq!(clips.max_concurrent_extractions, 4);
    }

    #[test]
    fn test_default_event_windows() {
        let events = EventsConfig::default();

        assert_eq!(events.window(EventType::HarshBraking), ClipWindow::new(5, 5));
        assert_eq!(events.window(EventType::FollowDistance), ClipWindow::new(3, 3));
        assert_eq!(events.window(EventType::Speeding), ClipWindow::new(5, 5));
        assert_eq!(events.window(EventType::Manual), ClipWindow::new(5, 5));
        assert_eq!(events.harsh_braking.total_seconds(), 10);
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_zero_frame_rate() {
        let mut config = Config::default();
        config.camera.frame_rate = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("frame_rate"));
    }

    #[test]
    fn test_validate_zero_dimensions() {
        let mut config = Config::default();
        config.camera.height = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("1280x0"));
    }

    #[test]
    fn test_validate_zero_buffer_duration() {
        let mut config = Config::default();
        config.buffer.duration_seconds = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("duration_seconds"));
    }

    #[test]
    fn test_validate_eviction_ratio_bounds() {
        let mut config = Config::default();
        config.clips.eviction_target_ratio = 0.0;
        assert!(config.validate().is_err());

        config.clips.eviction_target_ratio = 1.5;
        assert!(config.validate().is_err());

        config.clips.eviction_target_ratio = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_pre_roll_longer_than_buffer() {
        let mut config = Config::default();
        config.events.speeding = ClipWindow::new(45, 5);

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("events.speeding"));
    }

    #[test]
    fn test_validate_window_longer_than_buffer() {
        let mut config = Config::default();
        // Pre-roll alone fits, but it is evicted while the post-roll runs.
        config.events.harsh_braking = ClipWindow::new(25, 10);
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("events.harsh_braking"));

        config.events.harsh_braking = ClipWindow::new(20, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_huge_post_roll_does_not_overflow() {
        let mut config = Config::default();
        config.events.manual = ClipWindow::new(5, u32::MAX);

        assert_eq!(config.events.manual.total_seconds(), u32::MAX);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_upload_requires_url() {
        let mut config = Config::default();
        config.upload.enabled = true;
        assert!(config.validate().is_err());

        config.upload.server_url = Some("http://127.0.0.1:3000".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_concurrency() {
        let mut config = Config::default();
        config.clips.max_concurrent_extractions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_clips_dir_default() {
        let config = Config::default();
        let path = config.clips_dir();
        assert!(path.ends_with("dashrec/clips"));
    }

    #[test]
    fn test_clips_dir_custom() {
        let mut config = Config::default();
        config.clips.directory = Some(PathBuf::from("/media/sd/clips"));
        assert_eq!(config.clips_dir(), PathBuf::from("/media/sd/clips"));
    }

    #[test]
    fn test_buffer_capacity() {
        let config = Config::default();
        assert_eq!(config.buffer_capacity(), 900);
    }

    #[test]
    fn test_durations() {
        let config = Config::default();
        assert_eq!(config.frame_interval(), Duration::from_secs(1) / 30);
        assert_eq!(config.capture_timeout(), Duration::from_millis(500));
        assert_eq!(config.shutdown_grace(), Duration::from_secs(15));
        assert_eq!(config.upload_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_default_config_path() {
        let path = Config::default_config_path();
        assert!(path.to_string_lossy().contains("dashrec"));
        assert!(path.to_string_lossy().contains("config.toml"));
    }

    #[test]
    fn test_load_nonexistent_config() {
        let config = Config::load_from(Some(PathBuf::from("/nonexistent/config.toml"))).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[camera]
backend = "generic_usb"
frame_rate = 15

[clips]
directory = "/tmp/dashrec-clips"
max_storage_bytes = 1000000

[events.follow_distance]
seconds_before = 4
seconds_after = 2
"#,
        )
        .unwrap();

        let config = Config::load_from(Some(path)).unwrap();
        assert_eq!(config.camera.backend, BackendKind::GenericUsb);
        assert_eq!(config.camera.frame_rate, 15);
        assert_eq!(config.camera.width, 1280);
        assert_eq!(config.clips_dir(), PathBuf::from("/tmp/dashrec-clips"));
        assert_eq!(config.clips.max_storage_bytes, 1_000_000);
        assert_eq!(config.events.follow_distance, ClipWindow::new(4, 2));
        assert_eq!(config.events.manual, ClipWindow::new(5, 5));
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[camera]\nframe_rate = 0\n").unwrap();

        let err = Config::load_from(Some(path)).unwrap_err();
        assert!(matches!(err, Error::ConfigValidation { .. }));
    }

    #[test]
    fn test_config_serialize_roundtrip_keys() {
        let json = serde_json::to_string(&Config::default()).unwrap();
        assert!(json.contains("max_storage_bytes"));
        assert!(json.contains("harsh_braking"));
        assert!(json.contains("\"backend\":\"auto\""));
    }
}
