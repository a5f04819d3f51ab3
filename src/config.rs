use crate::error::ConfigError;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Plain operator variables honored on top of the file and `VISAGE_*` environment
const OPERATOR_ENV: [(&str, &str); 6] = [
    ("VIDEO_WIDTH", "camera.width"),
    ("VIDEO_HEIGHT", "camera.height"),
    ("TARGET_FPS", "camera.target_fps"),
    ("MOTION_THRESHOLD", "motion.threshold"),
    ("MOTION_SENSITIVITY", "motion.sensitivity"),
    ("MOTION_CHECK_INTERVAL", "motion.check_interval"),
];

const MIN_DIMENSION: i64 = 16;
const MAX_DIMENSION: i64 = 8192;
const MAX_FPS: i64 = 120;
const MAX_CHECK_INTERVAL: i64 = 1000;
const MAX_WARMUP_FRAMES: i64 = 100_000;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct VisageConfig {
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub motion: MotionConfig,
    #[serde(default)]
    pub face: FaceConfig,
    #[serde(default)]
    pub events: EventConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub system: SystemConfig,
}

/// Which frame source implementation to open
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Generated test pattern, needs no hardware
    Synthetic,
    /// V4L2 device through GStreamer (requires the `camera` feature)
    V4l2,
}

/// Which face detector implementation to load
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FaceBackend {
    /// Haar cascade evaluated in-process
    Native,
    /// OpenCV `CascadeClassifier` (requires the `opencv` feature)
    Opencv,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CameraConfig {
    /// Frame source implementation
    #[serde(default = "default_camera_source")]
    pub source: SourceKind,

    /// Camera device index (e.g., 0 for /dev/video0)
    #[serde(default)]
    pub device_index: u32,

    /// Capture width in pixels
    #[serde(default = "default_width")]
    pub width: u32,

    /// Capture height in pixels
    #[serde(default = "default_height")]
    pub height: u32,

    /// Target capture loop rate
    #[serde(default = "default_target_fps")]
    pub target_fps: u32,

    /// Upper bound on a single frame read
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MotionConfig {
    /// Motion detection enabled at startup
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Aggregate foreground area (full-frame pixels) that counts as motion
    #[serde(default = "default_motion_threshold")]
    pub threshold: u64,

    /// Background learning speed, 1 (slow) to 100 (fast)
    #[serde(default = "default_motion_sensitivity")]
    pub sensitivity: u32,

    /// Evaluate the foreground mask every Nth frame
    #[serde(default = "default_motion_check_interval")]
    pub check_interval: u32,

    /// Downscale factor applied before analysis (1 = full resolution)
    #[serde(default = "default_analysis_scale")]
    pub analysis_scale: u32,

    /// Squared deviation, in units of variance, that marks a pixel as foreground
    #[serde(default = "default_deviation_threshold")]
    pub deviation_threshold: f32,

    /// Variance floor so a perfectly still scene does not become hypersensitive
    #[serde(default = "default_min_variance")]
    pub min_variance: f32,

    /// Connected regions smaller than this (full-frame pixels) are noise
    #[serde(default = "default_min_region_area")]
    pub min_region_area: u32,

    /// Gaussian blur sigma applied before analysis, 0 disables it
    #[serde(default = "default_blur_sigma")]
    pub blur_sigma: f32,

    /// Keep learning the background while detection is disabled
    #[serde(default = "default_true")]
    pub update_background_when_disabled: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FaceConfig {
    /// Run face detection on motion regions
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Detection backend
    #[serde(default = "default_face_backend")]
    pub backend: FaceBackend,

    /// Pretrained OpenCV Haar cascade (XML)
    #[serde(default = "default_face_cascade_path")]
    pub cascade_path: String,

    /// Smallest face edge in pixels
    #[serde(default = "default_face_min_size")]
    pub min_size: u32,

    /// Window growth between pyramid levels
    #[serde(default = "default_face_scale_factor")]
    pub scale_factor: f32,

    /// Overlapping raw hits needed to accept a face
    #[serde(default = "default_face_min_neighbors")]
    pub min_neighbors: u32,

    /// Padding around motion regions when scanning for faces
    #[serde(default = "default_face_roi_padding")]
    pub roi_padding: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EventConfig {
    /// Minimum quiet time before a new motion start is reported
    #[serde(default = "default_motion_cooldown_ms")]
    pub motion_cooldown_ms: u64,

    /// Faces seen again within this window are treated as the same appearance
    #[serde(default = "default_face_coalesce_window_ms")]
    pub face_coalesce_window_ms: u64,

    /// Maximum centre distance (pixels) between coalesced faces
    #[serde(default = "default_face_coalesce_distance")]
    pub face_coalesce_distance: f32,

    /// Frames after each (re)open during which motion is ignored
    #[serde(default = "default_warmup_frames")]
    pub warmup_frames: u32,

    /// Event bus capacity
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CaptureConfig {
    /// Base path for snapshots and event records
    #[serde(default = "default_capture_path")]
    pub path: String,

    /// Write an annotated snapshot for each qualifying event
    #[serde(default = "default_true")]
    pub save_snapshots: bool,

    /// Persist event records as JSON
    #[serde(default = "default_true")]
    pub persist_events: bool,

    /// JPEG quality for snapshots
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    /// Enable timestamp overlay on snapshots
    #[serde(default)]
    pub timestamp_overlay: bool,

    /// Path to TrueType font file for timestamp overlay
    #[serde(default = "default_timestamp_font_path")]
    pub timestamp_font_path: String,

    /// Font size for timestamp overlay
    #[serde(default = "default_timestamp_font_size")]
    pub timestamp_font_size: f32,

    /// IANA timezone used for overlay text
    #[serde(default = "default_timestamp_timezone")]
    pub timestamp_timezone: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StreamConfig {
    /// Serve the HTTP interface
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// IP address to bind to
    #[serde(default = "default_stream_ip")]
    pub ip: String,

    /// Port to listen on
    #[serde(default = "default_stream_port")]
    pub port: u16,

    /// Maximum frames per second sent to each viewer
    #[serde(default = "default_stream_fps")]
    pub fps: u32,

    /// JPEG quality for streamed frames
    #[serde(default = "default_stream_jpeg_quality")]
    pub jpeg_quality: u8,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RecoveryConfig {
    /// Consecutive read failures tolerated before the source is reopened
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Reopen attempts before the loop gives up (0 = never give up)
    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,

    /// Base delay for reopen backoff
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum delay between reopen attempts
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Whether to use exponential backoff
    #[serde(default = "default_true")]
    pub exponential_backoff: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SystemConfig {
    /// Per-component stop timeout
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Longest on-demand recording accepted
    #[serde(default = "default_max_recording_secs")]
    pub max_recording_secs: u64,
}

impl VisageConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("visage.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let mut builder = Config::builder()
            // Start with default values
            .add_source(Config::try_from(&VisageConfig::default())?)
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // Add environment variables with VISAGE_ prefix, e.g. VISAGE_STREAM__PORT
            .add_source(
                Environment::with_prefix("VISAGE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        for (var, key) in OPERATOR_ENV {
            builder = builder.set_override_option(key, std::env::var(var).ok())?;
        }

        let config: VisageConfig = builder.build()?.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Runtime-adjustable subset used by the capture loop
    pub fn runtime(&self) -> RuntimeConfig {
        RuntimeConfig {
            width: self.camera.width,
            height: self.camera.height,
            target_fps: self.camera.target_fps,
            motion_threshold: self.motion.threshold,
            motion_sensitivity: self.motion.sensitivity,
            motion_check_interval: self.motion.check_interval,
            motion_enabled: self.motion.enabled,
            motion_cooldown_ms: self.events.motion_cooldown_ms,
            face_coalesce_window_ms: self.events.face_coalesce_window_ms,
            face_coalesce_distance: self.events.face_coalesce_distance,
            warmup_frames: self.events.warmup_frames,
            update_background_when_disabled: self.motion.update_background_when_disabled,
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.runtime().validate()?;

        if self.camera.read_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "camera.read_timeout_ms",
                "must be greater than 0",
            ));
        }

        if !(1..=8).contains(&self.motion.analysis_scale) {
            return Err(ConfigError::invalid(
                "motion.analysis_scale",
                "must be between 1 and 8",
            ));
        }

        if !(self.motion.deviation_threshold.is_finite() && self.motion.deviation_threshold > 0.0)
        {
            return Err(ConfigError::invalid(
                "motion.deviation_threshold",
                "must be a positive number",
            ));
        }

        if !(self.motion.min_variance.is_finite() && self.motion.min_variance > 0.0) {
            return Err(ConfigError::invalid(
                "motion.min_variance",
                "must be a positive number",
            ));
        }

        if !(self.motion.blur_sigma.is_finite() && self.motion.blur_sigma >= 0.0) {
            return Err(ConfigError::invalid(
                "motion.blur_sigma",
                "must be zero or positive",
            ));
        }

        if self.face.min_size < 8 {
            return Err(ConfigError::invalid("face.min_size", "must be at least 8"));
        }

        if !(self.face.scale_factor.is_finite() && self.face.scale_factor > 1.0) {
            return Err(ConfigError::invalid(
                "face.scale_factor",
                "must be greater than 1.0",
            ));
        }

        if self.face.min_neighbors == 0 {
            return Err(ConfigError::invalid(
                "face.min_neighbors",
                "must be greater than 0",
            ));
        }

        if self.events.bus_capacity == 0 {
            return Err(ConfigError::invalid(
                "events.bus_capacity",
                "must be greater than 0",
            ));
        }

        for (field, quality) in [
            ("capture.jpeg_quality", self.capture.jpeg_quality),
            ("stream.jpeg_quality", self.stream.jpeg_quality),
        ] {
            if !(1..=100).contains(&quality) {
                return Err(ConfigError::invalid(field, "must be between 1 and 100"));
            }
        }

        if self.stream.fps == 0 {
            return Err(ConfigError::invalid("stream.fps", "must be greater than 0"));
        }

        if self.recovery.max_consecutive_failures == 0 {
            return Err(ConfigError::invalid(
                "recovery.max_consecutive_failures",
                "must be greater than 0",
            ));
        }

        if self.recovery.base_delay_ms == 0
            || self.recovery.max_delay_ms < self.recovery.base_delay_ms
        {
            return Err(ConfigError::invalid(
                "recovery.max_delay_ms",
                "delays must be positive and max_delay_ms >= base_delay_ms",
            ));
        }

        if self.system.max_recording_secs == 0 {
            return Err(ConfigError::invalid(
                "system.max_recording_secs",
                "must be greater than 0",
            ));
        }

        Ok(())
    }
}

/// Parameters the capture loop re-reads at every cycle boundary.
///
/// Only ever replaced as a whole: see [`RuntimeConfig::apply`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
    pub motion_threshold: u64,
    pub motion_sensitivity: u32,
    pub motion_check_interval: u32,
    pub motion_enabled: bool,
    pub motion_cooldown_ms: u64,
    pub face_coalesce_window_ms: u64,
    pub face_coalesce_distance: f32,
    pub warmup_frames: u32,
    pub update_background_when_disabled: bool,
}

/// A partial runtime configuration change, as received from a controller.
///
/// Numeric fields are signed so out-of-range requests reach validation
/// instead of failing to parse.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfigDelta {
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub target_fps: Option<i64>,
    pub motion_threshold: Option<i64>,
    pub motion_sensitivity: Option<i64>,
    pub motion_check_interval: Option<i64>,
    pub motion_enabled: Option<bool>,
    pub motion_cooldown_ms: Option<i64>,
    pub face_coalesce_window_ms: Option<i64>,
    pub face_coalesce_distance: Option<f32>,
    pub warmup_frames: Option<i64>,
    pub update_background_when_disabled: Option<bool>,
}

impl RuntimeConfigDelta {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl RuntimeConfig {
    /// Time available for one capture cycle
    pub fn frame_budget(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.target_fps.max(1) as u64)
    }

    /// Background model learning coefficient in [0.001, 0.1]
    pub fn learning_rate(&self) -> f32 {
        self.motion_sensitivity.clamp(1, 100) as f32 / 1000.0
    }

    pub fn motion_cooldown(&self) -> Duration {
        Duration::from_millis(self.motion_cooldown_ms)
    }

    pub fn face_coalesce_window(&self) -> Duration {
        Duration::from_millis(self.face_coalesce_window_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        in_range("width", self.width as i64, MIN_DIMENSION, MAX_DIMENSION)?;
        in_range("height", self.height as i64, MIN_DIMENSION, MAX_DIMENSION)?;
        in_range("target_fps", self.target_fps as i64, 1, MAX_FPS)?;
        in_range("motion_sensitivity", self.motion_sensitivity as i64, 1, 100)?;
        in_range(
            "motion_check_interval",
            self.motion_check_interval as i64,
            1,
            MAX_CHECK_INTERVAL,
        )?;
        in_range("warmup_frames", self.warmup_frames as i64, 0, MAX_WARMUP_FRAMES)?;
        if !(self.face_coalesce_distance.is_finite() && self.face_coalesce_distance >= 0.0) {
            return Err(ConfigError::invalid(
                "face_coalesce_distance",
                "must be zero or a positive number",
            ));
        }
        Ok(())
    }

    /// Merge a delta into a copy of this configuration and validate the result.
    ///
    /// `self` is left untouched on error.
    pub fn apply(&self, delta: &RuntimeConfigDelta) -> Result<RuntimeConfig, ConfigError> {
        let mut next = self.clone();

        if let Some(v) = delta.width {
            next.width = in_range("width", v, MIN_DIMENSION, MAX_DIMENSION)? as u32;
        }
        if let Some(v) = delta.height {
            next.height = in_range("height", v, MIN_DIMENSION, MAX_DIMENSION)? as u32;
        }
        if let Some(v) = delta.target_fps {
            next.target_fps = in_range("target_fps", v, 1, MAX_FPS)? as u32;
        }
        if let Some(v) = delta.motion_threshold {
            next.motion_threshold = in_range("motion_threshold", v, 0, i64::MAX)? as u64;
        }
        if let Some(v) = delta.motion_sensitivity {
            next.motion_sensitivity = in_range("motion_sensitivity", v, 1, 100)? as u32;
        }
        if let Some(v) = delta.motion_check_interval {
            next.motion_check_interval =
                in_range("motion_check_interval", v, 1, MAX_CHECK_INTERVAL)? as u32;
        }
        if let Some(v) = delta.motion_enabled {
            next.motion_enabled = v;
        }
        if let Some(v) = delta.motion_cooldown_ms {
            next.motion_cooldown_ms = in_range("motion_cooldown_ms", v, 0, i64::MAX)? as u64;
        }
        if let Some(v) = delta.face_coalesce_window_ms {
            next.face_coalesce_window_ms =
                in_range("face_coalesce_window_ms", v, 0, i64::MAX)? as u64;
        }
        if let Some(v) = delta.face_coalesce_distance {
            next.face_coalesce_distance = v;
        }
        if let Some(v) = delta.warmup_frames {
            next.warmup_frames = in_range("warmup_frames", v, 0, MAX_WARMUP_FRAMES)? as u32;
        }
        if let Some(v) = delta.update_background_when_disabled {
            next.update_background_when_disabled = v;
        }

        next.validate()?;
        Ok(next)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        VisageConfig::default().runtime()
    }
}

fn in_range(field: &str, value: i64, min: i64, max: i64) -> Result<i64, ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::invalid(
            field,
            format!("{} is outside {}..={}", value, min, max),
        ));
    }
    Ok(value)
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source: default_camera_source(),
            device_index: 0,
            width: default_width(),
            height: default_height(),
            target_fps: default_target_fps(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_motion_threshold(),
            sensitivity: default_motion_sensitivity(),
            check_interval: default_motion_check_interval(),
            analysis_scale: default_analysis_scale(),
            deviation_threshold: default_deviation_threshold(),
            min_variance: default_min_variance(),
            min_region_area: default_min_region_area(),
            blur_sigma: default_blur_sigma(),
            update_background_when_disabled: true,
        }
    }
}

impl Default for FaceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: default_face_backend(),
            cascade_path: default_face_cascade_path(),
            min_size: default_face_min_size(),
            scale_factor: default_face_scale_factor(),
            min_neighbors: default_face_min_neighbors(),
            roi_padding: default_face_roi_padding(),
        }
    }
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            motion_cooldown_ms: default_motion_cooldown_ms(),
            face_coalesce_window_ms: default_face_coalesce_window_ms(),
            face_coalesce_distance: default_face_coalesce_distance(),
            warmup_frames: default_warmup_frames(),
            bus_capacity: default_bus_capacity(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            path: default_capture_path(),
            save_snapshots: true,
            persist_events: true,
            jpeg_quality: default_jpeg_quality(),
            timestamp_overlay: false,
            timestamp_font_path: default_timestamp_font_path(),
            timestamp_font_size: default_timestamp_font_size(),
            timestamp_timezone: default_timestamp_timezone(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ip: default_stream_ip(),
            port: default_stream_port(),
            fps: default_stream_fps(),
            jpeg_quality: default_stream_jpeg_quality(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: default_max_consecutive_failures(),
            max_recovery_attempts: default_max_recovery_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            exponential_backoff: true,
        }
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            max_recording_secs: default_max_recording_secs(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_camera_source() -> SourceKind {
    SourceKind::Synthetic
}
fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    480
}
fn default_target_fps() -> u32 {
    15
}
fn default_read_timeout_ms() -> u64 {
    1000
}

fn default_motion_threshold() -> u64 {
    5000
}
fn default_motion_sensitivity() -> u32 {
    50
}
fn default_motion_check_interval() -> u32 {
    3
}
fn default_analysis_scale() -> u32 {
    2
}
fn default_deviation_threshold() -> f32 {
    16.0
}
fn default_min_variance() -> f32 {
    25.0
}
fn default_min_region_area() -> u32 {
    200
}
fn default_blur_sigma() -> f32 {
    1.0
}

fn default_face_backend() -> FaceBackend {
    FaceBackend::Native
}

fn default_face_cascade_path() -> String {
    "/usr/share/opencv4/haarcascades/haarcascade_frontalface_default.xml".to_string()
}

fn default_face_min_size() -> u32 {
    48
}
fn default_face_scale_factor() -> f32 {
    1.25
}
fn default_face_min_neighbors() -> u32 {
    2
}
fn default_face_roi_padding() -> u32 {
    32
}

fn default_motion_cooldown_ms() -> u64 {
    3000
}
fn default_face_coalesce_window_ms() -> u64 {
    10_000
}
fn default_face_coalesce_distance() -> f32 {
    80.0
}
fn default_warmup_frames() -> u32 {
    30
}
fn default_bus_capacity() -> usize {
    100
}

fn default_capture_path() -> String {
    "./captures".to_string()
}
fn default_jpeg_quality() -> u8 {
    90
}
fn default_timestamp_font_path() -> String {
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf".to_string()
}
fn default_timestamp_font_size() -> f32 {
    20.0
}
fn default_timestamp_timezone() -> String {
    "UTC".to_string()
}

fn default_stream_ip() -> String {
    "0.0.0.0".to_string()
}
fn default_stream_port() -> u16 {
    5000
}
fn default_stream_fps() -> u32 {
    15
}
fn default_stream_jpeg_quality() -> u8 {
    85
}

fn default_max_consecutive_failures() -> u32 {
    5
}
fn default_max_recovery_attempts() -> u32 {
    10
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}
fn default_max_recording_secs() -> u64 {
    120
}
