//! Configuration management for the frame streamer

use crate::capture::{default_device, detect_platform, CaptureConfig, RestartPolicy};
use crate::format::{FrameGeometry, PixelFormat};
use crate::server::ServerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Complete frame streamer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub camera: CameraConfig,

    #[serde(default)]
    pub display: DisplayConfig,

    #[serde(default)]
    pub server: NetworkConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Statistics reporting interval (seconds, 0 = off)
    #[serde(default = "default_stats_interval")]
    pub stats_interval_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera: CameraConfig::default(),
            display: DisplayConfig::default(),
            server: NetworkConfig::default(),
            supervisor: SupervisorConfig::default(),
            stats_interval_seconds: default_stats_interval(),
        }
    }
}

/// Which camera backend to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DriverKind {
    /// Built-in scrolling colour bars
    #[default]
    TestPattern,
    /// GStreamer appsink pipeline (feature `gst`)
    Gstreamer,
    /// Direct V4L2 capture (feature `v4l2`)
    V4l2,
}

/// Camera and buffer pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    #[serde(default)]
    pub driver: DriverKind,

    /// Camera device
    /// - Linux: "/dev/video0"
    /// - macOS: "0" for first webcam
    /// - Raspberry Pi with libcamera: the sensor name
    #[serde(default = "default_device_path")]
    pub device: String,

    /// Frame width in pixels
    #[serde(default = "default_width")]
    pub width: u32,

    /// Frame height in pixels
    #[serde(default = "default_height")]
    pub height: u32,

    /// Pixel format, e.g. "BGR565", "RGB565", "YUYV"
    #[serde(default = "default_pixel_format")]
    pub pixel_format: PixelFormat,

    /// Frames per second
    #[serde(default = "default_fps")]
    pub fps: u32,

    /// Frame buffers in the pool (at least 3)
    #[serde(default = "default_buffer_count")]
    pub buffer_count: usize,

    /// Buffer start alignment in bytes (power of two)
    #[serde(default = "default_buffer_alignment")]
    pub buffer_alignment: usize,

    /// Longest wait for a frame before capture is considered dead
    #[serde(default = "default_dequeue_timeout_ms")]
    pub dequeue_timeout_ms: u64,

    /// Kernel-side buffers for the V4L2 backend
    #[serde(default = "default_kernel_buffers")]
    pub kernel_buffers: u32,

    /// Flip method (optional, GStreamer backend only)
    /// - "vertical-flip"
    /// - "horizontal-flip"
    /// - "rotate-180"
    /// - "rotate-90"
    /// - "rotate-270"
    #[serde(default)]
    pub flip_method: Option<String>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            driver: DriverKind::default(),
            device: default_device_path(),
            width: default_width(),
            height: default_height(),
            pixel_format: default_pixel_format(),
            fps: default_fps(),
            buffer_count: default_buffer_count(),
            buffer_alignment: default_buffer_alignment(),
            dequeue_timeout_ms: default_dequeue_timeout_ms(),
            kernel_buffers: default_kernel_buffers(),
            flip_method: None,
        }
    }
}

impl CameraConfig {
    pub fn geometry(&self) -> Result<FrameGeometry, ConfigError> {
        FrameGeometry::new(self.width, self.height, self.pixel_format)
            .map_err(|e| ConfigError::Invalid(format!("camera: {}", e)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DisplayKind {
    /// Frames are not mirrored locally
    #[default]
    None,
    /// Every n-th frame is written to a PPM file
    Snapshot,
}

/// Local display mirroring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    #[serde(default)]
    pub kind: DisplayKind,

    #[serde(default = "default_snapshot_path")]
    pub path: PathBuf,

    #[serde(default = "default_every_n_frames")]
    pub every_n_frames: u64,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            kind: DisplayKind::default(),
            path: default_snapshot_path(),
            every_n_frames: default_every_n_frames(),
        }
    }
}

/// TCP frame server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Listen port (0 = auto-assign)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Resend the current frame when capture has not published a newer one
    #[serde(default = "default_true")]
    pub repeat_frames: bool,

    /// How long a client waits for a frame before it gets the error marker
    #[serde(default = "default_frame_wait_timeout_ms")]
    pub frame_wait_timeout_ms: u64,

    /// Pause after a failed accept
    #[serde(default = "default_accept_backoff_ms")]
    pub accept_backoff_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            repeat_frames: true,
            frame_wait_timeout_ms: default_frame_wait_timeout_ms(),
            accept_backoff_ms: default_accept_backoff_ms(),
        }
    }
}

/// Capture restart behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Consecutive failed capture attempts tolerated (0 = never restart)
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

// Default value functions
fn default_stats_interval() -> u64 {
    10
}
fn default_device_path() -> String {
    default_device(detect_platform())
}
fn default_width() -> u32 {
    240
}
fn default_height() -> u32 {
    240
}
fn default_pixel_format() -> PixelFormat {
    PixelFormat::Bgr565
}
fn default_fps() -> u32 {
    30
}
fn default_buffer_count() -> usize {
    4
}
fn default_buffer_alignment() -> usize {
    64
}
fn default_dequeue_timeout_ms() -> u64 {
    20_000
}
fn default_kernel_buffers() -> u32 {
    4
}
fn default_snapshot_path() -> PathBuf {
    PathBuf::from("snapshot.ppm")
}
fn default_every_n_frames() -> u64 {
    30
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    5000
}
fn default_true() -> bool {
    true
}
fn default_frame_wait_timeout_ms() -> u64 {
    5_000
}
fn default_accept_backoff_ms() -> u64 {
    100
}
fn default_max_restarts() -> u32 {
    5
}
fn default_initial_backoff_ms() -> u64 {
    1_000
}
fn default_max_backoff_ms() -> u64 {
    30_000
}

const FLIP_METHODS: [&str; 5] = [
    "vertical-flip",
    "horizontal-flip",
    "rotate-180",
    "rotate-90",
    "rotate-270",
];

/// Longest timeout or backoff accepted from a config file: one hour
const MAX_DURATION_MS: u64 = 3_600_000;

fn check_duration_ms(name: &str, value: u64) -> Result<(), ConfigError> {
    if value > MAX_DURATION_MS {
        return Err(ConfigError::Invalid(format!(
            "{} must be at most {} ms, got {}",
            name, MAX_DURATION_MS, value
        )));
    }
    Ok(())
}

impl Config {
    /// Loads configuration from TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Loads configuration from TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_camera(&self.camera)?;

        let display = &self.display;
        if display.kind == DisplayKind::Snapshot {
            if display.path.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(
                    "display: snapshot path must not be empty".to_string(),
                ));
            }
            if display.every_n_frames == 0 {
                return Err(ConfigError::Invalid(
                    "display: every_n_frames must be > 0".to_string(),
                ));
            }
        }

        let server = &self.server;
        if server.frame_wait_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "server: frame_wait_timeout_ms must be > 0".to_string(),
            ));
        }
        check_duration_ms("server: frame_wait_timeout_ms", server.frame_wait_timeout_ms)?;
        check_duration_ms("server: accept_backoff_ms", server.accept_backoff_ms)?;
        self.server_config()
            .socket_addr()
            .map_err(|e| ConfigError::Invalid(format!("server: {}", e)))?;

        let supervisor = &self.supervisor;
        check_duration_ms("supervisor: max_backoff_ms", supervisor.max_backoff_ms)?;
        if supervisor.initial_backoff_ms > supervisor.max_backoff_ms {
            return Err(ConfigError::Invalid(format!(
                "supervisor: initial_backoff_ms ({}) exceeds max_backoff_ms ({})",
                supervisor.initial_backoff_ms, supervisor.max_backoff_ms
            )));
        }

        Ok(())
    }

    fn validate_camera(&self, cam: &CameraConfig) -> Result<(), ConfigError> {
        // Validate dimensions
        let geometry = cam.geometry()?;
        if cam.width > 4096 || cam.height > 4096 {
            return Err(ConfigError::Invalid(format!(
                "camera: {} exceeds 4096x4096",
                geometry
            )));
        }

        if cam.pixel_format == PixelFormat::Yuyv && cam.width % 2 != 0 {
            return Err(ConfigError::Invalid(
                "camera: YUYV width must be even".to_string(),
            ));
        }

        // Validate FPS
        if cam.fps == 0 || cam.fps > 120 {
            return Err(ConfigError::Invalid(format!(
                "camera: FPS must be between 1 and 120, got {}",
                cam.fps
            )));
        }

        // One buffer in the slot, one with the server, at least one with the driver
        if cam.buffer_count < 3 || cam.buffer_count > 16 {
            return Err(ConfigError::Invalid(format!(
                "camera: buffer_count must be between 3 and 16, got {}",
                cam.buffer_count
            )));
        }

        if !cam.buffer_alignment.is_power_of_two() || cam.buffer_alignment > 4096 {
            return Err(ConfigError::Invalid(format!(
                "camera: buffer_alignment must be a power of two up to 4096, got {}",
                cam.buffer_alignment
            )));
        }

        if cam.dequeue_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "camera: dequeue_timeout_ms must be > 0".to_string(),
            ));
        }
        check_duration_ms("camera: dequeue_timeout_ms", cam.dequeue_timeout_ms)?;

        if cam.driver == DriverKind::V4l2 && cam.kernel_buffers == 0 {
            return Err(ConfigError::Invalid(
                "camera: kernel_buffers must be > 0".to_string(),
            ));
        }

        if let Some(ref flip) = cam.flip_method {
            if !FLIP_METHODS.contains(&flip.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "camera: unknown flip_method {:?}",
                    flip
                )));
            }
        }

        Ok(())
    }

    /// Saves configuration to TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn capture_config(&self) -> Result<CaptureConfig, ConfigError> {
        Ok(CaptureConfig {
            geometry: self.camera.geometry()?,
            buffer_count: self.camera.buffer_count,
            buffer_alignment: self.camera.buffer_alignment,
            dequeue_timeout: Duration::from_millis(self.camera.dequeue_timeout_ms),
        })
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_address: self.server.bind_address.clone(),
            port: self.server.port,
            repeat_frames: self.server.repeat_frames,
            frame_wait_timeout: Duration::from_millis(self.server.frame_wait_timeout_ms),
            accept_backoff: Duration::from_millis(self.server.accept_backoff_ms),
        }
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            max_restarts: self.supervisor.max_restarts,
            initial_backoff: Duration::from_millis(self.supervisor.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.supervisor.max_backoff_ms),
        }
    }
}
