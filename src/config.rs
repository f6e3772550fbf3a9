//! Configuration management for the service.
//!
//! Settings are loaded from an optional TOML file through the `config` crate,
//! with `DEPTHCAST__`-prefixed environment variables layered on top, then
//! validated before anything is constructed. Missing sections fall back to
//! the documented defaults; contradictory values fail the load.
//!
//! ## Schema
//!
//! - **`base_sensor`**: queue bound, worker health supervision and the
//!   buffer-pool sizing shared by all sensors.
//! - **`service`**: broadcast cadence and idle behavior.
//! - **`sensors.{depth,color,infrared,body}`**: per-kind processing options.
//! - **`device`**: driver parameters (mock frame cadence, serial selector).
//! - **`frame_sync`**: multi-source synchronization window and sources.
//! - **`network.websocket`**: listener host/port and the identification
//!   timeout for new subscribers.
//! - **`debug`**: log level, log format, periodic performance broadcasts.

use crate::stream::StreamKind;
use crate::validation::{is_in_range, is_not_empty, is_valid_port};
use anyhow::{bail, Context, Result};
use config::Config;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub base_sensor: BaseSensorSettings,
    pub service: ServiceSettings,
    pub sensors: SensorsSettings,
    pub device: DeviceSettings,
    pub frame_sync: FrameSyncSettings,
    pub network: NetworkSettings,
    pub debug: DebugSettings,
}

impl Settings {
    /// Load settings from the given TOML file (when present) plus
    /// environment overrides, and validate them.
    pub fn new(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("DEPTHCAST").separator("__"),
        );
        let settings: Settings = builder
            .build()
            .context("failed to read configuration sources")?
            .try_deserialize()
            .context("failed to deserialize configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        is_valid_port(self.network.websocket.port)
            .map_err(|e| anyhow::anyhow!("network.websocket.port: {e}"))?;
        is_not_empty(&self.network.websocket.host)
            .map_err(|e| anyhow::anyhow!("network.websocket.host: {e}"))?;

        let pool = &self.base_sensor.buffer_pool;
        if pool.expand_size == 0 {
            bail!("base_sensor.buffer_pool.expand_size must be at least 1");
        }
        if pool.initial_size > pool.max_pool_size {
            bail!(
                "base_sensor.buffer_pool.initial_size ({}) exceeds max_pool_size ({})",
                pool.initial_size,
                pool.max_pool_size
            );
        }
        if pool.initial_size * StreamKind::ALL.len() > pool.max_pool_size {
            bail!(
                "base_sensor.buffer_pool: {} kinds at initial_size {} exceed max_pool_size {}",
                StreamKind::ALL.len(),
                pool.initial_size,
                pool.max_pool_size
            );
        }
        if self.base_sensor.max_queue_size == 0 {
            bail!("base_sensor.max_queue_size must be at least 1");
        }
        if self.base_sensor.frame_timeout_ms == 0 || self.base_sensor.health_check_interval_ms == 0
        {
            bail!("base_sensor health supervision intervals must be non-zero");
        }

        let depth = &self.sensors.depth;
        if depth.min_distance >= depth.max_distance {
            bail!(
                "sensors.depth: min_distance ({}) must be below max_distance ({})",
                depth.min_distance,
                depth.max_distance
            );
        }
        if let Some(map) = &depth.colorize {
            if crate::processing::depth::ColorMap::from_name(map).is_none() {
                bail!("sensors.depth.colorize: unknown color map '{map}'");
            }
        }

        let smoothing = &self.sensors.body.smoothing;
        is_in_range(smoothing.correction, 0.0..=1.0)
            .map_err(|e| anyhow::anyhow!("sensors.body.smoothing.correction: {e}"))?;
        if self.sensors.body.gesture_threshold <= 0.0 {
            bail!("sensors.body.gesture_threshold must be positive");
        }

        if self.frame_sync.enabled {
            if self.frame_sync.sources.is_empty() {
                bail!("frame_sync.sources must name at least one stream when enabled");
            }
            if self.frame_sync.sync_window_ms == 0 {
                bail!("frame_sync.sync_window_ms must be non-zero");
            }
            if self.frame_sync.buffer_size == 0 {
                bail!("frame_sync.buffer_size must be at least 1");
            }
        }

        crate::logging::parse_level(&self.debug.log_level)
            .map_err(|e| anyhow::anyhow!("debug.log_level: {e}"))?;

        Ok(())
    }

    /// Stream kinds with an enabled sensor section.
    pub fn enabled_kinds(&self) -> Vec<StreamKind> {
        let mut kinds = Vec::new();
        if self.sensors.depth.enabled {
            kinds.push(StreamKind::Depth);
        }
        if self.sensors.color.enabled {
            kinds.push(StreamKind::Color);
        }
        if self.sensors.infrared.enabled {
            kinds.push(StreamKind::Infrared);
        }
        if self.sensors.body.enabled {
            kinds.push(StreamKind::Body);
        }
        kinds
    }

    pub fn sensor_enabled(&self, kind: StreamKind) -> bool {
        match kind {
            StreamKind::Depth => self.sensors.depth.enabled,
            StreamKind::Color => self.sensors.color.enabled,
            StreamKind::Infrared => self.sensors.infrared.enabled,
            StreamKind::Body => self.sensors.body.enabled,
        }
    }
}

/// Supervision and buffering shared by every sensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BaseSensorSettings {
    /// Bound on queued raw frames per sensor; the oldest frame is dropped on
    /// overflow.
    pub max_queue_size: usize,
    pub health_check_interval_ms: u64,
    /// How long a worker may stay silent after a health check before it is
    /// restarted.
    pub frame_timeout_ms: u64,
    pub max_restarts: u32,
    pub buffer_pool: BufferPoolSettings,
}

impl Default for BaseSensorSettings {
    fn default() -> Self {
        Self {
            max_queue_size: 4,
            health_check_interval_ms: 1_000,
            frame_timeout_ms: 5_000,
            max_restarts: 3,
            buffer_pool: BufferPoolSettings::default(),
        }
    }
}

impl BaseSensorSettings {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferPoolSettings {
    pub initial_size: usize,
    pub expand_size: usize,
    pub max_pool_size: usize,
    pub zero_on_release: bool,
}

impl Default for BufferPoolSettings {
    fn default() -> Self {
        Self {
            initial_size: 2,
            expand_size: 2,
            max_pool_size: 32,
            zero_on_release: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    pub server_version: String,
    pub stats_interval_ms: u64,
    /// Start every enabled sensor when the first subscriber identifies.
    pub auto_start_on_connect: bool,
    /// Stop all sensors when the last subscriber disconnects.
    pub stop_when_idle: bool,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            stats_interval_ms: 1_000,
            auto_start_on_connect: true,
            stop_when_idle: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SensorsSettings {
    pub depth: DepthSettings,
    pub color: ColorSettings,
    pub infrared: InfraredSettings,
    pub body: BodySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DepthSettings {
    pub enabled: bool,
    /// Reliability filter lower bound, millimeters.
    pub min_distance: u16,
    /// Reliability filter upper bound, millimeters.
    pub max_distance: u16,
    pub normalize: bool,
    pub gamma: bool,
    pub point_cloud: bool,
    /// Named color map for the optional colorized rendering.
    pub colorize: Option<String>,
    pub calibration: CalibrationSettings,
}

impl Default for DepthSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            min_distance: 500,
            max_distance: 4_500,
            normalize: true,
            gamma: false,
            point_cloud: false,
            colorize: None,
            calibration: CalibrationSettings::default(),
        }
    }
}

/// Depth camera intrinsics used for point-cloud projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationSettings {
    pub focal_x: f32,
    pub focal_y: f32,
    pub principal_x: f32,
    pub principal_y: f32,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            focal_x: 365.456,
            focal_y: 365.456,
            principal_x: 254.878,
            principal_y: 205.395,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorSettings {
    pub enabled: bool,
    /// Force every alpha byte to 255.
    pub force_alpha: bool,
    pub compression: Option<CompressionSettings>,
}

impl Default for ColorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            force_alpha: true,
            compression: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionSettings {
    pub format: String,
    pub quality: u8,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            format: "jpeg".to_string(),
            quality: 80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InfraredSettings {
    pub enabled: bool,
    pub gamma: bool,
}

impl Default for InfraredSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            gamma: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BodySettings {
    pub enabled: bool,
    pub smoothing: SmoothingSettings,
    pub compute_velocity: bool,
    pub compute_bounds: bool,
    pub compute_confidence: bool,
    /// Spine-relative horizontal displacement, meters, that registers a
    /// swipe.
    pub gesture_threshold: f32,
    /// Joints to smooth; all joints when unset.
    pub joints: Option<Vec<String>>,
}

impl Default for BodySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            smoothing: SmoothingSettings::default(),
            compute_velocity: true,
            compute_bounds: true,
            compute_confidence: true,
            gesture_threshold: 0.2,
            joints: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothingSettings {
    /// Blend factor toward the previous position.
    pub correction: f32,
    /// Clamp on per-frame joint travel, meters.
    pub max_deviation: f32,
    /// Movements below this radius snap to the previous position, meters.
    pub jitter_radius: f32,
}

impl Default for SmoothingSettings {
    fn default() -> Self {
        Self {
            correction: 0.25,
            max_deviation: 0.1,
            jitter_radius: 0.005,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Emission cadence of the mock driver, milliseconds.
    pub frame_interval_ms: u64,
    /// Optional device serial to select among attached cameras.
    pub serial: Option<String>,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            frame_interval_ms: 33,
            serial: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameSyncSettings {
    pub enabled: bool,
    /// Streams that must all be present before a bundle is emitted.
    pub sources: Vec<StreamKind>,
    pub sync_window_ms: u64,
    /// Age at which an unmatched slot is discarded.
    pub drop_after_ms: u64,
    /// Bound on simultaneously held slots.
    pub buffer_size: usize,
}

impl Default for FrameSyncSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            sources: vec![StreamKind::Depth, StreamKind::Color, StreamKind::Body],
            sync_window_ms: 33,
            drop_after_ms: 66,
            buffer_size: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NetworkSettings {
    pub websocket: WebsocketSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebsocketSettings {
    pub host: String,
    pub port: u16,
    /// Subscribers that have not identified within this window are closed.
    pub identification_timeout_ms: u64,
    /// Upper bound on a single inbound wire frame.
    pub max_frame_bytes: usize,
}

impl Default for WebsocketSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8181,
            identification_timeout_ms: 5_000,
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

impl WebsocketSettings {
    pub fn identification_timeout(&self) -> Duration {
        Duration::from_millis(self.identification_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugSettings {
    pub log_level: String,
    /// One of `pretty`, `compact`, `json`.
    pub log_format: String,
    /// Broadcast pool, sensor and sync statistics on the stats interval.
    pub performance: bool,
}

impl Default for DebugSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            performance: false,
        }
    }
}
