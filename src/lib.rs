pub mod capture;
pub mod pipeline;
pub mod relay;

use std::path::Path;

use arc_swap::ArcSwap;
use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};

use crate::relay::metadata::{ATTRKEY_SENSOR_METADATA, SENSOR_METADATA_SIZE};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub relay: RelayConfig,
    pub camera: CameraConfig,
    pub encoder: EncoderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Attribute tag carrying per-frame sensor data
    pub metadata_tag: u32,
    /// Exact size of a valid sensor data blob
    pub metadata_size: usize,
}

/// Simulated camera feeding the loopback runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub buffer_count: usize,
    pub fps: u32,
    pub frames: u64,
    /// Attach sensor data to every n-th frame, 0 disables it
    pub metadata_every: u64,
}

/// Simulated encoder draining the loopback runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub queue_depth: usize,
    pub release_delay_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            format: PixelFormat::Nv12,
            metadata_tag: ATTRKEY_SENSOR_METADATA,
            metadata_size: SENSOR_METADATA_SIZE,
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            buffer_count: 4,
            fps: 30,
            frames: 120,
            metadata_every: 1,
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            queue_depth: 4,
            release_delay_ms: 5,
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then `RELAY__*`
    /// environment variables (e.g. `RELAY__CAMERA__FPS=60`), over defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder
            .add_source(
                config::Environment::with_prefix("RELAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
