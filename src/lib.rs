//! Frame-processing pipeline for camera capture.
//!
//! Captured buffers flow from a producer into a [`Dispatcher`], which hands
//! each one to the active processor on its own processing context. Work too
//! slow for the capture cadence goes to [`AsyncQueue`]s. Buffers are
//! reference-counted [`Frame`]s returned to the producer once released,
//! plugins are resolved through a [`PluginRegistry`], and failures reach the
//! controlling context through the [`ErrorBridge`].
//!
//! [`Dispatcher`]: pipeline::Dispatcher
//! [`AsyncQueue`]: pipeline::AsyncQueue
//! [`Frame`]: capture::Frame
//! [`PluginRegistry`]: plugin::PluginRegistry
//! [`ErrorBridge`]: pipeline::ErrorBridge

pub mod capture;
pub mod error;
pub mod pipeline;
pub mod plugin;
pub mod utils;

use std::path::Path;

use arc_swap::ArcSwap;
use capture::frame::{Orientation, PixelFormat};
use serde::{Deserialize, Serialize};
use tracing::info;

pub use error::{PipelineError, Result};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Environment variable prefix, e.g. `FRAMEPIPE__CAPTURE__FPS=60`
pub const ENV_PREFIX: &str = "FRAMEPIPE";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub demo: DemoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
    pub orientation: Orientation,
    pub mirrored: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Name of the processing thread
    pub processing_thread: String,
    /// Offload queue threads are named `{prefix}-{queue}`
    pub offload_thread_prefix: String,
    /// Pin the processing thread to this core
    #[serde(default)]
    pub processing_core: Option<usize>,
}

/// Parameters of the bundled demo binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemoConfig {
    pub frames: u64,
    pub processor_ms: u64,
    pub offload_ms: u64,
    pub offload_fps: f64,
    /// Every n-th frame fails, to exercise error reporting (0 disables)
    pub fail_every: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            format: PixelFormat::Nv12,
            buffer_count: 4,
            orientation: Orientation::Portrait,
            mirrored: false,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            processing_thread: "framepipe-processor".into(),
            offload_thread_prefix: "framepipe-async".into(),
            processing_core: None,
        }
    }
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            frames: 120,
            processor_ms: 20, // Slower than 30fps capture on purpose
            offload_ms: 150,
            offload_fps: 5.0,
            fail_every: 50,
        }
    }
}

impl Config {
    /// Load defaults, overlaid with an optional TOML file and then
    /// `FRAMEPIPE__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            info!("Loading configuration from {}", path.display());
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}
