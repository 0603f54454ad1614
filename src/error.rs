//! Error types for the frame pipeline.

use thiserror::Error;

/// Result type alias using the pipeline's error.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Structural failures, surfaced synchronously at the call site.
///
/// Failures raised by processors and offloaded tasks are not represented
/// here; they travel through the [`ErrorBridge`](crate::pipeline::ErrorBridge)
/// as [`ProcessingError`](crate::pipeline::ProcessingError).
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A frame was accessed after its reference count reached zero.
    #[error("frame #{sequence} used after its buffer was released")]
    UseAfterRelease { sequence: u64 },

    /// No plugin is registered under the requested name.
    #[error("frame processor plugin not found: {0}")]
    PluginNotFound(String),

    /// The plugin factory refused the given options.
    #[error("failed to initialize plugin {name}: {message}")]
    PluginInit { name: String, message: String },

    /// The plugin's processing entry point returned an error.
    #[error("plugin {name} failed: {message}")]
    PluginFailed { name: String, message: String },

    /// The execution context no longer accepts work.
    #[error("execution context {0} is closed")]
    ContextClosed(String),

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
