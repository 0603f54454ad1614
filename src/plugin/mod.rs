//! Frame processor plugins
//!
//! Native extensions implement [`FrameProcessorPlugin`] and register a
//! [`PluginFactory`] under a stable name with the [`PluginRegistry`].
//! Processors resolve a [`PluginHandle`] once and call it for every frame.
//!
//! # Example
//!
//! ```rust,ignore
//! let registry = PluginRegistry::new();
//! builtin::register_builtins(&registry);
//!
//! let luminance = registry.resolve("luminance", &PluginOptions::new())?;
//! dispatcher.set_processor(Some(Processor::new("exposure", move |frame: &Frame| {
//!     let result = luminance.call(frame, &PluginArgs::new())?;
//!     info!("mean luminance {}", result["mean"]);
//!     Ok(())
//! })));
//! ```

pub mod builtin;
pub mod registry;

use std::fmt;
use std::sync::Arc;

use color_eyre::eyre;
use serde_json::{Map, Value};

use crate::capture::Frame;
use crate::error::{PipelineError, Result};

pub use registry::PluginRegistry;

/// Per-call arguments passed to a plugin.
pub type PluginArgs = Map<String, Value>;

/// Options fixed when a plugin instance is created.
pub type PluginOptions = Map<String, Value>;

/// Processing entry point of a native extension.
pub trait FrameProcessorPlugin: Send + Sync {
    fn process(&self, frame: &Frame, args: &PluginArgs) -> eyre::Result<Value>;
}

/// Builds plugin instances from options.
pub trait PluginFactory: Send + Sync {
    fn create(&self, options: &PluginOptions) -> eyre::Result<Arc<dyn FrameProcessorPlugin>>;
}

impl<F> PluginFactory for F
where
    F: Fn(&PluginOptions) -> eyre::Result<Arc<dyn FrameProcessorPlugin>> + Send + Sync,
{
    fn create(&self, options: &PluginOptions) -> eyre::Result<Arc<dyn FrameProcessorPlugin>> {
        self(options)
    }
}

/// A resolved plugin instance.
#[derive(Clone)]
pub struct PluginHandle {
    name: Arc<str>,
    options: Arc<PluginOptions>,
    instance: Arc<dyn FrameProcessorPlugin>,
}

impl PluginHandle {
    pub(crate) fn new(
        name: &str,
        options: PluginOptions,
        instance: Arc<dyn FrameProcessorPlugin>,
    ) -> Self {
        Self {
            name: Arc::from(name),
            options: Arc::new(options),
            instance,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &PluginOptions {
        &self.options
    }

    /// Run the plugin on `frame`. The caller must already hold a reference
    /// to the frame (inside a processor or offloaded task); the plugin does
    /// not take one of its own.
    pub fn call(&self, frame: &Frame, args: &PluginArgs) -> Result<Value> {
        if !frame.is_valid() {
            return Err(PipelineError::UseAfterRelease {
                sequence: frame.sequence(),
            });
        }
        self.instance
            .process(frame, args)
            .map_err(|e| PipelineError::PluginFailed {
                name: self.name.to_string(),
                message: format!("{:#}", e),
            })
    }

    /// Whether both handles point at the same instance.
    pub fn same_instance(&self, other: &PluginHandle) -> bool {
        Arc::ptr_eq(&self.instance, &other.instance)
    }
}

impl fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHandle")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish()
    }
}
