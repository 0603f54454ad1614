//! Plugin registry mapping names to factories and cached instances.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde_json::Value;
use tracing::{debug, info};

use super::{PluginArgs, PluginFactory, PluginHandle, PluginOptions};
use crate::capture::Frame;
use crate::error::{PipelineError, Result};

/// Registry for frame processor plugins.
///
/// Plugins register once, when their extension loads, and are resolved by
/// processors afterwards. Resolving the same name with the same options
/// returns the same instance.
pub struct PluginRegistry {
    /// Factories indexed by plugin name.
    factories: RwLock<HashMap<String, Arc<dyn PluginFactory>>>,
    /// (name, canonical options) -> resolved instance.
    instances: Mutex<HashMap<(String, String), PluginHandle>>,
}

impl PluginRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Register a factory. A later registration under the same name
    /// replaces the earlier one and discards its cached instances.
    pub fn register(&self, name: impl Into<String>, factory: impl PluginFactory + 'static) {
        let name = name.into();
        let replaced = self
            .factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), Arc::new(factory))
            .is_some();

        if replaced {
            self.instances
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|(cached, _), _| cached != &name);
            info!("Replaced frame processor plugin {}", name);
        } else {
            info!("Registered frame processor plugin {}", name);
        }
    }

    /// Check if a plugin is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// List all registered plugin names, sorted.
    pub fn registered(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Look up a plugin and get an instance for `options`, creating it on
    /// first use.
    pub fn resolve(&self, name: &str, options: &PluginOptions) -> Result<PluginHandle> {
        let key = (name.to_string(), cache_key(options));
        loop {
            let factory = self
                .factory(name)
                .ok_or_else(|| PipelineError::PluginNotFound(name.to_string()))?;

            if let Some(handle) = self
                .instances
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&key)
            {
                return Ok(handle.clone());
            }

            // Factories may be slow; build outside the lock
            let instance = factory
                .create(options)
                .map_err(|e| PipelineError::PluginInit {
                    name: name.to_string(),
                    message: format!("{:#}", e),
                })?;

            let mut instances = self
                .instances
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            // A register() in the meantime already evicted this name
            if !self.factory(name).is_some_and(|current| Arc::ptr_eq(&current, &factory)) {
                debug!(plugin = name, "factory replaced while resolving, retrying");
                continue;
            }
            debug!(plugin = name, options = %key.1, "created plugin instance");
            let handle = instances
                .entry(key.clone())
                .or_insert_with(|| PluginHandle::new(name, options.clone(), instance));
            return Ok(handle.clone());
        }
    }

    fn factory(&self, name: &str) -> Option<Arc<dyn PluginFactory>> {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Call a resolved plugin on a frame the caller holds a reference to.
    pub fn invoke(&self, plugin: &PluginHandle, frame: &Frame, args: &PluginArgs) -> Result<Value> {
        plugin.call(frame, args)
    }
}

/// Options rendered with sorted keys, so equal options give equal keys.
fn cache_key(options: &PluginOptions) -> String {
    let sorted: BTreeMap<&String, &Value> = options.iter().collect();
    serde_json::to_string(&sorted).unwrap_or_default()
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}
