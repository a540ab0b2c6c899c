//! Adapter factories for building model backends from configuration.
//!
//! ```ignore
//! let mut registry = AdapterRegistry::new();
//! registry.register(Arc::new(AnthropicAdapterFactory));
//!
//! let adapter = registry.create("anthropic", &serde_json::json!({"model": "claude-haiku-4-5"}))?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use super::{ModelAdapter, ModelError};

/// Builds one kind of [`ModelAdapter`] from JSON configuration.
pub trait AdapterFactory: Send + Sync {
    /// Unique identifier, e.g. "anthropic".
    fn adapter_type(&self) -> &'static str;

    fn create(&self, config: &JsonValue) -> Result<Arc<dyn ModelAdapter>, ModelError>;

    /// Validate configuration without creating an adapter.
    fn validate_config(&self, config: &JsonValue) -> Result<(), ModelError>;

    fn default_config(&self) -> JsonValue {
        serde_json::json!({})
    }

    fn description(&self) -> &'static str {
        "Model adapter"
    }
}

/// Registry of adapter factories, keyed by type name.
#[derive(Default)]
pub struct AdapterRegistry {
    factories: BTreeMap<String, Arc<dyn AdapterFactory>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory, replacing any previous one of the same type.
    pub fn register(&mut self, factory: Arc<dyn AdapterFactory>) {
        self.factories
            .insert(factory.adapter_type().to_string(), factory);
    }

    pub fn create(
        &self,
        adapter_type: &str,
        config: &JsonValue,
    ) -> Result<Arc<dyn ModelAdapter>, ModelError> {
        self.factories
            .get(adapter_type)
            .ok_or_else(|| {
                ModelError::NotConfigured(format!(
                    "Unknown adapter type: '{}'. Available: {:?}",
                    adapter_type,
                    self.available_types()
                ))
            })?
            .create(config)
    }

    pub fn validate(&self, adapter_type: &str, config: &JsonValue) -> Result<(), ModelError> {
        self.factories
            .get(adapter_type)
            .ok_or_else(|| {
                ModelError::NotConfigured(format!("Unknown adapter type: '{}'", adapter_type))
            })?
            .validate_config(config)
    }

    pub fn available_types(&self) -> Vec<&str> {
        self.factories.keys().map(|s| s.as_str()).collect()
    }

    pub fn has_adapter(&self, adapter_type: &str) -> bool {
        self.factories.contains_key(adapter_type)
    }

    pub fn default_config(&self, adapter_type: &str) -> Option<JsonValue> {
        self.factories
            .get(adapter_type)
            .map(|f| f.default_config())
    }

    /// Registry with every adapter compiled into this build.
    #[cfg(feature = "anthropic")]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(super::AnthropicAdapterFactory));
        registry
    }

    /// Registry with every adapter compiled into this build.
    #[cfg(not(feature = "anthropic"))]
    pub fn with_defaults() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("adapters", &self.available_types())
            .finish()
    }
}
