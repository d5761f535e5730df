//! Backend registry for resolving a key-value store from configuration.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::kv::KvStore;
use fieldsync_common::{Error, Result};

/// Factory function type for creating backends.
pub type BackendFactory = Box<dyn Fn(&Value) -> Result<Arc<dyn KvStore>> + Send + Sync>;

/// Registry for key-value backend factories.
///
/// Allows dynamic registration and resolution of storage backends
/// by name and configuration.
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl BackendRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a backend factory.
    ///
    /// # Errors
    /// - Returns error if name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: BackendFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::InvalidInput(format!(
                "Backend '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolve a backend by name and configuration.
    ///
    /// # Errors
    /// - Backend not found
    /// - Configuration invalid
    pub fn resolve(&self, name: &str, config: &Value) -> Result<Arc<dyn KvStore>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Backend '{}' is not registered", name)))?;
        factory(config)
    }

    /// Get list of registered backend names.
    pub fn backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if a backend is registered.
    pub fn has_backend(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn required_str<'a>(config: &'a Value, key: &str, backend: &str) -> Result<&'a str> {
    config
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::InvalidInput(format!("{} backend requires '{}'", backend, key)))
}

/// Create a registry with the built-in backends.
pub fn create_default_registry() -> BackendRegistry {
    let mut registry = BackendRegistry::new();

    // In-memory backend (for testing)
    registry.factories.insert(
        "memory".to_string(),
        Box::new(|_config: &Value| -> Result<Arc<dyn KvStore>> {
            Ok(Arc::new(crate::memory::MemoryKv::new()))
        }),
    );

    // One file per key under a root directory
    registry.factories.insert(
        "local".to_string(),
        Box::new(|config: &Value| -> Result<Arc<dyn KvStore>> {
            let root = required_str(config, "root", "local")?;
            Ok(Arc::new(crate::local::LocalKv::new(root)?))
        }),
    );

    registry.factories.insert(
        "sqlite".to_string(),
        Box::new(|config: &Value| -> Result<Arc<dyn KvStore>> {
            let path = required_str(config, "path", "sqlite")?;
            Ok(Arc::new(crate::sqlite::SqliteKv::open(path)?))
        }),
    );

    registry
}
