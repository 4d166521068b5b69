//! Store registry for resolving a local store engine from configuration.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use larder_common::{Error, Result};

use crate::store::LocalStore;

/// Factory function type for creating stores.
pub type StoreFactory = Box<dyn Fn(Value) -> Result<Arc<dyn LocalStore>> + Send + Sync>;

/// Registry for local store factories.
///
/// Allows the embedding application to pick the storage engine by name:
/// the SQL engine on native targets, the memory engine in tests.
pub struct StoreRegistry {
    factories: HashMap<String, StoreFactory>,
}

impl StoreRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a store factory.
    ///
    /// # Errors
    /// - Returns error if name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: StoreFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::AlreadyExists(format!(
                "Store '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolve a store by name and configuration.
    ///
    /// # Errors
    /// - Store not found
    /// - Configuration invalid
    /// - Engine failed to open
    pub fn resolve(&self, name: &str, config: Value) -> Result<Arc<dyn LocalStore>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Store '{}' is not registered", name)))?;
        factory(config)
    }

    /// Get list of registered store names.
    pub fn stores(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with the built-in engines.
///
/// - `memory`: no configuration
/// - `sqlite`: `{"path": "<file>"}`, or `{"path": ":memory:"}`
pub fn create_default_registry() -> StoreRegistry {
    let mut factories: HashMap<String, StoreFactory> = HashMap::new();

    factories.insert(
        "memory".to_string(),
        Box::new(|_config| Ok(Arc::new(crate::memory::MemoryStore::new()))),
    );

    factories.insert(
        "sqlite".to_string(),
        Box::new(|config| {
            let path = config
                .get("path")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    Error::InvalidInput("SQLite store requires 'path'".to_string())
                })?;
            let store = if path == ":memory:" {
                crate::sqlite::SqliteStore::in_memory()?
            } else {
                crate::sqlite::SqliteStore::open(path)?
            };
            Ok(Arc::new(store))
        }),
    );

    StoreRegistry { factories }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    #[test]
    fn test_default_registry_resolves_builtins() {
        let registry = create_default_registry();
        assert_eq!(registry.stores(), vec!["memory", "sqlite"]);

        let memory = registry.resolve("memory", Value::Null).unwrap();
        assert_eq!(memory.name(), "memory");

        let sqlite = registry
            .resolve("sqlite", serde_json::json!({"path": ":memory:"}))
            .unwrap();
        assert_eq!(sqlite.name(), "sqlite");
    }

    #[test]
    fn test_sqlite_requires_path() {
        let registry = create_default_registry();
        assert!(registry.resolve("sqlite", Value::Null).is_err());
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = StoreRegistry::new();
        registry
            .register("test", Box::new(|_| Ok(Arc::new(MemoryStore::new()))))
            .unwrap();

        let result = registry.register("test", Box::new(|_| Ok(Arc::new(MemoryStore::new()))));
        assert!(result.is_err());
    }

    #[test]
    fn test_resolve_unknown_fails() {
        let registry = StoreRegistry::new();
        assert!(registry.resolve("indexeddb", Value::Null).is_err());
    }
}
