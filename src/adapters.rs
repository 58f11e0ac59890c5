// src/adapters.rs
//
// Registry of output container conventions. The core only ever hands out
// plain ndarray arrays; other container types are provided by adapters that
// declare whether their backing library is usable when they register.

use crate::error::{EofError, Result};
use log::{debug, warn};
use std::collections::BTreeMap;

/// A container convention that analysis inputs and outputs can be wrapped in.
pub trait ContainerAdapter: Send + Sync {
    /// Name callers use to request this container, e.g. `"standard"`.
    fn name(&self) -> &str;

    /// Whether the library backing this container can be used.
    fn is_available(&self) -> bool;
}

/// Plain `ndarray` arrays. Always available.
#[derive(Debug, Default, Clone, Copy)]
pub struct NdarrayAdapter;

impl ContainerAdapter for NdarrayAdapter {
    fn name(&self) -> &str {
        "standard"
    }

    fn is_available(&self) -> bool {
        true
    }
}

/// Adapters keyed by name. Capability is checked once, at registration.
pub struct AdapterRegistry {
    adapters: BTreeMap<String, Box<dyn ContainerAdapter>>,
}

impl AdapterRegistry {
    /// Registry with no adapters.
    pub fn empty() -> Self {
        Self { adapters: BTreeMap::new() }
    }

    /// Registry holding the built-in [`NdarrayAdapter`].
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry
            .adapters
            .insert(NdarrayAdapter.name().to_string(), Box::new(NdarrayAdapter));
        registry
    }

    /// Adds an adapter, replacing any with the same name.
    ///
    /// Fails with `UnsupportedContainer` if the adapter reports itself unavailable.
    pub fn register(&mut self, adapter: Box<dyn ContainerAdapter>) -> Result<()> {
        let name = adapter.name().to_string();
        if !adapter.is_available() {
            warn!("Container adapter '{}' is not available and was not registered.", name);
            return Err(EofError::UnsupportedContainer { name });
        }
        debug!("Registered container adapter '{}'.", name);
        self.adapters.insert(name, adapter);
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<&dyn ContainerAdapter> {
        self.adapters
            .get(name)
            .map(|a| a.as_ref())
            .ok_or_else(|| EofError::UnsupportedContainer { name: name.to_string() })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.adapters.keys().map(String::as_str).collect()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct LabeledArrays {
        installed: bool,
    }

    impl ContainerAdapter for LabeledArrays {
        fn name(&self) -> &str {
            "labeled"
        }

        fn is_available(&self) -> bool {
            self.installed
        }
    }

    #[test]
    fn test_builtin_standard_adapter_resolves() {
        let registry = AdapterRegistry::default();
        assert_eq!(registry.names(), vec!["standard"]);
        assert!(registry.resolve("standard").unwrap().is_available());
    }

    #[test]
    fn test_unknown_and_unavailable_containers_are_rejected() {
        let mut registry = AdapterRegistry::new();
        match registry.resolve("cube") {
            Err(EofError::UnsupportedContainer { name }) => assert_eq!(name, "cube"),
            other => panic!("expected UnsupportedContainer, got {:?}", other.map(|a| a.name().to_string())),
        }
        assert!(matches!(
            registry.register(Box::new(LabeledArrays { installed: false })),
            Err(EofError::UnsupportedContainer { .. })
        ));
        assert!(!registry.contains("labeled"));

        registry.register(Box::new(LabeledArrays { installed: true })).unwrap();
        assert_eq!(registry.names(), vec!["labeled", "standard"]);
    }
}
