use std::collections::BTreeMap;

use anyhow::{anyhow, Result};

use super::backend::DetectorBackend;

/// Registry of detector backends available to a host.
///
/// A pipeline owns its detector exclusively, so backends are handed out by value
/// (`take`) rather than shared.
pub struct BackendRegistry {
    backends: BTreeMap<String, Box<dyn DetectorBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: BTreeMap::new(),
        }
    }

    /// Register a backend under its name, replacing any earlier one.
    pub fn register<B: DetectorBackend + 'static>(&mut self, backend: B) {
        self.backends.insert(backend.name().to_string(), Box::new(backend));
    }

    /// List registered backends.
    pub fn list(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    /// Remove and return a backend by name.
    pub fn take(&mut self, name: &str) -> Result<Box<dyn DetectorBackend>> {
        self.backends.remove(name).ok_or_else(|| {
            anyhow!(
                "backend '{}' not registered (available: {})",
                name,
                self.list().join(", ")
            )
        })
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
