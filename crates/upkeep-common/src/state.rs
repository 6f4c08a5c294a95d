//! ---
//! upkeep_section: "01-core-functionality"
//! upkeep_subsection: "module"
//! upkeep_type: "source"
//! upkeep_scope: "code"
//! upkeep_description: "Shared primitives and utilities for the orchestration runtime."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;

/// Answers "how many processors are currently working on this instance".
///
/// Implementations must be safe to query concurrently from validation and
/// health probes.
pub trait ActiveProcessorLookup: Send + Sync {
    fn active_processors(&self, instance: &str) -> Result<usize>;
}

/// Process-local registry, used when updates run in-process and by tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryProcessorRegistry {
    inner: Arc<Mutex<HashMap<String, usize>>>,
}

impl InMemoryProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, instance: &str, count: usize) {
        let mut guard = self.inner.lock();
        if count == 0 {
            guard.remove(instance);
        } else {
            guard.insert(instance.to_owned(), count);
        }
    }

    pub fn increment(&self, instance: &str) {
        *self.inner.lock().entry(instance.to_owned()).or_default() += 1;
    }

    pub fn decrement(&self, instance: &str) {
        let mut guard = self.inner.lock();
        if let Some(count) = guard.get_mut(instance) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                guard.remove(instance);
            }
        }
    }
}

impl ActiveProcessorLookup for InMemoryProcessorRegistry {
    fn active_processors(&self, instance: &str) -> Result<usize> {
        Ok(self.inner.lock().get(instance).copied().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_track_increments() {
        let registry = InMemoryProcessorRegistry::new();
        registry.increment("alpha");
        registry.increment("alpha");
        registry.decrement("alpha");
        assert_eq!(registry.active_processors("alpha").unwrap(), 1);
        registry.decrement("alpha");
        assert_eq!(registry.active_processors("alpha").unwrap(), 0);
        registry.set("beta", 3);
        assert_eq!(registry.active_processors("beta").unwrap(), 3);
    }
}
