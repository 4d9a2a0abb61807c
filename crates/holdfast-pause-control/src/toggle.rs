//! Pause switches read by strategies on every dispatch.

use std::collections::BTreeSet;
use std::sync::RwLock;

use holdfast_kernel::{SharedStore, StoreError};

use crate::error::PauseControlError;

pub const TOGGLE_PREFIX: &str = "pause_control:toggle";

/// Source of truth for whether a named pause switch is on.
pub trait PauseToggle: Send + Sync {
    fn is_enabled(&self, name: &str) -> Result<bool, PauseControlError>;
}

/// Process-local toggles, flipped directly by tests and embedders.
#[derive(Debug, Default)]
pub struct StaticPauseToggle {
    enabled: RwLock<BTreeSet<String>>,
}

impl StaticPauseToggle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(&self, name: &str) -> Result<(), PauseControlError> {
        self.enabled
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .insert(name.to_string());
        Ok(())
    }

    pub fn disable(&self, name: &str) -> Result<(), PauseControlError> {
        self.enabled
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .remove(name);
        Ok(())
    }
}

impl PauseToggle for StaticPauseToggle {
    fn is_enabled(&self, name: &str) -> Result<bool, PauseControlError> {
        Ok(self
            .enabled
            .read()
            .map_err(|_| StoreError::Poisoned)?
            .contains(name))
    }
}

/// Toggles kept in the shared store so an operator can flip them for every
/// process at once.
#[derive(Clone)]
pub struct KvPauseToggle {
    store: SharedStore,
}

impl KvPauseToggle {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub fn key(name: &str) -> String {
        format!("{TOGGLE_PREFIX}:{name}")
    }

    pub fn enable(&self, name: &str) -> Result<(), PauseControlError> {
        self.store.set(&Self::key(name), "1", None)?;
        Ok(())
    }

    /// Returns whether the toggle was on.
    pub fn disable(&self, name: &str) -> Result<bool, PauseControlError> {
        Ok(self.store.del(&[Self::key(name).as_str()])? > 0)
    }
}

impl PauseToggle for KvPauseToggle {
    fn is_enabled(&self, name: &str) -> Result<bool, PauseControlError> {
        Ok(self.store.exists(&Self::key(name))?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use holdfast_kernel::InMemoryKeyValueStore;

    use super::*;

    #[test]
    fn static_toggle_flips() {
        let toggle = StaticPauseToggle::new();
        assert!(!toggle.is_enabled("w").expect("read"));
        toggle.enable("w").expect("enable");
        assert!(toggle.is_enabled("w").expect("read"));
        toggle.disable("w").expect("disable");
        assert!(!toggle.is_enabled("w").expect("read"));
    }

    #[test]
    fn kv_toggle_is_visible_through_the_store() {
        let store: SharedStore = Arc::new(InMemoryKeyValueStore::new());
        let toggle = KvPauseToggle::new(store.clone());
        toggle.enable("search_indexing").expect("enable");

        assert!(store
            .exists("pause_control:toggle:search_indexing")
            .expect("exists"));
        assert!(KvPauseToggle::new(store).is_enabled("search_indexing").expect("read"));
        assert!(toggle.disable("search_indexing").expect("disable"));
        assert!(!toggle.disable("search_indexing").expect("disable"));
    }
}
