//! In-memory key-value store
//!
//! Clones share the same map, so a test can drop a controller, build a new
//! one over the same store and observe what a restarted process would read.

use crate::error::StoreError;
use crate::store::KeyValueStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type Entries = HashMap<(String, String), toml::Value>;

/// Shared in-memory store
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<Entries>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self, group: &str) -> Result<std::sync::MutexGuard<'_, Entries>, StoreError> {
        self.entries.lock().map_err(|_| StoreError::Read {
            group: group.to_string(),
            reason: "store lock poisoned".to_string(),
        })
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, group: &str, key: &str) -> Result<Option<toml::Value>, StoreError> {
        let entries = self.lock(group)?;
        Ok(entries.get(&(group.to_string(), key.to_string())).cloned())
    }

    fn set_many(&self, group: &str, values: &[(&str, toml::Value)]) -> Result<(), StoreError> {
        // A single lock scope makes the batch atomic
        let mut entries = self.lock(group)?;
        for (key, value) in values {
            entries.insert((group.to_string(), key.to_string()), value.clone());
        }
        Ok(())
    }

    fn remove(&self, group: &str, key: &str) -> Result<(), StoreError> {
        let mut entries = self.lock(group)?;
        entries.remove(&(group.to_string(), key.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_entries() {
        let store = MemoryStore::new();
        let clone = store.clone();

        store
            .set_many("g", &[("flag", toml::Value::Boolean(true))])
            .unwrap();
        assert_eq!(
            clone.get("g", "flag").unwrap(),
            Some(toml::Value::Boolean(true))
        );

        clone.remove("g", "flag").unwrap();
        assert_eq!(store.get("g", "flag").unwrap(), None);
        // Removing twice is fine
        clone.remove("g", "flag").unwrap();
    }
}
