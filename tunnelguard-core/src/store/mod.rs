//! Durable connection intent
//!
//! The controller's only state that survives a process restart is the
//! [`ConnectionIntent`] pair. It lives in a group-scoped key-value store;
//! both keys are always written in one atomic batch.

use crate::error::StoreError;
use crate::types::ConnectionIntent;
use std::sync::Arc;
use tracing::debug;

pub mod file;
pub mod memory;

pub use file::TomlFileStore;
pub use memory::MemoryStore;

/// Key holding `ConnectionIntent::should_be_connected`
pub const KEY_SHOULD_BE_CONNECTED: &str = "shouldBeConnected";

/// Key holding `ConnectionIntent::app_initiated`
pub const KEY_APP_INITIATED: &str = "appInitiatedConnection";

/// Key the tunnel side writes its latest traffic report into
pub const KEY_CONNECTION_UPDATE: &str = "connectionUpdate";

/// Group-scoped durable key-value store
///
/// Implementations must apply a `set_many` batch atomically: after a crash
/// either every entry of the batch is visible or none is.
pub trait KeyValueStore: Send + Sync {
    /// Read a single value, `None` when the key was never written
    fn get(&self, group: &str, key: &str) -> Result<Option<toml::Value>, StoreError>;

    /// Write several keys as one atomic update
    fn set_many(&self, group: &str, entries: &[(&str, toml::Value)]) -> Result<(), StoreError>;

    /// Delete a key, succeeding when it does not exist
    fn remove(&self, group: &str, key: &str) -> Result<(), StoreError>;
}

/// Typed view of the key-value store for one group
#[derive(Clone)]
pub struct PersistedIntentStore {
    backend: Arc<dyn KeyValueStore>,
    group: String,
}

impl std::fmt::Debug for PersistedIntentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistedIntentStore")
            .field("group", &self.group)
            .finish_non_exhaustive()
    }
}

impl PersistedIntentStore {
    pub fn new(backend: Arc<dyn KeyValueStore>, group: impl Into<String>) -> Self {
        Self {
            backend,
            group: group.into(),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Read the persisted intent; missing keys read as `false`
    pub fn load(&self) -> Result<ConnectionIntent, StoreError> {
        let intent = ConnectionIntent {
            should_be_connected: self.get_bool(KEY_SHOULD_BE_CONNECTED)?,
            app_initiated: self.get_bool(KEY_APP_INITIATED)?,
        };
        debug!(group = %self.group, ?intent, "Loaded persisted intent");
        Ok(intent)
    }

    /// Write both intent fields in one batch
    pub fn save(&self, intent: &ConnectionIntent) -> Result<(), StoreError> {
        self.backend.set_many(
            &self.group,
            &[
                (
                    KEY_SHOULD_BE_CONNECTED,
                    toml::Value::Boolean(intent.should_be_connected),
                ),
                (KEY_APP_INITIATED, toml::Value::Boolean(intent.app_initiated)),
            ],
        )?;
        debug!(group = %self.group, ?intent, "Persisted intent");
        Ok(())
    }

    /// Reset the intent to both-false
    pub fn clear(&self) -> Result<(), StoreError> {
        self.save(&ConnectionIntent::IDLE)
    }

    /// Latest traffic report written by the tunnel side
    pub fn connection_update(&self) -> Result<Option<String>, StoreError> {
        match self.backend.get(&self.group, KEY_CONNECTION_UPDATE)? {
            None => Ok(None),
            Some(toml::Value::String(report)) => Ok(Some(report)),
            Some(other) => Err(StoreError::Corrupt {
                group: self.group.clone(),
                reason: format!(
                    "{} must be a string, found {}",
                    KEY_CONNECTION_UPDATE,
                    other.type_str()
                ),
            }),
        }
    }

    /// Record a traffic report for `connection_update`
    pub fn set_connection_update(&self, report: &str) -> Result<(), StoreError> {
        self.backend.set_many(
            &self.group,
            &[(KEY_CONNECTION_UPDATE, toml::Value::String(report.to_string()))],
        )
    }

    fn get_bool(&self, key: &str) -> Result<bool, StoreError> {
        match self.backend.get(&self.group, key)? {
            None => Ok(false),
            Some(toml::Value::Boolean(value)) => Ok(value),
            Some(other) => Err(StoreError::Corrupt {
                group: self.group.clone(),
                reason: format!("{} must be a boolean, found {}", key, other.type_str()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (MemoryStore, PersistedIntentStore) {
        let backend = MemoryStore::new();
        let intents = PersistedIntentStore::new(Arc::new(backend.clone()), "group.test");
        (backend, intents)
    }

    #[test]
    fn test_missing_keys_read_as_idle() {
        let (_, intents) = store();
        assert_eq!(intents.load().unwrap(), ConnectionIntent::IDLE);
    }

    #[test]
    fn test_save_then_load() {
        let (_, intents) = store();
        intents.save(&ConnectionIntent::CONNECT).unwrap();
        assert_eq!(intents.load().unwrap(), ConnectionIntent::CONNECT);

        intents.clear().unwrap();
        assert_eq!(intents.load().unwrap(), ConnectionIntent::IDLE);
    }

    #[test]
    fn test_groups_are_isolated() {
        let (backend, intents) = store();
        intents.save(&ConnectionIntent::CONNECT).unwrap();

        let other = PersistedIntentStore::new(Arc::new(backend), "group.other");
        assert_eq!(other.load().unwrap(), ConnectionIntent::IDLE);
    }

    #[test]
    fn test_wrong_type_is_corrupt() {
        let (backend, intents) = store();
        backend
            .set_many(
                "group.test",
                &[(KEY_SHOULD_BE_CONNECTED, toml::Value::String("yes".into()))],
            )
            .unwrap();
        assert!(matches!(intents.load(), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_connection_update() {
        let (_, intents) = store();
        assert_eq!(intents.connection_update().unwrap(), None);

        intents.set_connection_update("{\"byte_in\":10}").unwrap();
        assert_eq!(
            intents.connection_update().unwrap().as_deref(),
            Some("{\"byte_in\":10}")
        );
    }
}
