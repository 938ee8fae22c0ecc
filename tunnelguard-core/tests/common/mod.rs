//! Shared fixtures for controller integration tests
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tunnelguard_core::error::StoreError;
use tunnelguard_core::store::{KeyValueStore, MemoryStore, PersistedIntentStore};
use tunnelguard_core::tunnel::{SimulatedProvider, Stage};
use tunnelguard_core::types::{ConnectionIntent, IdentityParams};
use tunnelguard_core::SessionController;

pub const PROVIDER_ID: &str = "net.example.tunnel";
pub const GROUP_ID: &str = "group.net.example";

pub fn identity() -> IdentityParams {
    IdentityParams::new(PROVIDER_ID, "Example VPN", GROUP_ID)
}

/// Controller wired to a simulated provider and an in-memory store
pub struct Harness {
    pub provider: SimulatedProvider,
    pub store: MemoryStore,
    pub controller: SessionController,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(SimulatedProvider::new(), MemoryStore::new())
    }

    pub fn autonomous() -> Self {
        Self::with(SimulatedProvider::autonomous(), MemoryStore::new())
    }

    pub fn with(provider: SimulatedProvider, store: MemoryStore) -> Self {
        let controller =
            SessionController::new(Arc::new(provider.clone()), Arc::new(store.clone()));
        Self {
            provider,
            store,
            controller,
        }
    }

    /// Intent as it is on "disk"
    pub fn persisted_intent(&self) -> ConnectionIntent {
        PersistedIntentStore::new(Arc::new(self.store.clone()), GROUP_ID)
            .load()
            .unwrap()
    }

    pub async fn intent(&self) -> ConnectionIntent {
        self.controller.snapshot().await.unwrap().intent
    }
}

/// Let every ready task run without reaching the controller's timers
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Every stage delivered so far
pub fn drain(stages: &mut mpsc::UnboundedReceiver<Stage>) -> Vec<Stage> {
    let mut seen = Vec::new();
    while let Ok(stage) = stages.try_recv() {
        seen.push(stage);
    }
    seen
}

/// Store whose writes can be switched to fail
#[derive(Clone, Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_writes: Arc<AtomicBool>,
}

impl FlakyStore {
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl KeyValueStore for FlakyStore {
    fn get(&self, group: &str, key: &str) -> Result<Option<toml::Value>, StoreError> {
        self.inner.get(group, key)
    }

    fn set_many(&self, group: &str, entries: &[(&str, toml::Value)]) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Write {
                group: group.to_string(),
                reason: "disk full".to_string(),
            });
        }
        self.inner.set_many(group, entries)
    }

    fn remove(&self, group: &str, key: &str) -> Result<(), StoreError> {
        self.inner.remove(group, key)
    }
}
