//! TOML file backed key-value store
//!
//! Each group is one `<group>.toml` file in the state directory. Updates are
//! written to a temporary file next to it and renamed over the old file, so
//! readers never observe a half written batch.

use crate::error::StoreError;
use crate::store::KeyValueStore;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Durable store rooted at a state directory
#[derive(Debug)]
pub struct TomlFileStore {
    dir: PathBuf,
    // Serializes read-modify-write cycles within this process
    write_lock: Mutex<()>,
}

impl TomlFileStore {
    /// Create a store rooted at `dir`, creating the directory if needed
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::Write {
            group: String::new(),
            reason: format!("Failed to create state directory {:?}: {}", dir, e),
        })?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn group_path(&self, group: &str) -> PathBuf {
        self.dir.join(format!("{}.toml", group))
    }

    fn read_table(&self, group: &str) -> Result<toml::Table, StoreError> {
        let path = self.group_path(group);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(toml::Table::new());
            }
            Err(e) => {
                return Err(StoreError::Read {
                    group: group.to_string(),
                    reason: e.to_string(),
                })
            }
        };

        contents.parse::<toml::Table>().map_err(|e| {
            warn!(group, path = ?path, "State file failed to parse");
            StoreError::Corrupt {
                group: group.to_string(),
                reason: e.to_string(),
            }
        })
    }

    fn write_table(&self, group: &str, table: &toml::Table) -> Result<(), StoreError> {
        let write_error = |reason: String| StoreError::Write {
            group: group.to_string(),
            reason,
        };

        let contents = toml::to_string(table).map_err(|e| write_error(e.to_string()))?;

        let mut temp = tempfile::NamedTempFile::new_in(&self.dir)
            .map_err(|e| write_error(format!("Failed to create temp file: {}", e)))?;
        temp.write_all(contents.as_bytes())
            .map_err(|e| write_error(e.to_string()))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| write_error(e.to_string()))?;
        temp.persist(self.group_path(group))
            .map_err(|e| write_error(format!("Failed to replace state file: {}", e.error)))?;

        debug!(group, "State file replaced");
        Ok(())
    }
}

impl KeyValueStore for TomlFileStore {
    fn get(&self, group: &str, key: &str) -> Result<Option<toml::Value>, StoreError> {
        Ok(self.read_table(group)?.get(key).cloned())
    }

    fn set_many(&self, group: &str, entries: &[(&str, toml::Value)]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Write {
            group: group.to_string(),
            reason: "store lock poisoned".to_string(),
        })?;

        let mut table = self.read_table(group)?;
        for (key, value) in entries {
            table.insert(key.to_string(), value.clone());
        }
        self.write_table(group, &table)
    }

    fn remove(&self, group: &str, key: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Write {
            group: group.to_string(),
            reason: "store lock poisoned".to_string(),
        })?;

        let mut table = self.read_table(group)?;
        if table.remove(key).is_some() {
            self.write_table(group, &table)?;
        }
        Ok(())
    }
}
