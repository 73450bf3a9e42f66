use std::{collections::BTreeMap, fs, path::PathBuf, sync::Mutex};

use serde::{Deserialize, Serialize};

use super::{SessionStorage, StorageError};

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionFile {
    schema_version: u32,
    #[serde(default)]
    entries: BTreeMap<String, String>,
}

impl Default for SessionFile {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

/// Session storage backed by a single JSON file, so entries survive a host
/// reload until the console session is ended with `clear`.
pub struct FileSessionStorage {
    file_path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSessionStorage {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            file_path: base_dir.join("staff-console-session.json"),
            write_lock: Mutex::new(()),
        }
    }

    /// Rewrites an older session file at the current schema version.
    pub fn migrate_if_needed(&self) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().map_err(|_| StorageError::Unavailable)?;
        let mut state = self.read_state()?;
        if state.schema_version < CURRENT_SCHEMA_VERSION {
            state.schema_version = CURRENT_SCHEMA_VERSION;
            self.write_state(&state)?;
        }
        Ok(())
    }

    pub fn file_path(&self) -> &PathBuf {
        &self.file_path
    }

    fn update<F>(&self, mutate: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut BTreeMap<String, String>),
    {
        let _guard = self.write_lock.lock().map_err(|_| StorageError::Unavailable)?;
        let mut state = self.read_state()?;
        mutate(&mut state.entries);
        self.write_state(&state)
    }

    fn read_state(&self) -> Result<SessionFile, StorageError> {
        if !self.file_path.exists() {
            return Ok(SessionFile::default());
        }

        let raw = fs::read_to_string(&self.file_path).map_err(|error| {
            StorageError::Io(format!(
                "failed to read {}: {error}",
                self.file_path.display()
            ))
        })?;

        if raw.trim().is_empty() {
            return Ok(SessionFile::default());
        }

        let state: SessionFile = serde_json::from_str(&raw)?;
        if state.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchema {
                found: state.schema_version,
                supported: CURRENT_SCHEMA_VERSION,
            });
        }
        Ok(state)
    }

    fn write_state(&self, state: &SessionFile) -> Result<(), StorageError> {
        self.ensure_parent_dir()?;
        let tmp_path = self.file_path.with_extension("tmp");

        let serialized = serde_json::to_string_pretty(state)?;
        fs::write(&tmp_path, serialized).map_err(|error| {
            StorageError::Io(format!("failed to write {}: {error}", tmp_path.display()))
        })?;
        fs::rename(&tmp_path, &self.file_path).map_err(|error| {
            StorageError::Io(format!(
                "failed to atomically move {} to {}: {error}",
                tmp_path.display(),
                self.file_path.display()
            ))
        })
    }

    fn ensure_parent_dir(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.file_path.parent() {
            fs::create_dir_all(parent).map_err(|error| {
                StorageError::Io(format!("failed to create {}: {error}", parent.display()))
            })?;
        }
        Ok(())
    }
}

impl SessionStorage for FileSessionStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.read_state()?.entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.update(|entries| {
            entries.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.update(|entries| {
            entries.remove(key);
        })
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.update(|entries| entries.clear())
    }
}
