use std::sync::Arc;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::storage::{SessionStorage, StorageError};

/// Open/closed flag for an inline form, kept across a host reload.
///
/// The key holds the JSON literal `true` while open and is absent otherwise.
pub struct FormVisibility {
    key: String,
    storage: Arc<dyn SessionStorage>,
    is_open: bool,
}

impl FormVisibility {
    pub fn new(storage: Arc<dyn SessionStorage>, key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            storage,
            is_open: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    pub fn set_visibility(&mut self, open: bool) {
        self.is_open = open;
        let result = if open {
            self.storage.set(&self.key, "true")
        } else {
            self.storage.remove(&self.key)
        };
        if let Err(error) = result {
            warn!(key = %self.key, %error, "failed to persist form visibility");
        }
    }

    pub fn restore_state(&mut self) {
        match self.storage.get(&self.key) {
            Ok(Some(raw)) => {
                if serde_json::from_str::<bool>(&raw).unwrap_or(false) {
                    self.is_open = true;
                }
            }
            Ok(None) => {}
            Err(error) => warn!(key = %self.key, %error, "failed to read form visibility"),
        }
    }

    pub fn clear_state(&mut self) {
        self.is_open = false;
        if let Err(error) = self.storage.remove(&self.key) {
            warn!(key = %self.key, %error, "failed to clear form visibility");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedModal<T> {
    pub open: bool,
    pub data: Option<T>,
}

/// Modal visibility together with the record being edited.
///
/// Only `open` with a payload is ever written; any other combination removes
/// the entry, so a reload can never reopen an edit modal with nothing in it.
pub struct ModalState<T> {
    key: String,
    storage: Arc<dyn SessionStorage>,
    is_open: bool,
    edit_data: Option<T>,
}

impl<T> ModalState<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    pub fn new(storage: Arc<dyn SessionStorage>, key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            storage,
            is_open: false,
            edit_data: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    pub fn edit_data(&self) -> Option<&T> {
        self.edit_data.as_ref()
    }

    pub fn set_visibility(&mut self, open: bool, data: Option<T>) {
        self.is_open = open;
        self.edit_data = data;

        match (open, self.edit_data.as_ref()) {
            (true, Some(data)) => self.write(data),
            _ => self.remove(),
        }
    }

    /// Applies the persisted entry, if a valid one exists. Intended to run
    /// once when the owning view mounts.
    pub fn restore_state(&mut self) {
        let raw = match self.storage.get(&self.key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return,
            Err(error) => {
                warn!(key = %self.key, %error, "failed to read modal state");
                return;
            }
        };

        match serde_json::from_str::<PersistedModal<T>>(&raw) {
            Ok(PersistedModal {
                open: true,
                data: Some(data),
            }) => {
                self.is_open = true;
                self.edit_data = Some(data);
            }
            Ok(_) => debug!(key = %self.key, "ignoring incomplete modal state"),
            Err(error) => debug!(key = %self.key, %error, "ignoring malformed modal state"),
        }
    }

    pub fn clear_state(&mut self) {
        self.is_open = false;
        self.edit_data = None;
        self.remove();
    }

    fn write(&self, data: &T) {
        let entry = PersistedModal {
            open: true,
            data: Some(data),
        };
        let result = serde_json::to_string(&entry)
            .map_err(StorageError::from)
            .and_then(|serialized| self.storage.set(&self.key, &serialized));
        if let Err(error) = result {
            warn!(key = %self.key, %error, "failed to persist modal state");
        }
    }

    fn remove(&self) {
        if let Err(error) = self.storage.remove(&self.key) {
            warn!(key = %self.key, %error, "failed to remove modal state");
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::storage::MemoryStorage;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct EditTarget {
        id: String,
        name: String,
    }

    fn target() -> EditTarget {
        EditTarget {
            id: "doc-7".to_string(),
            name: "Dr. Mensah".to_string(),
        }
    }

    #[test]
    fn simple_flag_survives_reload() {
        let storage = Arc::new(MemoryStorage::new());
        let mut visibility = FormVisibility::new(storage.clone(), "doctors:add-form");
        visibility.set_visibility(true);
        assert_eq!(
            storage.get("doctors:add-form").unwrap().as_deref(),
            Some("true")
        );

        let mut reloaded = FormVisibility::new(storage.clone(), "doctors:add-form");
        reloaded.restore_state();
        assert!(reloaded.is_open());

        reloaded.set_visibility(false);
        assert_eq!(storage.get("doctors:add-form").unwrap(), None);
    }

    #[test]
    fn simple_flag_clear_resets_everything() {
        let storage = Arc::new(MemoryStorage::new());
        let mut visibility = FormVisibility::new(storage.clone(), "doctors:add-form");
        visibility.set_visibility(true);

        visibility.clear_state();
        assert!(!visibility.is_open());

        let mut reloaded = FormVisibility::new(storage, "doctors:add-form");
        reloaded.restore_state();
        assert!(!reloaded.is_open());
    }

    #[test]
    fn open_with_payload_is_persisted() {
        let storage = Arc::new(MemoryStorage::new());
        let mut modal = ModalState::new(storage.clone(), "doctors:edit-modal");
        modal.set_visibility(true, Some(target()));

        let raw = storage.get("doctors:edit-modal").unwrap().unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(
            value,
            json!({ "open": true, "data": { "id": "doc-7", "name": "Dr. Mensah" } })
        );

        let mut reloaded = ModalState::<EditTarget>::new(storage, "doctors:edit-modal");
        reloaded.restore_state();
        assert!(reloaded.is_open());
        assert_eq!(reloaded.edit_data(), Some(&target()));
    }

    #[test]
    fn open_without_payload_removes_entry() {
        let storage = Arc::new(MemoryStorage::new());
        let mut modal = ModalState::new(storage.clone(), "doctors:edit-modal");
        modal.set_visibility(true, Some(target()));

        modal.set_visibility(true, None);
        assert!(modal.is_open());
        assert_eq!(storage.get("doctors:edit-modal").unwrap(), None);
    }

    #[test]
    fn closing_never_stores_false() {
        let storage = Arc::new(MemoryStorage::new());
        let mut modal = ModalState::new(storage.clone(), "doctors:edit-modal");
        modal.set_visibility(false, Some(target()));

        assert!(!modal.is_open());
        assert_eq!(storage.get("doctors:edit-modal").unwrap(), None);
    }

    #[test]
    fn persisted_entry_without_data_reads_as_none() {
        let entry: PersistedModal<EditTarget> =
            serde_json::from_value(json!({ "open": true })).unwrap();
        assert_eq!(
            entry,
            PersistedModal {
                open: true,
                data: None
            }
        );
    }

    #[test]
    fn restore_ignores_inconsistent_entries() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .set("doctors:edit-modal", &json!({ "open": true }).to_string())
            .unwrap();
        let mut modal = ModalState::<EditTarget>::new(storage.clone(), "doctors:edit-modal");
        modal.restore_state();
        assert!(!modal.is_open());

        storage
            .set(
                "doctors:edit-modal",
                &json!({ "open": false, "data": { "id": "x", "name": "y" } }).to_string(),
            )
            .unwrap();
        modal.restore_state();
        assert!(!modal.is_open());

        storage.set("doctors:edit-modal", "{{").unwrap();
        modal.restore_state();
        assert!(modal.edit_data().is_none());
    }

    #[test]
    fn clear_state_leaves_nothing_to_restore() {
        let storage = Arc::new(MemoryStorage::new());
        let mut modal = ModalState::new(storage.clone(), "doctors:edit-modal");
        modal.set_visibility(true, Some(target()));

        modal.clear_state();
        assert!(!modal.is_open());
        assert!(modal.edit_data().is_none());

        let mut reloaded = ModalState::<EditTarget>::new(storage, "doctors:edit-modal");
        reloaded.restore_state();
        assert!(!reloaded.is_open());
    }
}
