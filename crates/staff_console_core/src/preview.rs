use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use uuid::Uuid;

use crate::models::SelectedFile;

pub const PREVIEW_SCHEME: &str = "blob:staff-console/";

/// Page-lifetime references to selected file bytes, the equivalent of
/// `URL.createObjectURL` / `URL.revokeObjectURL`.
pub trait PreviewRegistry: Send + Sync {
    fn create(&self, file: &SelectedFile) -> String;
    fn revoke(&self, url: &str);
    fn resolve(&self, url: &str) -> Option<Arc<Vec<u8>>>;
    fn live_count(&self) -> usize;
}

pub fn is_local_preview(url: &str) -> bool {
    url.starts_with(PREVIEW_SCHEME)
}

#[derive(Default)]
pub struct ObjectUrlRegistry {
    entries: Mutex<HashMap<String, Arc<Vec<u8>>>>,
}

impl ObjectUrlRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreviewRegistry for ObjectUrlRegistry {
    fn create(&self, file: &SelectedFile) -> String {
        let url = format!("{PREVIEW_SCHEME}{}", Uuid::new_v4());
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(url.clone(), Arc::clone(&file.bytes));
        }
        url
    }

    fn revoke(&self, url: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(url);
        }
    }

    fn resolve(&self, url: &str) -> Option<Arc<Vec<u8>>> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(url).cloned())
    }

    fn live_count(&self) -> usize {
        self.entries
            .lock()
            .map(|entries| entries.len())
            .unwrap_or_default()
    }
}
