//! Expiring snapshots of in-progress form values.
//!
//! A snapshot is written under a caller-chosen key as
//! `{"timestamp": <ms>, "data": <values>}`. Reads treat anything absent,
//! unparsable or older than the expiry window as missing. Storage failures
//! are logged and swallowed so persistence can never block editing.

use std::sync::Arc;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    clock::{Clock, SystemClock},
    storage::SessionStorage,
};

pub const DEFAULT_EXPIRY_MINUTES: i64 = 1440;
/// One year; longer windows are rejected at configuration time.
pub const MAX_EXPIRY_MINUTES: i64 = 525_600;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot<T> {
    pub timestamp: i64,
    pub data: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistOptions {
    pub expiry_minutes: i64,
}

impl Default for PersistOptions {
    fn default() -> Self {
        Self {
            expiry_minutes: DEFAULT_EXPIRY_MINUTES,
        }
    }
}

/// Guard for the first change notification after mount, which carries the
/// blank initial values and must not overwrite a snapshot about to be
/// restored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountLatch {
    AwaitingFirstEffect,
    Active,
}

impl MountLatch {
    /// Returns `true` once the latch has already fired.
    fn consume(&mut self) -> bool {
        match self {
            Self::AwaitingFirstEffect => {
                *self = Self::Active;
                false
            }
            Self::Active => true,
        }
    }
}

pub struct FormPersist {
    key: String,
    storage: Arc<dyn SessionStorage>,
    clock: Arc<dyn Clock>,
    options: PersistOptions,
    latch: MountLatch,
}

impl FormPersist {
    pub fn new(storage: Arc<dyn SessionStorage>, key: impl Into<String>) -> Self {
        Self::with_clock(storage, key, Arc::new(SystemClock), PersistOptions::default())
    }

    pub fn with_clock(
        storage: Arc<dyn SessionStorage>,
        key: impl Into<String>,
        clock: Arc<dyn Clock>,
        options: PersistOptions,
    ) -> Self {
        Self {
            key: key.into(),
            storage,
            clock,
            options,
            latch: MountLatch::AwaitingFirstEffect,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn latch(&self) -> MountLatch {
        self.latch
    }

    /// Change-triggered persistence. The first call after construction only
    /// arms the latch.
    pub fn on_values_changed<T: Serialize + ?Sized>(&mut self, values: &T) {
        if !self.latch.consume() {
            debug!(key = %self.key, "skipping persistence on initial mount");
            return;
        }
        self.persist(values);
    }

    pub fn persist<T: Serialize + ?Sized>(&self, values: &T) {
        let snapshot = Snapshot {
            timestamp: self.clock.now_millis(),
            data: values,
        };

        let serialized = match serde_json::to_string(&snapshot) {
            Ok(value) => value,
            Err(error) => {
                warn!(key = %self.key, %error, "failed to serialize form snapshot");
                return;
            }
        };

        if let Err(error) = self.storage.set(&self.key, &serialized) {
            warn!(key = %self.key, %error, "failed to persist form snapshot");
        }
    }

    pub fn restore<T: DeserializeOwned>(&self) -> Option<T> {
        let raw = match self.storage.get(&self.key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(error) => {
                warn!(key = %self.key, %error, "failed to read form snapshot");
                return None;
            }
        };

        let snapshot = match serde_json::from_str::<Snapshot<Value>>(&raw) {
            Ok(snapshot) => snapshot,
            Err(error) => {
                debug!(key = %self.key, %error, "ignoring malformed form snapshot");
                return None;
            }
        };

        if self.is_expired(snapshot.timestamp) {
            debug!(key = %self.key, "discarding expired form snapshot");
            self.clear();
            return None;
        }

        match serde_json::from_value(snapshot.data) {
            Ok(data) => Some(data),
            Err(error) => {
                debug!(key = %self.key, %error, "form snapshot does not match the requested shape");
                None
            }
        }
    }

    pub fn clear(&self) {
        if let Err(error) = self.storage.remove(&self.key) {
            warn!(key = %self.key, %error, "failed to clear form snapshot");
        }
    }

    fn is_expired(&self, timestamp: i64) -> bool {
        // Timestamps come from storage and may hold any i64.
        let age_millis = self.clock.now_millis().saturating_sub(timestamp);
        age_millis > self.options.expiry_minutes.saturating_mul(60_000)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{clock::ManualClock, storage::MemoryStorage};

    const NOW: i64 = 1_700_000_000_000;

    fn fixture() -> (Arc<MemoryStorage>, Arc<ManualClock>, FormPersist) {
        let storage = Arc::new(MemoryStorage::new());
        let clock = Arc::new(ManualClock::new(NOW));
        let persist = FormPersist::with_clock(
            storage.clone(),
            "doctor-form:new",
            clock.clone(),
            PersistOptions::default(),
        );
        (storage, clock, persist)
    }

    fn write_aged_snapshot(storage: &MemoryStorage, minutes_old: i64, data: Value) {
        let raw = json!({ "timestamp": NOW - minutes_old * 60_000, "data": data }).to_string();
        storage.set("doctor-form:new", &raw).unwrap();
    }

    #[test]
    fn first_change_after_mount_keeps_existing_snapshot() {
        let (storage, _clock, mut persist) = fixture();
        write_aged_snapshot(&storage, 5, json!(["Ada", "Lovelace"]));

        persist.on_values_changed(&json!(["", ""]));
        assert_eq!(persist.latch(), MountLatch::Active);
        assert_eq!(
            persist.restore::<Value>(),
            Some(json!(["Ada", "Lovelace"]))
        );

        persist.on_values_changed(&json!(["Grace", "Hopper"]));
        assert_eq!(
            persist.restore::<Value>(),
            Some(json!(["Grace", "Hopper"]))
        );
    }

    #[test]
    fn persist_then_restore_round_trips() {
        let (_storage, _clock, persist) = fixture();
        let values = (String::from("Ada"), 12_u32, vec![String::from("MBBS")]);

        persist.persist(&values);
        assert_eq!(persist.restore::<(String, u32, Vec<String>)>(), Some(values));
    }

    #[test]
    fn snapshot_inside_window_is_restored() {
        let (storage, _clock, persist) = fixture();
        write_aged_snapshot(&storage, 1439, json!(["kept"]));

        assert_eq!(persist.restore::<Value>(), Some(json!(["kept"])));
        assert!(storage.get("doctor-form:new").unwrap().is_some());
    }

    #[test]
    fn expired_snapshot_is_removed() {
        let (storage, _clock, persist) = fixture();
        write_aged_snapshot(&storage, 1441, json!(["stale"]));

        assert_eq!(persist.restore::<Value>(), None);
        assert_eq!(storage.get("doctor-form:new").unwrap(), None);
    }

    #[test]
    fn snapshot_expires_as_clock_advances() {
        let (_storage, clock, persist) = fixture();
        persist.persist(&json!(["draft"]));

        clock.advance_minutes(DEFAULT_EXPIRY_MINUTES);
        assert!(persist.restore::<Value>().is_some());

        clock.advance_minutes(1);
        assert!(persist.restore::<Value>().is_none());
    }

    #[test]
    fn malformed_entries_read_as_absent() {
        let (storage, _clock, persist) = fixture();

        storage.set("doctor-form:new", "not json").unwrap();
        assert_eq!(persist.restore::<Value>(), None);

        storage
            .set("doctor-form:new", &json!({ "data": [1] }).to_string())
            .unwrap();
        assert_eq!(persist.restore::<Value>(), None);

        persist.persist(&json!(["text"]));
        assert_eq!(persist.restore::<Vec<u32>>(), None);
    }

    #[test]
    fn extreme_timestamps_never_overflow() {
        let (storage, _clock, persist) = fixture();
        storage
            .set(
                "doctor-form:new",
                &json!({ "timestamp": i64::MIN, "data": [1] }).to_string(),
            )
            .unwrap();
        assert_eq!(persist.restore::<Value>(), None);
        assert_eq!(storage.get("doctor-form:new").unwrap(), None);

        let unbounded = FormPersist::with_clock(
            storage.clone(),
            "doctor-form:new",
            Arc::new(ManualClock::new(NOW)),
            PersistOptions {
                expiry_minutes: i64::MAX,
            },
        );
        write_aged_snapshot(&storage, 60 * 24 * 365, json!(["old"]));
        assert_eq!(unbounded.restore::<Value>(), Some(json!(["old"])));
    }

    #[test]
    fn snapshot_from_ahead_of_the_clock_is_kept() {
        let (_storage, clock, persist) = fixture();
        persist.persist(&json!(["draft"]));

        clock.set(NOW - 10 * 60_000);
        assert_eq!(persist.restore::<Value>(), Some(json!(["draft"])));
    }

    #[test]
    fn clear_then_restore_finds_nothing() {
        let (_storage, _clock, persist) = fixture();
        persist.persist(&json!([1, 2, 3]));

        persist.clear();
        assert_eq!(persist.restore::<Value>(), None);
    }

    #[test]
    fn storage_failures_are_swallowed() {
        let (storage, _clock, mut persist) = fixture();
        storage.fail_writes(true);

        persist.on_values_changed(&json!(["a"]));
        persist.on_values_changed(&json!(["b"]));
        persist.persist(&json!(["c"]));
        assert_eq!(persist.restore::<Value>(), None);
    }

    #[test]
    fn envelope_matches_wire_layout() {
        let (storage, _clock, persist) = fixture();
        persist.persist(&json!(["Ada", 3]));

        let raw = storage.get("doctor-form:new").unwrap().unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value, json!({ "timestamp": NOW, "data": ["Ada", 3] }));
    }
}
