//! Persistence collaborator for identity records.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::StorageError;
use crate::identity::IdentityRecord;

/// Where identity records go when an identity retires, and where they come
/// from at start-up.
///
/// Implement this trait to back the tracker with a database, files or a
/// remote service. Failures on `persist` are logged by the tracker and never
/// stop frame processing.
pub trait IdentityStorage: Send {
    /// Write or overwrite the record with `record.id`.
    fn persist(&mut self, record: &IdentityRecord) -> Result<(), StorageError>;

    /// Delete the record with `id`. Deleting an id that was never stored is
    /// not an error.
    fn remove(&mut self, id: u64) -> Result<(), StorageError>;

    /// Every stored record, in any order.
    fn load_all(&mut self) -> Result<Vec<IdentityRecord>, StorageError>;
}

/// In-process storage. Clones share the same records, so a test can keep a
/// handle while the tracker owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    records: Arc<Mutex<BTreeMap<u64, IdentityRecord>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage pre-filled with `records`, as if saved by an earlier session.
    pub fn with_records(records: impl IntoIterator<Item = IdentityRecord>) -> Self {
        let storage = Self::new();
        storage
            .records
            .lock()
            .extend(records.into_iter().map(|record| (record.id, record)));
        storage
    }

    pub fn get(&self, id: u64) -> Option<IdentityRecord> {
        self.records.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl IdentityStorage for MemoryStorage {
    fn persist(&mut self, record: &IdentityRecord) -> Result<(), StorageError> {
        self.records.lock().insert(record.id, record.clone());
        Ok(())
    }

    fn remove(&mut self, id: u64) -> Result<(), StorageError> {
        self.records.lock().remove(&id);
        Ok(())
    }

    fn load_all(&mut self) -> Result<Vec<IdentityRecord>, StorageError> {
        Ok(self.records.lock().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Sample;
    use chrono::{TimeZone, Utc};
    use ndarray::array;

    fn record(id: u64) -> IdentityRecord {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        IdentityRecord {
            id,
            display_name: None,
            samples: vec![Sample::new(array![0.5, 0.5], now)],
            sample_count: 1,
            created_at: now,
            last_seen_at: now,
            plugin_results: BTreeMap::new(),
        }
    }

    #[test]
    fn test_clones_share_records() {
        let handle = MemoryStorage::with_records([record(1)]);
        let mut owned = handle.clone();

        owned.persist(&record(2)).unwrap();
        assert_eq!(handle.len(), 2);
        assert_eq!(owned.load_all().unwrap().len(), 2);
        assert_eq!(handle.get(2), Some(record(2)));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut storage = MemoryStorage::with_records([record(1), record(2)]);
        storage.remove(1).unwrap();
        storage.remove(1).unwrap();
        storage.remove(9).unwrap();
        assert_eq!(storage.get(1), None);
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn test_record_survives_json() {
        let json = serde_json::to_string(&record(4)).unwrap();
        let back: IdentityRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record(4));
    }
}
