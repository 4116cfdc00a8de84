//! In-process snapshot store. Contents are lost on restart.

use std::collections::HashMap;
use std::sync::RwLock;

use super::{SnapshotStore, StoreError};

#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshots: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> StoreError {
    StoreError::DatabaseError("memory store lock poisoned".into())
}

impl SnapshotStore for MemoryStore {
    fn get(&self, room_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let snapshots = self.snapshots.read().map_err(|_| poisoned())?;
        Ok(snapshots.get(room_id).cloned())
    }

    fn put(&self, room_id: &str, snapshot: &[u8]) -> Result<(), StoreError> {
        let mut snapshots = self.snapshots.write().map_err(|_| poisoned())?;
        snapshots.insert(room_id.to_string(), snapshot.to_vec());
        Ok(())
    }

    fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
        let snapshots = self.snapshots.read().map_err(|_| poisoned())?;
        Ok(snapshots.keys().cloned().collect())
    }
}
