//! In-memory snapshot storage.

use super::{BoxFuture, Storage, StorageError, StorageResult};
use std::collections::HashMap;
use std::sync::RwLock;

/// Snapshots kept in a map; lost when dropped.
#[derive(Default)]
pub struct MemoryStorage {
    snapshots: RwLock<HashMap<String, Vec<u8>>>,
}

fn lock_error<E: std::fmt::Display>(e: E) -> StorageError {
    StorageError::Other(format!("Lock error: {e}"))
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn save(&self, id: &str, snapshot: &[u8]) -> BoxFuture<'_, StorageResult<()>> {
        let result = self
            .snapshots
            .write()
            .map(|mut snapshots| {
                snapshots.insert(id.to_string(), snapshot.to_vec());
            })
            .map_err(lock_error);
        Box::pin(async move { result })
    }

    fn load(&self, id: &str) -> BoxFuture<'_, StorageResult<Vec<u8>>> {
        let result = match self.snapshots.read() {
            Ok(snapshots) => snapshots
                .get(id)
                .cloned()
                .ok_or_else(|| StorageError::NotFound(id.to_string())),
            Err(e) => Err(lock_error(e)),
        };
        Box::pin(async move { result })
    }

    fn delete(&self, id: &str) -> BoxFuture<'_, StorageResult<()>> {
        let result = self
            .snapshots
            .write()
            .map(|mut snapshots| {
                snapshots.remove(id);
            })
            .map_err(lock_error);
        Box::pin(async move { result })
    }

    fn list(&self) -> BoxFuture<'_, StorageResult<Vec<String>>> {
        let result = self
            .snapshots
            .read()
            .map(|snapshots| {
                let mut ids: Vec<String> = snapshots.keys().cloned().collect();
                ids.sort();
                ids
            })
            .map_err(lock_error);
        Box::pin(async move { result })
    }

    fn exists(&self, id: &str) -> BoxFuture<'_, StorageResult<bool>> {
        let result = self
            .snapshots
            .read()
            .map(|snapshots| snapshots.contains_key(id))
            .map_err(lock_error);
        Box::pin(async move { result })
    }
}
