//! In-memory backend used when no durable storage is available.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::backend::{Collection, StoreBackend};
use crate::error::StoreError;

#[derive(Default)]
pub struct MemoryBackend {
    collections: Mutex<HashMap<Collection, Vec<(String, Vec<u8>)>>>,
    quota_bytes: Option<u64>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject writes that would push total stored bytes past `quota_bytes`.
    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::default()
        }
    }

    fn collections(&self) -> MutexGuard<'_, HashMap<Collection, Vec<(String, Vec<u8>)>>> {
        self.collections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn is_durable(&self) -> bool {
        false
    }

    async fn probe(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get(&self, collection: Collection, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let collections = self.collections();
        Ok(collections
            .get(&collection)
            .and_then(|entries| entries.iter().find(|(k, _)| k == key))
            .map(|(_, v)| v.clone()))
    }

    async fn put(
        &self,
        collection: Collection,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), StoreError> {
        let mut collections = self.collections();

        if let Some(quota) = self.quota_bytes {
            let used: u64 = collections
                .values()
                .flatten()
                .map(|(_, v)| v.len() as u64)
                .sum();
            let replaced = collections
                .get(&collection)
                .and_then(|entries| entries.iter().find(|(k, _)| k == key))
                .map(|(_, v)| v.len() as u64)
                .unwrap_or(0);
            let needed = value.len() as u64;
            if used - replaced + needed > quota {
                return Err(StoreError::QuotaExceeded {
                    needed,
                    capacity: quota,
                });
            }
        }

        let entries = collections.entry(collection).or_default();
        match entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => entries.push((key.to_string(), value)),
        }
        Ok(())
    }

    async fn delete(&self, collection: Collection, key: &str) -> Result<bool, StoreError> {
        let mut collections = self.collections();
        let Some(entries) = collections.get_mut(&collection) else {
            return Ok(false);
        };
        let before = entries.len();
        entries.retain(|(k, _)| k != key);
        Ok(entries.len() != before)
    }

    async fn scan(&self, collection: Collection) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        Ok(self
            .collections()
            .get(&collection)
            .cloned()
            .unwrap_or_default())
    }

    async fn clear(&self, collection: Collection) -> Result<(), StoreError> {
        self.collections().remove(&collection);
        Ok(())
    }
}
