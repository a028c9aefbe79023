//! Capacity-bounded local cache of photos, embeddings and metadata.
//!
//! Every cached photo id owns up to three records (one per collection).
//! The store tracks how recently each id was read and, when a write pushes
//! the cache past its record or byte ceiling, evicts the least recently
//! accessed ids until it fits again.

mod backend;
mod memory;
mod records;
mod schema;
mod sqlite;

pub use backend::{Collection, StoreBackend};
pub use memory::MemoryBackend;
pub use records::{path_in_dir, CachedPhotoRecord, EmbeddingRecord, MetadataRecord};
pub use sqlite::SqliteBackend;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::error::StoreError;
use records::{bytes_to_embedding, embedding_to_bytes};

/// Record and byte ceilings for the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
    pub max_records: usize,
    pub max_bytes: u64,
}

impl From<&StoreConfig> for StoreLimits {
    fn from(config: &StoreConfig) -> Self {
        Self {
            max_records: config.max_records,
            max_bytes: config.max_bytes,
        }
    }
}

/// Snapshot of cache usage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub entries: usize,
    pub bytes: u64,
    pub limits: StoreLimits,
    pub durable: bool,
}

#[derive(Debug, Clone, Default)]
struct IndexEntry {
    last_accessed: DateTime<Utc>,
    /// Breaks ties between accesses within the same timestamp.
    tick: u64,
    bytes: [u64; 3],
}

impl IndexEntry {
    fn total(&self) -> u64 {
        self.bytes.iter().sum()
    }
}

#[derive(Debug, Default)]
struct CacheIndex {
    entries: HashMap<String, IndexEntry>,
    tick: u64,
}

impl CacheIndex {
    fn total_bytes(&self) -> u64 {
        self.entries.values().map(IndexEntry::total).sum()
    }

    fn touch(&mut self, id: &str, at: DateTime<Utc>) {
        self.tick += 1;
        let tick = self.tick;
        let entry = self.entries.entry(id.to_string()).or_default();
        entry.last_accessed = at;
        entry.tick = tick;
    }

    fn set_bytes(&mut self, id: &str, collection: Collection, bytes: u64) {
        if let Some(slot) = slot_of(collection) {
            self.entries.entry(id.to_string()).or_default().bytes[slot] = bytes;
        }
    }

    fn over_limits(&self, limits: &StoreLimits) -> bool {
        self.entries.len() > limits.max_records || self.total_bytes() > limits.max_bytes
    }

    /// Least recently accessed id, skipping `protect`.
    fn lru_victim(&self, protect: Option<&str>) -> Option<String> {
        self.entries
            .iter()
            .filter(|(id, _)| Some(id.as_str()) != protect)
            .min_by(|a, b| {
                (a.1.last_accessed, a.1.tick).cmp(&(b.1.last_accessed, b.1.tick))
            })
            .map(|(id, _)| id.clone())
    }
}

fn slot_of(collection: Collection) -> Option<usize> {
    match collection {
        Collection::Photos => Some(0),
        Collection::Embeddings => Some(1),
        Collection::Metadata => Some(2),
        Collection::Actions => None,
    }
}

pub struct LocalStore {
    backend: Arc<dyn StoreBackend>,
    supported: bool,
    limits: StoreLimits,
    index: Mutex<CacheIndex>,
}

impl LocalStore {
    /// Open the durable cache described by `config`.
    ///
    /// Never fails: if SQLite cannot be opened the store degrades to an
    /// in-memory backend and `is_supported()` reports false.
    pub async fn open(config: &StoreConfig) -> Self {
        let limits = StoreLimits::from(config);
        match SqliteBackend::open(&config.db_path, config.quota_bytes) {
            Ok(db) => match Self::with_backend(Arc::new(db), limits).await {
                Ok(store) => return store,
                Err(e) => warn!(error = %e, "Cache database unusable, falling back to memory"),
            },
            Err(e) => warn!(error = %e, "Cache database unavailable, falling back to memory"),
        }
        Self::in_memory(limits)
    }

    /// Memory-only store; not durable, so `is_supported()` is false.
    pub fn in_memory(limits: StoreLimits) -> Self {
        Self {
            backend: Arc::new(MemoryBackend::new()),
            supported: false,
            limits,
            index: Mutex::new(CacheIndex::default()),
        }
    }

    /// Wrap an explicit backend, rebuilding the recency index from its contents.
    pub async fn with_backend(
        backend: Arc<dyn StoreBackend>,
        limits: StoreLimits,
    ) -> Result<Self, StoreError> {
        let supported = match backend.probe().await {
            Ok(()) => backend.is_durable(),
            Err(e) => {
                warn!(backend = backend.backend_name(), error = %e, "Storage probe failed");
                false
            }
        };

        let store = Self {
            backend,
            supported,
            limits,
            index: Mutex::new(CacheIndex::default()),
        };
        store.rebuild_index().await?;
        Ok(store)
    }

    async fn rebuild_index(&self) -> Result<(), StoreError> {
        let mut photos: Vec<(String, DateTime<Utc>, u64)> = Vec::new();
        for (id, bytes) in self.backend.scan(Collection::Photos).await? {
            let last_accessed = serde_json::from_slice::<CachedPhotoRecord>(&bytes)
                .map(|record| record.last_accessed)
                .unwrap_or_default();
            photos.push((id, last_accessed, bytes.len() as u64));
        }
        photos.sort_by(|a, b| a.1.cmp(&b.1));

        let mut sizes: Vec<(Collection, Vec<(String, u64)>)> = Vec::new();
        for collection in [Collection::Embeddings, Collection::Metadata] {
            let entries = self
                .backend
                .scan(collection)
                .await?
                .into_iter()
                .map(|(id, bytes)| (id, bytes.len() as u64))
                .collect();
            sizes.push((collection, entries));
        }

        let mut index = self.index();
        *index = CacheIndex::default();
        // Ids without a photo record sort as oldest
        for (collection, entries) in &sizes {
            for (id, len) in entries {
                if !index.entries.contains_key(id) {
                    index.touch(id, DateTime::<Utc>::default());
                }
                index.set_bytes(id, *collection, *len);
            }
        }
        for (id, last_accessed, len) in photos {
            index.touch(&id, last_accessed);
            index.set_bytes(&id, Collection::Photos, len);
        }
        debug!(entries = index.entries.len(), "Cache index rebuilt");
        Ok(())
    }

    fn index(&self) -> MutexGuard<'_, CacheIndex> {
        self.index.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether a durable offline cache is available.
    pub fn is_supported(&self) -> bool {
        self.supported
    }

    pub fn limits(&self) -> StoreLimits {
        self.limits
    }

    /// Backend shared with the action queue.
    pub fn backend(&self) -> Arc<dyn StoreBackend> {
        self.backend.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.index().entries.is_empty()
    }

    pub fn stats(&self) -> StoreStats {
        let index = self.index();
        StoreStats {
            entries: index.entries.len(),
            bytes: index.total_bytes(),
            limits: self.limits,
            durable: self.supported,
        }
    }

    /// Last access time of a cached id, without counting as an access.
    pub fn recency(&self, id: &str) -> Option<DateTime<Utc>> {
        self.index().entries.get(id).map(|e| e.last_accessed)
    }

    // ========================================================================
    // Photos
    // ========================================================================

    /// Cache a photo record. Storing counts as an access.
    pub async fn store_photo(&self, record: &CachedPhotoRecord) -> Result<(), StoreError> {
        let mut record = record.clone();
        record.last_accessed = Utc::now();
        let bytes = serde_json::to_vec(&record)?;
        self.write(Collection::Photos, &record.id, bytes, record.last_accessed)
            .await
    }

    /// Read a photo record, refreshing its `last_accessed`.
    pub async fn get_photo(&self, id: &str) -> Result<Option<CachedPhotoRecord>, StoreError> {
        self.touch(id).await
    }

    /// Record an access to `id`. The time lands on the photo record so
    /// that recency survives a restart; ids without one are touched in
    /// memory only.
    async fn touch(&self, id: &str) -> Result<Option<CachedPhotoRecord>, StoreError> {
        let now = Utc::now();
        let Some(bytes) = self.backend.get(Collection::Photos, id).await? else {
            self.index().touch(id, now);
            return Ok(None);
        };
        let mut record: CachedPhotoRecord = serde_json::from_slice(&bytes)?;
        record.last_accessed = now;

        let updated = serde_json::to_vec(&record)?;
        let len = updated.len() as u64;
        self.backend.put(Collection::Photos, id, updated).await?;
        let mut index = self.index();
        index.touch(id, now);
        index.set_bytes(id, Collection::Photos, len);
        Ok(Some(record))
    }

    /// All cached photo records, without touching recency.
    pub async fn cached_photos(&self) -> Result<Vec<CachedPhotoRecord>, StoreError> {
        let mut photos = Vec::new();
        for (id, bytes) in self.backend.scan(Collection::Photos).await? {
            match serde_json::from_slice(&bytes) {
                Ok(record) => photos.push(record),
                Err(e) => warn!(id = %id, error = %e, "Skipping unreadable photo record"),
            }
        }
        Ok(photos)
    }

    // ========================================================================
    // Embeddings
    // ========================================================================

    pub async fn store_embedding(&self, id: &str, vector: &[f32]) -> Result<(), StoreError> {
        let bytes = embedding_to_bytes(vector);
        self.write(Collection::Embeddings, id, bytes, Utc::now()).await
    }

    pub async fn get_embedding(&self, id: &str) -> Result<Option<Vec<f32>>, StoreError> {
        let Some(bytes) = self.backend.get(Collection::Embeddings, id).await? else {
            return Ok(None);
        };
        self.touch(id).await?;
        Ok(Some(bytes_to_embedding(&bytes)))
    }

    pub async fn all_embeddings(&self) -> Result<Vec<EmbeddingRecord>, StoreError> {
        Ok(self
            .backend
            .scan(Collection::Embeddings)
            .await?
            .into_iter()
            .map(|(id, bytes)| EmbeddingRecord::new(id, bytes_to_embedding(&bytes)))
            .collect())
    }

    // ========================================================================
    // Metadata
    // ========================================================================

    pub async fn store_metadata(
        &self,
        id: &str,
        metadata: &MetadataRecord,
    ) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(metadata)?;
        self.write(Collection::Metadata, id, bytes, Utc::now()).await
    }

    pub async fn get_metadata(&self, id: &str) -> Result<Option<MetadataRecord>, StoreError> {
        let Some(bytes) = self.backend.get(Collection::Metadata, id).await? else {
            return Ok(None);
        };
        let record = serde_json::from_slice(&bytes)?;
        self.touch(id).await?;
        Ok(Some(record))
    }

    pub async fn all_metadata(&self) -> Result<Vec<(String, MetadataRecord)>, StoreError> {
        let mut all = Vec::new();
        for (id, bytes) in self.backend.scan(Collection::Metadata).await? {
            match serde_json::from_slice(&bytes) {
                Ok(record) => all.push((id, record)),
                Err(e) => warn!(id = %id, error = %e, "Skipping unreadable metadata record"),
            }
        }
        Ok(all)
    }

    // ========================================================================
    // Removal
    // ========================================================================

    /// Drop every record held for `id`.
    pub async fn remove_photo(&self, id: &str) -> Result<(), StoreError> {
        for collection in Collection::CACHED {
            self.backend.delete(collection, id).await?;
        }
        self.index().entries.remove(id);
        Ok(())
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        for collection in Collection::CACHED {
            self.backend.clear(collection).await?;
        }
        *self.index() = CacheIndex::default();
        Ok(())
    }

    // ========================================================================
    // Capacity management
    // ========================================================================

    /// Full-overwrite write of one record, evicting on backend quota errors
    /// and then enforcing the configured ceilings.
    async fn write(
        &self,
        collection: Collection,
        id: &str,
        bytes: Vec<u8>,
        accessed: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let len = bytes.len() as u64;
        let projected = {
            let index = self.index();
            let mut sizes = index.entries.get(id).map(|e| e.bytes).unwrap_or_default();
            if let Some(slot) = slot_of(collection) {
                sizes[slot] = len;
            }
            sizes.iter().sum::<u64>()
        };
        if projected > self.limits.max_bytes {
            warn!(id = %id, needed = projected, "Entry exceeds cache capacity");
            return Err(StoreError::QuotaExceeded {
                needed: projected,
                capacity: self.limits.max_bytes,
            });
        }

        loop {
            match self.backend.put(collection, id, bytes.clone()).await {
                Ok(()) => break,
                Err(StoreError::QuotaExceeded { needed, capacity })
                    if capacity > 0 && needed > capacity =>
                {
                    return Err(StoreError::QuotaExceeded { needed, capacity });
                }
                Err(StoreError::QuotaExceeded { needed, capacity }) => {
                    if !self.evict_lru(Some(id)).await? {
                        warn!(id = %id, needed, "Quota exceeded with nothing left to evict");
                        return Err(StoreError::QuotaExceeded { needed, capacity });
                    }
                }
                Err(e) => return Err(e),
            }
        }

        {
            let mut index = self.index();
            index.touch(id, accessed);
            index.set_bytes(id, collection, len);
        }
        self.enforce_limits(id).await
    }

    /// Evict the least recently accessed entry to free backend space for
    /// another writer sharing the backend. Returns false if the cache is empty.
    pub async fn evict_one(&self) -> Result<bool, StoreError> {
        self.evict_lru(None).await
    }

    async fn evict_lru(&self, protect: Option<&str>) -> Result<bool, StoreError> {
        let Some(victim) = self.index().lru_victim(protect) else {
            return Ok(false);
        };
        debug!(victim = %victim, "Evicting to free backend quota");
        self.remove_photo(&victim).await?;
        Ok(true)
    }

    async fn enforce_limits(&self, protect: &str) -> Result<(), StoreError> {
        loop {
            let victim = {
                let index = self.index();
                if !index.over_limits(&self.limits) {
                    return Ok(());
                }
                index.lru_victim(Some(protect))
            };

            match victim {
                Some(victim) => {
                    debug!(victim = %victim, "Evicting least recently accessed entry");
                    self.remove_photo(&victim).await?;
                }
                None => {
                    // Only the entry just written is left and it alone is too big
                    let needed = self
                        .index()
                        .entries
                        .get(protect)
                        .map(IndexEntry::total)
                        .unwrap_or(0);
                    self.remove_photo(protect).await?;
                    warn!(id = %protect, needed, "Entry exceeds cache capacity");
                    return Err(StoreError::QuotaExceeded {
                        needed,
                        capacity: self.limits.max_bytes,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn limits(max_records: usize) -> StoreLimits {
        StoreLimits {
            max_records,
            max_bytes: 10 * 1024 * 1024,
        }
    }

    async fn sqlite_store(max_records: usize) -> LocalStore {
        let db = SqliteBackend::open_in_memory().unwrap();
        LocalStore::with_backend(Arc::new(db), limits(max_records))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_embedding_round_trip() {
        let store = sqlite_store(10).await;
        let vector = vec![0.25, -1.0, 3.5e-8, 42.0];
        store.store_embedding("p1", &vector).await.unwrap();
        assert_eq!(store.get_embedding("p1").await.unwrap(), Some(vector));
        assert_eq!(store.get_embedding("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_metadata_round_trip() {
        let store = sqlite_store(10).await;
        let mut metadata = MetadataRecord::new("/photos/beach.jpg");
        metadata.title = Some("Sunset at Beach".into());
        metadata.tags = BTreeSet::from(["vacation".to_string(), "sunset".to_string()]);
        metadata.favorite = true;
        metadata.exif.insert("iso".into(), serde_json::json!(200));
        metadata.exif.insert("aperture".into(), serde_json::json!(2.8));
        metadata.faces.push(serde_json::json!({"x": 10, "y": 20}));
        metadata.ocr = Some("sunset beach".into());

        store.store_metadata("p1", &metadata).await.unwrap();
        assert_eq!(store.get_metadata("p1").await.unwrap(), Some(metadata));
    }

    #[tokio::test]
    async fn test_get_photo_refreshes_last_accessed() {
        let store = sqlite_store(10).await;
        let mut record = CachedPhotoRecord::new("p1", "/photos/a.jpg").with_thumbnail("thumb://a");
        record.last_accessed = DateTime::<Utc>::default();
        store.store_photo(&record).await.unwrap();

        let first = store.get_photo("p1").await.unwrap().unwrap();
        assert!(first.last_accessed > DateTime::<Utc>::default());
        assert_eq!(first.thumbnail_ref.as_deref(), Some("thumb://a"));
        assert_eq!(first.cached_at, record.cached_at);

        let second = store.get_photo("p1").await.unwrap().unwrap();
        assert!(second.last_accessed >= first.last_accessed);
    }

    #[tokio::test]
    async fn test_eviction_drops_single_lru_entry() {
        let store = sqlite_store(3).await;
        for i in 1..=3 {
            let id = format!("p{i}");
            store
                .store_photo(&CachedPhotoRecord::new(&id, format!("/photos/{id}.jpg")))
                .await
                .unwrap();
        }
        // p1 becomes the most recently used
        store.get_photo("p1").await.unwrap();

        store
            .store_photo(&CachedPhotoRecord::new("p4", "/photos/p4.jpg"))
            .await
            .unwrap();

        assert_eq!(store.stats().entries, 3);
        assert!(store.get_photo("p2").await.unwrap().is_none());
        for id in ["p1", "p3", "p4"] {
            assert!(store.get_photo(id).await.unwrap().is_some(), "{id} evicted");
        }
    }

    #[tokio::test]
    async fn test_eviction_removes_all_records_of_victim() {
        let store = sqlite_store(1).await;
        store.store_photo(&CachedPhotoRecord::new("p1", "/a.jpg")).await.unwrap();
        store.store_embedding("p1", &[1.0, 2.0]).await.unwrap();
        store.store_metadata("p1", &MetadataRecord::new("/a.jpg")).await.unwrap();

        store.store_metadata("p2", &MetadataRecord::new("/b.jpg")).await.unwrap();

        assert!(store.get_embedding("p1").await.unwrap().is_none());
        assert!(store.get_metadata("p1").await.unwrap().is_none());
        assert!(store.get_metadata("p2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_byte_ceiling_evicts() {
        let db = SqliteBackend::open_in_memory().unwrap();
        let store = LocalStore::with_backend(
            Arc::new(db),
            StoreLimits {
                max_records: 100,
                max_bytes: 100,
            },
        )
        .await
        .unwrap();

        store.store_embedding("a", &[0.0; 10]).await.unwrap(); // 40 bytes
        store.store_embedding("b", &[0.0; 10]).await.unwrap(); // 80 bytes
        store.store_embedding("c", &[0.0; 10]).await.unwrap(); // would be 120

        let stats = store.stats();
        assert!(stats.bytes <= 100);
        assert_eq!(stats.entries, 2);
        assert!(store.get_embedding("a").await.unwrap().is_none());

        // A single record larger than the ceiling cannot be cached
        let err = store.store_embedding("huge", &[0.0; 64]).await.unwrap_err();
        assert!(matches!(err, StoreError::QuotaExceeded { .. }));
        assert!(store.get_embedding("huge").await.unwrap().is_none());
        // Rejected up front, so nothing else was evicted for it
        assert!(store.get_embedding("b").await.unwrap().is_some());
        assert!(store.get_embedding("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_backend_quota_triggers_eviction() {
        let backend = Arc::new(MemoryBackend::with_quota(100));
        let store = LocalStore::with_backend(backend, limits(100)).await.unwrap();

        store.store_embedding("a", &[0.0; 10]).await.unwrap();
        store.store_embedding("b", &[0.0; 10]).await.unwrap();
        store.store_embedding("c", &[0.0; 10]).await.unwrap();

        assert!(store.get_embedding("a").await.unwrap().is_none());
        assert!(store.get_embedding("c").await.unwrap().is_some());

        let err = store.store_embedding("huge", &[0.0; 30]).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::QuotaExceeded {
                needed: 120,
                capacity: 100
            }
        ));
        assert!(store.get_embedding("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_memory_backend_is_not_supported() {
        let store = LocalStore::with_backend(Arc::new(MemoryBackend::new()), limits(5))
            .await
            .unwrap();
        assert!(!store.is_supported());
        // Still usable as a memory-only cache
        store.store_embedding("p1", &[1.0]).await.unwrap();
        assert_eq!(store.get_embedding("p1").await.unwrap(), Some(vec![1.0]));
    }

    #[tokio::test]
    async fn test_open_falls_back_when_path_unusable() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the parent directory should be
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();

        let config = StoreConfig {
            db_path: blocker.join("cache.db"),
            ..Default::default()
        };
        let store = LocalStore::open(&config).await;
        assert!(!store.is_supported());
    }

    #[tokio::test]
    async fn test_index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            db_path: dir.path().join("cache.db"),
            max_records: 2,
            ..Default::default()
        };

        {
            let store = LocalStore::open(&config).await;
            assert!(store.is_supported());
            store.store_photo(&CachedPhotoRecord::new("old", "/old.jpg")).await.unwrap();
            store.store_photo(&CachedPhotoRecord::new("new", "/new.jpg")).await.unwrap();
        }

        let store = LocalStore::open(&config).await;
        assert_eq!(store.stats().entries, 2);
        store.store_photo(&CachedPhotoRecord::new("newest", "/newest.jpg")).await.unwrap();
        assert!(store.recency("old").is_none());
        assert!(store.recency("new").is_some());
    }

    #[tokio::test]
    async fn test_embedding_reads_count_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            db_path: dir.path().join("cache.db"),
            max_records: 2,
            ..Default::default()
        };

        {
            let store = LocalStore::open(&config).await;
            store.store_photo(&CachedPhotoRecord::new("old", "/old.jpg")).await.unwrap();
            store.store_embedding("old", &[1.0, 0.0]).await.unwrap();
            store.store_photo(&CachedPhotoRecord::new("new", "/new.jpg")).await.unwrap();
            // Reading the embedding makes "old" the most recent
            store.get_embedding("old").await.unwrap();
        }

        let store = LocalStore::open(&config).await;
        store.store_photo(&CachedPhotoRecord::new("newest", "/newest.jpg")).await.unwrap();
        assert!(store.recency("old").is_some());
        assert!(store.recency("new").is_none());
    }

    #[tokio::test]
    async fn test_evict_one_drops_lru_entry() {
        let store = sqlite_store(10).await;
        store.store_photo(&CachedPhotoRecord::new("a", "/a.jpg")).await.unwrap();
        store.store_photo(&CachedPhotoRecord::new("b", "/b.jpg")).await.unwrap();

        assert!(store.evict_one().await.unwrap());
        assert!(store.recency("a").is_none());
        assert!(store.recency("b").is_some());

        assert!(store.evict_one().await.unwrap());
        assert!(!store.evict_one().await.unwrap());
        assert!(store.is_empty());
    }
}
