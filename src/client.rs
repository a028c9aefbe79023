//! Photo library capabilities that keep working while the backend is
//! unreachable.
//!
//! `PhotoClient` owns the whole offline subsystem. Construct it once per
//! application, call `init()` to start connectivity tracking and background
//! sync, and `dispose()` before dropping it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{RemoteError, StoreError, SyncError};
use crate::queue::{ActionPayload, ActionQueue, ActionType, ConflictResolver};
use crate::remote::{execute_payload, LibraryEntry, RemoteApi};
use crate::search::{LocalSearchEngine, ScoredResult, SearchOptions, SearchQuery};
use crate::store::{path_in_dir, CachedPhotoRecord, LocalStore, MetadataRecord};
use crate::sync::{SyncCoordinator, SyncReport, SyncStatus};

/// How a mutation was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    /// The backend confirmed it.
    Applied,
    /// Queued for replay on reconnection.
    Queued(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchSource {
    Remote,
    /// Approximated from the local cache.
    Local,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchResults {
    pub source: SearchSource,
    pub hits: Vec<ScoredResult>,
}

pub struct PhotoClient {
    config: Config,
    remote: Arc<dyn RemoteApi>,
    store: Arc<LocalStore>,
    queue: Arc<ActionQueue>,
    monitor: Arc<ConnectivityMonitor>,
    search: LocalSearchEngine,
    sync: Arc<SyncCoordinator>,
}

impl PhotoClient {
    /// Open the cache and queue described by `config`.
    pub async fn build(config: Config, remote: Arc<dyn RemoteApi>) -> Result<Self, StoreError> {
        let store = LocalStore::open(&config.store).await;
        Self::with_store(config, store, remote).await
    }

    pub async fn with_store(
        config: Config,
        store: LocalStore,
        remote: Arc<dyn RemoteApi>,
    ) -> Result<Self, StoreError> {
        let store = Arc::new(store);
        let queue = Arc::new(ActionQueue::open(&store, config.queue.clone()).await?);
        let monitor = Arc::new(ConnectivityMonitor::new(
            remote.clone(),
            config.connectivity.clone(),
        ));
        let search = LocalSearchEngine::new(store.clone(), config.search.clone());
        let sync = Arc::new(SyncCoordinator::new(
            monitor.clone(),
            queue.clone(),
            store.clone(),
            remote.clone(),
            config.sync.clone(),
            config.remote.library_dirs.clone(),
        ));

        Ok(Self {
            config,
            remote,
            store,
            queue,
            monitor,
            search,
            sync,
        })
    }

    /// Establish connectivity and start background sync. Returns whether the
    /// backend is reachable.
    pub async fn init(&self) -> bool {
        let online = self.monitor.force_check().await;
        self.monitor.start();
        self.sync.init();
        info!(
            online,
            durable = self.store.is_supported(),
            pending = self.queue.pending_count(),
            "Photo client initialized"
        );
        online
    }

    pub fn dispose(&self) {
        self.sync.dispose();
        self.monitor.stop();
        info!("Photo client disposed");
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<ActionQueue> {
        &self.queue
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    pub fn is_online(&self) -> bool {
        self.monitor.get_status()
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    pub async fn set_favorite(
        &self,
        dir: &str,
        path: &str,
        favorite: bool,
    ) -> Result<MutationOutcome, SyncError> {
        self.mutate(ActionPayload::Favorite {
            dir: dir.to_string(),
            path: path.to_string(),
            favorite,
        })
        .await
    }

    pub async fn set_tags(
        &self,
        dir: &str,
        path: &str,
        tags: &[String],
    ) -> Result<MutationOutcome, SyncError> {
        self.mutate(ActionPayload::SetTags {
            dir: dir.to_string(),
            path: path.to_string(),
            tags: tags.to_vec(),
        })
        .await
    }

    pub async fn delete_photos(
        &self,
        dir: &str,
        paths: &[String],
    ) -> Result<MutationOutcome, SyncError> {
        self.mutate(ActionPayload::Delete {
            dir: dir.to_string(),
            paths: paths.to_vec(),
        })
        .await
    }

    /// Call the backend directly when online, otherwise queue. A direct call
    /// is skipped while an older change to the same resource is still queued,
    /// so replay cannot overwrite it with stale state. Changes queued while
    /// online are handed to the sync loop rather than waiting for the next
    /// reconnection.
    async fn mutate(&self, payload: ActionPayload) -> Result<MutationOutcome, SyncError> {
        let queued_ahead = self
            .queue
            .has_pending_for(payload.action_type(), &payload.resource_key());

        let mut replay_after = Duration::ZERO;
        if self.monitor.get_status() && !queued_ahead {
            let result = tokio::time::timeout(
                self.config.queue.request_timeout(),
                execute_payload(self.remote.as_ref(), &payload),
            )
            .await
            .unwrap_or(Err(RemoteError::Timeout));

            match result {
                Ok(()) => {
                    self.apply_locally(&payload).await;
                    return Ok(MutationOutcome::Applied);
                }
                Err(e) if e.is_permanent() => {
                    warn!(
                        action_type = payload.action_type().as_str(),
                        error = %e,
                        "Backend rejected change"
                    );
                    return Err(e.into());
                }
                Err(e) => {
                    debug!(error = %e, "Backend call failed, queueing");
                    replay_after = self.config.queue.backoff(1);
                }
            }
        }

        let id = self.queue.queue_action(payload.clone()).await?;
        self.apply_locally(&payload).await;
        self.sync.publish_queue_counts();
        if self.monitor.get_status() {
            self.sync.request_sync(replay_after);
        }
        Ok(MutationOutcome::Queued(id))
    }

    /// Mirror a change into the cache so offline views stay consistent.
    async fn apply_locally(&self, payload: &ActionPayload) {
        if let Err(e) = self.try_apply_locally(payload).await {
            warn!(error = %e, "Failed to update cached metadata");
        }
    }

    async fn try_apply_locally(&self, payload: &ActionPayload) -> Result<(), StoreError> {
        let paths = payload.paths();
        let cached: Vec<(String, MetadataRecord)> = self
            .store
            .all_metadata()
            .await?
            .into_iter()
            .filter(|(_, meta)| paths.contains(&meta.path.as_str()))
            .collect();

        match payload {
            ActionPayload::Favorite { favorite, .. } => {
                for (id, mut meta) in cached {
                    meta.favorite = *favorite;
                    self.store.store_metadata(&id, &meta).await?;
                }
            }
            ActionPayload::SetTags { tags, .. } => {
                for (id, mut meta) in cached {
                    meta.tags = tags.iter().cloned().collect();
                    self.store.store_metadata(&id, &meta).await?;
                }
            }
            ActionPayload::Delete { .. } => {
                let photos = self.store.cached_photos().await?;
                let ids = cached
                    .into_iter()
                    .map(|(id, _)| id)
                    .chain(
                        photos
                            .into_iter()
                            .filter(|p| paths.contains(&p.path.as_str()))
                            .map(|p| p.id),
                    );
                for id in ids {
                    self.store.remove_photo(&id).await?;
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Remote search, falling back to the local cache when offline or when
    /// the backend call fails.
    pub async fn search(
        &self,
        dir: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<SearchResults, StoreError> {
        if self.monitor.get_status() {
            let result = tokio::time::timeout(
                self.config.queue.request_timeout(),
                self.remote.search(dir, query, options),
            )
            .await
            .unwrap_or(Err(RemoteError::Timeout));

            match result {
                Ok(hits) => {
                    let hits = hits
                        .into_iter()
                        .map(|hit| ScoredResult {
                            last_accessed: self.store.recency(&hit.id),
                            id: hit.id,
                            path: hit.path,
                            score: hit.score,
                            keyword_score: None,
                            similarity: None,
                        })
                        .collect();
                    return Ok(SearchResults {
                        source: SearchSource::Remote,
                        hits,
                    });
                }
                Err(e) => warn!(error = %e, "Remote search failed, using local cache"),
            }
        }

        if !self.search.is_supported() {
            debug!("Local search has no durable cache to work from");
        }
        let options = SearchOptions {
            path_prefix: options.path_prefix.clone().or_else(|| Some(dir.to_string())),
            ..options.clone()
        };
        let hits = self.search.search(&SearchQuery::text(query), &options).await?;
        Ok(SearchResults {
            source: SearchSource::Local,
            hits,
        })
    }

    /// Cached photos most similar to `id`.
    pub async fn find_similar(
        &self,
        id: &str,
        options: &SearchOptions,
    ) -> Result<Vec<ScoredResult>, StoreError> {
        self.search.search(&SearchQuery::similar_to(id), options).await
    }

    /// List `dir`, caching what the backend returns. Offline, or when the
    /// backend is unreachable, serves the cached entries instead.
    pub async fn get_library(&self, dir: &str) -> Result<Vec<LibraryEntry>, SyncError> {
        if self.monitor.get_status() {
            match self.remote.get_library(dir).await {
                Ok(entries) => {
                    for entry in &entries {
                        match self.cache_entry(entry).await {
                            Ok(()) => {}
                            Err(StoreError::QuotaExceeded { needed, .. }) => {
                                warn!(id = %entry.id, needed, "Library entry too large to cache");
                            }
                            Err(e) => return Err(e.into()),
                        }
                    }
                    return Ok(entries);
                }
                Err(e) if e.is_permanent() => return Err(e.into()),
                Err(e) => warn!(error = %e, "Library fetch failed, using local cache"),
            }
        }
        Ok(self.cached_library(dir).await?)
    }

    async fn cache_entry(&self, entry: &LibraryEntry) -> Result<(), StoreError> {
        let mut record = CachedPhotoRecord::new(&entry.id, &entry.path);
        record.thumbnail_ref = entry.thumbnail_ref.clone();
        self.store.store_photo(&record).await?;
        self.store.store_metadata(&entry.id, &entry.metadata).await?;
        if let Some(ref vector) = entry.embedding {
            self.store.store_embedding(&entry.id, vector).await?;
        }
        Ok(())
    }

    async fn cached_library(&self, dir: &str) -> Result<Vec<LibraryEntry>, StoreError> {
        let mut metadata: HashMap<String, MetadataRecord> =
            self.store.all_metadata().await?.into_iter().collect();
        let mut embeddings: HashMap<String, Vec<f32>> = self
            .store
            .all_embeddings()
            .await?
            .into_iter()
            .map(|e| (e.photo_id, e.vector))
            .collect();

        Ok(self
            .store
            .cached_photos()
            .await?
            .into_iter()
            .filter(|photo| path_in_dir(&photo.path, dir))
            .map(|photo| LibraryEntry {
                metadata: metadata
                    .remove(&photo.id)
                    .unwrap_or_else(|| MetadataRecord::new(&photo.path)),
                embedding: embeddings.remove(&photo.id),
                id: photo.id,
                path: photo.path,
                thumbnail_ref: photo.thumbnail_ref,
            })
            .collect())
    }

    /// Open a cached photo, refreshing its recency.
    pub async fn view_photo(&self, id: &str) -> Result<Option<CachedPhotoRecord>, StoreError> {
        self.store.get_photo(id).await
    }

    // ========================================================================
    // Sync
    // ========================================================================

    pub fn status(&self) -> SyncStatus {
        self.sync.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.sync.subscribe()
    }

    pub fn register_conflict_resolver(&self, action_type: ActionType, resolver: ConflictResolver) {
        self.sync.register_conflict_resolver(action_type, resolver);
    }

    pub async fn force_sync(&self) -> Result<SyncReport, SyncError> {
        self.sync.force_sync().await
    }

    pub async fn enhanced_sync(&self) -> Result<SyncReport, SyncError> {
        self.sync.enhanced_sync().await
    }
}
