//! Reconnection orchestration.
//!
//! On every confirmed reconnection (or a manual `force_sync`) the
//! coordinator drains the action queue through the remote backend and then
//! refreshes the local cache from the remote library. Each cycle carries a
//! generation number; a newer cycle or a disconnect supersedes older ones
//! and their late results are discarded.

mod status;

pub use status::{SyncState, SyncStatus};

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::connectivity::{ConnectivityMonitor, Subscription};
use crate::error::{StoreError, SyncError};
use crate::queue::{ActionQueue, ActionType, ConflictResolver, DrainReport};
use crate::remote::{LibraryEntry, RemoteApi, RemoteExecutor};
use crate::store::{path_in_dir, CachedPhotoRecord, LocalStore, MetadataRecord};

/// Why the background loop should look at the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncTrigger {
    Reconnected,
    Disconnected,
    Retry,
}

/// Changes applied to the cache by a library refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub updated: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub drain: DrainReport,
    pub refresh: RefreshReport,
}

struct Running {
    subscription: Subscription,
    task: JoinHandle<()>,
    triggers: mpsc::UnboundedSender<SyncTrigger>,
}

pub struct SyncCoordinator {
    monitor: Arc<ConnectivityMonitor>,
    queue: Arc<ActionQueue>,
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteApi>,
    config: SyncConfig,
    library_dirs: Vec<String>,
    /// Shared with the connectivity listener so a disconnect supersedes the
    /// running cycle immediately.
    generation: Arc<AtomicU64>,
    /// Consecutive failed cycles, for retry backoff.
    failures: AtomicU32,
    status_tx: watch::Sender<SyncStatus>,
    running: Mutex<Option<Running>>,
}

impl SyncCoordinator {
    pub fn new(
        monitor: Arc<ConnectivityMonitor>,
        queue: Arc<ActionQueue>,
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteApi>,
        config: SyncConfig,
        library_dirs: Vec<String>,
    ) -> Self {
        let initial = SyncStatus {
            is_online: monitor.get_status(),
            pending_count: queue.pending_count(),
            failed_count: queue.failed_count(),
            ..Default::default()
        };
        let (status_tx, _) = watch::channel(initial);
        Self {
            monitor,
            queue,
            store,
            remote,
            config,
            library_dirs,
            generation: Arc::new(AtomicU64::new(0)),
            failures: AtomicU32::new(0),
            status_tx,
            running: Mutex::new(None),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start reacting to connectivity changes. Idempotent.
    pub fn init(self: &Arc<Self>) {
        let mut running = self.running();
        if running.is_some() {
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = {
            let tx = tx.clone();
            let generation = self.generation.clone();
            self.monitor.on_status_change(move |online| {
                let trigger = if online {
                    SyncTrigger::Reconnected
                } else {
                    // The loop may be inside a cycle; stop it now
                    generation.fetch_add(1, Ordering::SeqCst);
                    SyncTrigger::Disconnected
                };
                let _ = tx.send(trigger);
            })
        };

        // Leftovers from a previous run
        if self.monitor.get_status() && self.queue.pending_count() > 0 {
            let _ = tx.send(SyncTrigger::Reconnected);
        }

        let coordinator: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(trigger) = rx.recv().await {
                let Some(c) = coordinator.upgrade() else {
                    break;
                };
                c.handle(trigger).await;
            }
        });

        *running = Some(Running {
            subscription,
            task,
            triggers: tx,
        });
        info!("Sync coordinator started");
    }

    /// Stop reacting to connectivity changes and supersede any running cycle.
    pub fn dispose(&self) {
        if let Some(running) = self.running().take() {
            running.subscription.unsubscribe();
            running.task.abort();
            self.generation.fetch_add(1, Ordering::SeqCst);
            info!("Sync coordinator stopped");
        }
    }

    /// Ask the background loop for a cycle after `delay`. Does nothing
    /// before `init` or after `dispose`.
    pub fn request_sync(&self, delay: Duration) {
        let Some(tx) = self.running().as_ref().map(|r| r.triggers.clone()) else {
            return;
        };
        if delay.is_zero() {
            let _ = tx.send(SyncTrigger::Retry);
            return;
        }
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(SyncTrigger::Retry);
        });
    }

    async fn handle(&self, trigger: SyncTrigger) {
        debug!(?trigger, "Sync trigger");
        match trigger {
            SyncTrigger::Disconnected => {
                self.publish(|status| {
                    status.is_online = false;
                    if status.state == SyncState::Syncing {
                        status.state = SyncState::Idle;
                    }
                });
            }
            SyncTrigger::Reconnected | SyncTrigger::Retry => {
                if !self.monitor.get_status() {
                    return;
                }
                match self.run_cycle().await {
                    Ok(_) | Err(SyncError::Superseded) => {}
                    Err(e) => {
                        let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                        let delay = self.config.error_retry(failures);
                        warn!(error = %e, failures, ?delay, "Sync failed, retrying later");
                        self.request_sync(delay);
                    }
                }
            }
        }
    }

    /// Wait until online, then drain the queue and refresh the cache.
    pub async fn enhanced_sync(&self) -> Result<SyncReport, SyncError> {
        self.monitor.wait_online().await;
        self.run_cycle().await
    }

    /// Sync now, skipping the connectivity dwell time.
    pub async fn force_sync(&self) -> Result<SyncReport, SyncError> {
        if !self.monitor.force_check().await {
            self.publish(|status| status.is_online = false);
            return Err(SyncError::Offline);
        }
        self.run_cycle().await
    }

    async fn run_cycle(&self) -> Result<SyncReport, SyncError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let is_current = || self.generation.load(Ordering::SeqCst) == generation;

        info!(generation, "Sync started");
        self.publish(|status| {
            status.state = SyncState::Syncing;
            status.is_online = true;
        });

        let executor = RemoteExecutor::new(self.remote.clone());
        let drain = loop {
            // A superseded drain may still be finishing its current action
            self.queue.wait_idle().await;
            if !is_current() {
                return Err(SyncError::Superseded);
            }
            let report = match self.queue.process_queue_while(&executor, &is_current).await {
                Ok(report) => report,
                Err(e) => return Err(self.fail(e.into())),
            };
            if !report.skipped {
                break report;
            }
        };
        if drain.superseded || !is_current() {
            debug!(generation, "Sync superseded");
            return Err(SyncError::Superseded);
        }

        let mut refresh = RefreshReport::default();
        for dir in &self.library_dirs {
            match self.refresh_library(dir, &is_current).await {
                Ok(report) => {
                    refresh.updated += report.updated;
                    refresh.removed += report.removed;
                }
                Err(SyncError::Superseded) => return Err(SyncError::Superseded),
                Err(e) => return Err(self.fail(e)),
            }
        }

        let last_error = match drain.failed.as_slice() {
            [] => None,
            [(_, err)] => Some(format!("1 action failed: {}", err)),
            [(_, err), ..] => Some(format!(
                "{} actions failed, last: {}",
                drain.failed.len(),
                err
            )),
        };
        self.failures.store(0, Ordering::SeqCst);
        self.publish(|status| {
            status.state = SyncState::Idle;
            status.last_synced_at = Some(Utc::now());
            status.last_error = last_error;
        });

        info!(
            generation,
            replayed = drain.succeeded,
            failed = drain.failed.len(),
            updated = refresh.updated,
            removed = refresh.removed,
            "Sync complete"
        );
        Ok(SyncReport { drain, refresh })
    }

    fn fail(&self, e: SyncError) -> SyncError {
        error!(error = %e, "Sync failed");
        let message = e.to_string();
        self.publish(|status| {
            status.state = SyncState::Error;
            status.last_error = Some(message);
        });
        e
    }

    /// Bring cached entries under `dir` in line with the remote library.
    /// Paths with queued changes keep their local state.
    async fn refresh_library(
        &self,
        dir: &str,
        is_current: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<RefreshReport, SyncError> {
        let entries = self.remote.get_library(dir).await?;
        if !is_current() {
            return Err(SyncError::Superseded);
        }

        let dirty: HashSet<String> = self
            .queue
            .get_queue()
            .iter()
            .filter(|a| a.is_pending())
            .flat_map(|a| a.payload.paths().into_iter().map(String::from))
            .collect();

        let photos: HashMap<String, CachedPhotoRecord> = self
            .store
            .cached_photos()
            .await?
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();
        let metadata: HashMap<String, MetadataRecord> =
            self.store.all_metadata().await?.into_iter().collect();
        let embeddings: HashMap<String, Vec<f32>> = self
            .store
            .all_embeddings()
            .await?
            .into_iter()
            .map(|e| (e.photo_id, e.vector))
            .collect();

        let mut report = RefreshReport::default();
        for entry in &entries {
            if dirty.contains(&entry.path) {
                continue;
            }

            match self.cache_entry(entry, &photos, &metadata, &embeddings).await {
                Ok(true) => report.updated += 1,
                Ok(false) => {}
                Err(StoreError::QuotaExceeded { needed, .. }) => {
                    warn!(id = %entry.id, needed, "Library entry too large to cache");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let remote_ids: HashSet<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        for photo in photos.values() {
            if path_in_dir(&photo.path, dir)
                && !remote_ids.contains(photo.id.as_str())
                && !dirty.contains(&photo.path)
            {
                self.store.remove_photo(&photo.id).await?;
                report.removed += 1;
            }
        }

        debug!(dir = %dir, updated = report.updated, removed = report.removed, "Library refreshed");
        Ok(report)
    }

    /// Write whatever differs between a library entry and the cache.
    /// Returns whether anything was written.
    async fn cache_entry(
        &self,
        entry: &LibraryEntry,
        photos: &HashMap<String, CachedPhotoRecord>,
        metadata: &HashMap<String, MetadataRecord>,
        embeddings: &HashMap<String, Vec<f32>>,
    ) -> Result<bool, StoreError> {
        let mut changed = false;
        if !photos.contains_key(&entry.id) {
            let mut record = CachedPhotoRecord::new(&entry.id, &entry.path);
            record.thumbnail_ref = entry.thumbnail_ref.clone();
            self.store.store_photo(&record).await?;
            changed = true;
        }
        if metadata.get(&entry.id) != Some(&entry.metadata) {
            self.store.store_metadata(&entry.id, &entry.metadata).await?;
            changed = true;
        }
        if let Some(ref vector) = entry.embedding {
            if embeddings.get(&entry.id) != Some(vector) {
                self.store.store_embedding(&entry.id, vector).await?;
                changed = true;
            }
        }
        Ok(changed)
    }

    pub fn register_conflict_resolver(&self, action_type: ActionType, resolver: ConflictResolver) {
        self.queue.register_conflict_resolver(action_type, resolver);
    }

    pub fn status(&self) -> SyncStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    /// Re-publish queue counts after the queue changed outside a sync.
    pub fn publish_queue_counts(&self) {
        self.publish(|_| {});
    }

    fn publish(&self, update: impl FnOnce(&mut SyncStatus)) {
        let pending_count = self.queue.pending_count();
        let failed_count = self.queue.failed_count();
        self.status_tx.send_modify(|status| {
            update(status);
            status.pending_count = pending_count;
            status.failed_count = failed_count;
        });
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectivityConfig, QueueConfig};
    use crate::error::RemoteError;
    use crate::queue::ActionPayload;
    use crate::remote::RemoteSearchHit;
    use crate::search::SearchOptions;
    use crate::store::StoreLimits;
    use crate::testing::{Call, StubRemote};
    use async_trait::async_trait;
    use tokio::sync::Notify;

    struct Fixture {
        remote: Arc<StubRemote>,
        monitor: Arc<ConnectivityMonitor>,
        queue: Arc<ActionQueue>,
        store: Arc<LocalStore>,
    }

    async fn fixture(remote: Arc<StubRemote>) -> Fixture {
        let store = Arc::new(LocalStore::in_memory(StoreLimits {
            max_records: 100,
            max_bytes: 1024 * 1024,
        }));
        let queue = ActionQueue::open(
            &store,
            QueueConfig {
                max_attempts: 3,
                base_backoff_ms: 1,
                max_backoff_ms: 5,
                request_timeout_secs: 5,
            },
        )
        .await
        .unwrap();
        let monitor = Arc::new(ConnectivityMonitor::new(
            remote.clone(),
            ConnectivityConfig::default(),
        ));
        Fixture {
            remote,
            monitor,
            queue: Arc::new(queue),
            store,
        }
    }

    fn coordinator(f: &Fixture, api: Arc<dyn RemoteApi>, dirs: &[&str]) -> Arc<SyncCoordinator> {
        Arc::new(SyncCoordinator::new(
            f.monitor.clone(),
            f.queue.clone(),
            f.store.clone(),
            api,
            SyncConfig::default(),
            dirs.iter().map(|d| d.to_string()).collect(),
        ))
    }

    fn favorite(path: &str, value: bool) -> ActionPayload {
        ActionPayload::Favorite {
            dir: "/photos".into(),
            path: path.into(),
            favorite: value,
        }
    }

    fn set_tags(path: &str, tags: &[&str]) -> ActionPayload {
        ActionPayload::SetTags {
            dir: "/photos".into(),
            path: path.into(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_reconnect_drains_queue() {
        let f = fixture(Arc::new(StubRemote::new())).await;
        f.remote.set_offline(true);
        let sync = coordinator(&f, f.remote.clone(), &[]);
        sync.init();

        f.queue.queue_action(favorite("a.jpg", true)).await.unwrap();
        f.queue.queue_action(set_tags("b.jpg", &["x"])).await.unwrap();
        sync.publish_queue_counts();
        assert_eq!(sync.status().pending_count, 2);

        let mut rx = sync.subscribe();
        f.remote.set_offline(false);
        assert!(f.monitor.force_check().await);

        let status = tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| s.last_synced_at.is_some() && s.state == SyncState::Idle),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();

        assert!(status.is_online);
        assert_eq!(status.pending_count, 0);
        assert!(f.queue.get_queue().is_empty());
        assert_eq!(f.remote.mutation_calls().len(), 2);
        sync.dispose();
    }

    #[tokio::test]
    async fn test_force_sync_offline() {
        let f = fixture(Arc::new(StubRemote::new())).await;
        f.remote.set_offline(true);
        let sync = coordinator(&f, f.remote.clone(), &[]);

        assert!(matches!(sync.force_sync().await, Err(SyncError::Offline)));
        assert!(!sync.status().is_online);
    }

    #[tokio::test]
    async fn test_replaying_twice_converges() {
        let sequence = vec![
            favorite("a.jpg", true),
            set_tags("a.jpg", &["sea"]),
            favorite("b.jpg", false),
            set_tags("a.jpg", &["sea", "sky"]),
            ActionPayload::Delete {
                dir: "/photos".into(),
                paths: vec!["c.jpg".into()],
            },
        ];

        let once = fixture(Arc::new(StubRemote::new())).await;
        let sync = coordinator(&once, once.remote.clone(), &[]);
        for payload in &sequence {
            once.queue.queue_action(payload.clone()).await.unwrap();
        }
        sync.force_sync().await.unwrap();

        let twice = fixture(Arc::new(StubRemote::new())).await;
        let sync = coordinator(&twice, twice.remote.clone(), &[]);
        for _ in 0..2 {
            for payload in &sequence {
                twice.queue.queue_action(payload.clone()).await.unwrap();
            }
            sync.force_sync().await.unwrap();
        }

        assert!(!once.remote.state().favorites.is_empty());
        assert_eq!(once.remote.state(), twice.remote.state());
        assert_eq!(
            twice.remote.state().tags.get("a.jpg"),
            Some(&vec!["sea".to_string(), "sky".to_string()])
        );
    }

    #[tokio::test]
    async fn test_permanent_failure_surfaces_in_status() {
        let f = fixture(Arc::new(StubRemote::new())).await;
        let sync = coordinator(&f, f.remote.clone(), &[]);
        f.queue.queue_action(set_tags("a.jpg", &["?"])).await.unwrap();
        f.remote.fail_next(RemoteError::http(400, "invalid tag"));

        let report = sync.force_sync().await.unwrap();
        assert_eq!(report.drain.failed.len(), 1);

        let status = sync.status();
        assert_eq!(status.state, SyncState::Idle);
        assert_eq!(status.failed_count, 1);
        assert_eq!(status.pending_count, 0);
        assert!(status.last_error.unwrap().contains("invalid tag"));
        assert_eq!(f.queue.get_queue().len(), 1);
    }

    /// Remote whose favorite call blocks until released.
    struct GatedRemote {
        inner: Arc<StubRemote>,
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl RemoteApi for GatedRemote {
        async fn set_favorite(
            &self,
            dir: &str,
            path: &str,
            favorite: bool,
        ) -> Result<(), RemoteError> {
            self.started.notify_one();
            self.release.notified().await;
            self.inner.set_favorite(dir, path, favorite).await
        }

        async fn set_tags(
            &self,
            dir: &str,
            path: &str,
            tags: &[String],
        ) -> Result<(), RemoteError> {
            self.inner.set_tags(dir, path, tags).await
        }

        async fn delete(&self, dir: &str, paths: &[String]) -> Result<(), RemoteError> {
            self.inner.delete(dir, paths).await
        }

        async fn search(
            &self,
            dir: &str,
            query: &str,
            options: &SearchOptions,
        ) -> Result<Vec<RemoteSearchHit>, RemoteError> {
            self.inner.search(dir, query, options).await
        }

        async fn get_library(&self, dir: &str) -> Result<Vec<LibraryEntry>, RemoteError> {
            self.inner.get_library(dir).await
        }

        async fn ping(&self) -> Result<(), RemoteError> {
            self.inner.ping().await
        }
    }

    #[tokio::test]
    async fn test_disconnect_supersedes_running_cycle() {
        let f = fixture(Arc::new(StubRemote::new())).await;
        let gated = Arc::new(GatedRemote {
            inner: f.remote.clone(),
            started: Notify::new(),
            release: Notify::new(),
        });
        f.remote.set_offline(true);
        let sync = coordinator(&f, gated.clone(), &[]);
        sync.init();
        f.queue.queue_action(favorite("a.jpg", true)).await.unwrap();
        f.queue.queue_action(favorite("b.jpg", true)).await.unwrap();

        f.remote.set_offline(false);
        assert!(f.monitor.force_check().await);
        gated.started.notified().await;

        // Connection dropped while the first replay was in flight
        f.remote.set_offline(true);
        assert!(!f.monitor.force_check().await);
        gated.release.notify_one();
        f.queue.wait_idle().await;

        let queued = f.queue.get_queue();
        assert_eq!(queued.len(), 2);
        for action in &queued {
            assert!(action.is_pending());
            assert_eq!(action.attempts, 0);
        }
        let mut rx = sync.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| !s.is_online))
            .await
            .unwrap()
            .unwrap();

        // The next reconnection replays both
        f.remote.set_offline(false);
        assert!(f.monitor.force_check().await);
        for _ in 0..2 {
            gated.started.notified().await;
            gated.release.notify_one();
        }
        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| s.last_synced_at.is_some() && s.pending_count == 0),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(f.queue.get_queue().is_empty());
        assert_eq!(f.remote.state().favorites.len(), 2);
        sync.dispose();
    }

    #[tokio::test]
    async fn test_failed_cycle_retries_with_growing_delay() {
        let f = fixture(Arc::new(StubRemote::new())).await;
        let sync = Arc::new(SyncCoordinator::new(
            f.monitor.clone(),
            f.queue.clone(),
            f.store.clone(),
            f.remote.clone(),
            SyncConfig {
                error_retry_ms: 50,
                max_error_retry_ms: 1000,
            },
            vec!["/photos".into()],
        ));
        assert!(f.monitor.force_check().await);
        let mut rx = sync.subscribe();
        sync.init();

        f.remote.fail_next(RemoteError::http(503, "busy"));
        f.remote.fail_next(RemoteError::http(503, "busy"));
        let started = tokio::time::Instant::now();
        sync.request_sync(Duration::ZERO);

        let failed = tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| s.state == SyncState::Error),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert!(failed.last_error.unwrap().contains("busy"));

        let synced = tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| s.state == SyncState::Idle && s.last_synced_at.is_some()),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert!(synced.last_error.is_none());

        // 50ms after the first failure, 100ms after the second
        assert!(started.elapsed() >= Duration::from_millis(150));
        let fetches = f
            .remote
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::GetLibrary { .. }))
            .count();
        assert_eq!(fetches, 3);
        sync.dispose();
    }

    #[tokio::test]
    async fn test_refresh_updates_and_prunes_cache() {
        let f = fixture(Arc::new(StubRemote::new())).await;
        let sync = coordinator(&f, f.remote.clone(), &["/photos"]);

        // Cached earlier, since deleted remotely
        f.store
            .store_photo(&CachedPhotoRecord::new("gone", "/photos/gone.jpg"))
            .await
            .unwrap();
        // Outside the refreshed directory
        f.store
            .store_photo(&CachedPhotoRecord::new("other", "/elsewhere/x.jpg"))
            .await
            .unwrap();
        f.store
            .store_photo(&CachedPhotoRecord::new("sibling", "/photos2/x.jpg"))
            .await
            .unwrap();

        let mut meta = MetadataRecord::new("/photos/a.jpg");
        meta.title = Some("Remote title".into());
        let mut dirty_meta = MetadataRecord::new("/photos/b.jpg");
        dirty_meta.favorite = false;
        f.remote.set_library(
            "/photos",
            vec![
                LibraryEntry {
                    id: "a".into(),
                    path: "/photos/a.jpg".into(),
                    metadata: meta.clone(),
                    embedding: Some(vec![0.5, 0.5]),
                    thumbnail_ref: Some("thumb://a".into()),
                },
                LibraryEntry {
                    id: "b".into(),
                    path: "/photos/b.jpg".into(),
                    metadata: dirty_meta,
                    embedding: None,
                    thumbnail_ref: None,
                },
            ],
        );

        // A favorite for b.jpg that will fail and stay queued
        f.queue.queue_action(favorite("/photos/b.jpg", true)).await.unwrap();
        f.remote.fail_next(RemoteError::http(409, "conflict"));
        // Failed actions do not hold back the refresh
        let report = sync.force_sync().await.unwrap();
        assert_eq!(report.refresh.removed, 1);
        assert_eq!(report.refresh.updated, 2);

        assert_eq!(f.store.get_metadata("a").await.unwrap(), Some(meta));
        assert_eq!(f.store.get_embedding("a").await.unwrap(), Some(vec![0.5, 0.5]));
        assert!(f.store.get_photo("gone").await.unwrap().is_none());
        assert!(f.store.get_photo("other").await.unwrap().is_some());
        assert!(f.store.get_photo("sibling").await.unwrap().is_some());

        // A second refresh with nothing changed is a no-op
        let report = sync.force_sync().await.unwrap();
        assert_eq!(report.refresh, RefreshReport::default());
    }

    #[tokio::test]
    async fn test_refresh_keeps_locally_dirty_paths() {
        let f = fixture(Arc::new(StubRemote::new())).await;
        let sync = coordinator(&f, f.remote.clone(), &["/photos"]);

        let mut local = MetadataRecord::new("/photos/a.jpg");
        local.tags.insert("mine".into());
        f.store.store_metadata("a", &local).await.unwrap();
        f.queue
            .queue_action(ActionPayload::SetTags {
                dir: "/photos".into(),
                path: "/photos/a.jpg".into(),
                tags: vec!["mine".into()],
            })
            .await
            .unwrap();

        f.remote.set_library(
            "/photos",
            vec![LibraryEntry {
                id: "a".into(),
                path: "/photos/a.jpg".into(),
                metadata: MetadataRecord::new("/photos/a.jpg"),
                embedding: None,
                thumbnail_ref: None,
            }],
        );

        let report = sync.refresh_library("/photos", &|| true).await.unwrap();
        assert_eq!(report, RefreshReport::default());
        assert_eq!(f.store.get_metadata("a").await.unwrap(), Some(local));
    }
}
