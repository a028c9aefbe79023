//! Durable FIFO queue of mutations made while the backend was unreachable.
//!
//! Actions are persisted in the `action_queue` collection of the local
//! store's backend and mirrored in memory. `process_queue` drains them in
//! order through an [`ActionExecutor`]; only one drain runs at a time.

pub mod action;
pub mod resolver;

pub use action::{ActionPayload, ActionStatus, ActionType, QueuedAction};
pub use resolver::{last_write_wins, merge_tags, ConflictResolver, ResolverRegistry};

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{RemoteError, StoreError};
use crate::store::{Collection, LocalStore, StoreBackend};

/// Performs the remote call for a queued action.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &QueuedAction) -> Result<(), RemoteError>;
}

/// Outcome of one `process_queue` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Another drain was already running; nothing was done.
    pub skipped: bool,
    /// The drain stopped because its sync cycle was superseded.
    pub superseded: bool,
    pub succeeded: usize,
    /// Retries scheduled after transient failures
    pub retried: usize,
    /// Actions removed by conflict coalescing
    pub coalesced: usize,
    /// Actions marked failed during this drain, with their error
    pub failed: Vec<(Uuid, String)>,
}

/// Resets the busy flag however the drain exits.
struct BusyGuard<'a> {
    queue: &'a ActionQueue,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.queue.busy.store(false, Ordering::SeqCst);
        self.queue.idle.notify_waiters();
    }
}

pub struct ActionQueue {
    backend: Arc<dyn StoreBackend>,
    /// Cache sharing the backend; evicted from when a write hits the quota.
    cache: Option<Arc<LocalStore>>,
    config: QueueConfig,
    /// Mirror of the persisted queue, ascending `seq`.
    actions: Mutex<Vec<QueuedAction>>,
    next_seq: AtomicU64,
    resolvers: RwLock<ResolverRegistry>,
    busy: AtomicBool,
    idle: Notify,
}

impl ActionQueue {
    /// Open the queue persisted alongside `store`. Cache entries are
    /// evicted to make room when a queue write hits the storage quota.
    pub async fn open(store: &Arc<LocalStore>, config: QueueConfig) -> Result<Self, StoreError> {
        let mut queue = Self::with_backend(store.backend(), config).await?;
        queue.cache = Some(store.clone());
        Ok(queue)
    }

    pub async fn with_backend(
        backend: Arc<dyn StoreBackend>,
        config: QueueConfig,
    ) -> Result<Self, StoreError> {
        let mut actions = Vec::new();
        for (key, bytes) in backend.scan(Collection::Actions).await? {
            match serde_json::from_slice::<QueuedAction>(&bytes) {
                Ok(mut action) => {
                    // Interrupted mid-replay; replaying again is safe
                    if action.status == ActionStatus::InFlight {
                        action.status = ActionStatus::Pending;
                        backend
                            .put(Collection::Actions, &key, serde_json::to_vec(&action)?)
                            .await?;
                    }
                    actions.push(action);
                }
                Err(e) => warn!(key = %key, error = %e, "Skipping unreadable queued action"),
            }
        }
        actions.sort_by_key(|a| a.seq);
        let next_seq = actions.last().map(|a| a.seq + 1).unwrap_or(1);

        if !actions.is_empty() {
            info!(count = actions.len(), "Loaded queued actions");
        }

        Ok(Self {
            backend,
            cache: None,
            config,
            actions: Mutex::new(actions),
            next_seq: AtomicU64::new(next_seq),
            resolvers: RwLock::new(ResolverRegistry::new()),
            busy: AtomicBool::new(false),
            idle: Notify::new(),
        })
    }

    fn actions(&self) -> MutexGuard<'_, Vec<QueuedAction>> {
        self.actions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append an action. Resolves once it is persisted.
    pub async fn queue_action(&self, payload: ActionPayload) -> Result<Uuid, StoreError> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let action = QueuedAction::new(payload, seq);
        self.write(&action).await?;

        let id = action.id;
        info!(action_id = %id, action_type = action.action_type().as_str(), "Queued action");
        let mut actions = self.actions();
        actions.push(action);
        actions.sort_by_key(|a| a.seq);
        Ok(id)
    }

    /// Snapshot of every queued action, failed ones included.
    pub fn get_queue(&self) -> Vec<QueuedAction> {
        self.actions().clone()
    }

    /// Actions still waiting for replay (pending or in flight).
    pub fn pending_count(&self) -> usize {
        self.actions().iter().filter(|a| a.is_pending()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.actions()
            .iter()
            .filter(|a| a.status == ActionStatus::Failed)
            .count()
    }

    /// Whether a pending action of `action_type` targets `resource_key`.
    pub fn has_pending_for(&self, action_type: ActionType, resource_key: &str) -> bool {
        self.actions().iter().any(|a| {
            a.is_pending()
                && a.action_type() == action_type
                && a.payload.resource_key() == resource_key
        })
    }

    pub async fn clear_queue(&self) -> Result<(), StoreError> {
        self.backend.clear(Collection::Actions).await?;
        self.actions().clear();
        info!("Cleared action queue");
        Ok(())
    }

    pub async fn remove_action(&self, id: Uuid) -> Result<bool, StoreError> {
        let existed = self.backend.delete(Collection::Actions, &id.to_string()).await?;
        self.actions().retain(|a| a.id != id);
        Ok(existed)
    }

    /// Drop failed actions the user has acknowledged.
    pub async fn clear_failed(&self) -> Result<usize, StoreError> {
        let failed: Vec<Uuid> = self
            .actions()
            .iter()
            .filter(|a| a.status == ActionStatus::Failed)
            .map(|a| a.id)
            .collect();
        for id in &failed {
            self.remove_action(*id).await?;
        }
        Ok(failed.len())
    }

    /// Put failed actions back on the replay path with a fresh attempt budget.
    pub async fn retry_failed(&self) -> Result<usize, StoreError> {
        let failed: Vec<QueuedAction> = self
            .actions()
            .iter()
            .filter(|a| a.status == ActionStatus::Failed)
            .cloned()
            .collect();
        for mut action in failed.iter().cloned() {
            action.status = ActionStatus::Pending;
            action.attempts = 0;
            action.last_error = None;
            self.persist(&action).await?;
        }
        Ok(failed.len())
    }

    pub fn register_conflict_resolver(&self, action_type: ActionType, resolver: ConflictResolver) {
        self.resolvers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .register(action_type, resolver);
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Wait until no drain is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if !self.is_busy() {
                return;
            }
            notified.await;
        }
    }

    /// Drain the queue in FIFO order. A no-op if a drain is already running.
    pub async fn process_queue(
        &self,
        executor: &dyn ActionExecutor,
    ) -> Result<DrainReport, StoreError> {
        self.process_queue_while(executor, &|| true).await
    }

    /// Drain the queue while `is_current` holds. Results of calls that
    /// complete after `is_current` turns false are discarded and the action
    /// stays pending.
    pub async fn process_queue_while(
        &self,
        executor: &dyn ActionExecutor,
        is_current: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<DrainReport, StoreError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Queue drain already running");
            return Ok(DrainReport {
                skipped: true,
                ..Default::default()
            });
        }
        let _guard = BusyGuard { queue: self };

        let mut report = DrainReport {
            coalesced: self.coalesce().await?,
            ..Default::default()
        };

        let order: Vec<Uuid> = self
            .actions()
            .iter()
            .filter(|a| a.status == ActionStatus::Pending)
            .map(|a| a.id)
            .collect();

        for id in order {
            let Some(mut action) = self.find(id) else {
                continue;
            };
            if action.status != ActionStatus::Pending {
                continue;
            }

            loop {
                if !is_current() {
                    report.superseded = true;
                    return Ok(report);
                }

                action.status = ActionStatus::InFlight;
                if !self.persist(&action).await? {
                    // Removed while we were working
                    break;
                }

                let result = tokio::time::timeout(
                    self.config.request_timeout(),
                    executor.execute(&action),
                )
                .await
                .unwrap_or(Err(RemoteError::Timeout));

                if !is_current() {
                    action.status = ActionStatus::Pending;
                    self.persist(&action).await?;
                    report.superseded = true;
                    return Ok(report);
                }

                match result {
                    Ok(()) => {
                        self.remove_action(action.id).await?;
                        debug!(action_id = %action.id, "Replayed action");
                        report.succeeded += 1;
                        break;
                    }
                    Err(e) => {
                        action.attempts += 1;
                        action.last_error = Some(e.to_string());

                        if e.is_permanent() || action.attempts >= self.config.max_attempts {
                            action.status = ActionStatus::Failed;
                            self.persist(&action).await?;
                            warn!(
                                action_id = %action.id,
                                attempts = action.attempts,
                                error = %e,
                                "Queued action failed"
                            );
                            report.failed.push((action.id, e.to_string()));
                            break;
                        }

                        action.status = ActionStatus::Pending;
                        self.persist(&action).await?;
                        report.retried += 1;
                        let delay = self.config.backoff(action.attempts);
                        debug!(action_id = %action.id, error = %e, ?delay, "Retrying action");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        info!(
            succeeded = report.succeeded,
            failed = report.failed.len(),
            coalesced = report.coalesced,
            "Queue drained"
        );
        Ok(report)
    }

    /// Persist one action, evicting cache entries while the backend is full.
    async fn write(&self, action: &QueuedAction) -> Result<(), StoreError> {
        let key = action.id.to_string();
        let bytes = serde_json::to_vec(action)?;
        loop {
            match self.backend.put(Collection::Actions, &key, bytes.clone()).await {
                Ok(()) => return Ok(()),
                Err(StoreError::QuotaExceeded { needed, capacity }) => {
                    let evicted = match self.cache {
                        Some(ref cache) => cache.evict_one().await?,
                        None => false,
                    };
                    if !evicted {
                        warn!(action_id = %action.id, needed, "Storage full");
                        return Err(StoreError::QuotaExceeded { needed, capacity });
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn find(&self, id: Uuid) -> Option<QueuedAction> {
        self.actions().iter().find(|a| a.id == id).cloned()
    }

    /// Write back an action that is still queued. Returns false if it was
    /// removed in the meantime.
    async fn persist(&self, action: &QueuedAction) -> Result<bool, StoreError> {
        if self.find(action.id).is_none() {
            return Ok(false);
        }
        self.write(action).await?;

        let mut actions = self.actions();
        match actions.iter_mut().find(|a| a.id == action.id) {
            Some(slot) => {
                *slot = action.clone();
                Ok(true)
            }
            // Cleared between the write and now
            None => Ok(false),
        }
    }

    /// Collapse same-resource pending actions. Returns how many were removed.
    async fn coalesce(&self) -> Result<usize, StoreError> {
        let plan = {
            let registry = self
                .resolvers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone();
            resolver::plan_coalesce(&self.actions(), &registry)
        };
        if plan.is_empty() {
            return Ok(0);
        }

        for survivor in &plan.upserts {
            self.write(survivor).await?;
        }
        for id in &plan.dropped {
            self.backend.delete(Collection::Actions, &id.to_string()).await?;
        }

        let mut actions = self.actions();
        actions.retain(|a| !plan.dropped.contains(&a.id));
        for survivor in plan.upserts {
            match actions.iter_mut().find(|a| a.id == survivor.id) {
                Some(slot) => *slot = survivor,
                None => actions.push(survivor),
            }
        }
        actions.sort_by_key(|a| a.seq);

        debug!(removed = plan.dropped.len(), "Coalesced queued actions");
        Ok(plan.dropped.len())
    }
}
