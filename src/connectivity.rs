//! Online/offline tracking for the remote backend.
//!
//! The platform connectivity signal is advisory: it can report online while
//! the backend is unreachable. A status is only considered online when the
//! signal says so and a heartbeat ping succeeds. Flips shorter than the
//! configured dwell time are ignored.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::ConnectivityConfig;
use crate::remote::RemoteApi;

/// Debounces raw online observations into confirmed transitions.
#[derive(Debug, Clone)]
pub struct DebounceState {
    confirmed: bool,
    /// Observed status differing from `confirmed`, and since when.
    candidate: Option<(bool, Instant)>,
}

impl DebounceState {
    pub fn new(initial: bool) -> Self {
        Self {
            confirmed: initial,
            candidate: None,
        }
    }

    pub fn confirmed(&self) -> bool {
        self.confirmed
    }

    /// A differing status is waiting out its dwell time.
    pub fn is_settling(&self) -> bool {
        self.candidate.is_some()
    }

    /// Feed one observation. Returns the new status when a transition is
    /// confirmed.
    pub fn observe(&mut self, raw: bool, now: Instant, dwell: Duration) -> Option<bool> {
        if raw == self.confirmed {
            self.candidate = None;
            return None;
        }

        let since = match self.candidate {
            Some((status, since)) if status == raw => since,
            _ => {
                self.candidate = Some((raw, now));
                now
            }
        };

        if now.saturating_duration_since(since) >= dwell {
            self.force(raw)
        } else {
            None
        }
    }

    /// Accept `raw` immediately, skipping the dwell time.
    pub fn force(&mut self, raw: bool) -> Option<bool> {
        self.candidate = None;
        if raw == self.confirmed {
            return None;
        }
        self.confirmed = raw;
        Some(raw)
    }
}

type Listener = Arc<dyn Fn(bool) + Send + Sync>;
type Listeners = Mutex<HashMap<u64, Listener>>;

/// Handle returned by [`ConnectivityMonitor::on_status_change`].
pub struct Subscription {
    id: u64,
    listeners: Weak<Listeners>,
}

impl Subscription {
    /// Deregister the listener. Safe to call after the monitor is gone.
    pub fn unsubscribe(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&self.id);
        }
    }
}

struct MonitorState {
    debounce: DebounceState,
    /// Last platform connectivity signal.
    signal: bool,
}

pub struct ConnectivityMonitor {
    remote: Arc<dyn RemoteApi>,
    config: ConnectivityConfig,
    state: Mutex<MonitorState>,
    status_tx: watch::Sender<bool>,
    listeners: Arc<Listeners>,
    next_listener: AtomicU64,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectivityMonitor {
    /// Starts offline until the first successful check.
    pub fn new(remote: Arc<dyn RemoteApi>, config: ConnectivityConfig) -> Self {
        let (status_tx, _) = watch::channel(false);
        Self {
            remote,
            config,
            state: Mutex::new(MonitorState {
                debounce: DebounceState::new(false),
                signal: true,
            }),
            status_tx,
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_listener: AtomicU64::new(1),
            heartbeat: Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current debounced status.
    pub fn get_status(&self) -> bool {
        *self.status_tx.borrow()
    }

    /// Channel carrying every confirmed status.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.status_tx.subscribe()
    }

    /// Register a callback for confirmed transitions.
    pub fn on_status_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::SeqCst);
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, Arc::new(callback));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Resolves once the monitor reports online.
    pub async fn wait_online(&self) {
        let mut rx = self.subscribe();
        // The sender lives as long as self
        let _ = rx.wait_for(|online| *online).await;
    }

    /// Feed the platform connectivity signal, then re-check.
    pub async fn report_signal(&self, online: bool) -> bool {
        self.state().signal = online;
        debug!(online, "Connectivity signal");
        self.check().await
    }

    /// Observe the current raw status through the dwell-time filter.
    pub async fn check(&self) -> bool {
        let raw = self.probe().await;
        let transition = self
            .state()
            .debounce
            .observe(raw, Instant::now(), self.config.min_dwell());
        self.apply(transition);
        self.get_status()
    }

    /// Probe and accept the result immediately, skipping the dwell time.
    pub async fn force_check(&self) -> bool {
        let raw = self.probe().await;
        let transition = self.state().debounce.force(raw);
        self.apply(transition);
        self.get_status()
    }

    async fn probe(&self) -> bool {
        if !self.state().signal {
            return false;
        }
        matches!(
            tokio::time::timeout(self.config.heartbeat_timeout(), self.remote.ping()).await,
            Ok(Ok(()))
        )
    }

    fn apply(&self, transition: Option<bool>) {
        let Some(online) = transition else {
            return;
        };
        info!(online, "Connectivity changed");
        self.status_tx.send_replace(online);

        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener(online);
        }
    }

    fn is_settling(&self) -> bool {
        self.state().debounce.is_settling()
    }

    /// Start the periodic heartbeat. While a status change is settling the
    /// monitor re-checks at the dwell interval instead.
    pub fn start(self: &Arc<Self>) {
        let mut heartbeat = self
            .heartbeat
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if heartbeat.is_some() {
            return;
        }

        let monitor = Arc::downgrade(self);
        let interval = self.config.heartbeat_interval();
        let settle = self.config.min_dwell().max(Duration::from_millis(50));
        *heartbeat = Some(tokio::spawn(async move {
            loop {
                let Some(m) = monitor.upgrade() else {
                    break;
                };
                m.check().await;
                let delay = if m.is_settling() { settle } else { interval };
                drop(m);
                tokio::time::sleep(delay).await;
            }
        }));
        debug!(?interval, "Heartbeat started");
    }

    pub fn stop(&self) {
        if let Some(handle) = self
            .heartbeat
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            handle.abort();
            debug!("Heartbeat stopped");
        }
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
