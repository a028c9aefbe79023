use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Syncing,
    Error,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Syncing => "syncing",
            SyncState::Error => "error",
        }
    }
}

/// Sync state published to subscribers after every transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub is_online: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Queued actions still waiting for replay
    pub pending_count: usize,
    /// Queued actions that failed permanently and await the user
    pub failed_count: usize,
    pub last_error: Option<String>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            state: SyncState::Idle,
            is_online: false,
            last_synced_at: None,
            pending_count: 0,
            failed_count: 0,
            last_error: None,
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}), {} pending, {} failed",
            self.state.as_str(),
            if self.is_online { "online" } else { "offline" },
            self.pending_count,
            self.failed_count
        )?;
        if let Some(at) = self.last_synced_at {
            write!(f, ", last synced {}", at.format("%Y-%m-%d %H:%M:%S"))?;
        }
        if let Some(ref err) = self.last_error {
            write!(f, ", last error: {}", err)?;
        }
        Ok(())
    }
}
