//! Error types shared across the sync subsystem.

use thiserror::Error;

/// Failures of the local persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend unavailable: {0}")]
    StorageUnavailable(String),

    #[error("storage quota exceeded: {needed} bytes needed, capacity {capacity}")]
    QuotaExceeded { needed: u64, capacity: u64 },

    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        // SQLITE_FULL is what a page-count quota turns into
        if let rusqlite::Error::SqliteFailure(ref e, _) = err {
            if e.code == rusqlite::ErrorCode::DiskFull {
                return StoreError::QuotaExceeded {
                    needed: 0,
                    capacity: 0,
                };
            }
        }
        StoreError::Sqlite(err)
    }
}

/// Failures reported by the remote search backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("http {status}: {message}")]
    Http { status: u16, message: String },
}

impl RemoteError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        RemoteError::Http {
            status,
            message: message.into(),
        }
    }

    /// Network failures, timeouts and 5xx responses are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Network(_) | RemoteError::Timeout => true,
            RemoteError::Http { status, .. } => *status >= 500,
        }
    }

    /// Validation failures (4xx) never succeed on replay.
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

/// Failures of a sync cycle as a whole.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("backend is offline")]
    Offline,

    #[error("sync superseded by a newer cycle")]
    Superseded,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RemoteError::Network("reset".into()).is_transient());
        assert!(RemoteError::Timeout.is_transient());
        assert!(RemoteError::http(503, "unavailable").is_transient());
        assert!(RemoteError::http(500, "boom").is_transient());

        assert!(RemoteError::http(400, "bad tags").is_permanent());
        assert!(RemoteError::http(404, "no such photo").is_permanent());
        assert!(!RemoteError::http(422, "invalid").is_transient());
    }
}
