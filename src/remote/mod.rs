//! Client-side view of the remote photo search backend.

mod http;

pub use http::HttpRemote;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::RemoteError;
use crate::queue::{ActionExecutor, ActionPayload, QueuedAction};
use crate::search::SearchOptions;
use crate::store::MetadataRecord;

/// One photo as listed by the backend library endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryEntry {
    pub id: String,
    pub path: String,
    #[serde(default)]
    pub metadata: MetadataRecord,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub thumbnail_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSearchHit {
    pub id: String,
    pub path: String,
    pub score: f32,
}

/// Calls against the remote backend. Every call either succeeds or fails
/// with a network/timeout error or an HTTP status.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn set_favorite(&self, dir: &str, path: &str, favorite: bool) -> Result<(), RemoteError>;

    async fn set_tags(&self, dir: &str, path: &str, tags: &[String]) -> Result<(), RemoteError>;

    async fn delete(&self, dir: &str, paths: &[String]) -> Result<(), RemoteError>;

    async fn search(
        &self,
        dir: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<RemoteSearchHit>, RemoteError>;

    async fn get_library(&self, dir: &str) -> Result<Vec<LibraryEntry>, RemoteError>;

    /// Cheap reachability check used by the connectivity heartbeat.
    async fn ping(&self) -> Result<(), RemoteError>;
}

/// Perform the remote call an action payload describes.
pub async fn execute_payload(
    remote: &dyn RemoteApi,
    payload: &ActionPayload,
) -> Result<(), RemoteError> {
    match payload {
        ActionPayload::Favorite {
            dir,
            path,
            favorite,
        } => remote.set_favorite(dir, path, *favorite).await,
        ActionPayload::SetTags { dir, path, tags } => remote.set_tags(dir, path, tags).await,
        ActionPayload::Delete { dir, paths } => remote.delete(dir, paths).await,
    }
}

/// Replays queued actions against a [`RemoteApi`].
pub struct RemoteExecutor {
    remote: Arc<dyn RemoteApi>,
}

impl RemoteExecutor {
    pub fn new(remote: Arc<dyn RemoteApi>) -> Self {
        Self { remote }
    }
}

#[async_trait]
impl ActionExecutor for RemoteExecutor {
    async fn execute(&self, action: &QueuedAction) -> Result<(), RemoteError> {
        execute_payload(self.remote.as_ref(), &action.payload).await
    }
}
