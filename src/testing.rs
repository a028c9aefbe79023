//! Test doubles shared by module tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::error::RemoteError;
use crate::remote::{LibraryEntry, RemoteApi, RemoteSearchHit};
use crate::search::SearchOptions;

/// A remote call as seen by the stub.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    SetFavorite { dir: String, path: String, favorite: bool },
    SetTags { dir: String, path: String, tags: Vec<String> },
    Delete { dir: String, paths: Vec<String> },
    Search { dir: String, query: String },
    GetLibrary { dir: String },
}

/// Remote state after applying calls: favorite and tags per path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteState {
    pub favorites: BTreeMap<String, bool>,
    pub tags: BTreeMap<String, Vec<String>>,
    pub deleted: Vec<String>,
}

/// In-memory `RemoteApi` that records calls and can be scripted to fail.
#[derive(Default)]
pub struct StubRemote {
    offline: AtomicBool,
    calls: Mutex<Vec<Call>>,
    state: Mutex<RemoteState>,
    /// Errors returned, in order, by the next mutating calls.
    scripted: Mutex<VecDeque<RemoteError>>,
    library: Mutex<HashMap<String, Vec<LibraryEntry>>>,
    hits: Mutex<Vec<RemoteSearchHit>>,
}

impl StubRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn fail_next(&self, err: RemoteError) {
        self.scripted.lock().unwrap().push_back(err);
    }

    pub fn set_library(&self, dir: &str, entries: Vec<LibraryEntry>) {
        self.library.lock().unwrap().insert(dir.to_string(), entries);
    }

    pub fn set_hits(&self, hits: Vec<RemoteSearchHit>) {
        *self.hits.lock().unwrap() = hits;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn mutation_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| {
                matches!(
                    c,
                    Call::SetFavorite { .. } | Call::SetTags { .. } | Call::Delete { .. }
                )
            })
            .collect()
    }

    pub fn state(&self) -> RemoteState {
        self.state.lock().unwrap().clone()
    }

    fn reachable(&self) -> Result<(), RemoteError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("unreachable".into()));
        }
        Ok(())
    }

    fn mutate(&self, call: Call) -> Result<(), RemoteError> {
        self.reachable()?;
        self.calls.lock().unwrap().push(call.clone());
        if let Some(err) = self.scripted.lock().unwrap().pop_front() {
            return Err(err);
        }

        let mut state = self.state.lock().unwrap();
        match call {
            Call::SetFavorite { path, favorite, .. } => {
                state.favorites.insert(path, favorite);
            }
            Call::SetTags { path, tags, .. } => {
                state.tags.insert(path, tags);
            }
            Call::Delete { paths, .. } => {
                for path in paths {
                    if !state.deleted.contains(&path) {
                        state.deleted.push(path);
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteApi for StubRemote {
    async fn set_favorite(&self, dir: &str, path: &str, favorite: bool) -> Result<(), RemoteError> {
        self.mutate(Call::SetFavorite {
            dir: dir.into(),
            path: path.into(),
            favorite,
        })
    }

    async fn set_tags(&self, dir: &str, path: &str, tags: &[String]) -> Result<(), RemoteError> {
        self.mutate(Call::SetTags {
            dir: dir.into(),
            path: path.into(),
            tags: tags.to_vec(),
        })
    }

    async fn delete(&self, dir: &str, paths: &[String]) -> Result<(), RemoteError> {
        self.mutate(Call::Delete {
            dir: dir.into(),
            paths: paths.to_vec(),
        })
    }

    async fn search(
        &self,
        dir: &str,
        query: &str,
        _options: &SearchOptions,
    ) -> Result<Vec<RemoteSearchHit>, RemoteError> {
        self.reachable()?;
        self.calls.lock().unwrap().push(Call::Search {
            dir: dir.into(),
            query: query.into(),
        });
        Ok(self.hits.lock().unwrap().clone())
    }

    async fn get_library(&self, dir: &str) -> Result<Vec<LibraryEntry>, RemoteError> {
        self.reachable()?;
        self.calls
            .lock()
            .unwrap()
            .push(Call::GetLibrary { dir: dir.into() });
        if let Some(err) = self.scripted.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(self
            .library
            .lock()
            .unwrap()
            .get(dir)
            .cloned()
            .unwrap_or_default())
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        self.reachable()
    }
}
