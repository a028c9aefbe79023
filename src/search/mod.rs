//! Approximate search over the local cache.
//!
//! Used when the remote search backend is unreachable. Results are
//! recomputed from the cached metadata and embeddings on every call.

pub mod scoring;

pub use scoring::{blend, cosine_similarity, keyword_score, keywords, MAX_KEYWORD_SCORE};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

use crate::config::SearchConfig;
use crate::error::StoreError;
use crate::store::{path_in_dir, LocalStore};

/// What to search for. At least one of the two should be set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchQuery {
    pub text: Option<String>,
    /// Photo id for "more like this".
    pub similar_to: Option<String>,
}

impl SearchQuery {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            similar_to: None,
        }
    }

    pub fn similar_to(id: impl Into<String>) -> Self {
        Self {
            text: None,
            similar_to: Some(id.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchOptions {
    /// Maximum results; the configured default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,

    /// Keyword weight in the blended score; the configured default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alpha: Option<f32>,

    /// Results must score strictly above this.
    #[serde(default)]
    pub min_score: f32,

    /// Restrict results to paths inside this directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredResult {
    pub id: String,
    pub path: String,
    pub score: f32,
    /// Normalized keyword score in [0, 1], if the query had text.
    pub keyword_score: Option<f32>,
    pub similarity: Option<f32>,
    pub last_accessed: Option<DateTime<Utc>>,
}

pub struct LocalSearchEngine {
    store: Arc<LocalStore>,
    config: SearchConfig,
}

impl LocalSearchEngine {
    pub fn new(store: Arc<LocalStore>, config: SearchConfig) -> Self {
        Self { store, config }
    }

    /// True only if the store is durable and has something cached.
    pub fn is_supported(&self) -> bool {
        self.store.is_supported() && !self.store.is_empty()
    }

    pub async fn search(
        &self,
        query: &SearchQuery,
        options: &SearchOptions,
    ) -> Result<Vec<ScoredResult>, StoreError> {
        let kws = query.text.as_deref().map(keywords).unwrap_or_default();

        let source = match &query.similar_to {
            Some(id) => match self.store.get_embedding(id).await? {
                Some(vector) => Some(vector),
                None => {
                    debug!(id = %id, "No cached embedding for similarity source");
                    None
                }
            },
            None => None,
        };

        if kws.is_empty() && source.is_none() {
            return Ok(Vec::new());
        }

        let alpha = options.alpha.unwrap_or(if query.similar_to.is_some() {
            self.config.similar_alpha
        } else {
            self.config.text_alpha
        });

        let metadata: HashMap<String, _> = self.store.all_metadata().await?.into_iter().collect();
        let embeddings: HashMap<String, Vec<f32>> = self
            .store
            .all_embeddings()
            .await?
            .into_iter()
            .map(|record| (record.photo_id, record.vector))
            .collect();
        let paths: HashMap<String, String> = self
            .store
            .cached_photos()
            .await?
            .into_iter()
            .map(|record| (record.id, record.path))
            .collect();

        let candidates: BTreeSet<&String> = metadata.keys().chain(embeddings.keys()).collect();

        let mut results = Vec::new();
        for id in candidates {
            if query.similar_to.as_deref() == Some(id.as_str()) {
                continue;
            }

            let meta = metadata.get(id);
            let path = paths
                .get(id)
                .cloned()
                .or_else(|| meta.map(|m| m.path.clone()))
                .unwrap_or_else(|| id.clone());
            if let Some(prefix) = &options.path_prefix {
                if !path_in_dir(&path, prefix) {
                    continue;
                }
            }

            let kw = (!kws.is_empty()).then(|| {
                meta.map(|m| keyword_score(m, &kws) / MAX_KEYWORD_SCORE)
                    .unwrap_or(0.0)
            });
            let sim = source.as_ref().map(|source| {
                embeddings
                    .get(id)
                    .map(|vector| cosine_similarity(source, vector))
                    .unwrap_or(0.0)
            });

            let score = match (kw, sim) {
                (Some(kw), Some(sim)) => blend(kw, sim, alpha),
                (Some(kw), None) => kw,
                (None, Some(sim)) => sim,
                (None, None) => continue,
            };
            if score <= options.min_score {
                continue;
            }

            results.push(ScoredResult {
                id: id.clone(),
                path,
                score,
                keyword_score: kw,
                similarity: sim,
                last_accessed: self.store.recency(id),
            });
        }

        rank(&mut results);
        results.truncate(options.limit.unwrap_or(self.config.limit));
        debug!(count = results.len(), "Local search complete");
        Ok(results)
    }
}

/// Score descending, then most recently accessed, then id.
pub fn rank(results: &mut [ScoredResult]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.last_accessed.cmp(&a.last_accessed))
            .then_with(|| a.id.cmp(&b.id))
    });
}
