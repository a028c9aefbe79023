//! Record types held in the local cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Whether `path` lies inside directory `dir`, compared by path component
/// so `/photos2/a.jpg` is not under `/photos`. An empty `dir` matches all.
pub fn path_in_dir(path: &str, dir: &str) -> bool {
    Path::new(path).starts_with(dir)
}

/// A photo the client has fetched or viewed at least once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedPhotoRecord {
    pub id: String,
    pub path: String,
    pub cached_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    /// Opaque handle to a cached thumbnail (URL, blob key, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_ref: Option<String>,
}

impl CachedPhotoRecord {
    pub fn new(id: impl Into<String>, path: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            path: path.into(),
            cached_at: now,
            last_accessed: now,
            thumbnail_ref: None,
        }
    }

    pub fn with_thumbnail(mut self, thumbnail_ref: impl Into<String>) -> Self {
        self.thumbnail_ref = Some(thumbnail_ref.into());
        self
    }
}

/// Embedding vector for a photo; one per photo id, overwritten on re-index.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    pub photo_id: String,
    pub vector: Vec<f32>,
    pub dim: usize,
}

impl EmbeddingRecord {
    pub fn new(photo_id: impl Into<String>, vector: Vec<f32>) -> Self {
        let dim = vector.len();
        Self {
            photo_id: photo_id.into(),
            vector,
            dim,
        }
    }
}

/// User-facing metadata for a photo.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub path: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub favorite: bool,
    #[serde(default)]
    pub exif: BTreeMap<String, serde_json::Value>,
    /// Face detections, kept opaque.
    #[serde(default)]
    pub faces: Vec<serde_json::Value>,
    #[serde(default)]
    pub ocr: Option<String>,
}

impl MetadataRecord {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}

/// Convert f32 slice to bytes for storage
pub(crate) fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

/// Convert bytes back to f32 vector
pub(crate) fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
