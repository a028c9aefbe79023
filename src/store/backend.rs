//! Persistence backend abstraction.
//!
//! The local cache only needs named key-value collections with get, put
//! and delete; no cross-collection transactions. SQLite backs the durable
//! cache, an in-memory map stands in when no durable storage is available.

use async_trait::async_trait;

use crate::error::StoreError;

/// Named collections held by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Photos,
    Embeddings,
    Metadata,
    Actions,
}

impl Collection {
    /// Collections that make up one cached photo.
    pub const CACHED: [Collection; 3] = [
        Collection::Photos,
        Collection::Embeddings,
        Collection::Metadata,
    ];

    pub fn table(&self) -> &'static str {
        match self {
            Collection::Photos => "photos",
            Collection::Embeddings => "embeddings",
            Collection::Metadata => "metadata",
            Collection::Actions => "action_queue",
        }
    }
}

/// Trait for key-value storage backends.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Backend name for logging
    fn backend_name(&self) -> &'static str;

    /// Whether data written here survives a restart
    fn is_durable(&self) -> bool;

    /// Check the backend is usable for reads and writes
    async fn probe(&self) -> Result<(), StoreError>;

    async fn get(&self, collection: Collection, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Insert or fully overwrite a value. Overwrites keep the key's
    /// original position in `scan` order.
    async fn put(&self, collection: Collection, key: &str, value: Vec<u8>)
        -> Result<(), StoreError>;

    /// Delete a value, returning whether it existed
    async fn delete(&self, collection: Collection, key: &str) -> Result<bool, StoreError>;

    /// All entries of a collection in insertion order
    async fn scan(&self, collection: Collection) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    async fn clear(&self, collection: Collection) -> Result<(), StoreError>;
}
