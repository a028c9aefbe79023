//! Offline-first sync and local search fallback for a photo search client.
//!
//! Mutations made while the backend is unreachable are queued durably and
//! replayed in order on reconnection; searches fall back to an approximate
//! keyword and embedding-similarity search over the local cache.

pub mod client;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod logging;
pub mod queue;
pub mod remote;
pub mod search;
pub mod store;
pub mod sync;

#[cfg(test)]
mod testing;

pub use client::{MutationOutcome, PhotoClient, SearchResults, SearchSource};
pub use config::Config;
pub use error::{RemoteError, StoreError, SyncError};
