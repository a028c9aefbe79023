//! SQLite schema for the cache database. Every collection is a key/value
//! table; values are JSON or raw embedding bytes.

pub const SCHEMA: &str = r#"
-- Cached photo records, keyed by photo id
CREATE TABLE IF NOT EXISTS photos (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,          -- JSON CachedPhotoRecord
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

-- Embedding vectors, keyed by photo id
CREATE TABLE IF NOT EXISTS embeddings (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,          -- float32 array stored as little-endian bytes
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

-- User metadata (title, tags, favorite, ...), keyed by photo id
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,          -- JSON MetadataRecord
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

-- Mutations waiting to be replayed against the backend
CREATE TABLE IF NOT EXISTS action_queue (
    key TEXT PRIMARY KEY,         -- action uuid
    value BLOB NOT NULL,          -- JSON QueuedAction
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#;

/// Statements applied after `SCHEMA`; failures (already applied) are ignored.
pub const MIGRATIONS: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_photos_updated ON photos(updated_at)",
];
