//! SQLite backend implementation.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::backend::{Collection, StoreBackend};
use super::schema::{MIGRATIONS, SCHEMA};
use crate::error::StoreError;

pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open (creating if needed) the cache database at `path`.
    ///
    /// `quota_bytes` caps the database size; writes beyond it fail with
    /// `StoreError::QuotaExceeded`.
    pub fn open(path: &Path, quota_bytes: Option<u64>) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::StorageUnavailable(format!("{}: {}", parent.display(), e))
            })?;
        }
        let conn = Connection::open(path)
            .map_err(|e| StoreError::StorageUnavailable(format!("{}: {}", path.display(), e)))?;
        Self::from_connection(conn, quota_bytes)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::StorageUnavailable(e.to_string()))?;
        Self::from_connection(conn, None)
    }

    fn from_connection(conn: Connection, quota_bytes: Option<u64>) -> Result<Self, StoreError> {
        if let Some(quota) = quota_bytes {
            let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
            let pages = (quota as i64 / page_size.max(1)).max(1);
            conn.pragma_update_and_check(None, "max_page_count", pages, |row| {
                row.get::<_, i64>(0)
            })?;
        }
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.initialize()?;
        Ok(db)
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute_batch(SCHEMA)?;
        for migration in MIGRATIONS {
            let _ = conn.execute(migration, []);
        }
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl StoreBackend for SqliteBackend {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn is_durable(&self) -> bool {
        true
    }

    async fn probe(&self) -> Result<(), StoreError> {
        // Takes the write lock without touching data
        self.conn()
            .execute_batch("BEGIN IMMEDIATE; ROLLBACK;")
            .map_err(|e| StoreError::StorageUnavailable(e.to_string()))
    }

    async fn get(&self, collection: Collection, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let sql = format!("SELECT value FROM {} WHERE key = ?", collection.table());
        let value = self
            .conn()
            .query_row(&sql, [key], |row| row.get::<_, Vec<u8>>(0))
            .optional()?;
        Ok(value)
    }

    async fn put(
        &self,
        collection: Collection,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), StoreError> {
        // Upsert rather than REPLACE so the rowid (scan order) survives
        let sql = format!(
            r#"
            INSERT INTO {} (key, value, updated_at)
            VALUES (?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
            collection.table()
        );
        let needed = value.len() as u64;
        self.conn()
            .execute(&sql, params![key, value])
            .map_err(|e| match StoreError::from(e) {
                StoreError::QuotaExceeded { capacity, .. } => {
                    StoreError::QuotaExceeded { needed, capacity }
                }
                other => other,
            })?;
        Ok(())
    }

    async fn delete(&self, collection: Collection, key: &str) -> Result<bool, StoreError> {
        let sql = format!("DELETE FROM {} WHERE key = ?", collection.table());
        let affected = self.conn().execute(&sql, [key])?;
        Ok(affected > 0)
    }

    async fn scan(&self, collection: Collection) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let sql = format!("SELECT key, value FROM {} ORDER BY rowid", collection.table());
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn clear(&self, collection: Collection) -> Result<(), StoreError> {
        let sql = format!("DELETE FROM {}", collection.table());
        self.conn().execute(&sql, [])?;
        Ok(())
    }
}
