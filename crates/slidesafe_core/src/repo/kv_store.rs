//! Key-value store contract and implementations.
//!
//! # Responsibility
//! - Abstract the string key/value storage the local buffer writes through.
//! - Back it with SQLite for durability or with memory for tests and
//!   storage-less environments.
//!
//! # Invariants
//! - `set` replaces any previous value for the key.
//! - `remove` of an absent key is not an error.

use crate::db::{open_db, open_db_in_memory, DbError, DbResult};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug)]
pub enum StoreError {
    Db(DbError),
    /// Writing would exceed the store's byte quota.
    QuotaExceeded {
        key: String,
        requested_bytes: usize,
        quota_bytes: usize,
    },
    /// Storage is switched off (private mode, policy, ...).
    Unavailable(&'static str),
    Serialization(serde_json::Error),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::QuotaExceeded {
                key,
                requested_bytes,
                quota_bytes,
            } => write!(
                f,
                "storage quota exceeded writing `{key}`: {requested_bytes} bytes needed, quota {quota_bytes}"
            ),
            Self::Unavailable(reason) => write!(f, "local storage unavailable: {reason}"),
            Self::Serialization(err) => write!(f, "snapshot serialization failed: {err}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Serialization(err) => Some(err),
            Self::QuotaExceeded { .. } | Self::Unavailable(_) => None,
        }
    }
}

impl StoreError {
    /// Stable short code used in log lines.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Db(_) => "db_error",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::Unavailable(_) => "storage_unavailable",
            Self::Serialization(_) => "serialization_failed",
        }
    }
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value)
    }
}

/// Local key-value persistence collaborator.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> StoreResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> StoreResult<()>;
    fn remove(&self, key: &str) -> StoreResult<()>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        (**self).remove(key)
    }
}

/// SQLite-backed store; survives process restarts when opened on a file.
pub struct SqliteKeyValueStore {
    conn: Mutex<Connection>,
}

impl SqliteKeyValueStore {
    /// Opens the store at `path`, applying migrations.
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        Ok(Self::from_connection(open_db(path)?))
    }

    pub fn open_in_memory() -> DbResult<Self> {
        Ok(Self::from_connection(open_db_in_memory()?))
    }

    /// Wraps a connection that already went through `open_db`.
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KeyValueStore for SqliteKeyValueStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let value = self
            .conn()
            .query_row(
                "SELECT value FROM local_snapshots WHERE key = ?1;",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.conn().execute(
            "INSERT INTO local_snapshots (key, value, updated_at)
             VALUES (?1, ?2, (strftime('%s', 'now') * 1000))
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at;",
            params![key, value],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        self.conn()
            .execute("DELETE FROM local_snapshots WHERE key = ?1;", params![key])?;
        Ok(())
    }
}

/// In-process store with an optional byte quota.
///
/// Size accounting counts key and value bytes of every entry.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<HashMap<String, String>>,
    quota_bytes: Option<usize>,
    disabled: AtomicBool,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::default()
        }
    }

    /// Makes every subsequent operation fail with `StoreError::Unavailable`.
    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_enabled(&self) -> StoreResult<()> {
        if self.disabled.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("storage disabled"));
        }
        Ok(())
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.ensure_enabled()?;
        Ok(self.entries().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.ensure_enabled()?;
        let mut entries = self.entries();

        if let Some(quota_bytes) = self.quota_bytes {
            let others: usize = entries
                .iter()
                .filter(|(existing, _)| existing.as_str() != key)
                .map(|(existing, stored)| existing.len() + stored.len())
                .sum();
            let requested_bytes = others + key.len() + value.len();
            if requested_bytes > quota_bytes {
                return Err(StoreError::QuotaExceeded {
                    key: key.to_string(),
                    requested_bytes,
                    quota_bytes,
                });
            }
        }

        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        self.ensure_enabled()?;
        self.entries().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{KeyValueStore, MemoryKeyValueStore, SqliteKeyValueStore, StoreError};

    #[test]
    fn sqlite_store_upserts_and_removes() {
        let store = SqliteKeyValueStore::open_in_memory().unwrap();
        assert_eq!(store.get("k").unwrap(), None);

        store.set("k", "v1").unwrap();
        store.set("k", "v2").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v2"));

        store.remove("k").unwrap();
        store.remove("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn memory_quota_counts_replaced_value_once() {
        let store = MemoryKeyValueStore::with_quota(10);
        store.set("ab", "12345678").unwrap();
        // Replacing the same key must not double count the old value.
        store.set("ab", "87654321").unwrap();

        let err = store.set("cd", "x").unwrap_err();
        match err {
            StoreError::QuotaExceeded {
                requested_bytes,
                quota_bytes,
                ..
            } => {
                assert_eq!(requested_bytes, 13);
                assert_eq!(quota_bytes, 10);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn disabled_memory_store_rejects_every_operation() {
        let store = MemoryKeyValueStore::new();
        store.set_disabled(true);
        assert!(matches!(store.get("k"), Err(StoreError::Unavailable(_))));
        assert!(matches!(store.set("k", "v"), Err(StoreError::Unavailable(_))));
        assert!(matches!(store.remove("k"), Err(StoreError::Unavailable(_))));

        store.set_disabled(false);
        store.set("k", "v").unwrap();
        assert!(!store.is_empty());
    }
}
