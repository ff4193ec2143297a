//! SQLite-backed key-value store for the edge agent.
//!
//! Values live in named buckets. Every read-modify-write goes through
//! [`StateStore::transaction`], which takes SQLite's write lock up front so
//! concurrent writers to the same key serialize instead of losing updates.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("key already exists: {bucket}/{key}")]
    KeyExists { bucket: String, key: String },

    #[error("State not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    Invalid(String),

    #[error("state store lock poisoned")]
    Poisoned,
}

/// SQLite state store.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Open or create a state store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateStoreError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::with_connection(conn)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StateStoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StateStoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                bucket TEXT NOT NULL,
                key TEXT NOT NULL,
                value BLOB NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (bucket, key)
            );
            "#,
        )?;

        debug!("State store schema initialized");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StateStoreError> {
        self.conn.lock().map_err(|_| StateStoreError::Poisoned)
    }

    /// Run `f` inside one immediate transaction.
    ///
    /// Commits when `f` returns `Ok`, rolls back otherwise.
    pub fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Txn<'_>) -> Result<T, E>,
        E: From<StateStoreError>,
    {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StateStoreError::from)?;

        let result = f(&Txn { conn: &tx });
        match result {
            Ok(value) => {
                tx.commit().map_err(StateStoreError::from)?;
                Ok(value)
            }
            Err(e) => {
                tx.rollback().map_err(StateStoreError::from)?;
                Err(e)
            }
        }
    }

    /// Get a value outside of any explicit transaction.
    pub fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StateStoreError> {
        let conn = self.lock()?;
        get(&conn, bucket, key)
    }

    /// List the keys of a bucket.
    pub fn keys(&self, bucket: &str) -> Result<Vec<String>, StateStoreError> {
        let conn = self.lock()?;
        keys(&conn, bucket)
    }

    pub fn upsert(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), StateStoreError> {
        let conn = self.lock()?;
        upsert(&conn, bucket, key, value)
    }

    pub fn delete(&self, bucket: &str, key: &str) -> Result<bool, StateStoreError> {
        let conn = self.lock()?;
        delete(&conn, bucket, key)
    }

    /// Get and decode a JSON value outside of any explicit transaction.
    pub fn get_json<T: DeserializeOwned>(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<T>, StateStoreError> {
        self.get(bucket, key)?
            .map(|raw| decode(bucket, key, &raw))
            .transpose()
    }
}

/// Operations available inside [`StateStore::transaction`].
pub struct Txn<'a> {
    conn: &'a Connection,
}

impl Txn<'_> {
    pub fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StateStoreError> {
        get(self.conn, bucket, key)
    }

    /// Insert a new key, failing with [`StateStoreError::KeyExists`] if present.
    pub fn insert(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), StateStoreError> {
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO kv (bucket, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![bucket, key, value, now()],
        )?;
        if changed == 0 {
            return Err(StateStoreError::KeyExists {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        Ok(())
    }

    pub fn upsert(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), StateStoreError> {
        upsert(self.conn, bucket, key, value)
    }

    /// Get and decode a JSON value.
    pub fn get_json<T: DeserializeOwned>(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<T>, StateStoreError> {
        self.get(bucket, key)?
            .map(|raw| decode(bucket, key, &raw))
            .transpose()
    }

    pub fn insert_json<T: Serialize>(
        &self,
        bucket: &str,
        key: &str,
        value: &T,
    ) -> Result<(), StateStoreError> {
        self.insert(bucket, key, &encode(value)?)
    }

    pub fn upsert_json<T: Serialize>(
        &self,
        bucket: &str,
        key: &str,
        value: &T,
    ) -> Result<(), StateStoreError> {
        self.upsert(bucket, key, &encode(value)?)
    }

    pub fn delete(&self, bucket: &str, key: &str) -> Result<bool, StateStoreError> {
        delete(self.conn, bucket, key)
    }

    pub fn keys(&self, bucket: &str) -> Result<Vec<String>, StateStoreError> {
        keys(self.conn, bucket)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StateStoreError> {
    serde_json::to_vec(value).map_err(|e| StateStoreError::Invalid(e.to_string()))
}

fn decode<T: DeserializeOwned>(bucket: &str, key: &str, raw: &[u8]) -> Result<T, StateStoreError> {
    serde_json::from_slice(raw)
        .map_err(|e| StateStoreError::Invalid(format!("{bucket}/{key}: {e}")))
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn get(conn: &Connection, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StateStoreError> {
    conn.query_row(
        "SELECT value FROM kv WHERE bucket = ?1 AND key = ?2",
        params![bucket, key],
        |row| row.get(0),
    )
    .optional()
    .map_err(Into::into)
}

fn upsert(conn: &Connection, bucket: &str, key: &str, value: &[u8]) -> Result<(), StateStoreError> {
    conn.execute(
        r#"
        INSERT INTO kv (bucket, key, value, updated_at)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(bucket, key) DO UPDATE SET
            value = excluded.value,
            updated_at = excluded.updated_at
        "#,
        params![bucket, key, value, now()],
    )?;
    Ok(())
}

fn delete(conn: &Connection, bucket: &str, key: &str) -> Result<bool, StateStoreError> {
    let changed = conn.execute(
        "DELETE FROM kv WHERE bucket = ?1 AND key = ?2",
        params![bucket, key],
    )?;
    Ok(changed > 0)
}

fn keys(conn: &Connection, bucket: &str) -> Result<Vec<String>, StateStoreError> {
    let mut stmt = conn.prepare("SELECT key FROM kv WHERE bucket = ?1 ORDER BY key")?;
    let keys = stmt
        .query_map(params![bucket], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_delete() {
        let store = StateStore::open_in_memory().unwrap();

        store
            .transaction(|tx| tx.insert("b", "k", b"v1"))
            .unwrap();
        assert_eq!(store.get("b", "k").unwrap(), Some(b"v1".to_vec()));

        // Buckets are separate namespaces
        assert_eq!(store.get("other", "k").unwrap(), None);

        assert!(store.delete("b", "k").unwrap());
        assert!(!store.delete("b", "k").unwrap());
        assert_eq!(store.get("b", "k").unwrap(), None);
    }

    #[test]
    fn test_insert_existing_key_fails() {
        let store = StateStore::open_in_memory().unwrap();
        store.upsert("b", "k", b"v1").unwrap();

        let err = store
            .transaction(|tx| tx.insert("b", "k", b"v2"))
            .unwrap_err();
        assert!(matches!(err, StateStoreError::KeyExists { .. }));
        assert_eq!(store.get("b", "k").unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let store = StateStore::open_in_memory().unwrap();
        store.upsert("b", "k", b"before").unwrap();

        let result: Result<(), StateStoreError> = store.transaction(|tx| {
            tx.upsert("b", "k", b"after")?;
            Err(StateStoreError::Invalid("abort".into()))
        });
        assert!(result.is_err());
        assert_eq!(store.get("b", "k").unwrap(), Some(b"before".to_vec()));
    }

    #[test]
    fn test_json_values() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .transaction(|tx| tx.insert_json("b", "k", &serde_json::json!({"a": 1})))
            .unwrap();

        let value: Option<serde_json::Value> = store.get_json("b", "k").unwrap();
        assert_eq!(value, Some(serde_json::json!({"a": 1})));

        store.upsert("b", "bad", b"not json").unwrap();
        let err = store.get_json::<serde_json::Value>("b", "bad").unwrap_err();
        assert!(matches!(err, StateStoreError::Invalid(_)));
    }

    #[test]
    fn test_keys_sorted() {
        let store = StateStore::open_in_memory().unwrap();
        store.upsert("b", "zeta", b"1").unwrap();
        store.upsert("b", "alpha", b"2").unwrap();
        store.upsert("c", "other", b"3").unwrap();

        assert_eq!(store.keys("b").unwrap(), vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_open_on_disk_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");

        {
            let store = StateStore::open(&path).unwrap();
            store.upsert("b", "k", b"v").unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        assert_eq!(store.get("b", "k").unwrap(), Some(b"v".to_vec()));
    }
}
