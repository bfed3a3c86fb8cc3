//! Keyed storage capability injected into the message log and memory.
//!
//! The log never reaches for a global store: hosts pass an `Arc<dyn Storage>`
//! explicitly. Two backends are provided, an in-process map for tests and
//! ephemeral sessions, and a `SQLite` key/value table for the terminal client.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use dashmap::DashMap;
use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;

use crate::chat::error::StorageResult;

/// Boxed future type for storage operations.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Get/set/remove by key.
pub trait Storage: Send + Sync {
    /// Read the value stored under `key`.
    ///
    /// # Errors
    /// Returns an error if the backend cannot be read.
    fn get<'a>(&'a self, key: &'a str) -> StorageFuture<'a, StorageResult<Option<String>>>;

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    /// Returns an error if the backend cannot be written.
    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> StorageFuture<'a, StorageResult<()>>;

    /// Remove the entry under `key`; missing keys are not an error.
    ///
    /// # Errors
    /// Returns an error if the backend cannot be written.
    fn remove<'a>(&'a self, key: &'a str) -> StorageFuture<'a, StorageResult<()>>;
}

/// In-process storage backed by a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: DashMap<String, String>,
}

impl MemoryStorage {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get<'a>(&'a self, key: &'a str) -> StorageFuture<'a, StorageResult<Option<String>>> {
        Box::pin(async move { Ok(self.entries.get(key).map(|entry| entry.value().clone())) })
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> StorageFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            self.entries.insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> StorageFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            self.entries.remove(key);
            Ok(())
        })
    }
}

/// `SQLite` implementation of keyed storage.
///
/// Statements run on the connection's own thread, never on the runtime.
pub struct SqliteStorage {
    conn: Connection,
    table: String,
}

impl SqliteStorage {
    /// Table name for key/value entries.
    pub const DEFAULT_TABLE: &'static str = "companion_kv";

    /// Open (or create) the database at `path` and ensure the table exists.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or initialized.
    pub async fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        Self::with_connection(Connection::open(path).await?).await
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    /// Returns an error if the table cannot be created.
    pub async fn open_in_memory() -> StorageResult<Self> {
        Self::with_connection(Connection::open_in_memory().await?).await
    }

    async fn with_connection(conn: Connection) -> StorageResult<Self> {
        let table = Self::DEFAULT_TABLE.to_string();
        let table_name = table.clone();

        conn.call(move |conn| {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table_name} (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                )"
            ))?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, table })
    }
}

impl Storage for SqliteStorage {
    fn get<'a>(&'a self, key: &'a str) -> StorageFuture<'a, StorageResult<Option<String>>> {
        Box::pin(async move {
            let table = self.table.clone();
            let key = key.to_string();
            let value = self
                .conn
                .call(move |conn| {
                    let value = conn
                        .query_row(
                            &format!("SELECT value FROM {table} WHERE key = ?1"),
                            rusqlite::params![key],
                            |row| row.get::<_, String>(0),
                        )
                        .optional()?;
                    Ok(value)
                })
                .await?;
            Ok(value)
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> StorageFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let table = self.table.clone();
            let key = key.to_string();
            let value = value.to_string();
            self.conn
                .call(move |conn| {
                    conn.execute(
                        &format!("INSERT OR REPLACE INTO {table} (key, value) VALUES (?1, ?2)"),
                        rusqlite::params![key, value],
                    )?;
                    Ok(())
                })
                .await?;
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> StorageFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let table = self.table.clone();
            let key = key.to_string();
            self.conn
                .call(move |conn| {
                    conn.execute(
                        &format!("DELETE FROM {table} WHERE key = ?1"),
                        rusqlite::params![key],
                    )?;
                    Ok(())
                })
                .await?;
            Ok(())
        })
    }
}
