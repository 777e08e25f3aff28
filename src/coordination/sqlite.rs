//! SQLite lease table shared by every instance that opens the same database.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection};

use crate::error::LockError;
use crate::storage::sqlite::open_connection;

use super::lock::LockStore;

fn db(err: rusqlite::Error) -> LockError {
    LockError::Unavailable(err.to_string())
}

/// Lock rows with an absolute expiry in unix milliseconds.
#[derive(Clone)]
pub struct SqliteLockStore {
    connection: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteLockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLockStore").finish_non_exhaustive()
    }
}

impl SqliteLockStore {
    pub fn open(path: &Path) -> Result<Self, LockError> {
        let connection = open_connection(path).map_err(db)?;
        connection
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS locks (
                    name TEXT PRIMARY KEY,
                    holder TEXT NOT NULL,
                    expires_at INTEGER NOT NULL
                );",
            )
            .map_err(db)?;
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }
}

impl LockStore for SqliteLockStore {
    fn set_if_absent(&self, key: &str, holder: &str, lease: Duration) -> Result<bool, LockError> {
        let now = Utc::now().timestamp_millis();
        let expires_at = now.saturating_add(lease.as_millis() as i64);

        // A single statement is atomic across connections: the row is
        // written when absent and taken over only once its lease has passed.
        let written = self
            .connection
            .lock()
            .execute(
                "INSERT INTO locks (name, holder, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (name) DO UPDATE
                 SET holder = excluded.holder, expires_at = excluded.expires_at
                 WHERE locks.expires_at <= ?4",
                params![key, holder, expires_at, now],
            )
            .map_err(db)?;
        Ok(written == 1)
    }

    fn delete_if_held(&self, key: &str, holder: &str) -> Result<bool, LockError> {
        let deleted = self
            .connection
            .lock()
            .execute(
                "DELETE FROM locks WHERE name = ?1 AND holder = ?2",
                params![key, holder],
            )
            .map_err(db)?;
        Ok(deleted == 1)
    }
}
