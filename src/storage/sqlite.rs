//! SQLite-backed key export table.
//!
//! One row per key, keyed by id. `created_at` is indexed for the retention
//! window scans; `terminal` marks keys the gateway has accepted or
//! confirmed as duplicates.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::error::StoreError;

use super::models::{DiagnosisKey, PersistedKey, ReportType, RetryState, KEY_LENGTH};
use super::store::KeyStore;

/// Schema version this build reads and writes.
const SCHEMA_VERSION: i64 = 1;

/// Wait for a concurrent writer before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open a read-write connection with WAL journaling and a busy timeout.
pub(crate) fn open_connection(path: &Path) -> Result<Connection, rusqlite::Error> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    let connection = Connection::open_with_flags(path, flags)?;
    connection.busy_timeout(BUSY_TIMEOUT)?;
    connection.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
    Ok(connection)
}

fn db(err: rusqlite::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

/// Key table in a SQLite database file.
#[derive(Clone)]
pub struct SqliteKeyStore {
    connection: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteKeyStore").finish_non_exhaustive()
    }
}

impl SqliteKeyStore {
    /// Open (creating if needed) the key table at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let mut connection = open_connection(path).map_err(db)?;
        initialize_schema(&mut connection)?;
        log::info!("KEY_STORE_OPENED path={}", path.display());
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    pub fn get(&self, id: i64) -> Result<Option<PersistedKey>, StoreError> {
        let conn = self.connection.lock();
        let row = conn
            .query_row(
                &format!("SELECT {} FROM diagnosis_keys WHERE id = ?1", COLUMNS),
                params![id],
                KeyRow::from_row,
            )
            .optional()
            .map_err(db)?;
        row.map(KeyRow::into_persisted).transpose()
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        let conn = self.connection.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM diagnosis_keys", params![], |row| {
                row.get(0)
            })
            .map_err(db)?;
        Ok(count as usize)
    }

    /// Run `statement` once per id inside one transaction and count the
    /// rows it touched.
    fn update_each(&self, statement: &str, ids: &[i64]) -> Result<usize, StoreError> {
        let mut conn = self.connection.lock();
        let tx = conn.transaction().map_err(db)?;
        let mut updated = 0;
        {
            let mut stmt = tx.prepare(statement).map_err(db)?;
            for id in ids {
                updated += stmt.execute(params![id]).map_err(db)?;
            }
        }
        tx.commit().map_err(db)?;
        Ok(updated)
    }
}

fn initialize_schema(connection: &mut Connection) -> Result<(), StoreError> {
    let tx = connection.transaction().map_err(db)?;
    tx.execute_batch("CREATE TABLE IF NOT EXISTS store_meta (version INTEGER NOT NULL);")
        .map_err(db)?;
    let version: Option<i64> = tx
        .query_row("SELECT version FROM store_meta LIMIT 1", params![], |row| {
            row.get(0)
        })
        .optional()
        .map_err(db)?;

    match version {
        None => {
            tx.execute(
                "INSERT INTO store_meta (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )
            .map_err(db)?;
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS diagnosis_keys (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    key_data BLOB NOT NULL,
                    rolling_start_interval_number INTEGER NOT NULL,
                    rolling_period INTEGER NOT NULL,
                    transmission_risk_level INTEGER NOT NULL,
                    visited_countries TEXT NOT NULL,
                    origin TEXT NOT NULL,
                    report_type INTEGER NOT NULL,
                    days_since_onset_of_symptoms INTEGER NOT NULL,
                    created_at INTEGER NOT NULL,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    terminal INTEGER NOT NULL DEFAULT 0
                );
                CREATE INDEX IF NOT EXISTS idx_diagnosis_keys_created_at
                    ON diagnosis_keys (created_at);",
            )
            .map_err(db)?;
        }
        Some(SCHEMA_VERSION) => {}
        Some(other) => {
            return Err(StoreError::Unavailable(format!(
                "unsupported key store schema version: {}",
                other
            )));
        }
    }

    tx.commit().map_err(db)
}

const COLUMNS: &str = "id, key_data, rolling_start_interval_number, rolling_period, \
     transmission_risk_level, visited_countries, origin, report_type, \
     days_since_onset_of_symptoms, created_at, retry_count, terminal";

/// Raw column values of one row.
struct KeyRow {
    id: i64,
    key_data: Vec<u8>,
    rolling_start_interval_number: u32,
    rolling_period: u32,
    transmission_risk_level: i32,
    visited_countries: String,
    origin: String,
    report_type: i32,
    days_since_onset_of_symptoms: i32,
    created_at: i64,
    retry_count: u32,
    terminal: bool,
}

impl KeyRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            key_data: row.get(1)?,
            rolling_start_interval_number: row.get(2)?,
            rolling_period: row.get(3)?,
            transmission_risk_level: row.get(4)?,
            visited_countries: row.get(5)?,
            origin: row.get(6)?,
            report_type: row.get(7)?,
            days_since_onset_of_symptoms: row.get(8)?,
            created_at: row.get(9)?,
            retry_count: row.get(10)?,
            terminal: row.get(11)?,
        })
    }

    fn into_persisted(self) -> Result<PersistedKey, StoreError> {
        let id = self.id;
        let key_data: [u8; KEY_LENGTH] =
            self.key_data
                .try_into()
                .map_err(|b: Vec<u8>| StoreError::Corrupt {
                    id,
                    reason: format!("key length {}", b.len()),
                })?;
        let created_at =
            DateTime::from_timestamp_millis(self.created_at).ok_or_else(|| StoreError::Corrupt {
                id,
                reason: format!("created_at {}", self.created_at),
            })?;

        Ok(PersistedKey {
            id,
            created_at,
            retry: if self.terminal {
                RetryState::Terminal
            } else {
                RetryState::Pending {
                    attempts: self.retry_count,
                }
            },
            key: DiagnosisKey {
                key_data,
                rolling_start_interval_number: self.rolling_start_interval_number,
                rolling_period: self.rolling_period,
                transmission_risk_level: self.transmission_risk_level,
                visited_countries: split_countries(&self.visited_countries),
                origin: self.origin,
                report_type: ReportType::from_i32(self.report_type),
                days_since_onset_of_symptoms: self.days_since_onset_of_symptoms,
            },
        })
    }
}

fn split_countries(joined: &str) -> Vec<String> {
    joined
        .split(',')
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

impl KeyStore for SqliteKeyStore {
    fn insert(
        &self,
        key: DiagnosisKey,
        created_at: DateTime<Utc>,
    ) -> Result<PersistedKey, StoreError> {
        let conn = self.connection.lock();
        conn.execute(
            "INSERT INTO diagnosis_keys (
                key_data, rolling_start_interval_number, rolling_period,
                transmission_risk_level, visited_countries, origin, report_type,
                days_since_onset_of_symptoms, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                &key.key_data[..],
                key.rolling_start_interval_number,
                key.rolling_period,
                key.transmission_risk_level,
                key.visited_countries.join(","),
                key.origin,
                key.report_type.as_i32(),
                key.days_since_onset_of_symptoms,
                created_at.timestamp_millis(),
            ],
        )
        .map_err(db)?;

        Ok(PersistedKey {
            id: conn.last_insert_rowid(),
            created_at,
            retry: RetryState::default(),
            key,
        })
    }

    fn pending_since(&self, since: DateTime<Utc>) -> Result<Vec<PersistedKey>, StoreError> {
        let conn = self.connection.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM diagnosis_keys
                 WHERE terminal = 0 AND created_at >= ?1
                 ORDER BY id",
                COLUMNS
            ))
            .map_err(db)?;
        let rows = stmt
            .query_map(params![since.timestamp_millis()], KeyRow::from_row)
            .map_err(db)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db)?;
        rows.into_iter().map(KeyRow::into_persisted).collect()
    }

    fn record_rejection(&self, ids: &[i64]) -> Result<usize, StoreError> {
        self.update_each(
            "UPDATE diagnosis_keys
             SET retry_count = CASE WHEN terminal = 0 THEN retry_count + 1 ELSE retry_count END
             WHERE id = ?1",
            ids,
        )
    }

    fn mark_terminal(&self, ids: &[i64]) -> Result<usize, StoreError> {
        self.update_each("UPDATE diagnosis_keys SET terminal = 1 WHERE id = ?1", ids)
    }

    fn delete(&self, ids: &[i64]) -> Result<usize, StoreError> {
        self.update_each("DELETE FROM diagnosis_keys WHERE id = ?1", ids)
    }

    fn purge(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.connection.lock();
        conn.execute(
            "DELETE FROM diagnosis_keys WHERE terminal = 1 OR created_at < ?1",
            params![cutoff.timestamp_millis()],
        )
        .map_err(db)
    }
}
