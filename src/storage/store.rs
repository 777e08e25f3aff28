//! Diagnosis key export table.
//!
//! `KeyStore` is the seam to the persistent key table. `mark_terminal`,
//! `delete` and `purge` are idempotent per key id; `record_rejection`
//! counts one attempt per call.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::StoreError;

use super::models::{DiagnosisKey, PersistedKey, RetryState};

/// Persistent table of diagnosis keys awaiting export.
pub trait KeyStore: Send + Sync {
    /// Insert a freshly published key with `Pending { attempts: 0 }`.
    fn insert(&self, key: DiagnosisKey, created_at: DateTime<Utc>)
        -> Result<PersistedKey, StoreError>;

    /// Non-terminal keys created at or after `since`, ordered by id.
    fn pending_since(&self, since: DateTime<Utc>) -> Result<Vec<PersistedKey>, StoreError>;

    /// Count one more rejected upload attempt for each key. Unknown ids are skipped.
    fn record_rejection(&self, ids: &[i64]) -> Result<usize, StoreError>;

    /// Move keys to the terminal state. Unknown ids are skipped.
    fn mark_terminal(&self, ids: &[i64]) -> Result<usize, StoreError>;

    /// Delete keys by id. Unknown ids are skipped.
    fn delete(&self, ids: &[i64]) -> Result<usize, StoreError>;

    /// Delete terminal keys and any key created before `cutoff`.
    fn purge(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// In-process key table.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    inner: Mutex<MemoryTable>,
}

#[derive(Debug, Default)]
struct MemoryTable {
    next_id: i64,
    rows: BTreeMap<i64, PersistedKey>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: i64) -> Option<PersistedKey> {
        self.inner.lock().rows.get(&id).cloned()
    }
}

impl KeyStore for MemoryKeyStore {
    fn insert(
        &self,
        key: DiagnosisKey,
        created_at: DateTime<Utc>,
    ) -> Result<PersistedKey, StoreError> {
        let mut table = self.inner.lock();
        table.next_id += 1;
        let row = PersistedKey {
            id: table.next_id,
            created_at,
            retry: RetryState::default(),
            key,
        };
        table.rows.insert(row.id, row.clone());
        Ok(row)
    }

    fn pending_since(&self, since: DateTime<Utc>) -> Result<Vec<PersistedKey>, StoreError> {
        let table = self.inner.lock();
        Ok(table
            .rows
            .values()
            .filter(|row| !row.retry.is_terminal() && row.created_at >= since)
            .cloned()
            .collect())
    }

    fn record_rejection(&self, ids: &[i64]) -> Result<usize, StoreError> {
        let mut table = self.inner.lock();
        let mut updated = 0;
        for id in ids {
            if let Some(row) = table.rows.get_mut(id) {
                row.retry = row.retry.after_rejection();
                updated += 1;
            }
        }
        Ok(updated)
    }

    fn mark_terminal(&self, ids: &[i64]) -> Result<usize, StoreError> {
        let mut table = self.inner.lock();
        let mut updated = 0;
        for id in ids {
            if let Some(row) = table.rows.get_mut(id) {
                row.retry = RetryState::Terminal;
                updated += 1;
            }
        }
        Ok(updated)
    }

    fn delete(&self, ids: &[i64]) -> Result<usize, StoreError> {
        let mut table = self.inner.lock();
        Ok(ids
            .iter()
            .filter(|id| table.rows.remove(*id).is_some())
            .count())
    }

    fn purge(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut table = self.inner.lock();
        let before = table.rows.len();
        table
            .rows
            .retain(|_, row| !row.retry.is_terminal() && row.created_at >= cutoff);
        Ok(before - table.rows.len())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::storage::models::ReportType;

    fn key(byte: u8) -> DiagnosisKey {
        DiagnosisKey {
            key_data: [byte; 16],
            rolling_start_interval_number: 2_680_000,
            rolling_period: 144,
            transmission_risk_level: 2,
            visited_countries: vec![],
            origin: "IE".to_string(),
            report_type: ReportType::ConfirmedTest,
            days_since_onset_of_symptoms: 0,
        }
    }

    #[test]
    fn test_pending_excludes_terminal_and_old() {
        let store = MemoryKeyStore::new();
        let now = Utc::now();
        let fresh = store.insert(key(1), now).unwrap();
        let done = store.insert(key(2), now).unwrap();
        let _old = store.insert(key(3), now - Duration::days(20)).unwrap();

        store.mark_terminal(&[done.id]).unwrap();

        let pending = store.pending_since(now - Duration::days(14)).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, fresh.id);
    }

    #[test]
    fn test_record_rejection_counts_each_call() {
        let store = MemoryKeyStore::new();
        let row = store.insert(key(1), Utc::now()).unwrap();
        assert_eq!(store.record_rejection(&[row.id, 999]).unwrap(), 1);
        assert_eq!(store.record_rejection(&[row.id]).unwrap(), 1);
        assert_eq!(
            store.get(row.id).unwrap().retry,
            RetryState::Pending { attempts: 2 }
        );
    }

    #[test]
    fn test_purge_removes_terminal_and_expired() {
        let store = MemoryKeyStore::new();
        let now = Utc::now();
        let keep = store.insert(key(1), now).unwrap();
        let done = store.insert(key(2), now).unwrap();
        store.insert(key(3), now - Duration::days(30)).unwrap();
        store.mark_terminal(&[done.id]).unwrap();

        assert_eq!(store.purge(now - Duration::days(14)).unwrap(), 2);
        assert_eq!(store.len(), 1);
        assert!(store.get(keep.id).is_some());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let store = MemoryKeyStore::new();
        let row = store.insert(key(1), Utc::now()).unwrap();
        assert_eq!(store.delete(&[row.id]).unwrap(), 1);
        assert_eq!(store.delete(&[row.id]).unwrap(), 0);
        assert!(store.is_empty());
    }
}
