//! Lease-based distributed lock.
//!
//! A lock is a key in a shared store holding the holder's token, written only
//! if absent and expiring after the lease so a crashed holder cannot block
//! the job forever. Release deletes the key only while the token still
//! matches.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::LockError;
use crate::logging::structured::LogContext;

/// Default lease for scheduled jobs.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(60 * 60);

/// Namespace prefix separating locks from general cache keys.
pub const LOCK_NAMESPACE: &str = "lock:";

/// Shared key-value store with set-if-absent and expiry.
pub trait LockStore: Send + Sync {
    /// Store `holder` under `key` for `lease` unless a live entry exists.
    /// Returns whether the entry was written.
    fn set_if_absent(&self, key: &str, holder: &str, lease: Duration) -> Result<bool, LockError>;

    /// Delete `key` if it still holds `holder`. Returns whether it was deleted.
    fn delete_if_held(&self, key: &str, holder: &str) -> Result<bool, LockError>;
}

#[derive(Debug)]
struct LeaseEntry {
    holder: String,
    deadline: Instant,
}

/// In-process lock store with lease expiry.
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    entries: Mutex<HashMap<String, LeaseEntry>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockStore for MemoryLockStore {
    fn set_if_absent(&self, key: &str, holder: &str, lease: Duration) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get(key) {
            if entry.deadline > now {
                return Ok(false);
            }
        }

        entries.insert(
            key.to_string(),
            LeaseEntry {
                holder: holder.to_string(),
                deadline: now + lease,
            },
        );
        Ok(true)
    }

    fn delete_if_held(&self, key: &str, holder: &str) -> Result<bool, LockError> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.holder == holder => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Result of an acquisition attempt. Contention is not an error.
#[derive(Debug)]
pub enum Acquisition<'a> {
    Acquired(LockHandle<'a>),
    AlreadyHeld,
}

/// Named lease lock over a shared store.
pub struct DistributedLock {
    store: Arc<dyn LockStore>,
    lease: Duration,
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

impl DistributedLock {
    pub fn new(store: Arc<dyn LockStore>, lease: Duration) -> Self {
        Self { store, lease }
    }

    /// Try to take the lock for `name`.
    pub fn acquire(&self, name: &str, ctx: &LogContext) -> Result<Acquisition<'_>, LockError> {
        let key = format!("{}{}", LOCK_NAMESPACE, name);
        let holder = Uuid::new_v4().to_string();

        if self.store.set_if_absent(&key, &holder, self.lease)? {
            log::info!(
                "{} LOCK_ACQUIRED name={} lease_secs={}",
                ctx,
                name,
                self.lease.as_secs()
            );
            Ok(Acquisition::Acquired(LockHandle {
                lock: self,
                key,
                holder,
                released: false,
                ctx: ctx.clone(),
            }))
        } else {
            log::info!("{} LOCK_HELD_ELSEWHERE name={}", ctx, name);
            Ok(Acquisition::AlreadyHeld)
        }
    }
}

/// Proof of lock ownership. Releases the lock when dropped.
#[derive(Debug)]
pub struct LockHandle<'a> {
    lock: &'a DistributedLock,
    key: String,
    holder: String,
    released: bool,
    ctx: LogContext,
}

impl LockHandle<'_> {
    pub fn name(&self) -> &str {
        &self.key[LOCK_NAMESPACE.len()..]
    }

    /// Release explicitly. Returns false if the lease had already passed to
    /// another holder.
    pub fn release(mut self) -> Result<bool, LockError> {
        self.released = true;
        self.release_inner()
    }

    fn release_inner(&self) -> Result<bool, LockError> {
        let deleted = self.lock.store.delete_if_held(&self.key, &self.holder)?;
        if deleted {
            log::info!("{} LOCK_RELEASED name={}", self.ctx, self.name());
        } else {
            log::warn!("{} LOCK_LEASE_LOST name={}", self.ctx, self.name());
        }
        Ok(deleted)
    }
}

impl Drop for LockHandle<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.release_inner() {
            log::warn!(
                "{} LOCK_RELEASE_FAILED name={} error={}",
                self.ctx,
                self.name(),
                e
            );
        }
    }
}
