//! Cross-instance coordination.
//!
//! Scheduled jobs run on stateless instances; a lease-based lock in a shared
//! key-value store keeps one job of each name running at a time.

pub mod lock;
pub mod sqlite;

pub use lock::*;
pub use sqlite::SqliteLockStore;
