//! Storage module.
//!
//! Diagnosis key models and the export table seam.
//! `SqliteKeyStore` is the durable table; `MemoryKeyStore` backs tests.

pub mod models;
pub mod sqlite;
pub mod store;

pub use models::*;
pub use sqlite::SqliteKeyStore;
pub use store::*;
