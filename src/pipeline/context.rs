//! Pipeline context management.
//!
//! Provides run context for logging, the run date and cooperative
//! cancellation shared by one invocation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::logging::structured::LogContext;

/// Cancellation flag shared with whoever triggered the invocation.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Context for one pipeline invocation.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub cancellation: CancellationFlag,
}

impl RunContext {
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    /// Context with a fixed start time.
    pub fn at(started_at: DateTime<Utc>) -> Self {
        let run_id = format!("run-{}", &Uuid::new_v4().to_string()[..8]);
        Self {
            run_id,
            started_at,
            cancellation: CancellationFlag::new(),
        }
    }

    pub fn with_cancellation(mut self, cancellation: CancellationFlag) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn run_date(&self) -> NaiveDate {
        self.started_at.date_naive()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn log_context(&self) -> LogContext {
        LogContext::new(&self.run_id)
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_format() {
        let ctx = RunContext::new();
        assert!(ctx.run_id.starts_with("run-"));
        assert_eq!(ctx.run_id.len(), "run-".len() + 8);
    }

    #[test]
    fn test_cancellation_shared() {
        let flag = CancellationFlag::new();
        let ctx = RunContext::new().with_cancellation(flag.clone());
        assert!(!ctx.is_cancelled());
        flag.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_run_date() {
        let started = DateTime::parse_from_rfc3339("2020-12-10T23:59:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            RunContext::at(started).run_date(),
            NaiveDate::from_ymd_opt(2020, 12, 10).unwrap()
        );
    }
}
