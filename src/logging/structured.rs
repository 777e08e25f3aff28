//! Structured logging utilities.
//!
//! Provides context-aware logging with run_id, batch tag and country group
//! included in every log message.

use std::fmt;

/// Logging context for one pipeline invocation.
#[derive(Debug, Clone)]
pub struct LogContext {
    pub run_id: String,
    pub batch: Option<String>,
    pub group: Option<String>,
}

impl LogContext {
    pub fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            batch: None,
            group: None,
        }
    }

    pub fn with_batch(&self, batch: &str) -> Self {
        Self {
            run_id: self.run_id.clone(),
            batch: Some(batch.to_string()),
            group: self.group.clone(),
        }
    }

    pub fn with_group(&self, group: &str) -> Self {
        Self {
            run_id: self.run_id.clone(),
            batch: self.batch.clone(),
            group: Some(group.to_string()),
        }
    }
}

impl fmt::Display for LogContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[run={}]", self.run_id)?;
        if let Some(group) = &self.group {
            write!(f, " [group={}]", group)?;
        }
        if let Some(batch) = &self.batch {
            write!(f, " [batch={}]", batch)?;
        }
        Ok(())
    }
}

/// Log an info message with context.
#[macro_export]
macro_rules! log_info {
    ($ctx:expr, $event:expr $(, $key:ident = $value:expr)* $(,)?) => {
        log::info!(
            concat!("{} {}", $(" ", stringify!($key), "={:?}",)*),
            $ctx,
            $event,
            $($value,)*
        );
    };
}

/// Log a warning message with context.
#[macro_export]
macro_rules! log_warn {
    ($ctx:expr, $event:expr $(, $key:ident = $value:expr)* $(,)?) => {
        log::warn!(
            concat!("{} {}", $(" ", stringify!($key), "={:?}",)*),
            $ctx,
            $event,
            $($value,)*
        );
    };
}

/// Log an error message with context.
#[macro_export]
macro_rules! log_error {
    ($ctx:expr, $event:expr $(, $key:ident = $value:expr)* $(,)?) => {
        log::error!(
            concat!("{} {}", $(" ", stringify!($key), "={:?}",)*),
            $ctx,
            $event,
            $($value,)*
        );
    };
}

/// Log a debug message with context.
#[macro_export]
macro_rules! log_debug {
    ($ctx:expr, $event:expr $(, $key:ident = $value:expr)* $(,)?) => {
        log::debug!(
            concat!("{} {}", $(" ", stringify!($key), "={:?}",)*),
            $ctx,
            $event,
            $($value,)*
        );
    };
}
