//! Structured logging with run context.
//!
//! Provides logging macros and utilities that include run_id, batch and
//! country group in every log message for easy correlation across a
//! scheduled invocation.

pub mod structured;

pub use structured::*;
