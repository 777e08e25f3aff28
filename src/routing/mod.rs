//! Routing module.
//!
//! Decides where downloaded keys are republished:
//! - Grouping by origin country
//! - Country to Health Authority ID resolution

pub mod authority;

pub use authority::*;
