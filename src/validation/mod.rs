//! Validation module.
//!
//! Checks downloaded gateway records before they are grouped and
//! republished:
//! - Key material length and encoding
//! - Rolling period bounds
//! - Origin and visited country codes

pub mod keys;

pub use keys::*;
