//! Security module.
//!
//! Provides detached batch signing for gateway uploads and the key-set HMAC
//! that binds verification certificates to published keys.

pub mod key_hmac;
pub mod signing;

pub use key_hmac::*;
pub use signing::*;
