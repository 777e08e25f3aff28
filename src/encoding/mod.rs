//! Encoding module.
//!
//! Canonical byte encoding used for signing and batch tags, and the wire
//! formats spoken with the federation gateway.

pub mod canonical;
pub mod wire;

pub use canonical::*;
pub use wire::*;
