//! Batching module.
//!
//! Splits key collections for network calls:
//! - Contiguous fixed-size chunks for gateway uploads
//! - Overlap-bounded chunks the key server accepts as-is

pub mod contiguous;
pub mod overlap;

pub use contiguous::*;
pub use overlap::*;
