//! Remote service clients.
//!
//! Each remote party is a trait so pipelines can be driven by in-process
//! fakes; the `Http*` implementations speak the real protocols over
//! blocking `reqwest` clients.

pub mod gateway;
pub mod http;
pub mod keyserver;
pub mod verification;

pub use gateway::*;
pub use http::HttpSettings;
pub use keyserver::*;
pub use verification::*;
