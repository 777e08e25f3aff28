//! Synchronization pipelines.
//!
//! - `upload` - local keys to the federation gateway
//! - `download` - gateway keys to the local key server, under the job lock
//! - `publish` - the per-group verification and publish exchange

pub mod context;
pub mod download;
pub mod publish;
pub mod upload;

pub use context::*;
pub use download::{DownloadPipeline, DownloadReport};
pub use publish::{PublishPipeline, PublishReport};
pub use upload::{UploadPipeline, UploadReport};
