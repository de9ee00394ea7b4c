pub mod api;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod partitioning;
pub mod pipeline;
pub mod query;
pub mod retry;
pub mod storage;
#[doc(hidden)]
pub mod testing;
pub mod window;

pub use error::{PipelineError, Result};
