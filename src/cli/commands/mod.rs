//! CLI command implementations.

mod ask;
mod config;
mod ingest;
mod serve;
mod status;

pub use ask::run_ask;
pub use config::run_config;
pub use ingest::{run_extract, run_index, run_ingest};
pub use serve::run_serve;
pub use status::run_status;
