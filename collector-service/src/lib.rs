pub mod api;
pub mod config;
pub mod filter;
pub mod import;
pub mod metrics_server;
pub mod observability;
pub mod pipeline;
pub mod protocol;
pub mod sink;
pub mod sources;
pub mod supervisor;
pub mod transform;

pub use pipeline::{Envelope, IngestCounters, Pipeline};
