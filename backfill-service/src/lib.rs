pub mod config;
pub mod engine;
pub mod metrics_server;
pub mod observability;
pub mod sinks;
pub mod sources;

pub use engine::{BackfillEngine, BackfillReport, DeviceRef};
