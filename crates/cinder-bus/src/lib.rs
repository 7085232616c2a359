//! In-process event bus for Cinder CI.

mod bus;
pub mod config;
pub mod metrics;

pub use bus::InMemoryEventBus;
pub use config::BusConfig;
pub use metrics::{BusMetrics, MetricsSnapshot};
