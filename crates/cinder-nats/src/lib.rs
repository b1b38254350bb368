//! Event bus implementations for Cinder.
//!
//! [`NatsEventBus`] publishes to a JetStream stream for multi-process deployments.
//! [`BroadcastEventBus`] keeps events inside the process for tests and single-node runs.

mod bus;
pub mod config;
pub mod health;
pub mod memory;
pub mod metrics;

pub use bus::{NatsEventBus, StreamInfo};
pub use config::NatsConfig;
pub use health::{HealthCheck, HealthStatus};
pub use memory::{BroadcastEventBus, subject_matches};
pub use metrics::{BusMetrics, MetricsSnapshot};
