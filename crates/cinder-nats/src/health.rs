//! Event bus health derived from its counters.

use crate::metrics::BusMetrics;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    /// Connected, but events have been lost on the way.
    Degraded { reason: String },
    Unhealthy { reason: String },
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    /// Healthy or degraded.
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded { .. })
    }
}

#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub connected: bool,
    pub events_published: u64,
    pub events_received: u64,
    pub publish_failures: u64,
    pub events_dropped: u64,
}

impl HealthCheck {
    pub fn from_metrics(metrics: &BusMetrics, connected: bool) -> Self {
        let snapshot = metrics.snapshot();

        let status = if !connected {
            HealthStatus::Unhealthy {
                reason: "Event bus is not connected".to_string(),
            }
        } else if snapshot.publish_failures > 0 {
            HealthStatus::Degraded {
                reason: format!("{} publish failures recorded", snapshot.publish_failures),
            }
        } else if snapshot.events_dropped > 0 {
            HealthStatus::Degraded {
                reason: format!("{} events dropped by slow subscribers", snapshot.events_dropped),
            }
        } else {
            HealthStatus::Healthy
        };

        Self {
            status,
            connected,
            events_published: snapshot.events_published,
            events_received: snapshot.events_received,
            publish_failures: snapshot.publish_failures,
            events_dropped: snapshot.events_dropped,
        }
    }
}
