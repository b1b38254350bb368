//! Scheduler configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Interval between queue reconciliations against the job store.
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
    /// How long an agent's request for work may wait before returning without a lease.
    #[serde(default = "default_lease_wait_timeout")]
    pub lease_wait_timeout_secs: u64,
    /// Optimistic update attempts before a mutation gives up with a conflict.
    #[serde(default = "default_max_update_attempts")]
    pub max_update_attempts: u32,
    /// How long a batch may stay ready while its pool has no online agents.
    #[serde(default = "default_no_agents_online_grace")]
    pub no_agents_online_grace_secs: u64,
    /// Running time after which a step is timed out.
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,
    #[serde(default = "default_step_timeout_check_interval")]
    pub step_timeout_check_interval_secs: u64,
}

fn default_reconcile_interval() -> u64 {
    5
}

fn default_lease_wait_timeout() -> u64 {
    30
}

fn default_max_update_attempts() -> u32 {
    10
}

fn default_no_agents_online_grace() -> u64 {
    3600
}

fn default_step_timeout() -> u64 {
    24 * 60 * 60
}

fn default_step_timeout_check_interval() -> u64 {
    60
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_reconcile_interval(),
            lease_wait_timeout_secs: default_lease_wait_timeout(),
            max_update_attempts: default_max_update_attempts(),
            no_agents_online_grace_secs: default_no_agents_online_grace(),
            step_timeout_secs: default_step_timeout(),
            step_timeout_check_interval_secs: default_step_timeout_check_interval(),
        }
    }
}

impl SchedulerConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn lease_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_wait_timeout_secs)
    }

    pub fn no_agents_online_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.no_agents_online_grace_secs as i64)
    }

    pub fn step_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.step_timeout_secs as i64)
    }

    pub fn step_timeout_check_interval(&self) -> Duration {
        Duration::from_secs(self.step_timeout_check_interval_secs)
    }
}
