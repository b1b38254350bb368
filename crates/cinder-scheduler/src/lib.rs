//! Batch planning, readiness propagation and dispatch for Cinder.
//!
//! [`planner`] lays out batches and steps for a job, [`readiness`] advances them as
//! dependencies finish, [`jobs::JobService`] commits every change with optimistic
//! concurrency, and [`scheduler::DispatchScheduler`] hands ready batches to agents.

pub mod agents;
pub mod config;
pub mod dag;
pub mod jobs;
pub mod labels;
pub mod planner;
pub mod queue;
pub mod readiness;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use config::SchedulerConfig;
pub use jobs::{CreateJobRequest, JobListener, JobService};
pub use scheduler::{DispatchScheduler, QueueSnapshot};
