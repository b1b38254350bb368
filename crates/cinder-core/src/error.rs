//! Error types for Cinder.

use crate::graph::GraphError;
use crate::ids::{BatchId, ContentHash, JobId, StepId};
use thiserror::Error;

/// Failures raised while laying out batches and steps for a job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("Node '{0}' does not allow retries")]
    RetryNotAllowed(String),

    #[error("Node '{node}' has exhausted its retry budget ({attempts} attempts)")]
    RetryLimitExceeded { node: String, attempts: u32 },

    #[error("Unknown target: {0}")]
    UnknownTarget(String),

    #[error("Node '{0}' does not exist in the job's graph")]
    NodeNotFound(String),

    #[error("Job has run out of batch and step ids")]
    IdsExhausted,
}

#[derive(Debug, Error)]
pub enum Error {
    // Job errors
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Batch {batch_id} not found in job {job_id}")]
    BatchNotFound { job_id: JobId, batch_id: BatchId },

    #[error("Step {step_id} not found in batch {batch_id} of job {job_id}")]
    StepNotFound {
        job_id: JobId,
        batch_id: BatchId,
        step_id: StepId,
    },

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Job {0} was modified concurrently too many times")]
    Conflict(JobId),

    // Graph errors
    #[error("Graph not found: {0}")]
    GraphNotFound(ContentHash),

    #[error("Invalid graph: {0}")]
    InvalidGraph(#[from] GraphError),

    // Planning errors
    #[error("Planning failed: {0}")]
    Plan(#[from] PlanError),

    // Infrastructure errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Event bus error: {0}")]
    EventBus(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
