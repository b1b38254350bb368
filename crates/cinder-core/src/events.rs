//! Domain events published after job mutations commit.

use crate::agent::LeaseOutcome;
use crate::ids::*;
use crate::job::{BatchErrorCode, BatchState, JobState, LabelState, StepOutcome, StepState};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// All events in the Cinder system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    JobCreated(JobCreatedPayload),
    JobScheduled(JobScheduledPayload),
    JobCompleted(JobCompletedPayload),
    BatchStateChanged(BatchStateChangedPayload),
    StepStateChanged(StepStateChangedPayload),
    LabelUpdated(LabelUpdatedPayload),
    LeaseCancelRequested(LeaseCancelRequestedPayload),
    LeaseFinished(LeaseFinishedPayload),
}

impl Event {
    /// Returns the NATS subject for this event.
    pub fn subject(&self) -> String {
        match self {
            Event::JobCreated(p) => format!("job.created.{}", p.stream_id),
            Event::JobScheduled(p) => format!("job.{}.scheduled", p.job_id),
            Event::JobCompleted(p) => format!("job.{}.completed", p.job_id),
            Event::BatchStateChanged(p) => format!("job.{}.batch.{}.state", p.job_id, p.batch_id),
            Event::StepStateChanged(p) => format!(
                "job.{}.batch.{}.step.{}.state",
                p.job_id, p.batch_id, p.step_id
            ),
            Event::LabelUpdated(p) => format!("job.{}.label.{}", p.job_id, p.label_idx),
            Event::LeaseCancelRequested(p) => format!("lease.{}.cancel", p.lease_id),
            Event::LeaseFinished(p) => format!("lease.{}.finished", p.lease_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobCreatedPayload {
    pub job_id: JobId,
    pub stream_id: StreamId,
    pub template_id: TemplateId,
    pub change: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobScheduledPayload {
    pub job_id: JobId,
    pub batch_id: BatchId,
    pub lease_id: LeaseId,
    pub agent_id: AgentId,
    pub pool_id: PoolId,
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobCompletedPayload {
    pub job_id: JobId,
    pub state: JobState,
    pub outcome: StepOutcome,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BatchStateChangedPayload {
    pub job_id: JobId,
    pub batch_id: BatchId,
    pub state: BatchState,
    pub error: BatchErrorCode,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StepStateChangedPayload {
    pub job_id: JobId,
    pub batch_id: BatchId,
    pub step_id: StepId,
    pub node_name: String,
    pub state: StepState,
    pub outcome: StepOutcome,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LabelUpdatedPayload {
    pub job_id: JobId,
    pub label_idx: usize,
    pub name: Option<String>,
    pub state: LabelState,
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LeaseCancelRequestedPayload {
    pub lease_id: LeaseId,
    pub job_id: JobId,
    pub batch_id: BatchId,
    pub agent_id: Option<AgentId>,
    pub reason: BatchErrorCode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LeaseFinishedPayload {
    pub lease_id: LeaseId,
    pub job_id: JobId,
    pub batch_id: BatchId,
    pub outcome: LeaseOutcome,
    pub finished_at: DateTime<Utc>,
}
