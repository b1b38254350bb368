//! Job records: the mutable execution state of one graph.
//!
//! A [`Job`] references an immutable [`Graph`](crate::graph::Graph) by hash and holds
//! the batches and steps laid out for it. Records are treated as copy-on-write values:
//! mutations operate on a clone and are committed through the job store's
//! `update_index` compare-and-swap.

use crate::error::PlanError;
use crate::graph::{NodeRef, Priority};
use crate::ids::{
    AgentId, BatchId, ContentHash, JobId, LeaseId, LogId, PoolId, SessionId, StepId, StreamId,
    TemplateId,
};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default number of retries allowed per node, beyond the original attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// User recorded on requests made by the system itself (auto-retry, timeouts).
pub const SYSTEM_USER: &str = "system";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Waiting,
    Ready,
    Starting,
    Running,
    Stopping,
    Complete,
}

impl BatchState {
    /// Batches that have been handed to an agent but not finished.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, BatchState::Starting | BatchState::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Waiting,
    Ready,
    Running,
    Completed,
    Aborted,
    Skipped,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepState::Completed | StepState::Aborted | StepState::Skipped
        )
    }

    /// Steps that have not started and may be freely replanned.
    pub fn is_unstarted(&self) -> bool {
        matches!(self, StepState::Waiting | StepState::Ready)
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    #[default]
    Unspecified,
    Success,
    Warnings,
    Failure,
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Success | StepOutcome::Warnings)
    }
}

/// Systemic error attached to a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorCode {
    #[default]
    None,
    /// The step exceeded the running time bound.
    TimedOut,
    /// The step was skipped administratively.
    Paused,
    /// The batch ended before the step finished.
    Incomplete,
}

/// Batch-level error taxonomy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BatchErrorCode {
    #[default]
    None,
    UnknownStream,
    UnknownAgentType,
    UnknownPool,
    NoAgentsInPool,
    NoAgentsOnline,
    UnknownWorkspace,
    Cancelled,
    LostConnection,
    Incomplete,
    ExecutionError,
    UnknownShelf,
    NoLongerNeeded,
    SyncingFailed,
}

impl BatchErrorCode {
    /// Errors that prevent the nodes of a batch from being rescheduled.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, BatchErrorCode::None | BatchErrorCode::Incomplete)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Step {
    pub id: StepId,
    /// Index of the node within the batch's group.
    pub node_idx: usize,
    pub state: StepState,
    pub outcome: StepOutcome,
    pub error: StepErrorCode,
    /// Priority override for this node, replacing the graph's priority.
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub abort_requested: bool,
    #[serde(default)]
    pub abort_by: Option<String>,
    #[serde(default)]
    pub retry_by: Option<String>,
    #[serde(default)]
    pub ready_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finish_time: Option<DateTime<Utc>>,
}

impl Step {
    pub fn new(id: StepId, node_idx: usize) -> Self {
        Self {
            id,
            node_idx,
            state: StepState::Waiting,
            outcome: StepOutcome::Unspecified,
            error: StepErrorCode::None,
            priority: None,
            abort_requested: false,
            abort_by: None,
            retry_by: None,
            ready_time: None,
            start_time: None,
            finish_time: None,
        }
    }

    pub fn is_retry_requested(&self) -> bool {
        self.retry_by.is_some()
    }

    /// Whether this step counts as an execution attempt of its node.
    pub fn has_executed(&self) -> bool {
        self.start_time.is_some() || matches!(self.state, StepState::Running)
    }

    /// Whether the step ended without success.
    pub fn is_failed(&self) -> bool {
        match self.state {
            StepState::Skipped => true,
            StepState::Completed | StepState::Aborted => {
                self.outcome == StepOutcome::Failure
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Batch {
    pub id: BatchId,
    pub group_idx: usize,
    pub state: BatchState,
    pub error: BatchErrorCode,
    /// Steps ordered by ascending node index.
    pub steps: Vec<Step>,
    #[serde(default)]
    pub pool_id: Option<PoolId>,
    #[serde(default)]
    pub agent_id: Option<AgentId>,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub lease_id: Option<LeaseId>,
    #[serde(default)]
    pub log_id: Option<LogId>,
    /// `job.priority * 10 + max node priority + 1`; zero means not scheduled.
    pub schedule_priority: i32,
    #[serde(default)]
    pub ready_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finish_time: Option<DateTime<Utc>>,
}

impl Batch {
    pub fn new(id: BatchId, group_idx: usize) -> Self {
        Self {
            id,
            group_idx,
            state: BatchState::Waiting,
            error: BatchErrorCode::None,
            steps: Vec::new(),
            pool_id: None,
            agent_id: None,
            session_id: None,
            lease_id: None,
            log_id: None,
            schedule_priority: 0,
            ready_time: None,
            start_time: None,
            finish_time: None,
        }
    }

    pub fn node_ref(&self, step: &Step) -> NodeRef {
        NodeRef::new(self.group_idx, step.node_idx)
    }

    pub fn find_step(&self, step_id: StepId) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn find_step_mut(&mut self, step_id: StepId) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    /// Whether new steps may still be appended to this batch.
    pub fn is_appendable(&self) -> bool {
        self.state <= BatchState::Running && self.error == BatchErrorCode::None
    }

    /// Whether the batch is waiting in the dispatch queue.
    pub fn is_dispatchable(&self) -> bool {
        self.state == BatchState::Ready
            && self.agent_id.is_none()
            && self.error == BatchErrorCode::None
    }

    pub fn has_lease(&self) -> bool {
        self.lease_id.is_some()
    }

    pub fn clear_assignment(&mut self) {
        self.agent_id = None;
        self.session_id = None;
        self.lease_id = None;
        self.log_id = None;
    }
}

/// Options fixed at job creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JobOptions {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Running,
    Complete,
}

/// Progress of a graph label within a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LabelState {
    /// The job does not run every required node of the label.
    #[default]
    Unspecified,
    Running,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    pub id: JobId,
    pub stream_id: StreamId,
    pub template_id: TemplateId,
    pub graph_hash: ContentHash,
    pub change: i32,
    pub priority: Priority,
    pub arguments: Vec<String>,
    #[serde(default)]
    pub options: JobOptions,
    pub batches: Vec<Batch>,
    #[serde(default)]
    pub abort_by: Option<String>,
    /// Optimistic concurrency version; advanced by the store on every write.
    pub update_index: u64,
    /// Maximum schedule priority over dispatchable batches; zero when nothing is queued.
    pub schedule_priority: i32,
    /// Next sub-resource id to hand out for batches and steps.
    pub next_sub_resource_id: u16,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn is_aborted(&self) -> bool {
        self.abort_by.is_some()
    }

    pub fn find_batch(&self, batch_id: BatchId) -> Option<&Batch> {
        self.batches.iter().find(|b| b.id == batch_id)
    }

    pub fn find_batch_mut(&mut self, batch_id: BatchId) -> Option<&mut Batch> {
        self.batches.iter_mut().find(|b| b.id == batch_id)
    }

    pub fn find_batch_by_lease(&self, lease_id: LeaseId) -> Option<&Batch> {
        self.batches.iter().find(|b| b.lease_id == Some(lease_id))
    }

    /// Allocate a new sub-resource id, unique within this job. Ids are never reused, so
    /// the allocation fails once the counter runs out.
    pub fn allocate_sub_resource_id(&mut self) -> Result<u16, PlanError> {
        let id = self.next_sub_resource_id;
        self.next_sub_resource_id = id.checked_add(1).ok_or(PlanError::IdsExhausted)?;
        Ok(id)
    }

    /// All steps for a node, in creation order.
    pub fn steps_for_node(&self, node_ref: NodeRef) -> impl Iterator<Item = (&Batch, &Step)> {
        self.batches
            .iter()
            .filter(move |b| b.group_idx == node_ref.group_idx)
            .flat_map(move |b| {
                b.steps
                    .iter()
                    .filter(move |s| s.node_idx == node_ref.node_idx)
                    .map(move |s| (b, s))
            })
    }

    /// Number of times a node has started executing in this job.
    pub fn attempt_count(&self, node_ref: NodeRef) -> u32 {
        self.steps_for_node(node_ref)
            .filter(|(_, s)| s.has_executed())
            .count() as u32
    }

    pub fn state(&self) -> JobState {
        if self.batches.iter().all(|b| b.state == BatchState::Complete) {
            JobState::Complete
        } else if self.batches.iter().any(|b| {
            matches!(
                b.state,
                BatchState::Starting | BatchState::Running | BatchState::Stopping
            )
        }) {
            JobState::Running
        } else {
            JobState::Waiting
        }
    }
}
