//! Job service: the single write path for job records.
//!
//! Every operation reads the current record, applies its change to a copy, reruns the
//! batch planner and readiness propagation, and commits through the job store's
//! compare-and-swap on `update_index`. A writer that loses the race re-reads the record
//! and recomputes its change. Listeners and the event bus only ever see committed
//! records.

use crate::config::SchedulerConfig;
use crate::dag::GraphIndex;
use crate::labels::{job_outcome, label_statuses};
use crate::planner::{self, PlanReport};
use crate::queue::QueueItem;
use crate::readiness;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cinder_core::agent::{Lease, LeaseOutcome};
use cinder_core::error::PlanError;
use cinder_core::events::{
    BatchStateChangedPayload, Event, JobCompletedPayload, JobCreatedPayload, JobScheduledPayload,
    LabelUpdatedPayload, LeaseCancelRequestedPayload, LeaseFinishedPayload,
    StepStateChangedPayload,
};
use cinder_core::graph::{Graph, NodeRef, Priority};
use cinder_core::ids::{
    AgentId, BatchId, ContentHash, JobId, LeaseId, LogId, SessionId, StepId, StreamId, TemplateId,
};
use cinder_core::job::{
    BatchErrorCode, BatchState, Job, JobOptions, JobState, SYSTEM_USER, StepErrorCode,
    StepOutcome, StepState,
};
use cinder_core::ports::{EventBus, GraphStore, JobStore};
use cinder_core::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Parameters for a new job.
#[derive(Debug, Clone)]
pub struct CreateJobRequest {
    pub stream_id: StreamId,
    pub template_id: TemplateId,
    pub graph_hash: ContentHash,
    pub change: i32,
    pub priority: Priority,
    pub arguments: Vec<String>,
    pub options: JobOptions,
}

/// Observer of committed job records.
#[async_trait]
pub trait JobListener: Send + Sync {
    async fn job_updated(&self, job: &Job, graph: &Graph);

    async fn job_removed(&self, _job_id: JobId) {}
}

struct Commit<T> {
    job: Job,
    value: T,
}

pub struct JobService {
    jobs: Arc<dyn JobStore>,
    graphs: Arc<dyn GraphStore>,
    event_bus: Arc<dyn EventBus>,
    config: SchedulerConfig,
    indexes: RwLock<HashMap<ContentHash, Arc<GraphIndex>>>,
    listeners: RwLock<Vec<Arc<dyn JobListener>>>,
}

impl JobService {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        graphs: Arc<dyn GraphStore>,
        event_bus: Arc<dyn EventBus>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            jobs,
            graphs,
            event_bus,
            config,
            indexes: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn job_store(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    pub async fn add_listener(&self, listener: Arc<dyn JobListener>) {
        self.listeners.write().await.push(listener);
    }

    /// Dependency index for a stored graph, built once per hash.
    pub async fn graph_index(&self, hash: &ContentHash) -> Result<Arc<GraphIndex>> {
        if let Some(index) = self.indexes.read().await.get(hash) {
            return Ok(index.clone());
        }
        let graph = self
            .graphs
            .get(hash)
            .await?
            .ok_or_else(|| Error::GraphNotFound(hash.clone()))?;
        let index = Arc::new(GraphIndex::new(graph)?);
        self.indexes
            .write()
            .await
            .insert(hash.clone(), index.clone());
        Ok(index)
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Job> {
        self.jobs
            .get(job_id)
            .await?
            .ok_or(Error::JobNotFound(job_id))
    }

    /// Create a job and lay out its first batches.
    pub async fn create_job(&self, request: CreateJobRequest) -> Result<Job> {
        let index = self.graph_index(&request.graph_hash).await?;
        let now = Utc::now();
        let mut job = Job {
            id: JobId::new(),
            stream_id: request.stream_id,
            template_id: request.template_id,
            graph_hash: request.graph_hash,
            change: request.change,
            priority: request.priority,
            arguments: request.arguments,
            options: request.options,
            batches: Vec::new(),
            abort_by: None,
            update_index: 0,
            schedule_priority: 0,
            next_sub_resource_id: 1,
            created_at: now,
            updated_at: None,
        };
        let report = planner::plan(&mut job, &index, now)?;
        readiness::propagate(&mut job, &index, now);

        let job = self.jobs.add(&job).await?;
        info!(
            job_id = %job.id,
            stream_id = %job.stream_id,
            change = job.change,
            batches = job.batches.len(),
            "Job created"
        );

        let created = Event::JobCreated(JobCreatedPayload {
            job_id: job.id,
            stream_id: job.stream_id.clone(),
            template_id: job.template_id.clone(),
            change: job.change,
            created_at: now,
        });
        self.after_commit(None, &job, &index, &report, vec![created])
            .await;
        Ok(job)
    }

    /// Apply a step state change reported by an agent.
    pub async fn update_step(
        &self,
        job_id: JobId,
        batch_id: BatchId,
        step_id: StepId,
        state: StepState,
        outcome: StepOutcome,
        error: Option<StepErrorCode>,
    ) -> Result<Job> {
        self.mutate_job(job_id, |job, _, now| {
            apply_step_update(job, batch_id, step_id, state, outcome, error, now)
        })
        .await
    }

    /// Apply a batch state change reported by an agent.
    pub async fn update_batch(
        &self,
        job_id: JobId,
        batch_id: BatchId,
        state: BatchState,
        error: Option<BatchErrorCode>,
    ) -> Result<Job> {
        self.mutate_job(job_id, |job, index, now| {
            apply_batch_update(job, index, batch_id, state, error, now)
        })
        .await
    }

    /// Fail a batch that has not been handed to an agent.
    ///
    /// Returns `None` when the batch is no longer pending.
    pub async fn fail_batch(
        &self,
        job_id: JobId,
        batch_id: BatchId,
        error: BatchErrorCode,
    ) -> Result<Option<Job>> {
        let commit = self
            .mutate(job_id, |job, _, now| {
                Ok(apply_fail_batch(job, batch_id, error, now)?.then_some(()))
            })
            .await?;
        if commit.is_some() {
            warn!(job_id = %job_id, batch_id = %batch_id, error = ?error, "Batch cannot be scheduled");
        }
        Ok(commit.map(|c| c.job))
    }

    /// Record a lease for a queued batch.
    ///
    /// Returns `None` when the batch stopped being dispatchable since it was queued.
    pub async fn try_assign_lease(
        &self,
        item: &QueueItem,
        agent_id: AgentId,
        session_id: SessionId,
    ) -> Result<Option<Lease>> {
        let commit = self
            .mutate(item.job_id, |job, _, now| {
                let pos = batch_index(job, item.batch_id)?;
                let job_id = job.id;
                let batch = &mut job.batches[pos];
                if !batch.is_dispatchable() {
                    return Ok(None);
                }
                let lease = Lease {
                    id: LeaseId::new(),
                    log_id: LogId::new(),
                    agent_id,
                    session_id,
                    pool_id: item.pool_id.clone(),
                    job_id,
                    batch_id: batch.id,
                    workspace: item.workspace.clone(),
                    assigned_at: now,
                };
                batch.state = BatchState::Starting;
                batch.pool_id = Some(lease.pool_id.clone());
                batch.agent_id = Some(agent_id);
                batch.session_id = Some(session_id);
                batch.lease_id = Some(lease.id);
                batch.log_id = Some(lease.log_id);
                Ok(Some(lease))
            })
            .await?;

        let Some(Commit { value: lease, .. }) = commit else {
            return Ok(None);
        };
        info!(
            job_id = %lease.job_id,
            batch_id = %lease.batch_id,
            lease_id = %lease.id,
            agent_id = %lease.agent_id,
            "Lease assigned"
        );
        self.publish(vec![Event::JobScheduled(JobScheduledPayload {
            job_id: lease.job_id,
            batch_id: lease.batch_id,
            lease_id: lease.id,
            agent_id: lease.agent_id,
            pool_id: lease.pool_id.clone(),
            scheduled_at: lease.assigned_at,
        })]);
        Ok(Some(lease))
    }

    /// Withdraw a lease. A batch still starting goes back to the queue; a running batch
    /// is completed as cancelled.
    pub async fn cancel_lease(
        &self,
        job_id: JobId,
        batch_id: BatchId,
        lease_id: LeaseId,
    ) -> Result<Option<Job>> {
        let commit = self
            .mutate(job_id, |job, index, now| {
                Ok(apply_cancel_lease(job, index, batch_id, lease_id, now)?.then_some(()))
            })
            .await?;
        let Some(Commit { job, .. }) = commit else {
            return Ok(None);
        };
        info!(job_id = %job_id, batch_id = %batch_id, lease_id = %lease_id, "Lease cancelled");
        let agent_id = job.find_batch(batch_id).and_then(|b| b.agent_id);
        self.publish(vec![Event::LeaseCancelRequested(
            LeaseCancelRequestedPayload {
                lease_id,
                job_id,
                batch_id,
                agent_id,
                reason: BatchErrorCode::Cancelled,
            },
        )]);
        Ok(Some(job))
    }

    /// Settle a batch whose lease ended.
    pub async fn lease_finished(
        &self,
        job_id: JobId,
        batch_id: BatchId,
        lease_id: LeaseId,
        outcome: LeaseOutcome,
    ) -> Result<Option<Job>> {
        let commit = self
            .mutate(job_id, |job, index, now| {
                Ok(apply_lease_finished(job, index, batch_id, lease_id, outcome, now)?
                    .then_some(()))
            })
            .await?;
        self.publish(vec![Event::LeaseFinished(LeaseFinishedPayload {
            lease_id,
            job_id,
            batch_id,
            outcome,
            finished_at: Utc::now(),
        })]);
        match commit {
            Some(Commit { job, .. }) => {
                info!(job_id = %job_id, batch_id = %batch_id, outcome = ?outcome, "Lease finished");
                Ok(Some(job))
            }
            None => {
                debug!(job_id = %job_id, lease_id = %lease_id, "Ignoring finish of a stale lease");
                Ok(None)
            }
        }
    }

    pub async fn abort_job(&self, job_id: JobId, user: &str) -> Result<Job> {
        let job = self
            .mutate_job(job_id, |job, _, _| Ok(apply_abort_job(job, user)))
            .await?;
        info!(job_id = %job_id, user = %user, "Job aborted");
        self.publish(lease_cancellations(&job, BatchErrorCode::Cancelled));
        Ok(job)
    }

    pub async fn abort_step(
        &self,
        job_id: JobId,
        batch_id: BatchId,
        step_id: StepId,
        user: &str,
    ) -> Result<Job> {
        self.mutate_job(job_id, |job, _, now| {
            apply_abort_step(job, batch_id, step_id, user, now)
        })
        .await
    }

    /// Run a finished step again, along with dependents that were skipped because of it.
    pub async fn retry_step(
        &self,
        job_id: JobId,
        batch_id: BatchId,
        step_id: StepId,
        user: &str,
    ) -> Result<Job> {
        let job = self
            .mutate_job(job_id, |job, index, _| {
                apply_retry_step(job, index, batch_id, step_id, user)
            })
            .await?;
        info!(job_id = %job_id, batch_id = %batch_id, step_id = %step_id, user = %user, "Step retry requested");
        Ok(job)
    }

    pub async fn update_step_priority(
        &self,
        job_id: JobId,
        batch_id: BatchId,
        step_id: StepId,
        priority: Priority,
    ) -> Result<Job> {
        self.mutate_job(job_id, |job, _, _| {
            let pos = batch_index(job, batch_id)?;
            let step_pos = step_index(job, pos, step_id)?;
            let step = &mut job.batches[pos].steps[step_pos];
            let changed = step.priority != Some(priority);
            step.priority = Some(priority);
            Ok(changed)
        })
        .await
    }

    pub async fn update_job_priority(&self, job_id: JobId, priority: Priority) -> Result<Job> {
        self.mutate_job(job_id, |job, _, _| {
            let changed = job.priority != priority;
            job.priority = priority;
            Ok(changed)
        })
        .await
    }

    /// Skip every pending step of a batch that has not been handed to an agent.
    pub async fn skip_batch(&self, job_id: JobId, batch_id: BatchId) -> Result<Job> {
        self.mutate_job(job_id, |job, _, now| apply_skip_batch(job, batch_id, now))
            .await
    }

    pub async fn update_arguments(&self, job_id: JobId, arguments: Vec<String>) -> Result<Job> {
        self.mutate_job(job_id, |job, _, _| {
            let changed = job.arguments != arguments;
            job.arguments = arguments.clone();
            Ok(changed)
        })
        .await
    }

    /// Move a job onto another graph. Steps follow their nodes by name.
    pub async fn update_graph(&self, job_id: JobId, graph_hash: &ContentHash) -> Result<Job> {
        let next = self.graph_index(graph_hash).await?;
        let job = self
            .mutate_job(job_id, |job, index, _| {
                apply_graph_update(job, index.graph(), &next)
            })
            .await?;
        info!(job_id = %job_id, graph = %graph_hash, "Job moved to a new graph");
        Ok(job)
    }

    /// Delete a job record. Returns false when the job does not exist.
    pub async fn delete_job(&self, job_id: JobId) -> Result<bool> {
        for attempt in 1..=self.config.max_update_attempts {
            let Some(job) = self.jobs.get(job_id).await? else {
                return Ok(false);
            };
            if self.jobs.remove(job_id, job.update_index).await? {
                for listener in self.listeners.read().await.iter() {
                    listener.job_removed(job_id).await;
                }
                self.publish(lease_cancellations(&job, BatchErrorCode::Cancelled));
                info!(job_id = %job_id, "Job deleted");
                return Ok(true);
            }
            debug!(job_id = %job_id, attempt, "Job delete conflicted, retrying");
        }
        Err(Error::Conflict(job_id))
    }

    /// Time out steps that have been running longer than the configured bound.
    ///
    /// Returns the number of steps timed out.
    pub async fn expire_steps(&self, now: DateTime<Utc>) -> Result<usize> {
        let timeout = self.config.step_timeout();
        let mut expired = 0;
        for job in self.jobs.find_incomplete().await? {
            if !job
                .batches
                .iter()
                .flat_map(|b| &b.steps)
                .any(|s| is_overdue(s.state, s.abort_requested, s.start_time, now, timeout))
            {
                continue;
            }
            let result = self
                .mutate(job.id, |job, _, _| {
                    let count = apply_timeouts(job, now, timeout);
                    Ok((count > 0).then_some(count))
                })
                .await;
            match result {
                Ok(Some(commit)) => {
                    warn!(job_id = %job.id, steps = commit.value, "Steps timed out");
                    expired += commit.value;
                }
                Ok(None) | Err(Error::JobNotFound(_)) => {}
                Err(e) => warn!(job_id = %job.id, error = %e, "Failed to time out steps"),
            }
        }
        Ok(expired)
    }

    /// Commit a change that reports whether it did anything. Unchanged jobs are returned
    /// as currently stored.
    async fn mutate_job<F>(&self, job_id: JobId, mut apply: F) -> Result<Job>
    where
        F: FnMut(&mut Job, &GraphIndex, DateTime<Utc>) -> Result<bool> + Send,
    {
        let commit = self
            .mutate(job_id, |job, index, now| {
                Ok(apply(job, index, now)?.then_some(()))
            })
            .await?;
        match commit {
            Some(commit) => Ok(commit.job),
            None => self.get_job(job_id).await,
        }
    }

    /// Optimistic read-modify-write of one job.
    ///
    /// `apply` returns `None` to leave the job untouched. It may run several times, once
    /// per attempt, always against the latest stored record.
    async fn mutate<T, F>(&self, job_id: JobId, mut apply: F) -> Result<Option<Commit<T>>>
    where
        T: Send,
        F: FnMut(&mut Job, &GraphIndex, DateTime<Utc>) -> Result<Option<T>> + Send,
    {
        for attempt in 1..=self.config.max_update_attempts {
            let current = self.get_job(job_id).await?;
            let index = self.graph_index(&current.graph_hash).await?;
            let now = Utc::now();

            let mut next = current.clone();
            let Some(value) = apply(&mut next, &index, now)? else {
                return Ok(None);
            };
            let index = if next.graph_hash == current.graph_hash {
                index
            } else {
                self.graph_index(&next.graph_hash).await?
            };
            let report = planner::plan(&mut next, &index, now)?;
            readiness::propagate(&mut next, &index, now);
            next.updated_at = Some(now);

            match self.jobs.try_update(&next, current.update_index).await? {
                Some(committed) => {
                    self.after_commit(Some(&current), &committed, &index, &report, Vec::new())
                        .await;
                    return Ok(Some(Commit {
                        job: committed,
                        value,
                    }));
                }
                None => debug!(job_id = %job_id, attempt, "Job update conflicted, retrying"),
            }
        }
        warn!(job_id = %job_id, "Giving up on job update after repeated conflicts");
        Err(Error::Conflict(job_id))
    }

    async fn after_commit(
        &self,
        previous: Option<&Job>,
        job: &Job,
        index: &GraphIndex,
        report: &PlanReport,
        mut events: Vec<Event>,
    ) {
        let graph = index.graph();
        for listener in self.listeners.read().await.iter() {
            listener.job_updated(job, graph).await;
        }

        events.extend(job_events(previous, job, graph, Utc::now()));
        for retired in &report.retired_batches {
            if let Some(lease_id) = retired.lease_id {
                info!(job_id = %job.id, batch_id = %retired.batch_id, "Batch no longer needed");
                events.push(Event::LeaseCancelRequested(LeaseCancelRequestedPayload {
                    lease_id,
                    job_id: job.id,
                    batch_id: retired.batch_id,
                    agent_id: retired.agent_id,
                    reason: BatchErrorCode::NoLongerNeeded,
                }));
            }
        }
        self.publish(events);
    }

    /// Publish in the background. Delivery failures are logged and never fail the
    /// mutation that produced the events.
    fn publish(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let bus = self.event_bus.clone();
        tokio::spawn(async move {
            for event in events {
                let subject = event.subject();
                if let Err(e) = bus.publish(event).await {
                    warn!(subject = %subject, error = %e, "Failed to publish event");
                }
            }
        });
    }
}

/// Events describing the difference between two versions of a job.
pub fn job_events(
    previous: Option<&Job>,
    job: &Job,
    graph: &Graph,
    now: DateTime<Utc>,
) -> Vec<Event> {
    let mut events = Vec::new();

    for batch in &job.batches {
        let before = previous.and_then(|p| p.find_batch(batch.id));
        if before.is_none_or(|b| b.state != batch.state || b.error != batch.error) {
            events.push(Event::BatchStateChanged(BatchStateChangedPayload {
                job_id: job.id,
                batch_id: batch.id,
                state: batch.state,
                error: batch.error,
                timestamp: now,
            }));
        }
        for step in &batch.steps {
            let prior = before.and_then(|b| b.find_step(step.id));
            if prior.is_none_or(|s| s.state != step.state || s.outcome != step.outcome) {
                events.push(Event::StepStateChanged(StepStateChangedPayload {
                    job_id: job.id,
                    batch_id: batch.id,
                    step_id: step.id,
                    node_name: graph
                        .get_node(batch.node_ref(step))
                        .map(|n| n.name.clone())
                        .unwrap_or_default(),
                    state: step.state,
                    outcome: step.outcome,
                    timestamp: now,
                }));
            }
        }
    }

    let prior_labels = previous
        .map(|p| label_statuses(p, graph))
        .unwrap_or_default();
    for (label_idx, status) in label_statuses(job, graph).into_iter().enumerate() {
        let prior = prior_labels.get(label_idx).copied().unwrap_or_default();
        if prior != status {
            events.push(Event::LabelUpdated(LabelUpdatedPayload {
                job_id: job.id,
                label_idx,
                name: graph.labels[label_idx].name.clone(),
                state: status.state,
                outcome: status.outcome,
            }));
        }
    }

    let was_complete = previous.is_some_and(|p| p.state() == JobState::Complete);
    if !was_complete && job.state() == JobState::Complete {
        events.push(Event::JobCompleted(JobCompletedPayload {
            job_id: job.id,
            state: JobState::Complete,
            outcome: job_outcome(job),
            completed_at: now,
        }));
    }
    events
}

/// Cancellation requests for every lease still held on an unfinished batch.
fn lease_cancellations(job: &Job, reason: BatchErrorCode) -> Vec<Event> {
    job.batches
        .iter()
        .filter(|b| b.state != BatchState::Complete)
        .filter_map(|b| {
            b.lease_id.map(|lease_id| {
                Event::LeaseCancelRequested(LeaseCancelRequestedPayload {
                    lease_id,
                    job_id: job.id,
                    batch_id: b.id,
                    agent_id: b.agent_id,
                    reason,
                })
            })
        })
        .collect()
}

fn batch_index(job: &Job, batch_id: BatchId) -> Result<usize> {
    job.batches
        .iter()
        .position(|b| b.id == batch_id)
        .ok_or(Error::BatchNotFound {
            job_id: job.id,
            batch_id,
        })
}

fn step_index(job: &Job, batch_pos: usize, step_id: StepId) -> Result<usize> {
    let batch = &job.batches[batch_pos];
    batch
        .steps
        .iter()
        .position(|s| s.id == step_id)
        .ok_or(Error::StepNotFound {
            job_id: job.id,
            batch_id: batch.id,
            step_id,
        })
}

fn apply_step_update(
    job: &mut Job,
    batch_id: BatchId,
    step_id: StepId,
    state: StepState,
    outcome: StepOutcome,
    error: Option<StepErrorCode>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let pos = batch_index(job, batch_id)?;
    let step_pos = step_index(job, pos, step_id)?;
    let batch_state = job.batches[pos].state;
    let step = &mut job.batches[pos].steps[step_pos];

    if step.state.is_terminal() {
        let repeat = step.state == state
            && (outcome == StepOutcome::Unspecified || outcome == step.outcome);
        return if repeat {
            Ok(false)
        } else {
            Err(Error::InvalidTransition(format!(
                "step {step_id} already finished as {:?}",
                step.state
            )))
        };
    }

    let before = step.clone();
    if step.state != state {
        if !matches!(
            batch_state,
            BatchState::Starting | BatchState::Running | BatchState::Stopping
        ) {
            return Err(Error::InvalidTransition(format!(
                "step {step_id} cannot change state while its batch is {batch_state:?}"
            )));
        }
        match (step.state, state) {
            (StepState::Waiting | StepState::Ready, StepState::Running) => {
                step.start_time = Some(now);
            }
            (StepState::Running, StepState::Completed | StepState::Aborted) => {
                step.finish_time = Some(now);
            }
            (StepState::Waiting | StepState::Ready, StepState::Completed) => {
                step.start_time = Some(now);
                step.finish_time = Some(now);
            }
            (StepState::Waiting | StepState::Ready, StepState::Aborted | StepState::Skipped) => {
                step.finish_time = Some(now);
            }
            (from, to) => {
                return Err(Error::InvalidTransition(format!(
                    "step {step_id} cannot move from {from:?} to {to:?}"
                )));
            }
        }
        step.state = state;
    }

    if outcome != StepOutcome::Unspecified {
        step.outcome = outcome;
    }
    if step.outcome == StepOutcome::Unspecified {
        match step.state {
            StepState::Completed => step.outcome = StepOutcome::Success,
            StepState::Aborted | StepState::Skipped => step.outcome = StepOutcome::Failure,
            _ => {}
        }
    }
    if let Some(error) = error {
        step.error = error;
    }
    Ok(*step != before)
}

fn apply_batch_update(
    job: &mut Job,
    index: &GraphIndex,
    batch_id: BatchId,
    state: BatchState,
    error: Option<BatchErrorCode>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let pos = batch_index(job, batch_id)?;
    let batch = &mut job.batches[pos];
    match (batch.state, state) {
        (from, to) if from == to => Ok(false),
        (BatchState::Starting, BatchState::Running) => {
            batch.state = BatchState::Running;
            batch.start_time = Some(now);
            Ok(true)
        }
        (BatchState::Starting | BatchState::Running, BatchState::Stopping) => {
            batch.state = BatchState::Stopping;
            Ok(true)
        }
        (
            BatchState::Starting | BatchState::Running | BatchState::Stopping,
            BatchState::Complete,
        ) => {
            complete_batch(
                job,
                index,
                pos,
                error.unwrap_or_default(),
                StepState::Completed,
                now,
            );
            Ok(true)
        }
        (from, to) => Err(Error::InvalidTransition(format!(
            "batch {batch_id} cannot move from {from:?} to {to:?}"
        ))),
    }
}

/// Finish a batch on behalf of its agent.
///
/// Steps still running are failed with `running_state`. A node that may run again gets
/// its step flagged for retry. A batch that ends with unfinished steps and no error is
/// `Incomplete`.
fn complete_batch(
    job: &mut Job,
    index: &GraphIndex,
    batch_pos: usize,
    error: BatchErrorCode,
    running_state: StepState,
    now: DateTime<Utc>,
) {
    let graph = index.graph();
    let max_attempts = job.options.max_retries + 1;
    let batch = &job.batches[batch_pos];

    let unfinished = batch.steps.iter().any(|s| !s.state.is_terminal());
    let error = if error == BatchErrorCode::None && unfinished {
        BatchErrorCode::Incomplete
    } else {
        error
    };
    let retryable = !job.is_aborted()
        && !matches!(
            error,
            BatchErrorCode::Cancelled | BatchErrorCode::NoLongerNeeded
        );

    let mut retried: HashSet<NodeRef> = HashSet::new();
    for step in batch.steps.iter().filter(|s| s.state == StepState::Running) {
        let node = batch.node_ref(step);
        if retryable
            && !step.abort_requested
            && graph.get_node(node).is_some_and(|n| n.allow_retry)
            && job.attempt_count(node) < max_attempts
        {
            retried.insert(node);
        }
    }
    // Pending steps of a fatal batch are skipped in place, so the ones waiting on a
    // retried node have to be flagged too. Otherwise the planner moves them on its own.
    let downstream: HashSet<NodeRef> = if error.is_fatal() {
        retried
            .iter()
            .flat_map(|&node| index.transitive_dependents(node))
            .filter(|&node| graph.get_node(node).is_some_and(|n| n.allow_retry))
            .collect()
    } else {
        HashSet::new()
    };

    let batch = &mut job.batches[batch_pos];
    batch.state = BatchState::Complete;
    batch.error = error;
    batch.finish_time = Some(now);
    let group_idx = batch.group_idx;
    for step in &mut batch.steps {
        let node = NodeRef::new(group_idx, step.node_idx);
        match step.state {
            StepState::Running => {
                step.state = running_state;
                step.outcome = StepOutcome::Failure;
                step.error = StepErrorCode::Incomplete;
                step.finish_time = Some(now);
                if retried.contains(&node) {
                    step.retry_by = Some(SYSTEM_USER.to_string());
                }
            }
            StepState::Waiting | StepState::Ready if downstream.contains(&node) => {
                step.retry_by = Some(SYSTEM_USER.to_string());
            }
            _ => {}
        }
    }
}

fn apply_fail_batch(
    job: &mut Job,
    batch_id: BatchId,
    error: BatchErrorCode,
    now: DateTime<Utc>,
) -> Result<bool> {
    let pos = batch_index(job, batch_id)?;
    let batch = &mut job.batches[pos];
    if !matches!(batch.state, BatchState::Waiting | BatchState::Ready) || batch.has_lease() {
        return Ok(false);
    }
    batch.state = BatchState::Complete;
    batch.error = error;
    batch.finish_time = Some(now);
    Ok(true)
}

fn apply_cancel_lease(
    job: &mut Job,
    index: &GraphIndex,
    batch_id: BatchId,
    lease_id: LeaseId,
    now: DateTime<Utc>,
) -> Result<bool> {
    let pos = batch_index(job, batch_id)?;
    let batch = &mut job.batches[pos];
    if batch.lease_id != Some(lease_id) {
        return Ok(false);
    }
    match batch.state {
        BatchState::Starting => {
            batch.clear_assignment();
            batch.pool_id = None;
            batch.state = BatchState::Ready;
            Ok(true)
        }
        BatchState::Running | BatchState::Stopping => {
            complete_batch(
                job,
                index,
                pos,
                BatchErrorCode::Cancelled,
                StepState::Aborted,
                now,
            );
            Ok(true)
        }
        _ => Ok(false),
    }
}

fn apply_lease_finished(
    job: &mut Job,
    index: &GraphIndex,
    batch_id: BatchId,
    lease_id: LeaseId,
    outcome: LeaseOutcome,
    now: DateTime<Utc>,
) -> Result<bool> {
    let pos = batch_index(job, batch_id)?;
    let batch = &job.batches[pos];
    if batch.lease_id != Some(lease_id) || batch.state == BatchState::Complete {
        return Ok(false);
    }
    let (error, running_state) = match outcome {
        LeaseOutcome::Success => (BatchErrorCode::None, StepState::Completed),
        LeaseOutcome::Failure => (BatchErrorCode::ExecutionError, StepState::Aborted),
        LeaseOutcome::Cancelled => (BatchErrorCode::Cancelled, StepState::Aborted),
    };
    complete_batch(job, index, pos, error, running_state, now);
    Ok(true)
}

fn apply_abort_job(job: &mut Job, user: &str) -> bool {
    if job.is_aborted() {
        return false;
    }
    job.abort_by = Some(user.to_string());
    for step in job.batches.iter_mut().flat_map(|b| b.steps.iter_mut()) {
        if step.state == StepState::Running && !step.abort_requested {
            step.abort_requested = true;
            step.abort_by = Some(user.to_string());
        }
    }
    true
}

fn apply_abort_step(
    job: &mut Job,
    batch_id: BatchId,
    step_id: StepId,
    user: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let pos = batch_index(job, batch_id)?;
    let step_pos = step_index(job, pos, step_id)?;
    let step = &mut job.batches[pos].steps[step_pos];
    match step.state {
        StepState::Waiting | StepState::Ready => {
            step.state = StepState::Aborted;
            step.outcome = StepOutcome::Failure;
            step.abort_requested = true;
            step.abort_by = Some(user.to_string());
            step.finish_time = Some(now);
            Ok(true)
        }
        StepState::Running if !step.abort_requested => {
            step.abort_requested = true;
            step.abort_by = Some(user.to_string());
            Ok(true)
        }
        _ => Ok(false),
    }
}

fn apply_retry_step(
    job: &mut Job,
    index: &GraphIndex,
    batch_id: BatchId,
    step_id: StepId,
    user: &str,
) -> Result<bool> {
    let pos = batch_index(job, batch_id)?;
    let step_pos = step_index(job, pos, step_id)?;
    let batch = &job.batches[pos];
    let step = &batch.steps[step_pos];
    if step.is_retry_requested() {
        return Ok(false);
    }
    if !step.state.is_terminal() {
        return Err(Error::InvalidTransition(format!(
            "step {step_id} has not finished"
        )));
    }
    let node = batch.node_ref(step);
    job.batches[pos].steps[step_pos].retry_by = Some(user.to_string());

    // Dependents that may not be retried keep their single step; a skip that no
    // longer holds is replanned in place.
    let graph = index.graph();
    let dependents: HashSet<NodeRef> = index
        .transitive_dependents(node)
        .into_iter()
        .filter(|&dep| graph.node(dep).allow_retry)
        .collect();
    for batch in &mut job.batches {
        let group_idx = batch.group_idx;
        for step in &mut batch.steps {
            if step.state == StepState::Skipped
                && !step.is_retry_requested()
                && dependents.contains(&NodeRef::new(group_idx, step.node_idx))
            {
                step.retry_by = Some(user.to_string());
            }
        }
    }
    Ok(true)
}

fn apply_skip_batch(job: &mut Job, batch_id: BatchId, now: DateTime<Utc>) -> Result<bool> {
    let pos = batch_index(job, batch_id)?;
    let batch = &mut job.batches[pos];
    if !matches!(batch.state, BatchState::Waiting | BatchState::Ready) {
        return Err(Error::InvalidTransition(format!(
            "batch {batch_id} is {:?} and can no longer be skipped",
            batch.state
        )));
    }
    let mut changed = false;
    for step in batch.steps.iter_mut().filter(|s| s.state.is_unstarted()) {
        step.state = StepState::Skipped;
        step.outcome = StepOutcome::Failure;
        step.error = StepErrorCode::Paused;
        step.finish_time = Some(now);
        changed = true;
    }
    Ok(changed)
}

fn apply_graph_update(job: &mut Job, current: &Graph, next: &GraphIndex) -> Result<bool> {
    let next_graph = next.graph();
    if job.graph_hash == next_graph.hash {
        return Ok(false);
    }

    for batch in &mut job.batches {
        let agent_type = current
            .groups
            .get(batch.group_idx)
            .map(|g| g.agent_type.clone())
            .unwrap_or_default();
        let mut group_idx = None;
        for step in &mut batch.steps {
            let name = current
                .get_node(NodeRef::new(batch.group_idx, step.node_idx))
                .map(|n| n.name.clone())
                .ok_or_else(|| {
                    Error::Internal(format!("step {} points outside its graph", step.id))
                })?;
            let target = next_graph
                .find_node(&name)
                .ok_or_else(|| Error::Plan(PlanError::NodeNotFound(name.clone())))?;
            match group_idx {
                None => group_idx = Some(target.group_idx),
                Some(g) if g != target.group_idx => {
                    return Err(Error::InvalidTransition(format!(
                        "node '{name}' moved to a different group"
                    )));
                }
                Some(_) => {}
            }
            step.node_idx = target.node_idx;
        }

        batch.group_idx = match group_idx {
            Some(g) => g,
            None => next_graph
                .groups
                .iter()
                .position(|g| g.agent_type == agent_type)
                .ok_or_else(|| {
                    Error::InvalidTransition(format!(
                        "no group for agent type '{agent_type}' in the new graph"
                    ))
                })?,
        };
        batch.steps.sort_by_key(|s| s.node_idx);
    }

    job.graph_hash = next_graph.hash.clone();
    Ok(true)
}

fn is_overdue(
    state: StepState,
    abort_requested: bool,
    start_time: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    timeout: chrono::Duration,
) -> bool {
    state == StepState::Running && !abort_requested && start_time.is_some_and(|t| now - t > timeout)
}

fn apply_timeouts(job: &mut Job, now: DateTime<Utc>, timeout: chrono::Duration) -> usize {
    let mut count = 0;
    for step in job.batches.iter_mut().flat_map(|b| b.steps.iter_mut()) {
        if is_overdue(step.state, step.abort_requested, step.start_time, now, timeout) {
            step.error = StepErrorCode::TimedOut;
            step.abort_requested = true;
            step.abort_by = Some(SYSTEM_USER.to_string());
            count += 1;
        }
    }
    count
}
