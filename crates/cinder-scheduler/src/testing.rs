//! Shared fixtures for unit tests.

use crate::dag::GraphIndex;
use chrono::Utc;
use cinder_core::graph::{GraphDefinition, NodeDefinition, Priority};
use cinder_core::ids::{AgentId, JobId, LeaseId, LogId, PoolId, SessionId, StreamId, TemplateId};
use cinder_core::job::{BatchState, Job, JobOptions, StepOutcome, StepState};
use std::sync::Arc;

pub fn node(name: &str, inputs: &[&str]) -> NodeDefinition {
    NodeDefinition {
        name: name.to_string(),
        input_dependencies: inputs.iter().map(|s| s.to_string()).collect(),
        order_dependencies: vec![],
        priority: Priority::Normal,
        allow_retry: true,
        run_early: false,
    }
}

pub fn graph_index(definition: GraphDefinition) -> GraphIndex {
    GraphIndex::new(Arc::new(definition.build().unwrap())).unwrap()
}

pub fn job_for(index: &GraphIndex, arguments: &[&str]) -> Job {
    Job {
        id: JobId::new(),
        stream_id: StreamId::new("//Main"),
        template_id: TemplateId::new("ci"),
        graph_hash: index.graph().hash.clone(),
        change: 100,
        priority: Priority::Normal,
        arguments: arguments.iter().map(|s| s.to_string()).collect(),
        options: JobOptions::default(),
        batches: vec![],
        abort_by: None,
        update_index: 0,
        schedule_priority: 0,
        next_sub_resource_id: 1,
        created_at: Utc::now(),
        updated_at: None,
    }
}

/// Mark a step as having run to completion with the given outcome.
pub fn run_step(job: &mut Job, batch_pos: usize, step_pos: usize, outcome: StepOutcome) {
    let now = Utc::now();
    let step = &mut job.batches[batch_pos].steps[step_pos];
    step.state = StepState::Completed;
    step.outcome = outcome;
    step.start_time = Some(now);
    step.finish_time = Some(now);
}

/// Run the planner and readiness propagation the way a committed mutation does.
pub fn settle(job: &mut Job, index: &GraphIndex) {
    let now = Utc::now();
    crate::planner::plan(job, index, now).unwrap();
    crate::readiness::propagate(job, index, now);
}

/// Hand a batch to an agent and mark it running.
pub fn start_batch(job: &mut Job, batch_pos: usize) -> LeaseId {
    let lease_id = LeaseId::new();
    let batch = &mut job.batches[batch_pos];
    batch.state = BatchState::Running;
    batch.pool_id = Some(PoolId::new("win"));
    batch.agent_id = Some(AgentId::new());
    batch.session_id = Some(SessionId::new());
    batch.lease_id = Some(lease_id);
    batch.log_id = Some(LogId::new());
    batch.start_time = Some(Utc::now());
    lease_id
}
