//! Readiness propagation.
//!
//! Moves waiting steps to `Ready` or `Skipped` as their dependencies resolve (and ready
//! steps back to `Waiting` when a dependency reopens), moves
//! unassigned batches between `Waiting`, `Ready` and `Complete`, and recomputes the
//! job's schedule priority. Runs to a fixpoint, so skips cascade through the graph
//! in a single call.

use crate::dag::GraphIndex;
use chrono::{DateTime, Utc};
use cinder_core::graph::NodeRef;
use cinder_core::job::{BatchState, Job, StepOutcome, StepState};
use std::collections::HashMap;

/// How a node looks to the nodes that depend on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeStatus {
    /// Not finished yet.
    Pending,
    /// Finished successfully.
    Done(Option<DateTime<Utc>>),
    /// Failed, skipped, aborted or asked to abort.
    Failed(Option<DateTime<Utc>>),
}

impl NodeStatus {
    fn finish_time(&self) -> Option<DateTime<Utc>> {
        match self {
            NodeStatus::Pending => None,
            NodeStatus::Done(time) | NodeStatus::Failed(time) => *time,
        }
    }
}

/// Status of every node that has a step in the job, taken from its current step.
///
/// The current step is the last one not superseded by a retry. A node whose steps
/// have all been superseded is pending until the planner adds its replacement.
pub(crate) fn node_statuses(job: &Job) -> HashMap<NodeRef, NodeStatus> {
    let mut statuses = HashMap::new();
    for batch in &job.batches {
        for step in &batch.steps {
            let node = batch.node_ref(step);
            if step.is_retry_requested() {
                statuses.entry(node).or_insert(NodeStatus::Pending);
                continue;
            }
            let status = if step.abort_requested || step.is_failed() {
                NodeStatus::Failed(step.finish_time)
            } else if step.state.is_terminal() {
                NodeStatus::Done(step.finish_time)
            } else {
                NodeStatus::Pending
            };
            statuses.insert(node, status);
        }
    }
    statuses
}

/// Advance step and batch states until nothing changes. Returns whether anything did.
pub fn propagate(job: &mut Job, index: &GraphIndex, now: DateTime<Utc>) -> bool {
    let graph = index.graph();
    let mut changed_any = false;

    loop {
        let mut changed = false;
        let statuses = node_statuses(job);
        let created_at = job.created_at;

        for batch in &mut job.batches {
            let group_idx = batch.group_idx;
            for step in batch.steps.iter_mut().filter(|s| s.state.is_unstarted()) {
                let node = NodeRef::new(group_idx, step.node_idx);
                let deps: Vec<NodeStatus> = graph
                    .node(node)
                    .order_dependencies
                    .iter()
                    .filter_map(|dep| statuses.get(dep).copied())
                    .collect();

                if deps.iter().any(|s| matches!(s, NodeStatus::Failed(_))) {
                    step.state = StepState::Skipped;
                    step.outcome = StepOutcome::Failure;
                    step.finish_time = Some(now);
                    changed = true;
                } else if deps.contains(&NodeStatus::Pending) {
                    if step.state == StepState::Ready {
                        step.state = StepState::Waiting;
                        step.ready_time = None;
                        changed = true;
                    }
                } else if step.state == StepState::Waiting {
                    step.state = StepState::Ready;
                    step.ready_time = Some(
                        deps.iter()
                            .filter_map(NodeStatus::finish_time)
                            .max()
                            .unwrap_or(created_at),
                    );
                    changed = true;
                }
            }
        }

        let statuses = if changed { node_statuses(job) } else { statuses };
        for batch in &mut job.batches {
            if !matches!(batch.state, BatchState::Waiting | BatchState::Ready) {
                continue;
            }
            if batch.steps.is_empty() {
                continue;
            }

            if batch.steps.iter().all(|s| s.state.is_terminal()) {
                batch.state = BatchState::Complete;
                batch.finish_time = Some(now);
                changed = true;
                continue;
            }

            let pending: Vec<usize> = batch
                .steps
                .iter()
                .filter(|s| !s.state.is_terminal())
                .map(|s| s.node_idx)
                .collect();
            let deps: Vec<NodeStatus> = index
                .start_dependencies(batch.group_idx, &pending)
                .iter()
                .filter_map(|dep| statuses.get(dep).copied())
                .collect();

            if deps.contains(&NodeStatus::Pending) {
                if batch.state != BatchState::Waiting {
                    batch.state = BatchState::Waiting;
                    batch.ready_time = None;
                    changed = true;
                }
            } else if batch.state != BatchState::Ready {
                batch.state = BatchState::Ready;
                batch.ready_time = Some(
                    deps.iter()
                        .filter_map(NodeStatus::finish_time)
                        .max()
                        .unwrap_or(created_at),
                );
                changed = true;
            }
        }

        if !changed {
            break;
        }
        changed_any = true;
    }

    let schedule_priority = job
        .batches
        .iter()
        .filter(|b| b.is_dispatchable())
        .map(|b| b.schedule_priority)
        .max()
        .unwrap_or(0);
    if job.schedule_priority != schedule_priority {
        job.schedule_priority = schedule_priority;
        changed_any = true;
    }

    changed_any
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::plan;
    use crate::testing::{graph_index, job_for, node, run_step};
    use cinder_core::graph::{GraphDefinition, GroupDefinition};
    use cinder_core::job::BatchErrorCode;
    use chrono::Duration;

    fn a_then_b() -> GraphIndex {
        graph_index(GraphDefinition {
            groups: vec![
                GroupDefinition {
                    agent_type: "win".to_string(),
                    nodes: vec![node("A", &[])],
                },
                GroupDefinition {
                    agent_type: "linux".to_string(),
                    nodes: vec![node("B", &["A"]), node("C", &[])],
                },
            ],
            aggregates: vec![],
            labels: vec![],
        })
    }

    fn planned(index: &GraphIndex, args: &[&str]) -> Job {
        let mut job = job_for(index, args);
        let now = job.created_at;
        plan(&mut job, index, now).unwrap();
        propagate(&mut job, index, now);
        job
    }

    #[test]
    fn test_dependent_batch_waits_for_dependency() {
        let index = a_then_b();
        let mut job = planned(&index, &["-Target=B"]);

        assert_eq!(job.batches[0].state, BatchState::Ready);
        assert_eq!(job.batches[0].ready_time, Some(job.created_at));
        assert_eq!(job.batches[1].state, BatchState::Waiting);
        assert_eq!(job.batches[1].steps[0].state, StepState::Waiting);
        assert_eq!(job.schedule_priority, job.batches[0].schedule_priority);

        let finished = job.created_at + Duration::minutes(5);
        run_step(&mut job, 0, 0, StepOutcome::Success);
        job.batches[0].steps[0].finish_time = Some(finished);
        job.batches[0].state = BatchState::Complete;

        assert!(propagate(&mut job, &index, finished));
        assert_eq!(job.batches[1].state, BatchState::Ready);
        assert_eq!(job.batches[1].ready_time, Some(finished));
        assert_eq!(job.batches[1].steps[0].state, StepState::Ready);
    }

    #[test]
    fn test_failed_dependency_skips_dependents() {
        let index = a_then_b();
        let mut job = planned(&index, &["-Target=B"]);
        run_step(&mut job, 0, 0, StepOutcome::Failure);
        job.batches[0].state = BatchState::Complete;

        propagate(&mut job, &index, Utc::now());
        let b = &job.batches[1];
        assert_eq!(b.steps[0].state, StepState::Skipped);
        assert_eq!(b.steps[0].outcome, StepOutcome::Failure);
        assert_eq!(b.state, BatchState::Complete);
        assert_eq!(b.error, BatchErrorCode::None);
        assert_eq!(job.schedule_priority, 0);
    }

    #[test]
    fn test_abort_requested_dependency_skips_dependents() {
        let index = a_then_b();
        let mut job = planned(&index, &["-Target=B"]);
        let a = &mut job.batches[0].steps[0];
        a.state = StepState::Running;
        a.abort_requested = true;
        job.batches[0].state = BatchState::Running;

        propagate(&mut job, &index, Utc::now());
        assert_eq!(job.batches[1].steps[0].state, StepState::Skipped);
    }

    #[test]
    fn test_independent_steps_are_ready() {
        let index = a_then_b();
        let job = planned(&index, &[]);
        // C has no dependencies but shares a batch with B, which waits on A.
        let linux = &job.batches[1];
        assert_eq!(linux.steps[1].state, StepState::Ready);
        assert_eq!(linux.state, BatchState::Waiting);
    }

    #[test]
    fn test_ready_time_is_kept_while_ready() {
        let index = a_then_b();
        let mut job = planned(&index, &["-Target=A"]);
        let ready_time = job.batches[0].ready_time;

        assert!(!propagate(&mut job, &index, Utc::now()));
        assert_eq!(job.batches[0].ready_time, ready_time);
    }

    #[test]
    fn test_propagate_is_stable() {
        let index = a_then_b();
        let mut job = planned(&index, &[]);
        let snapshot = job.clone();
        assert!(!propagate(&mut job, &index, Utc::now()));
        assert_eq!(job, snapshot);
    }

    #[test]
    fn test_ready_step_returns_to_waiting_when_dependency_reopens() {
        let index = a_then_b();
        let mut job = planned(&index, &[]);
        run_step(&mut job, 0, 0, StepOutcome::Success);
        job.batches[0].state = BatchState::Complete;
        propagate(&mut job, &index, Utc::now());
        assert_eq!(job.batches[1].state, BatchState::Ready);
        assert_eq!(job.batches[1].steps[0].state, StepState::Ready);

        job.batches[0].steps[0].retry_by = Some("alice".to_string());
        assert!(propagate(&mut job, &index, Utc::now()));

        let linux = &job.batches[1];
        assert_eq!(linux.steps[0].state, StepState::Waiting);
        assert_eq!(linux.steps[0].ready_time, None);
        assert_eq!(linux.steps[1].state, StepState::Ready);
        assert_eq!(linux.state, BatchState::Waiting);
        assert_eq!(linux.ready_time, None);
    }

    /// A on Windows, M on Mac, then Early(A) and Late(M) sharing a Linux batch.
    fn early_and_late(run_early: bool) -> GraphIndex {
        let mut early = node("Early", &["A"]);
        early.run_early = run_early;
        graph_index(GraphDefinition {
            groups: vec![
                GroupDefinition {
                    agent_type: "win".to_string(),
                    nodes: vec![node("A", &[])],
                },
                GroupDefinition {
                    agent_type: "mac".to_string(),
                    nodes: vec![node("M", &[])],
                },
                GroupDefinition {
                    agent_type: "linux".to_string(),
                    nodes: vec![early, node("Late", &["M"])],
                },
            ],
            aggregates: vec![],
            labels: vec![],
        })
    }

    #[test]
    fn test_run_early_batch_only_waits_for_early_nodes() {
        for run_early in [true, false] {
            let index = early_and_late(run_early);
            let mut job = planned(&index, &[]);
            assert_eq!(job.batches[2].state, BatchState::Waiting);

            run_step(&mut job, 0, 0, StepOutcome::Success);
            job.batches[0].state = BatchState::Complete;
            propagate(&mut job, &index, Utc::now());

            let linux = &job.batches[2];
            assert_eq!(linux.steps[0].state, StepState::Ready);
            assert_eq!(linux.steps[1].state, StepState::Waiting);
            let expected = if run_early {
                BatchState::Ready
            } else {
                BatchState::Waiting
            };
            assert_eq!(linux.state, expected, "run_early = {run_early}");
        }
    }
}
