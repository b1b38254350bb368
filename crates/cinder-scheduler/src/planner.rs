//! Batch planner.
//!
//! Recomputes which nodes of a job still have to execute and lays out batches and
//! steps to match. The planner works on a private copy of the job record; a failed
//! plan leaves the stored record untouched. Planning twice in a row without any
//! intervening change produces the same layout.

use crate::dag::GraphIndex;
use chrono::{DateTime, Utc};
use cinder_core::error::PlanError;
use cinder_core::graph::{NodeRef, Priority};
use cinder_core::ids::{AgentId, BatchId, LeaseId, StepId};
use cinder_core::job::{
    Batch, BatchErrorCode, BatchState, Job, Step, StepErrorCode, StepOutcome, StepState,
    SYSTEM_USER,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

const TARGET_ARGUMENT: &str = "-Target=";

/// Side effects of a planning pass that must be acted on after the job is committed.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PlanReport {
    /// In-flight batches completed with `NoLongerNeeded`.
    pub retired_batches: Vec<RetiredBatch>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetiredBatch {
    pub batch_id: BatchId,
    pub lease_id: Option<LeaseId>,
    pub agent_id: Option<AgentId>,
}

/// Lay out batches and steps for every node the job still has to run.
pub fn plan(job: &mut Job, index: &GraphIndex, now: DateTime<Utc>) -> Result<PlanReport, PlanError> {
    let graph = index.graph();

    let mut overrides: HashMap<NodeRef, Priority> = HashMap::new();
    for batch in &job.batches {
        for step in &batch.steps {
            if let Some(priority) = step.priority {
                overrides.insert(batch.node_ref(step), priority);
            }
        }
    }
    let priorities = index.effective_priorities(&overrides);

    // Pull every unstarted step out of its batch. Steps of batches that died with a fatal
    // error can never run and are skipped in place instead.
    let mut recycled: HashMap<NodeRef, Step> = HashMap::new();
    let mut pruned: HashSet<BatchId> = HashSet::new();
    for batch in &mut job.batches {
        if batch.state == BatchState::Complete && batch.error.is_fatal() {
            for step in batch.steps.iter_mut().filter(|s| s.state.is_unstarted()) {
                step.state = StepState::Skipped;
                step.outcome = StepOutcome::Failure;
                step.finish_time = Some(now);
            }
            continue;
        }

        let group_idx = batch.group_idx;
        let before = batch.steps.len();
        let mut kept = Vec::with_capacity(before);
        for step in batch.steps.drain(..) {
            if step.state.is_unstarted() {
                recycled
                    .entry(NodeRef::new(group_idx, step.node_idx))
                    .or_insert(step);
            } else {
                kept.push(step);
            }
        }
        batch.steps = kept;
        if batch.steps.len() != before {
            pruned.insert(batch.id);
        }
    }

    // Re-adding a node for the sake of a same-group dependency flags its old step for
    // retry, which can clear failures downstream. Repeat until nothing new is flagged.
    let mut recycled_ids: HashMap<NodeRef, StepId> = HashMap::new();
    let targets = loop {
        let failed = failed_nodes(job, index);
        for batch in &mut job.batches {
            let group_idx = batch.group_idx;
            batch.steps.retain(|step| {
                let node = NodeRef::new(group_idx, step.node_idx);
                let stale = step.state == StepState::Skipped
                    && !step.is_retry_requested()
                    && !failed.contains(&node);
                if stale {
                    recycled_ids.entry(node).or_insert(step.id);
                }
                !stale
            });
        }

        let closure = target_closure(job, index)?;
        let mut targets: BTreeSet<NodeRef> = closure
            .iter()
            .copied()
            .filter(|&node| !has_final_step(job, node))
            .collect();

        let mut flagged = false;
        for &node in &closure {
            if targets.contains(&node) {
                continue;
            }
            let rerun = graph
                .node(node)
                .input_dependencies
                .iter()
                .any(|dep| dep.group_idx == node.group_idx && targets.contains(dep));
            if !rerun {
                continue;
            }
            for batch in job.batches.iter_mut().filter(|b| b.group_idx == node.group_idx) {
                for step in batch.steps.iter_mut().filter(|s| s.node_idx == node.node_idx) {
                    if step.state.is_terminal() && !step.is_retry_requested() {
                        step.retry_by = Some(SYSTEM_USER.to_string());
                        flagged = true;
                    }
                }
            }
            targets.insert(node);
        }

        if !flagged {
            break targets;
        }
    };

    // Nodes that need a fresh step, grouped by node group in ascending node order.
    let mut needed: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for &node in &targets {
        if has_live_step(job, node) {
            continue;
        }
        check_retry(job, index, node)?;
        needed.entry(node.group_idx).or_default().push(node.node_idx);
    }

    for (group_idx, node_idxs) in needed {
        let first = node_idxs[0];
        let pos = match appendable_batch(job, group_idx, first) {
            Some(pos) => pos,
            None => {
                let id = BatchId::new(job.allocate_sub_resource_id()?);
                job.batches.push(Batch::new(id, group_idx));
                job.batches.len() - 1
            }
        };

        for node_idx in node_idxs {
            let node = NodeRef::new(group_idx, node_idx);
            let step = match recycled.remove(&node) {
                // Readiness is recomputed: a dependency may have been reopened.
                Some(old) => {
                    let mut step = Step::new(old.id, node_idx);
                    step.priority = old.priority;
                    step
                }
                None => {
                    let id = match recycled_ids.remove(&node) {
                        Some(id) => id,
                        None => StepId::new(job.allocate_sub_resource_id()?),
                    };
                    let mut step = Step::new(id, node_idx);
                    step.priority = overrides.get(&node).copied();
                    step
                }
            };
            job.batches[pos].steps.push(step);
        }
    }

    let mut report = PlanReport::default();
    for batch in &mut job.batches {
        if batch.state.is_in_flight()
            && batch.error == BatchErrorCode::None
            && pruned.contains(&batch.id)
            && batch.steps.iter().all(|s| s.state.is_terminal())
        {
            batch.state = BatchState::Complete;
            batch.error = BatchErrorCode::NoLongerNeeded;
            batch.finish_time = Some(now);
            report.retired_batches.push(RetiredBatch {
                batch_id: batch.id,
                lease_id: batch.lease_id,
                agent_id: batch.agent_id,
            });
        }
    }

    let job_priority = job.priority.value();
    for batch in &mut job.batches {
        let max_priority = batch
            .steps
            .iter()
            .filter_map(|step| priorities.get(&batch.node_ref(step)))
            .max()
            .copied();
        batch.schedule_priority = match max_priority {
            Some(priority) => job_priority * 10 + priority.value() + 1,
            None => 0,
        };
    }

    job.batches.retain(|b| {
        !(b.steps.is_empty() && b.lease_id.is_none() && b.error == BatchErrorCode::None)
    });

    Ok(report)
}

/// Nodes whose failure justifies skipping the nodes that depend on them.
fn failed_nodes(job: &Job, index: &GraphIndex) -> HashSet<NodeRef> {
    let graph = index.graph();
    let max_attempts = job.options.max_retries + 1;
    let mut failed = HashSet::new();

    for &node in index.topological_order() {
        for (batch, step) in job.steps_for_node(node) {
            if step.is_retry_requested() {
                continue;
            }
            let fatal_batch = batch.state == BatchState::Complete && batch.error.is_fatal();
            let is_failed = match step.state {
                StepState::Skipped => {
                    fatal_batch
                        || step.error == StepErrorCode::Paused
                        || graph
                            .node(node)
                            .order_dependencies
                            .iter()
                            .any(|dep| failed.contains(dep))
                        || job.attempt_count(node) >= max_attempts
                }
                StepState::Completed | StepState::Aborted => {
                    step.is_failed()
                        || step.abort_requested
                        || (fatal_batch && !step.outcome.is_success())
                }
                StepState::Running => step.abort_requested,
                StepState::Waiting | StepState::Ready => false,
            };
            if is_failed {
                failed.insert(node);
                break;
            }
        }
    }
    failed
}

/// The value of a `-Target=` argument, matched case-insensitively.
pub fn target_argument(argument: &str) -> Option<&str> {
    let prefix = argument.get(..TARGET_ARGUMENT.len())?;
    if prefix.eq_ignore_ascii_case(TARGET_ARGUMENT) {
        Some(&argument[TARGET_ARGUMENT.len()..])
    } else {
        None
    }
}

/// Nodes requested by the job's arguments, closed over input dependencies.
fn target_closure(job: &Job, index: &GraphIndex) -> Result<BTreeSet<NodeRef>, PlanError> {
    if job.is_aborted() {
        return Ok(BTreeSet::new());
    }

    let graph = index.graph();
    let mut roots = Vec::new();
    let mut has_targets = false;
    for value in job.arguments.iter().filter_map(|arg| target_argument(arg)) {
        has_targets = true;
        for name in value.split([';', '+']).map(str::trim).filter(|s| !s.is_empty()) {
            if let Some(aggregate) = graph.find_aggregate(name) {
                roots.extend(aggregate.nodes.iter().copied());
            } else if let Some(node) = graph.find_node(name) {
                roots.push(node);
            } else {
                return Err(PlanError::UnknownTarget(name.to_string()));
            }
        }
    }
    if !has_targets {
        roots.extend(graph.node_refs());
    }
    if let Some(setup) = graph.setup_node() {
        roots.push(setup);
    }

    Ok(index.input_closure(roots))
}

/// Whether the node already finished for good in this job.
fn has_final_step(job: &Job, node: NodeRef) -> bool {
    job.steps_for_node(node)
        .any(|(_, step)| step.state.is_terminal() && !step.is_retry_requested())
}

fn has_live_step(job: &Job, node: NodeRef) -> bool {
    job.steps_for_node(node)
        .any(|(_, step)| !step.is_retry_requested())
}

/// Checks a node whose every step has been superseded before it gets another one.
fn check_retry(job: &Job, index: &GraphIndex, node: NodeRef) -> Result<(), PlanError> {
    let definition = index.graph().node(node);
    if !definition.allow_retry {
        // A node that may not be retried gets a single step, whether or not it ran.
        return match job.steps_for_node(node).next() {
            Some(_) => Err(PlanError::RetryNotAllowed(definition.name.clone())),
            None => Ok(()),
        };
    }
    let attempts = job.attempt_count(node);
    if attempts > job.options.max_retries {
        return Err(PlanError::RetryLimitExceeded {
            node: definition.name.clone(),
            attempts,
        });
    }
    Ok(())
}

/// Position of the batch new steps for the group should be appended to, if any.
fn appendable_batch(job: &Job, group_idx: usize, first_node_idx: usize) -> Option<usize> {
    let pos = job
        .batches
        .iter()
        .rposition(|b| b.group_idx == group_idx && b.is_appendable())?;
    match job.batches[pos].steps.last() {
        Some(last) if last.node_idx >= first_node_idx => None,
        _ => Some(pos),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{graph_index, job_for, node, run_step, settle, start_batch};
    use cinder_core::graph::{AggregateDefinition, GraphDefinition, GroupDefinition};
    use cinder_core::job::JobOptions;
    use pretty_assertions::assert_eq;

    fn two_group_graph() -> GraphIndex {
        graph_index(GraphDefinition {
            groups: vec![
                GroupDefinition {
                    agent_type: "win".to_string(),
                    nodes: vec![node("Setup Build", &[]), node("Compile", &["Setup Build"])],
                },
                GroupDefinition {
                    agent_type: "linux".to_string(),
                    nodes: vec![node("Test", &["Compile"]), node("Docs", &[])],
                },
            ],
            aggregates: vec![AggregateDefinition {
                name: "Tests".to_string(),
                nodes: vec!["Test".to_string()],
            }],
            labels: vec![],
        })
    }

    /// Compile on Windows; Lint and Test(Compile) on Linux.
    fn compile_then_test(test_allow_retry: bool) -> GraphIndex {
        let mut test = node("Test", &["Compile"]);
        test.allow_retry = test_allow_retry;
        graph_index(GraphDefinition {
            groups: vec![
                GroupDefinition {
                    agent_type: "win".to_string(),
                    nodes: vec![node("Compile", &[])],
                },
                GroupDefinition {
                    agent_type: "linux".to_string(),
                    nodes: vec![node("Lint", &[]), test],
                },
            ],
            aggregates: vec![],
            labels: vec![],
        })
    }

    fn latest_step(job: &Job, node: NodeRef) -> &Step {
        job.steps_for_node(node).last().unwrap().1
    }

    fn layout(job: &Job) -> Vec<(u16, usize, Vec<(u16, usize, StepState)>)> {
        job.batches
            .iter()
            .map(|b| {
                (
                    b.id.value(),
                    b.group_idx,
                    b.steps
                        .iter()
                        .map(|s| (s.id.value(), s.node_idx, s.state))
                        .collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_initial_plan_covers_every_node_without_targets() {
        let index = two_group_graph();
        let mut job = job_for(&index, &[]);
        plan(&mut job, &index, Utc::now()).unwrap();

        assert_eq!(job.batches.len(), 2);
        assert_eq!(job.batches[0].group_idx, 0);
        assert_eq!(
            job.batches[0].steps.iter().map(|s| s.node_idx).collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert_eq!(
            job.batches[1].steps.iter().map(|s| s.node_idx).collect::<Vec<_>>(),
            vec![0, 1]
        );
    }

    #[test]
    fn test_targets_expand_through_input_dependencies() {
        let index = two_group_graph();
        let mut job = job_for(&index, &["-Target=Tests"]);
        plan(&mut job, &index, Utc::now()).unwrap();

        // Setup Build, Compile and Test; Docs is not requested.
        let nodes: Vec<NodeRef> = job
            .batches
            .iter()
            .flat_map(|b| b.steps.iter().map(move |s| b.node_ref(s)))
            .collect();
        assert_eq!(
            nodes,
            vec![NodeRef::new(0, 0), NodeRef::new(0, 1), NodeRef::new(1, 0)]
        );
    }

    #[test]
    fn test_target_names_split_and_case_insensitive() {
        let index = two_group_graph();
        let mut job = job_for(&index, &["-target=docs;compile"]);
        plan(&mut job, &index, Utc::now()).unwrap();
        let count: usize = job.batches.iter().map(|b| b.steps.len()).sum();
        assert_eq!(count, 3);
    }

    #[test]
    fn test_unknown_target_fails() {
        let index = two_group_graph();
        let mut job = job_for(&index, &["-Target=Nope"]);
        assert_eq!(
            plan(&mut job, &index, Utc::now()),
            Err(PlanError::UnknownTarget("Nope".to_string()))
        );
    }

    #[test]
    fn test_plan_is_idempotent() {
        let index = two_group_graph();
        let mut job = job_for(&index, &[]);
        let now = Utc::now();
        plan(&mut job, &index, now).unwrap();
        let first = job.clone();
        plan(&mut job, &index, now).unwrap();
        assert_eq!(job, first);
    }

    #[test]
    fn test_schedule_priority() {
        let index = two_group_graph();
        let mut job = job_for(&index, &[]);
        job.priority = Priority::High;
        plan(&mut job, &index, Utc::now()).unwrap();
        // High (4) * 10 + Normal (2) + 1
        assert_eq!(job.batches[0].schedule_priority, 43);
    }

    #[test]
    fn test_aborted_job_targets_nothing() {
        let index = two_group_graph();
        let mut job = job_for(&index, &[]);
        plan(&mut job, &index, Utc::now()).unwrap();
        job.abort_by = Some("alice".to_string());
        plan(&mut job, &index, Utc::now()).unwrap();
        assert!(job.batches.is_empty());
    }

    #[test]
    fn test_completed_nodes_are_not_replanned() {
        let index = two_group_graph();
        let mut job = job_for(&index, &[]);
        plan(&mut job, &index, Utc::now()).unwrap();
        run_step(&mut job, 0, 0, StepOutcome::Success);

        let before = layout(&job);
        plan(&mut job, &index, Utc::now()).unwrap();
        assert_eq!(layout(&job), before);
    }

    #[test]
    fn test_fatal_batch_skips_pending_steps() {
        let index = two_group_graph();
        let mut job = job_for(&index, &[]);
        plan(&mut job, &index, Utc::now()).unwrap();
        job.batches[0].state = BatchState::Complete;
        job.batches[0].error = BatchErrorCode::UnknownPool;

        plan(&mut job, &index, Utc::now()).unwrap();
        assert!(
            job.batches[0]
                .steps
                .iter()
                .all(|s| s.state == StepState::Skipped && s.outcome == StepOutcome::Failure)
        );
        // Nothing replaces the skipped nodes.
        assert_eq!(job.batches.len(), 2);
    }

    #[test]
    fn test_retry_requested_node_gets_new_step_in_new_batch() {
        let index = two_group_graph();
        let mut job = job_for(&index, &[]);
        plan(&mut job, &index, Utc::now()).unwrap();
        run_step(&mut job, 0, 0, StepOutcome::Success);
        run_step(&mut job, 0, 1, StepOutcome::Failure);
        let old_id = job.batches[0].steps[1].id;
        job.batches[0].steps[1].retry_by = Some("bob".to_string());

        plan(&mut job, &index, Utc::now()).unwrap();
        let retry = job.batches.last().unwrap();
        assert_eq!(retry.group_idx, 0);
        assert_eq!(retry.steps.len(), 1);
        assert_eq!(retry.steps[0].node_idx, 1);
        assert_ne!(retry.steps[0].id, old_id);
    }

    #[test]
    fn test_retry_not_allowed() {
        let mut compile = node("Compile", &[]);
        compile.allow_retry = false;
        let index = graph_index(GraphDefinition {
            groups: vec![GroupDefinition {
                agent_type: "win".to_string(),
                nodes: vec![compile],
            }],
            aggregates: vec![],
            labels: vec![],
        });
        let mut job = job_for(&index, &[]);
        plan(&mut job, &index, Utc::now()).unwrap();
        run_step(&mut job, 0, 0, StepOutcome::Failure);
        job.batches[0].steps[0].retry_by = Some("bob".to_string());

        assert_eq!(
            plan(&mut job, &index, Utc::now()),
            Err(PlanError::RetryNotAllowed("Compile".to_string()))
        );
    }

    #[test]
    fn test_retry_budget_is_enforced() {
        let index = two_group_graph();
        let mut job = job_for(&index, &["-Target=Setup Build"]);
        job.options = JobOptions { max_retries: 1 };
        plan(&mut job, &index, Utc::now()).unwrap();

        run_step(&mut job, 0, 0, StepOutcome::Failure);
        job.batches[0].steps[0].retry_by = Some("bob".to_string());
        plan(&mut job, &index, Utc::now()).unwrap();
        assert_eq!(job.batches.len(), 2);

        run_step(&mut job, 1, 0, StepOutcome::Failure);
        job.batches[1].steps[0].retry_by = Some("bob".to_string());
        assert_eq!(
            plan(&mut job, &index, Utc::now()),
            Err(PlanError::RetryLimitExceeded {
                node: "Setup Build".to_string(),
                attempts: 2
            })
        );
    }

    #[test]
    fn test_stale_skip_is_replanned_with_same_id() {
        let index = two_group_graph();
        let mut job = job_for(&index, &[]);
        plan(&mut job, &index, Utc::now()).unwrap();
        // Docs skipped with no failed dependency: the skip is stale.
        let docs = &mut job.batches[1].steps[1];
        let docs_id = docs.id;
        docs.state = StepState::Skipped;
        docs.outcome = StepOutcome::Failure;

        plan(&mut job, &index, Utc::now()).unwrap();
        let docs = &job.batches[1].steps[1];
        assert_eq!(docs.state, StepState::Waiting);
        assert_eq!(docs.id, docs_id);
    }

    #[test]
    fn test_in_flight_batch_no_longer_needed() {
        let index = two_group_graph();
        let mut job = job_for(&index, &[]);
        plan(&mut job, &index, Utc::now()).unwrap();
        let lease_id = LeaseId::new();
        let batch = &mut job.batches[1];
        batch.state = BatchState::Starting;
        batch.lease_id = Some(lease_id);

        job.arguments = vec!["-Target=Compile".to_string()];
        let report = plan(&mut job, &index, Utc::now()).unwrap();

        let batch = &job.batches[1];
        assert_eq!(batch.state, BatchState::Complete);
        assert_eq!(batch.error, BatchErrorCode::NoLongerNeeded);
        assert!(batch.steps.is_empty());
        assert_eq!(report.retired_batches.len(), 1);
        assert_eq!(report.retired_batches[0].lease_id, Some(lease_id));
    }

    #[test]
    fn test_running_batch_is_appended_to() {
        let index = two_group_graph();
        let mut job = job_for(&index, &["-Target=Setup Build"]);
        plan(&mut job, &index, Utc::now()).unwrap();
        job.batches[0].state = BatchState::Running;
        job.batches[0].lease_id = Some(LeaseId::new());
        run_step(&mut job, 0, 0, StepOutcome::Success);

        job.arguments = vec!["-Target=Compile".to_string()];
        plan(&mut job, &index, Utc::now()).unwrap();
        assert_eq!(job.batches.len(), 1);
        assert_eq!(
            job.batches[0].steps.iter().map(|s| s.node_idx).collect::<Vec<_>>(),
            vec![0, 1]
        );
    }

    #[test]
    fn test_step_priority_override_lifts_prerequisites() {
        let index = two_group_graph();
        let mut job = job_for(&index, &[]);
        plan(&mut job, &index, Utc::now()).unwrap();
        assert_eq!(job.batches[0].schedule_priority, 23);
        assert_eq!(job.batches[1].schedule_priority, 23);

        job.batches[1].steps[0].priority = Some(Priority::Highest);
        plan(&mut job, &index, Utc::now()).unwrap();

        // Normal (2) * 10 + Highest (5) + 1. Compile and Setup Build are lifted with Test.
        assert_eq!(job.batches[1].schedule_priority, 26);
        assert_eq!(job.batches[0].schedule_priority, 26);
        assert_eq!(job.batches[1].steps[0].priority, Some(Priority::Highest));
        assert_eq!(job.batches[0].steps[1].priority, None);
    }

    #[test]
    fn test_recycled_step_waits_for_reopened_dependency() {
        let index = compile_then_test(true);
        let test = NodeRef::new(1, 1);
        let mut job = job_for(&index, &[]);
        settle(&mut job, &index);
        run_step(&mut job, 0, 0, StepOutcome::Success);
        settle(&mut job, &index);
        assert_eq!(latest_step(&job, test).state, StepState::Ready);

        // Lint starts while Compile is sent back for another run.
        start_batch(&mut job, 1);
        job.batches[1].steps[0].state = StepState::Running;
        job.batches[0].steps[0].retry_by = Some("alice".to_string());
        settle(&mut job, &index);

        assert_eq!(job.steps_for_node(NodeRef::new(0, 0)).count(), 2);
        let step = latest_step(&job, test);
        assert_eq!(step.state, StepState::Waiting);
        assert_eq!(step.ready_time, None);
        assert_eq!(job.steps_for_node(test).count(), 1);
    }

    #[test]
    fn test_skipped_step_without_retry_is_not_duplicated() {
        let index = compile_then_test(false);
        let test = NodeRef::new(1, 1);
        let mut job = job_for(&index, &[]);
        settle(&mut job, &index);
        run_step(&mut job, 0, 0, StepOutcome::Failure);
        settle(&mut job, &index);
        assert_eq!(latest_step(&job, test).state, StepState::Skipped);

        job.batches[0].steps[0].retry_by = Some("alice".to_string());
        job.batches[1].steps[1].retry_by = Some("alice".to_string());
        assert_eq!(
            plan(&mut job, &index, Utc::now()),
            Err(PlanError::RetryNotAllowed("Test".to_string()))
        );
    }
}
