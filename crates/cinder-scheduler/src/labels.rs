//! Label and job outcome derivation.

use crate::readiness::{NodeStatus, node_statuses};
use cinder_core::graph::{Graph, NodeRef};
use cinder_core::job::{Job, LabelState, StepOutcome, StepState};
use std::collections::HashMap;

/// Derived state of one graph label within a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LabelStatus {
    pub state: LabelState,
    pub outcome: StepOutcome,
}

/// Outcome of the current step for each node in the job, `Unspecified` while pending.
fn node_outcomes(job: &Job) -> HashMap<NodeRef, StepOutcome> {
    let statuses = node_statuses(job);
    let mut outcomes = HashMap::new();
    for batch in &job.batches {
        for step in batch.steps.iter().filter(|s| !s.is_retry_requested()) {
            let node = batch.node_ref(step);
            let outcome = match statuses.get(&node) {
                Some(NodeStatus::Failed(_)) => StepOutcome::Failure,
                Some(NodeStatus::Done(_)) if step.state == StepState::Completed => step.outcome,
                Some(NodeStatus::Done(_)) => StepOutcome::Success,
                _ => StepOutcome::Unspecified,
            };
            outcomes.insert(node, outcome);
        }
    }
    outcomes
}

fn worst(outcomes: impl Iterator<Item = StepOutcome>) -> StepOutcome {
    let mut result = StepOutcome::Success;
    for outcome in outcomes {
        match outcome {
            StepOutcome::Failure => return StepOutcome::Failure,
            StepOutcome::Warnings => result = StepOutcome::Warnings,
            _ => {}
        }
    }
    result
}

/// State and outcome of every label in the graph, in label order.
pub fn label_statuses(job: &Job, graph: &Graph) -> Vec<LabelStatus> {
    let outcomes = node_outcomes(job);
    graph
        .labels
        .iter()
        .map(|label| {
            let present = label
                .required_nodes
                .iter()
                .all(|node| outcomes.contains_key(node));
            if !present || label.required_nodes.is_empty() {
                return LabelStatus {
                    state: LabelState::Unspecified,
                    outcome: StepOutcome::Unspecified,
                };
            }

            let included: Vec<StepOutcome> = label
                .included_nodes
                .iter()
                .filter_map(|node| outcomes.get(node).copied())
                .collect();
            let running = included.contains(&StepOutcome::Unspecified);
            let finished = worst(
                included
                    .iter()
                    .copied()
                    .filter(|o| *o != StepOutcome::Unspecified),
            );
            if running {
                LabelStatus {
                    state: LabelState::Running,
                    outcome: match finished {
                        StepOutcome::Success => StepOutcome::Unspecified,
                        other => other,
                    },
                }
            } else {
                LabelStatus {
                    state: LabelState::Complete,
                    outcome: finished,
                }
            }
        })
        .collect()
}

/// Worst outcome over the current step of every node in the job.
pub fn job_outcome(job: &Job) -> StepOutcome {
    worst(node_outcomes(job).into_values())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::plan;
    use crate::readiness::propagate;
    use crate::testing::{graph_index, job_for, node, run_step};
    use chrono::Utc;
    use cinder_core::graph::{GraphDefinition, GroupDefinition, LabelDefinition};

    fn labelled() -> crate::dag::GraphIndex {
        graph_index(GraphDefinition {
            groups: vec![GroupDefinition {
                agent_type: "win".to_string(),
                nodes: vec![node("Compile", &[]), node("Test", &["Compile"]), node("Docs", &[])],
            }],
            aggregates: vec![],
            labels: vec![
                LabelDefinition {
                    name: Some("Editor".to_string()),
                    category: None,
                    required_nodes: vec!["Test".to_string()],
                    included_nodes: vec!["Compile".to_string(), "Test".to_string()],
                },
                LabelDefinition {
                    name: Some("Docs".to_string()),
                    category: None,
                    required_nodes: vec!["Docs".to_string()],
                    included_nodes: vec!["Docs".to_string()],
                },
            ],
        })
    }

    #[test]
    fn test_label_lifecycle() {
        let index = labelled();
        let mut job = job_for(&index, &["-Target=Test"]);
        plan(&mut job, &index, Utc::now()).unwrap();
        propagate(&mut job, &index, Utc::now());

        let statuses = label_statuses(&job, index.graph());
        assert_eq!(statuses[0].state, LabelState::Running);
        assert_eq!(statuses[0].outcome, StepOutcome::Unspecified);
        // Docs is not part of the job.
        assert_eq!(statuses[1].state, LabelState::Unspecified);

        run_step(&mut job, 0, 0, StepOutcome::Warnings);
        let statuses = label_statuses(&job, index.graph());
        assert_eq!(statuses[0].state, LabelState::Running);
        assert_eq!(statuses[0].outcome, StepOutcome::Warnings);

        run_step(&mut job, 0, 1, StepOutcome::Success);
        let statuses = label_statuses(&job, index.graph());
        assert_eq!(statuses[0].state, LabelState::Complete);
        assert_eq!(statuses[0].outcome, StepOutcome::Warnings);
        assert_eq!(job_outcome(&job), StepOutcome::Warnings);
    }

    #[test]
    fn test_failure_dominates() {
        let index = labelled();
        let mut job = job_for(&index, &["-Target=Test"]);
        plan(&mut job, &index, Utc::now()).unwrap();
        run_step(&mut job, 0, 0, StepOutcome::Failure);
        propagate(&mut job, &index, Utc::now());

        let statuses = label_statuses(&job, index.graph());
        assert_eq!(statuses[0].state, LabelState::Complete);
        assert_eq!(statuses[0].outcome, StepOutcome::Failure);
        assert_eq!(job_outcome(&job), StepOutcome::Failure);
    }
}
