//! Build graph types.
//!
//! A [`Graph`] is the immutable, content-addressed description of every node a job
//! may execute. Nodes are grouped into [`NodeGroup`]s that share one agent type;
//! aggregates and labels are named views over node subsets. Graphs are compiled
//! from a user-authored [`GraphDefinition`] and never mutated afterwards.

use crate::ids::ContentHash;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Name of the node every job implicitly targets.
pub const SETUP_NODE_NAME: &str = "Setup Build";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("Graph has no nodes")]
    EmptyGraph,
    #[error("Duplicate node name: {0}")]
    DuplicateNode(String),
    #[error("Node '{node}' depends on unknown node '{dependency}'")]
    UnknownDependency { node: String, dependency: String },
    #[error("Node '{node}' depends on '{dependency}', which runs later in the same group")]
    OutOfOrderDependency { node: String, dependency: String },
    #[error("Cycle detected in node dependencies at '{0}'")]
    CycleDetected(String),
    #[error("Cycle detected between agent groups")]
    GroupCycle,
    #[error("Duplicate aggregate name: {0}")]
    DuplicateAggregate(String),
    #[error("'{owner}' references unknown node '{node}'")]
    UnknownNode { owner: String, node: String },
    #[error("Failed to hash graph: {0}")]
    Hash(String),
}

/// Priority of a node or job.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Lowest = 0,
    BelowNormal = 1,
    #[default]
    Normal = 2,
    AboveNormal = 3,
    High = 4,
    Highest = 5,
}

impl Priority {
    pub fn value(self) -> i32 {
        self as i32
    }
}

/// Position of a node within a graph.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
pub struct NodeRef {
    pub group_idx: usize,
    pub node_idx: usize,
}

impl NodeRef {
    pub fn new(group_idx: usize, node_idx: usize) -> Self {
        Self {
            group_idx,
            node_idx,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Node {
    pub name: String,
    /// Nodes whose outputs this node consumes.
    pub input_dependencies: Vec<NodeRef>,
    /// Nodes that must finish first. Always a superset of `input_dependencies`.
    pub order_dependencies: Vec<NodeRef>,
    pub priority: Priority,
    pub allow_retry: bool,
    pub run_early: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct NodeGroup {
    pub agent_type: String,
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Aggregate {
    pub name: String,
    pub nodes: Vec<NodeRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Label {
    pub name: Option<String>,
    pub category: Option<String>,
    /// Nodes that must all be part of the job for the label to be shown.
    pub required_nodes: Vec<NodeRef>,
    /// Nodes whose outcomes determine the label outcome.
    pub included_nodes: Vec<NodeRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Graph {
    pub hash: ContentHash,
    pub groups: Vec<NodeGroup>,
    pub aggregates: Vec<Aggregate>,
    pub labels: Vec<Label>,
}

impl Graph {
    /// Get a node by reference. References always come from this graph.
    pub fn node(&self, node_ref: NodeRef) -> &Node {
        &self.groups[node_ref.group_idx].nodes[node_ref.node_idx]
    }

    pub fn get_node(&self, node_ref: NodeRef) -> Option<&Node> {
        self.groups
            .get(node_ref.group_idx)
            .and_then(|g| g.nodes.get(node_ref.node_idx))
    }

    /// Iterate over all node references in group order.
    pub fn node_refs(&self) -> impl Iterator<Item = NodeRef> + '_ {
        self.groups.iter().enumerate().flat_map(|(group_idx, group)| {
            (0..group.nodes.len()).map(move |node_idx| NodeRef::new(group_idx, node_idx))
        })
    }

    pub fn node_count(&self) -> usize {
        self.groups.iter().map(|g| g.nodes.len()).sum()
    }

    /// Find a node by name (case-insensitive).
    pub fn find_node(&self, name: &str) -> Option<NodeRef> {
        self.node_refs()
            .find(|&r| self.node(r).name.eq_ignore_ascii_case(name))
    }

    /// Find an aggregate by name (case-insensitive).
    pub fn find_aggregate(&self, name: &str) -> Option<&Aggregate> {
        self.aggregates
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
    }

    pub fn setup_node(&self) -> Option<NodeRef> {
        self.find_node(SETUP_NODE_NAME)
    }
}

// === Definitions ===

/// User-authored graph definition, compiled into a [`Graph`] by [`GraphDefinition::build`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GraphDefinition {
    pub groups: Vec<GroupDefinition>,
    #[serde(default)]
    pub aggregates: Vec<AggregateDefinition>,
    #[serde(default)]
    pub labels: Vec<LabelDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GroupDefinition {
    pub agent_type: String,
    pub nodes: Vec<NodeDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct NodeDefinition {
    pub name: String,
    #[serde(default)]
    pub input_dependencies: Vec<String>,
    #[serde(default)]
    pub order_dependencies: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_allow_retry")]
    pub allow_retry: bool,
    #[serde(default)]
    pub run_early: bool,
}

fn default_allow_retry() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AggregateDefinition {
    pub name: String,
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LabelDefinition {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub required_nodes: Vec<String>,
    #[serde(default)]
    pub included_nodes: Vec<String>,
}

impl GraphDefinition {
    /// Content hash of the definition.
    pub fn hash(&self) -> Result<ContentHash, GraphError> {
        let bytes = serde_json::to_vec(self).map_err(|e| GraphError::Hash(e.to_string()))?;
        Ok(ContentHash::compute(&bytes))
    }

    /// Validate the definition and compile it into an immutable graph.
    pub fn build(&self) -> Result<Graph, GraphError> {
        let mut name_to_ref: HashMap<String, NodeRef> = HashMap::new();
        for (group_idx, group) in self.groups.iter().enumerate() {
            for (node_idx, node) in group.nodes.iter().enumerate() {
                let key = node.name.to_ascii_lowercase();
                if name_to_ref
                    .insert(key, NodeRef::new(group_idx, node_idx))
                    .is_some()
                {
                    return Err(GraphError::DuplicateNode(node.name.clone()));
                }
            }
        }
        if name_to_ref.is_empty() {
            return Err(GraphError::EmptyGraph);
        }

        let resolve = |owner: &str, name: &str| {
            name_to_ref
                .get(&name.to_ascii_lowercase())
                .copied()
                .ok_or_else(|| GraphError::UnknownDependency {
                    node: owner.to_string(),
                    dependency: name.to_string(),
                })
        };

        let mut groups = Vec::with_capacity(self.groups.len());
        for (group_idx, group) in self.groups.iter().enumerate() {
            let mut nodes = Vec::with_capacity(group.nodes.len());
            for (node_idx, node) in group.nodes.iter().enumerate() {
                let mut input_dependencies = Vec::new();
                for dep in &node.input_dependencies {
                    push_unique(&mut input_dependencies, resolve(&node.name, dep)?);
                }
                let mut order_dependencies = input_dependencies.clone();
                for dep in &node.order_dependencies {
                    push_unique(&mut order_dependencies, resolve(&node.name, dep)?);
                }
                for dep in &order_dependencies {
                    if dep.group_idx == group_idx && dep.node_idx >= node_idx {
                        return Err(GraphError::OutOfOrderDependency {
                            node: node.name.clone(),
                            dependency: self.groups[dep.group_idx].nodes[dep.node_idx]
                                .name
                                .clone(),
                        });
                    }
                }
                nodes.push(Node {
                    name: node.name.clone(),
                    input_dependencies,
                    order_dependencies,
                    priority: node.priority,
                    allow_retry: node.allow_retry,
                    run_early: node.run_early,
                });
            }
            groups.push(NodeGroup {
                agent_type: group.agent_type.clone(),
                nodes,
            });
        }

        check_node_cycles(&groups)?;
        check_group_cycles(&groups)?;

        let resolve_member = |owner: &str, name: &str| {
            name_to_ref
                .get(&name.to_ascii_lowercase())
                .copied()
                .ok_or_else(|| GraphError::UnknownNode {
                    owner: owner.to_string(),
                    node: name.to_string(),
                })
        };

        let mut aggregates: Vec<Aggregate> = Vec::with_capacity(self.aggregates.len());
        for aggregate in &self.aggregates {
            if aggregates
                .iter()
                .any(|a| a.name.eq_ignore_ascii_case(&aggregate.name))
            {
                return Err(GraphError::DuplicateAggregate(aggregate.name.clone()));
            }
            let nodes = aggregate
                .nodes
                .iter()
                .map(|n| resolve_member(&aggregate.name, n))
                .collect::<Result<Vec<_>, _>>()?;
            aggregates.push(Aggregate {
                name: aggregate.name.clone(),
                nodes,
            });
        }

        let mut labels = Vec::with_capacity(self.labels.len());
        for label in &self.labels {
            let owner = label.name.clone().unwrap_or_else(|| "label".to_string());
            labels.push(Label {
                name: label.name.clone(),
                category: label.category.clone(),
                required_nodes: label
                    .required_nodes
                    .iter()
                    .map(|n| resolve_member(&owner, n))
                    .collect::<Result<Vec<_>, _>>()?,
                included_nodes: label
                    .included_nodes
                    .iter()
                    .map(|n| resolve_member(&owner, n))
                    .collect::<Result<Vec<_>, _>>()?,
            });
        }

        Ok(Graph {
            hash: self.hash()?,
            groups,
            aggregates,
            labels,
        })
    }
}

fn push_unique(list: &mut Vec<NodeRef>, node_ref: NodeRef) {
    if !list.contains(&node_ref) {
        list.push(node_ref);
    }
}

fn check_node_cycles(groups: &[NodeGroup]) -> Result<(), GraphError> {
    let mut graph: DiGraph<NodeRef, ()> = DiGraph::new();
    let mut indices: HashMap<NodeRef, NodeIndex> = HashMap::new();
    for (group_idx, group) in groups.iter().enumerate() {
        for node_idx in 0..group.nodes.len() {
            let node_ref = NodeRef::new(group_idx, node_idx);
            indices.insert(node_ref, graph.add_node(node_ref));
        }
    }
    for (group_idx, group) in groups.iter().enumerate() {
        for (node_idx, node) in group.nodes.iter().enumerate() {
            let target = indices[&NodeRef::new(group_idx, node_idx)];
            for dep in &node.order_dependencies {
                graph.add_edge(indices[dep], target, ());
            }
        }
    }
    toposort(&graph, None).map(|_| ()).map_err(|cycle| {
        let node_ref = graph[cycle.node_id()];
        GraphError::CycleDetected(groups[node_ref.group_idx].nodes[node_ref.node_idx].name.clone())
    })
}

/// Groups wait on the nodes their steps depend on before starting; those waits must not
/// form a cycle. Groups containing run-early nodes only wait on the run-early nodes' dependencies.
fn check_group_cycles(groups: &[NodeGroup]) -> Result<(), GraphError> {
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let indices: Vec<NodeIndex> = (0..groups.len()).map(|i| graph.add_node(i)).collect();
    for (group_idx, group) in groups.iter().enumerate() {
        let any_run_early = group.nodes.iter().any(|n| n.run_early);
        for node in group
            .nodes
            .iter()
            .filter(|n| !any_run_early || n.run_early)
        {
            for dep in &node.order_dependencies {
                if dep.group_idx != group_idx {
                    graph.update_edge(indices[dep.group_idx], indices[group_idx], ());
                }
            }
        }
    }
    toposort(&graph, None)
        .map(|_| ())
        .map_err(|_| GraphError::GroupCycle)
}
