//! Dependency index over a build graph.

use cinder_core::graph::{Graph, GraphError, NodeRef, Priority};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Reverse-dependency map and topological order for one graph.
///
/// Built once per graph hash and shared by every job that references it.
#[derive(Debug)]
pub struct GraphIndex {
    graph: Arc<Graph>,
    order: Vec<NodeRef>,
    dependents: HashMap<NodeRef, Vec<NodeRef>>,
}

impl GraphIndex {
    pub fn new(graph: Arc<Graph>) -> Result<Self, GraphError> {
        let mut dag: DiGraph<NodeRef, ()> = DiGraph::new();
        let mut indices: HashMap<NodeRef, NodeIndex> = HashMap::new();
        for node_ref in graph.node_refs() {
            indices.insert(node_ref, dag.add_node(node_ref));
        }

        let mut dependents: HashMap<NodeRef, Vec<NodeRef>> = HashMap::new();
        for node_ref in graph.node_refs() {
            for dep in &graph.node(node_ref).order_dependencies {
                let from = indices
                    .get(dep)
                    .copied()
                    .ok_or_else(|| GraphError::UnknownDependency {
                        node: graph.node(node_ref).name.clone(),
                        dependency: format!("{}:{}", dep.group_idx, dep.node_idx),
                    })?;
                dag.add_edge(from, indices[&node_ref], ());
                dependents.entry(*dep).or_default().push(node_ref);
            }
        }

        let order = toposort(&dag, None)
            .map_err(|cycle| GraphError::CycleDetected(graph.node(dag[cycle.node_id()]).name.clone()))?
            .into_iter()
            .map(|idx| dag[idx])
            .collect();

        Ok(Self {
            graph,
            order,
            dependents,
        })
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    /// Nodes ordered so that every node follows its order dependencies.
    pub fn topological_order(&self) -> &[NodeRef] {
        &self.order
    }

    /// Nodes with a direct order dependency on `node`.
    pub fn dependents(&self, node: NodeRef) -> &[NodeRef] {
        self.dependents
            .get(&node)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every node that transitively order-depends on `node`, in discovery order.
    pub fn transitive_dependents(&self, node: NodeRef) -> Vec<NodeRef> {
        let mut seen = HashSet::new();
        let mut result = Vec::new();
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            for &dependent in self.dependents(current) {
                if seen.insert(dependent) {
                    result.push(dependent);
                    stack.push(dependent);
                }
            }
        }
        result
    }

    /// The given nodes plus everything they transitively consume through input dependencies.
    pub fn input_closure(&self, roots: impl IntoIterator<Item = NodeRef>) -> BTreeSet<NodeRef> {
        let mut closure = BTreeSet::new();
        let mut stack: Vec<NodeRef> = roots.into_iter().collect();
        while let Some(node) = stack.pop() {
            if closure.insert(node) {
                stack.extend(self.graph.node(node).input_dependencies.iter().copied());
            }
        }
        closure
    }

    /// Priority of every node after applying overrides and lifting each prerequisite to
    /// the highest priority of the nodes that wait on it.
    pub fn effective_priorities(
        &self,
        overrides: &HashMap<NodeRef, Priority>,
    ) -> HashMap<NodeRef, Priority> {
        let mut priorities: HashMap<NodeRef, Priority> = self
            .order
            .iter()
            .map(|&node| {
                let priority = overrides
                    .get(&node)
                    .copied()
                    .unwrap_or(self.graph.node(node).priority);
                (node, priority)
            })
            .collect();

        for &node in self.order.iter().rev() {
            let priority = priorities[&node];
            for dep in &self.graph.node(node).order_dependencies {
                if let Some(dep_priority) = priorities.get_mut(dep)
                    && *dep_priority < priority
                {
                    *dep_priority = priority;
                }
            }
        }
        priorities
    }

    /// Nodes outside `group_idx` that must finish before a batch holding `node_idxs` may start.
    ///
    /// When any of the nodes is marked run-early, only the run-early nodes are considered.
    pub fn start_dependencies(&self, group_idx: usize, node_idxs: &[usize]) -> BTreeSet<NodeRef> {
        let group = &self.graph.groups[group_idx];
        let any_run_early = node_idxs.iter().any(|&idx| group.nodes[idx].run_early);
        node_idxs
            .iter()
            .map(|&idx| &group.nodes[idx])
            .filter(|node| !any_run_early || node.run_early)
            .flat_map(|node| node.order_dependencies.iter().copied())
            .filter(|dep| dep.group_idx != group_idx)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_core::graph::{GraphDefinition, GroupDefinition, NodeDefinition};

    fn node(name: &str, inputs: &[&str], priority: Priority) -> NodeDefinition {
        NodeDefinition {
            name: name.to_string(),
            input_dependencies: inputs.iter().map(|s| s.to_string()).collect(),
            order_dependencies: vec![],
            priority,
            allow_retry: true,
            run_early: false,
        }
    }

    fn index() -> GraphIndex {
        // win: Compile -> Cook ; linux: Test(Cook), Package(Compile)
        let def = GraphDefinition {
            groups: vec![
                GroupDefinition {
                    agent_type: "win".to_string(),
                    nodes: vec![
                        node("Compile", &[], Priority::Normal),
                        node("Cook", &["Compile"], Priority::Lowest),
                    ],
                },
                GroupDefinition {
                    agent_type: "linux".to_string(),
                    nodes: vec![
                        node("Test", &["Cook"], Priority::Highest),
                        node("Package", &["Compile"], Priority::Normal),
                    ],
                },
            ],
            aggregates: vec![],
            labels: vec![],
        };
        GraphIndex::new(Arc::new(def.build().unwrap())).unwrap()
    }

    #[test]
    fn test_topological_order_respects_dependencies() {
        let index = index();
        let order = index.topological_order();
        let pos = |n: NodeRef| order.iter().position(|&x| x == n).unwrap();
        assert!(pos(NodeRef::new(0, 0)) < pos(NodeRef::new(0, 1)));
        assert!(pos(NodeRef::new(0, 1)) < pos(NodeRef::new(1, 0)));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn test_input_closure() {
        let index = index();
        let closure = index.input_closure([NodeRef::new(1, 0)]);
        assert_eq!(
            closure.into_iter().collect::<Vec<_>>(),
            vec![NodeRef::new(0, 0), NodeRef::new(0, 1), NodeRef::new(1, 0)]
        );
    }

    #[test]
    fn test_transitive_dependents() {
        let index = index();
        let mut dependents = index.transitive_dependents(NodeRef::new(0, 0));
        dependents.sort();
        assert_eq!(
            dependents,
            vec![NodeRef::new(0, 1), NodeRef::new(1, 0), NodeRef::new(1, 1)]
        );
        assert!(index.transitive_dependents(NodeRef::new(1, 1)).is_empty());
    }

    #[test]
    fn test_priority_propagates_to_prerequisites() {
        let index = index();
        let priorities = index.effective_priorities(&HashMap::new());
        // Test is highest, so Cook and Compile inherit it.
        assert_eq!(priorities[&NodeRef::new(0, 1)], Priority::Highest);
        assert_eq!(priorities[&NodeRef::new(0, 0)], Priority::Highest);
        assert_eq!(priorities[&NodeRef::new(1, 1)], Priority::Normal);

        let mut overrides = HashMap::new();
        overrides.insert(NodeRef::new(1, 0), Priority::Lowest);
        let priorities = index.effective_priorities(&overrides);
        assert_eq!(priorities[&NodeRef::new(0, 1)], Priority::Lowest);
        assert_eq!(priorities[&NodeRef::new(0, 0)], Priority::Normal);
    }

    #[test]
    fn test_start_dependencies() {
        let index = index();
        assert_eq!(
            index.start_dependencies(1, &[0, 1]),
            [NodeRef::new(0, 0), NodeRef::new(0, 1)].into_iter().collect()
        );
        assert!(index.start_dependencies(0, &[0, 1]).is_empty());
    }
}
