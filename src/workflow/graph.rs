//! Petgraph view of a workflow's connection list
//!
//! Built once per validation and once per execution. Node weights are
//! positions in `Workflow::nodes`, edge weights are positions in
//! `Workflow::connections`, so every lookup maps straight back to the definition.

use crate::workflow::types::Workflow;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, VecDeque};

#[derive(Debug)]
pub struct WorkflowGraph {
    /// The petgraph DiGraph structure (self-loops excluded)
    graph: DiGraph<usize, usize>,
    /// Node id -> graph index; first declaration wins for duplicate ids
    node_id_to_index: HashMap<String, NodeIndex>,
    /// Node ids by position
    node_ids: Vec<String>,
    /// Incoming connection positions for each node, in connection order
    incoming: Vec<Vec<usize>>,
    /// Resolved `(source, target)` positions per connection; `None` when dangling
    endpoints: Vec<Option<(usize, usize)>>,
}

impl WorkflowGraph {
    pub fn build(workflow: &Workflow) -> Self {
        let mut graph = DiGraph::with_capacity(workflow.nodes.len(), workflow.connections.len());
        let mut node_id_to_index = HashMap::new();
        let mut indices = Vec::with_capacity(workflow.nodes.len());

        for (position, node) in workflow.nodes.iter().enumerate() {
            let index = graph.add_node(position);
            node_id_to_index.entry(node.id.clone()).or_insert(index);
            indices.push(index);
        }

        let mut incoming = vec![Vec::new(); workflow.nodes.len()];
        let mut endpoints = Vec::with_capacity(workflow.connections.len());

        for (position, connection) in workflow.connections.iter().enumerate() {
            let source = node_id_to_index.get(&connection.source);
            let target = node_id_to_index.get(&connection.target);
            let resolved = match (source, target) {
                (Some(&source), Some(&target)) => {
                    let (source, target) = (graph[source], graph[target]);
                    incoming[target].push(position);
                    if source != target {
                        graph.add_edge(indices[source], indices[target], position);
                    }
                    Some((source, target))
                }
                _ => None,
            };
            endpoints.push(resolved);
        }

        Self {
            graph,
            node_id_to_index,
            node_ids: workflow.nodes.iter().map(|node| node.id.clone()).collect(),
            incoming,
            endpoints,
        }
    }

    pub fn len(&self) -> usize {
        self.node_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_ids.is_empty()
    }

    pub fn position(&self, node_id: &str) -> Option<usize> {
        self.node_id_to_index.get(node_id).map(|&index| self.graph[index])
    }

    pub fn node_id(&self, position: usize) -> &str {
        &self.node_ids[position]
    }

    /// Connection positions feeding `position`
    pub fn incoming(&self, position: usize) -> &[usize] {
        &self.incoming[position]
    }

    pub fn endpoints(&self, connection: usize) -> Option<(usize, usize)> {
        self.endpoints.get(connection).copied().flatten()
    }

    pub fn is_acyclic(&self) -> bool {
        toposort(&self.graph, None).is_ok()
    }

    /// Every cycle as a sorted list of node ids, ordered by its first id
    pub fn cycles(&self) -> Vec<Vec<String>> {
        if self.is_acyclic() {
            return Vec::new();
        }

        let mut cycles: Vec<Vec<String>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|component| component.len() > 1)
            .map(|component| {
                let mut ids: Vec<String> = component
                    .into_iter()
                    .map(|index| self.node_ids[self.graph[index]].clone())
                    .collect();
                ids.sort();
                ids.dedup();
                ids
            })
            .collect();
        cycles.sort();
        cycles
    }

    /// Nodes central to the declared outputs: the outputs themselves and
    /// everything reachable backwards over non-optional edges. With no declared
    /// outputs every node is central.
    pub fn central(&self, workflow: &Workflow) -> Vec<bool> {
        if workflow.outputs.is_empty() {
            return vec![true; self.len()];
        }

        let mut central = vec![false; self.len()];
        let mut queue: VecDeque<usize> = workflow
            .outputs
            .iter()
            .filter_map(|id| self.position(id))
            .collect();

        while let Some(position) = queue.pop_front() {
            if std::mem::replace(&mut central[position], true) {
                continue;
            }
            for &connection in &self.incoming[position] {
                if workflow.connections[connection].optional {
                    continue;
                }
                if let Some((source, _)) = self.endpoints(connection) {
                    if !central[source] {
                        queue.push_back(source);
                    }
                }
            }
        }

        central
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::{Connection, NodeSpec};

    fn workflow(nodes: &[&str], edges: &[(&str, &str)]) -> Workflow {
        Workflow {
            id: "wf".into(),
            name: String::new(),
            nodes: nodes.iter().map(|id| NodeSpec::new(*id, "passthrough")).collect(),
            connections: edges.iter().map(|(s, t)| Connection::new(*s, *t)).collect(),
            config: Default::default(),
            outputs: Vec::new(),
            triggers: Vec::new(),
        }
    }

    #[test]
    fn reports_each_cycle_sorted() {
        let wf = workflow(
            &["a", "b", "c", "d", "e"],
            &[("a", "b"), ("c", "b"), ("b", "c"), ("d", "e"), ("e", "d")],
        );
        let graph = WorkflowGraph::build(&wf);
        assert!(!graph.is_acyclic());
        assert_eq!(
            graph.cycles(),
            vec![vec!["b".to_string(), "c".to_string()], vec!["d".to_string(), "e".to_string()]]
        );
    }

    #[test]
    fn central_nodes_follow_required_edges_only() {
        let mut wf = workflow(&["a", "b", "c", "side"], &[("a", "b"), ("b", "c")]);
        wf.connections.push(Connection::new("side", "c").optional());
        wf.outputs = vec!["c".into()];

        let graph = WorkflowGraph::build(&wf);
        assert_eq!(graph.central(&wf), vec![true, true, true, false]);
        assert_eq!(graph.incoming(graph.position("c").unwrap()), &[1, 2]);
    }

    #[test]
    fn dangling_connections_are_left_unresolved() {
        let wf = workflow(&["a"], &[("a", "ghost")]);
        let graph = WorkflowGraph::build(&wf);
        assert_eq!(graph.endpoints(0), None);
        assert!(graph.is_acyclic());
    }
}
