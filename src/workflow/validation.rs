//! Static workflow validation
//!
//! Runs before any execution is queued. Every problem is collected rather than
//! stopping at the first, and issues always come out in the same order: node
//! declaration order, then connection order, then output and input checks, then
//! cycles sorted by node id.

use crate::error::{ValidationError, ValidationIssue};
use crate::nodes::{NodeDefinition, NodeRegistry, PortSpec};
use crate::sandbox::lua;
use crate::workflow::graph::WorkflowGraph;
use crate::workflow::types::{Condition, NodeSpec, Workflow};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub fn validate(workflow: &Workflow, registry: &NodeRegistry) -> Result<(), ValidationError> {
    let mut issues = Vec::new();

    if workflow.nodes.is_empty() {
        issues.push(ValidationIssue::EmptyWorkflow);
    }

    let mut seen = HashSet::new();
    let mut reported = HashSet::new();
    for node in &workflow.nodes {
        if !seen.insert(node.id.as_str()) && reported.insert(node.id.as_str()) {
            issues.push(ValidationIssue::DuplicateNodeId(node.id.clone()));
        }
    }

    // First declaration wins, matching the graph
    let mut nodes: HashMap<&str, (&NodeSpec, Option<Arc<NodeDefinition>>)> = HashMap::new();
    for node in &workflow.nodes {
        if nodes.contains_key(node.id.as_str()) {
            continue;
        }
        let definition = match registry.resolve(&node.node_type) {
            Ok(entry) => {
                check_node(node, &entry.definition, &*(entry.constructor)(), &mut issues);
                Some(entry.definition)
            }
            Err(_) => {
                issues.push(ValidationIssue::UnknownNodeType {
                    node_id: node.id.clone(),
                    node_type: node.node_type.clone(),
                });
                None
            }
        };
        nodes.insert(node.id.as_str(), (node, definition));
    }

    for (index, connection) in workflow.connections.iter().enumerate() {
        let source = nodes.get(connection.source.as_str());
        let target = nodes.get(connection.target.as_str());
        if source.is_none() {
            issues.push(ValidationIssue::DanglingConnection {
                index,
                node_id: connection.source.clone(),
            });
        }
        if target.is_none() {
            issues.push(ValidationIssue::DanglingConnection {
                index,
                node_id: connection.target.clone(),
            });
        }
        if connection.source == connection.target {
            issues.push(ValidationIssue::SelfLoop(connection.source.clone()));
        }

        if let (Some((spec, definition)), Some(port)) = (source, &connection.source_port) {
            let declared = definition.as_ref().map_or(&[][..], |d| &d.outputs[..]);
            if !port_declared(&spec.outputs, declared, port) {
                issues.push(ValidationIssue::UnknownPort {
                    index,
                    node_id: spec.id.clone(),
                    port: port.clone(),
                });
            }
        }
        if let (Some((spec, definition)), Some(port)) = (target, &connection.target_port) {
            let declared = definition.as_ref().map_or(&[][..], |d| &d.inputs[..]);
            if !port_declared(&spec.inputs, declared, port) {
                issues.push(ValidationIssue::UnknownPort {
                    index,
                    node_id: spec.id.clone(),
                    port: port.clone(),
                });
            }
        }

        if let Some(Condition::Expr(expr)) = &connection.condition {
            if let Err(message) = lua::check_condition(expr) {
                issues.push(ValidationIssue::InvalidCondition { index, message });
            }
        }
    }

    for output in &workflow.outputs {
        if !nodes.contains_key(output.as_str()) {
            issues.push(ValidationIssue::UnknownOutputNode(output.clone()));
        }
    }

    // Roots are fed by trigger params, so only connected nodes can miss an input
    for node in &workflow.nodes {
        let Some((_, Some(definition))) = nodes.get(node.id.as_str()) else {
            continue;
        };
        let mut fed = workflow
            .connections
            .iter()
            .filter(|connection| connection.target == node.id)
            .map(|connection| connection.input_key())
            .peekable();
        if fed.peek().is_none() {
            continue;
        }
        let fed: HashSet<&str> = fed.collect();
        for port in definition.inputs.iter().filter(|port| port.required) {
            if !fed.contains(port.name.as_str()) {
                issues.push(ValidationIssue::MissingInput {
                    node_id: node.id.clone(),
                    port: port.name.clone(),
                });
            }
        }
    }

    for nodes in WorkflowGraph::build(workflow).cycles() {
        issues.push(ValidationIssue::Cycle { nodes });
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(ValidationError {
            workflow_id: workflow.id.clone(),
            issues,
        })
    }
}

fn check_node(
    node: &NodeSpec,
    definition: &NodeDefinition,
    instance: &dyn crate::nodes::Node,
    issues: &mut Vec<ValidationIssue>,
) {
    let problems = definition.check_config(&node.config);
    if !problems.is_empty() {
        issues.extend(problems.into_iter().map(|message| ValidationIssue::InvalidConfig {
            node_id: node.id.clone(),
            message,
        }));
        return;
    }
    if let Err(e) = instance.validate(&node.config) {
        issues.push(ValidationIssue::InvalidConfig {
            node_id: node.id.clone(),
            message: e.to_string(),
        });
    }
}

/// Ports listed on the node spec take precedence; no ports at all means any name
fn port_declared(spec_ports: &[String], definition_ports: &[PortSpec], port: &str) -> bool {
    if !spec_ports.is_empty() {
        return spec_ports.iter().any(|name| name == port);
    }
    definition_ports.is_empty() || definition_ports.iter().any(|spec| spec.name == port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NodeError;
    use crate::nodes::{constructor, Node, NodeContext, ValueType};
    use crate::workflow::types::{Connection, ValueMap};
    use async_trait::async_trait;
    use serde_json::json;

    struct Fetch;

    #[async_trait]
    impl Node for Fetch {
        async fn execute(&self, _ctx: &NodeContext, inputs: ValueMap) -> Result<ValueMap, NodeError> {
            Ok(inputs)
        }
    }

    fn registry() -> NodeRegistry {
        let registry = NodeRegistry::with_builtins();
        registry
            .register(
                "fetch",
                constructor(|| Fetch),
                NodeDefinition::new("fetch")
                    .input(PortSpec::required("url", ValueType::String))
                    .output(PortSpec::optional("body", ValueType::Any)),
            )
            .unwrap();
        registry
    }

    fn workflow(nodes: Vec<NodeSpec>, connections: Vec<Connection>) -> Workflow {
        Workflow {
            id: "wf".into(),
            name: String::new(),
            nodes,
            connections,
            config: ValueMap::new(),
            outputs: Vec::new(),
            triggers: Vec::new(),
        }
    }

    fn issues(workflow: &Workflow) -> Vec<ValidationIssue> {
        validate(workflow, &registry()).map_or_else(|e| e.issues, |()| Vec::new())
    }

    #[test]
    fn accepts_a_well_formed_chain() {
        let wf = workflow(
            vec![
                NodeSpec::new("start", "set").with_config("values", json!({"url": "http://x"})),
                NodeSpec::new("get", "fetch"),
            ],
            vec![Connection::new("start", "get").ports("url", "url")],
        );
        assert_eq!(issues(&wf), Vec::new());
    }

    #[test]
    fn reports_every_problem_in_a_stable_order() {
        let mut wf = workflow(
            vec![
                NodeSpec::new("a", "passthrough"),
                NodeSpec::new("a", "passthrough"),
                NodeSpec::new("b", "mystery"),
                NodeSpec::new("c", "delay"),
                NodeSpec::new("d", "fetch"),
            ],
            vec![
                Connection::new("a", "ghost"),
                Connection::new("a", "a"),
                Connection::new("a", "d").ports("out", "body"),
                Connection::new("a", "c").when(Condition::Expr("output.x ==".into())),
            ],
        );
        wf.outputs = vec!["nowhere".into()];

        let found = issues(&wf);
        assert_eq!(
            found[..6],
            [
                ValidationIssue::DuplicateNodeId("a".into()),
                ValidationIssue::UnknownNodeType { node_id: "b".into(), node_type: "mystery".into() },
                ValidationIssue::InvalidConfig {
                    node_id: "c".into(),
                    message: "missing required field 'ms'".into()
                },
                ValidationIssue::DanglingConnection { index: 0, node_id: "ghost".into() },
                ValidationIssue::SelfLoop("a".into()),
                ValidationIssue::UnknownPort { index: 2, node_id: "d".into(), port: "body".into() },
            ]
        );
        assert!(matches!(found[6], ValidationIssue::InvalidCondition { index: 3, .. }));
        assert_eq!(
            found[7..],
            [
                ValidationIssue::UnknownOutputNode("nowhere".into()),
                ValidationIssue::MissingInput { node_id: "d".into(), port: "url".into() },
            ]
        );
    }

    #[test]
    fn instance_validation_runs_only_on_clean_config() {
        let wf = workflow(
            vec![
                NodeSpec::new("typed", "delay").with_config("ms", json!("soon")),
                NodeSpec::new("negative", "delay").with_config("ms", json!(-5)),
            ],
            Vec::new(),
        );
        let found = issues(&wf);
        assert_eq!(found.len(), 2);
        assert_eq!(
            found[0],
            ValidationIssue::InvalidConfig {
                node_id: "typed".into(),
                message: "field 'ms' must be of type number".into()
            }
        );
        assert!(matches!(&found[1], ValidationIssue::InvalidConfig { node_id, .. } if node_id == "negative"));
    }

    #[test]
    fn cycles_are_reported_once_per_component() {
        let wf = workflow(
            vec![
                NodeSpec::new("a", "passthrough"),
                NodeSpec::new("b", "passthrough"),
                NodeSpec::new("c", "passthrough"),
            ],
            vec![Connection::new("a", "b"), Connection::new("b", "c"), Connection::new("c", "b")],
        );
        assert_eq!(
            issues(&wf),
            vec![ValidationIssue::Cycle { nodes: vec!["b".into(), "c".into()] }]
        );
    }

    #[test]
    fn repeated_validation_gives_equal_results() {
        let wf = workflow(
            vec![NodeSpec::new("x", "nope"), NodeSpec::new("y", "passthrough")],
            vec![Connection::new("x", "y"), Connection::new("y", "x")],
        );
        let registry = registry();
        let first = validate(&wf, &registry).unwrap_err();
        let second = validate(&wf, &registry).unwrap_err();
        assert_eq!(first, second);
        assert_eq!(first.to_string(), second.to_string());
    }

    #[test]
    fn empty_workflows_are_rejected() {
        assert_eq!(issues(&workflow(Vec::new(), Vec::new())), vec![ValidationIssue::EmptyWorkflow]);
    }
}
