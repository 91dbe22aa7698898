//! Core workflow type definitions
//!
//! A workflow is a declarative graph: typed nodes plus port-to-port connections.
//! These types are deserialized from JSON and are read-only to the executor.

use crate::resilience::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Port, config and parameter maps. Ordered so snapshots and cache keys
/// serialize the same way every time.
pub type ValueMap = BTreeMap<String, Value>;

/// A complete workflow definition containing nodes and their connections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique workflow identifier (e.g., "wf-billing")
    pub id: String,
    /// Human-readable workflow name
    #[serde(default)]
    pub name: String,
    /// Nodes in declaration order
    pub nodes: Vec<NodeSpec>,
    /// Data edges between node ports
    #[serde(default)]
    pub connections: Vec<Connection>,
    /// Free-form workflow settings; `timeout_ms` overrides the engine's workflow timeout
    #[serde(default)]
    pub config: ValueMap,
    /// Node ids whose results make up the workflow's declared outputs.
    /// Empty means every node counts.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Timers and manual entry points handled by the trigger scheduler
    #[serde(default)]
    pub triggers: Vec<TriggerSpec>,
}

impl Workflow {
    pub fn node(&self, node_id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|node| node.id == node_id)
    }

    /// Per-workflow execution budget from `config.timeout_ms`
    pub fn timeout(&self) -> Option<Duration> {
        self.config
            .get("timeout_ms")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
    }
}

/// A single node in the workflow graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Unique node identifier within the workflow
    pub id: String,
    /// Key into the node registry
    #[serde(rename = "type")]
    pub node_type: String,
    /// Static configuration handed to the node type
    #[serde(default)]
    pub config: ValueMap,
    /// Declared input port names; empty defers to the node type's definition
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Declared output port names; empty defers to the node type's definition
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Per-attempt timeout, never longer than the workflow's remaining budget
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Overrides the engine's default retry policy
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Name of the downstream dependency whose circuit breaker guards this node
    #[serde(default)]
    pub breaker: Option<String>,
    /// Reuse earlier outputs for identical inputs when the node type is cacheable
    #[serde(default)]
    pub cache: bool,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            config: ValueMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            timeout_ms: None,
            retry: None,
            breaker: None,
            cache: false,
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Directed edge `(source, source_port) -> (target, target_port)`
///
/// Without a `source_port` the whole output map of the source travels as one
/// object. Without a `target_port` the value lands on an input named after the
/// source node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub source: String,
    #[serde(default)]
    pub source_port: Option<String>,
    pub target: String,
    #[serde(default)]
    pub target_port: Option<String>,
    /// Gate evaluated against the source's outputs once it completes
    #[serde(default)]
    pub condition: Option<Condition>,
    /// An optional edge never blocks or skips its target
    #[serde(default)]
    pub optional: bool,
}

impl Connection {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            source_port: None,
            target: target.into(),
            target_port: None,
            condition: None,
            optional: false,
        }
    }

    pub fn ports(mut self, source_port: impl Into<String>, target_port: impl Into<String>) -> Self {
        self.source_port = Some(source_port.into());
        self.target_port = Some(target_port.into());
        self
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Input key the transported value is delivered under
    pub fn input_key(&self) -> &str {
        self.target_port.as_deref().unwrap_or(&self.source)
    }
}

/// Edge gate: a literal, or a Lua expression over the source's outputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Bool(bool),
    Expr(String),
}

/// External events that start executions of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerSpec {
    Manual,
    /// Six-field cron expression (seconds first), e.g. "0 */5 * * * *"
    Cron {
        schedule: String,
        #[serde(default)]
        params: ValueMap,
    },
    Interval {
        every_ms: u64,
        #[serde(default)]
        params: ValueMap,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_a_workflow_document() {
        let workflow: Workflow = serde_json::from_value(json!({
            "id": "wf-1",
            "name": "demo",
            "nodes": [
                {"id": "a", "type": "set", "config": {"values": {"x": 1}}},
                {"id": "b", "type": "passthrough", "timeout_ms": 500,
                 "retry": {"max_attempts": 4, "initial_delay_ms": 10}}
            ],
            "connections": [
                {"source": "a", "source_port": "x", "target": "b", "target_port": "x",
                 "condition": "output.x > 0"},
                {"source": "a", "target": "b", "condition": false, "optional": true}
            ],
            "config": {"timeout_ms": 2000},
            "triggers": [{"type": "interval", "every_ms": 1000}, {"type": "manual"}]
        }))
        .unwrap();

        assert_eq!(workflow.timeout(), Some(Duration::from_millis(2000)));
        let b = workflow.node("b").unwrap();
        assert_eq!(b.timeout(), Some(Duration::from_millis(500)));
        assert_eq!(b.retry.as_ref().unwrap().max_attempts, 4);
        assert_eq!(
            workflow.connections[0].condition,
            Some(Condition::Expr("output.x > 0".into()))
        );
        assert_eq!(workflow.connections[1].condition, Some(Condition::Bool(false)));
        assert_eq!(workflow.connections[1].input_key(), "a");
        assert_eq!(workflow.triggers.len(), 2);
    }
}
