//! Node Contract
//!
//! Every executable unit implements [`Node`]. A node type is registered with a
//! constructor and a declarative [`NodeDefinition`]; the executor builds a fresh
//! instance per node per execution and calls `execute` once per attempt.
//!
//! - Built-in node types live in [`builtin`]
//! - The process-wide type map lives in [`registry`]

pub mod builtin;
pub mod registry;

use crate::error::NodeError;
use crate::runtime::execution::ExecutionId;
use crate::sandbox::{CallContext, Sandbox};
use crate::workflow::types::ValueMap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub use builtin::register_builtins;
pub use registry::{NodeRegistry, RegisteredNode};

/// An executable node type.
///
/// Implementations must tolerate concurrent `execute` calls on different
/// instances of the same type.
#[async_trait]
pub trait Node: Send + Sync {
    /// Check static configuration before the first execution
    fn validate(&self, _config: &ValueMap) -> Result<(), NodeError> {
        Ok(())
    }

    async fn execute(&self, ctx: &NodeContext, inputs: ValueMap) -> Result<ValueMap, NodeError>;
}

/// Factory producing a fresh node instance
pub type NodeConstructor = Arc<dyn Fn() -> Box<dyn Node> + Send + Sync>;

/// Wrap a closure returning a concrete node type into a [`NodeConstructor`]
pub fn constructor<N, F>(factory: F) -> NodeConstructor
where
    N: Node + 'static,
    F: Fn() -> N + Send + Sync + 'static,
{
    Arc::new(move || Box::new(factory()) as Box<dyn Node>)
}

/// Schema type for ports and config fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Any,
    Null,
    Bool,
    Number,
    String,
    List,
    Map,
}

impl ValueType {
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            ValueType::Any => true,
            ValueType::Null => value.is_null(),
            ValueType::Bool => value.is_boolean(),
            ValueType::Number => value.is_number(),
            ValueType::String => value.is_string(),
            ValueType::List => value.is_array(),
            ValueType::Map => value.is_object(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ValueType::Any => "any",
            ValueType::Null => "null",
            ValueType::Bool => "bool",
            ValueType::Number => "number",
            ValueType::String => "string",
            ValueType::List => "list",
            ValueType::Map => "map",
        }
    }
}

/// A typed input or output port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    pub name: String,
    pub ty: ValueType,
    pub required: bool,
}

impl PortSpec {
    pub fn required(name: impl Into<String>, ty: ValueType) -> Self {
        Self { name: name.into(), ty, required: true }
    }

    pub fn optional(name: impl Into<String>, ty: ValueType) -> Self {
        Self { name: name.into(), ty, required: false }
    }
}

/// A typed static configuration key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigField {
    pub name: String,
    pub ty: ValueType,
    pub required: bool,
}

impl ConfigField {
    pub fn required(name: impl Into<String>, ty: ValueType) -> Self {
        Self { name: name.into(), ty, required: true }
    }

    pub fn optional(name: impl Into<String>, ty: ValueType) -> Self {
        Self { name: name.into(), ty, required: false }
    }
}

/// Declarative metadata for a node type.
///
/// A definition with no ports on one side accepts any port name on that side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub type_name: String,
    pub description: String,
    pub inputs: Vec<PortSpec>,
    pub outputs: Vec<PortSpec>,
    pub config: Vec<ConfigField>,
    /// Identical (config, inputs) always produce identical outputs
    pub cacheable: bool,
}

impl NodeDefinition {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            description: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            config: Vec::new(),
            cacheable: false,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn input(mut self, port: PortSpec) -> Self {
        self.inputs.push(port);
        self
    }

    pub fn output(mut self, port: PortSpec) -> Self {
        self.outputs.push(port);
        self
    }

    pub fn config_field(mut self, field: ConfigField) -> Self {
        self.config.push(field);
        self
    }

    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    pub fn input_port(&self, name: &str) -> Option<&PortSpec> {
        self.inputs.iter().find(|port| port.name == name)
    }

    pub fn output_port(&self, name: &str) -> Option<&PortSpec> {
        self.outputs.iter().find(|port| port.name == name)
    }

    /// Structural checks run at registration time
    pub(crate) fn check(&self) -> Result<(), String> {
        if self.type_name.trim().is_empty() {
            return Err("type name must not be empty".to_string());
        }
        check_unique("input port", self.inputs.iter().map(|port| port.name.as_str()))?;
        check_unique("output port", self.outputs.iter().map(|port| port.name.as_str()))?;
        check_unique("config field", self.config.iter().map(|field| field.name.as_str()))?;
        Ok(())
    }

    /// Problems with a node's static configuration, in field order
    pub fn check_config(&self, config: &ValueMap) -> Vec<String> {
        let mut problems = Vec::new();
        for field in &self.config {
            match config.get(&field.name) {
                None | Some(Value::Null) if field.required => {
                    problems.push(format!("missing required field '{}'", field.name));
                }
                Some(value) if !value.is_null() && !field.ty.accepts(value) => {
                    problems.push(format!(
                        "field '{}' must be of type {}",
                        field.name,
                        field.ty.name()
                    ));
                }
                _ => {}
            }
        }
        problems
    }

    /// Check assembled inputs against the declared input ports
    pub fn check_inputs(&self, inputs: &ValueMap) -> Result<(), String> {
        for port in &self.inputs {
            match inputs.get(&port.name) {
                Some(value) if !port.ty.accepts(value) => {
                    return Err(format!(
                        "input '{}' must be of type {}",
                        port.name,
                        port.ty.name()
                    ))
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn check_unique<'a>(kind: &str, names: impl Iterator<Item = &'a str>) -> Result<(), String> {
    let mut seen = HashSet::new();
    for name in names {
        if name.is_empty() {
            return Err(format!("{kind} name must not be empty"));
        }
        if !seen.insert(name) {
            return Err(format!("duplicate {kind} '{name}'"));
        }
    }
    Ok(())
}

/// Everything a node invocation may consult besides its inputs
#[derive(Clone)]
pub struct NodeContext {
    pub execution_id: ExecutionId,
    pub workflow_id: String,
    pub node_id: String,
    pub node_type: String,
    pub config: ValueMap,
    /// Zero-based attempt number
    pub attempt: u32,
    /// Cancelled when the execution is cancelled or times out
    pub cancel: CancellationToken,
    /// Deadline for this attempt
    pub deadline: Option<Instant>,
    pub sandbox: Arc<Sandbox>,
}

impl NodeContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn call_context(&self) -> CallContext {
        CallContext {
            cancel: self.cancel.clone(),
            deadline: self.deadline,
        }
    }

    /// Sleep that gives way to cancellation and the attempt deadline
    pub async fn sleep(&self, duration: Duration) -> Result<(), NodeError> {
        let wake = Instant::now() + duration;
        match self.deadline {
            Some(deadline) if deadline < wake => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => Err(NodeError::Timeout),
                    _ = self.cancel.cancelled() => Err(NodeError::Cancelled),
                }
            }
            _ => {
                tokio::select! {
                    _ = tokio::time::sleep_until(wake) => Ok(()),
                    _ = self.cancel.cancelled() => Err(NodeError::Cancelled),
                }
            }
        }
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("execution_id", &self.execution_id)
            .field("node_id", &self.node_id)
            .field("node_type", &self.node_type)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition() -> NodeDefinition {
        NodeDefinition::new("fetch")
            .input(PortSpec::required("url", ValueType::String))
            .output(PortSpec::optional("body", ValueType::Any))
            .config_field(ConfigField::required("method", ValueType::String))
            .config_field(ConfigField::optional("retries", ValueType::Number))
    }

    #[test]
    fn definition_structure_is_checked() {
        assert!(definition().check().is_ok());
        assert!(NodeDefinition::new(" ").check().is_err());

        let duplicated = definition().input(PortSpec::optional("url", ValueType::Any));
        assert_eq!(duplicated.check(), Err("duplicate input port 'url'".to_string()));
    }

    #[test]
    fn config_is_checked_against_fields() {
        let def = definition();
        let mut config = ValueMap::new();
        assert_eq!(def.check_config(&config), vec!["missing required field 'method'"]);

        config.insert("method".into(), json!("GET"));
        config.insert("retries".into(), json!("three"));
        assert_eq!(def.check_config(&config), vec!["field 'retries' must be of type number"]);

        config.insert("retries".into(), json!(3));
        assert!(def.check_config(&config).is_empty());
    }

    #[test]
    fn inputs_are_type_checked() {
        let def = definition();
        let mut inputs = ValueMap::new();
        assert!(def.check_inputs(&inputs).is_ok());
        inputs.insert("url".into(), json!(42));
        assert!(def.check_inputs(&inputs).is_err());
        inputs.insert("url".into(), json!("https://example.test"));
        assert!(def.check_inputs(&inputs).is_ok());
    }
}
