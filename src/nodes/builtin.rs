//! Built-in node types
//!
//! A small closed set covering data shaping, timing and sandboxed code. Anything
//! else is registered by the embedding application through the same registry.

use crate::error::NodeError;
use crate::nodes::{
    constructor, ConfigField, Node, NodeContext, NodeDefinition, NodeRegistry, PortSpec, ValueType,
};
use crate::sandbox::{policy, Language};
use crate::workflow::types::ValueMap;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Install every built-in type; existing entries with the same key are replaced
pub fn register_builtins(registry: &NodeRegistry) {
    let builtins = [
        (constructor(|| PassthroughNode), PassthroughNode::definition()),
        (constructor(|| SetNode), SetNode::definition()),
        (constructor(|| MergeNode), MergeNode::definition()),
        (constructor(|| DelayNode), DelayNode::definition()),
        (constructor(|| CodeNode), CodeNode::definition()),
    ];
    for (ctor, definition) in builtins {
        let node_type = definition.type_name.clone();
        if let Err(e) = registry.register_or_replace(&node_type, ctor, definition) {
            tracing::error!(node_type = %node_type, error = %e, "❌ Failed to register built-in node");
        }
    }
}

/// Outputs are the inputs, unchanged
pub struct PassthroughNode;

impl PassthroughNode {
    pub const TYPE: &'static str = "passthrough";

    pub fn definition() -> NodeDefinition {
        NodeDefinition::new(Self::TYPE)
            .describe("Forwards its inputs as outputs")
            .cacheable(true)
    }
}

#[async_trait]
impl Node for PassthroughNode {
    async fn execute(&self, _ctx: &NodeContext, inputs: ValueMap) -> Result<ValueMap, NodeError> {
        Ok(inputs)
    }
}

/// Inputs overlaid with the static `values` map
pub struct SetNode;

impl SetNode {
    pub const TYPE: &'static str = "set";

    pub fn definition() -> NodeDefinition {
        NodeDefinition::new(Self::TYPE)
            .describe("Emits its inputs overlaid with config.values")
            .config_field(ConfigField::required("values", ValueType::Map))
            .cacheable(true)
    }
}

#[async_trait]
impl Node for SetNode {
    async fn execute(&self, ctx: &NodeContext, mut inputs: ValueMap) -> Result<ValueMap, NodeError> {
        let values = ctx
            .config
            .get("values")
            .and_then(Value::as_object)
            .ok_or_else(|| NodeError::non_retryable("config.values must be a map"))?;
        for (key, value) in values {
            inputs.insert(key.clone(), value.clone());
        }
        Ok(inputs)
    }
}

/// Collects every present input into a single `merged` map
pub struct MergeNode;

impl MergeNode {
    pub const TYPE: &'static str = "merge";

    pub fn definition() -> NodeDefinition {
        NodeDefinition::new(Self::TYPE)
            .describe("Combines all inputs into output 'merged'")
            .output(PortSpec::required("merged", ValueType::Map))
            .cacheable(true)
    }
}

#[async_trait]
impl Node for MergeNode {
    async fn execute(&self, _ctx: &NodeContext, inputs: ValueMap) -> Result<ValueMap, NodeError> {
        let merged: serde_json::Map<String, Value> = inputs.into_iter().collect();
        Ok(ValueMap::from([("merged".to_string(), Value::Object(merged))]))
    }
}

/// Waits `config.ms` milliseconds, then forwards its inputs
pub struct DelayNode;

impl DelayNode {
    pub const TYPE: &'static str = "delay";

    pub fn definition() -> NodeDefinition {
        NodeDefinition::new(Self::TYPE)
            .describe("Sleeps for config.ms, honouring cancellation and deadlines")
            .config_field(ConfigField::required("ms", ValueType::Number))
    }

    fn duration(config: &ValueMap) -> Result<Duration, NodeError> {
        config
            .get("ms")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
            .ok_or_else(|| NodeError::non_retryable("config.ms must be a non-negative integer"))
    }
}

#[async_trait]
impl Node for DelayNode {
    fn validate(&self, config: &ValueMap) -> Result<(), NodeError> {
        Self::duration(config).map(|_| ())
    }

    async fn execute(&self, ctx: &NodeContext, inputs: ValueMap) -> Result<ValueMap, NodeError> {
        ctx.sleep(Self::duration(&ctx.config)?).await?;
        Ok(inputs)
    }
}

/// Runs user code through the sandboxed executor.
///
/// The script sees the node inputs as `inputs` and its result is emitted on
/// output `result`. A script that fails on its own terms is a deterministic
/// failure and is not retried.
pub struct CodeNode;

impl CodeNode {
    pub const TYPE: &'static str = "code";

    pub fn definition() -> NodeDefinition {
        NodeDefinition::new(Self::TYPE)
            .describe("Executes config.code in config.language inside the sandbox")
            .config_field(ConfigField::required("language", ValueType::String))
            .config_field(ConfigField::required("code", ValueType::String))
            .output(PortSpec::required("result", ValueType::Any))
    }
}

#[async_trait]
impl Node for CodeNode {
    fn validate(&self, config: &ValueMap) -> Result<(), NodeError> {
        let language: Language = config
            .get("language")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .parse()
            .map_err(|e: crate::error::SandboxError| NodeError::non_retryable(e.to_string()))?;
        let code = config.get("code").and_then(Value::as_str).unwrap_or_default();
        if let Some(pattern) = policy::find_forbidden(code, language) {
            return Err(NodeError::non_retryable(format!(
                "code contains forbidden pattern '{pattern}'"
            )));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &NodeContext, inputs: ValueMap) -> Result<ValueMap, NodeError> {
        let language: Language = ctx
            .config_str("language")
            .unwrap_or_default()
            .parse()
            .map_err(NodeError::from)?;
        let code = ctx
            .config_str("code")
            .ok_or_else(|| NodeError::non_retryable("config.code must be a string"))?;

        let result = ctx
            .sandbox
            .execute(&ctx.call_context(), code, language, &inputs)
            .await?;

        if !result.success {
            return Err(NodeError::NonRetryable(
                result.error.unwrap_or_else(|| "script failed".to_string()),
            ));
        }
        Ok(ValueMap::from([("result".to_string(), result.data)]))
    }
}
