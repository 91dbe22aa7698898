/// Citadel: workflow execution core
///
/// This library runs declarative workflow graphs: validated DAG scheduling with
/// bounded concurrency, retry and circuit breaker middleware around every node,
/// and sandboxed execution of user code.

// Engine limits and middleware defaults
pub mod config;

// Typed errors for validation, registry, node and sandbox failures
pub mod error;

// Workflow definitions, graph view, validation and file loading
pub mod workflow;

// Node contract, built-in node types and the hot-swappable type registry
pub mod nodes;

// Retry with backoff and named circuit breakers
pub mod resilience;

// Restricted Lua and subprocess code execution
pub mod sandbox;

// Dispatch loop, execution state, runner and trigger scheduler
pub mod runtime;

// Re-export commonly used types for external consumers
pub use config::EngineConfig;
pub use error::{EngineError, NodeError, ValidationError};
pub use nodes::{Node, NodeContext, NodeDefinition, NodeRegistry};
pub use runtime::{Execution, ExecutionEngine, ExecutionStatus, NodeStatus, TriggerScheduler, WorkflowRunner};
pub use workflow::Workflow;
