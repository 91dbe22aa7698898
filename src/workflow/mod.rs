/// Workflow Definition Layer
///
/// Declarative workflow documents and the static checks that gate execution:
/// - Type definitions (Workflow, NodeSpec, Connection, TriggerSpec)
/// - Petgraph view of the connection list
/// - Validation run before any execution is queued
/// - JSON file loading

pub mod graph;
pub mod storage;
pub mod types;
pub mod validation;

pub use graph::WorkflowGraph;
pub use storage::{load_workflow, parse_workflow};
pub use types::{Condition, Connection, NodeSpec, TriggerSpec, ValueMap, Workflow};
pub use validation::validate;
