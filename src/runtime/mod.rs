/// Runtime Execution Layer
///
/// Everything that turns a validated workflow into a finished execution:
/// - Execution and node result state machines
/// - The per-execution dispatch loop over the petgraph DAG
/// - Per-node invocation (cache, breaker, retry, timeout, panic capture)
/// - The runner holding live executions, and the trigger scheduler feeding it
/// - Engine-wide counters

pub mod cache;
pub mod engine;
pub mod execution;
pub(crate) mod invoker;
pub mod metrics;
pub mod runner;
pub mod scheduler;

pub use cache::{CacheKey, OutputCache};
pub use engine::ExecutionEngine;
pub use execution::{Execution, ExecutionId, ExecutionObserver, ExecutionStatus, NodeResult, NodeStatus};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use runner::WorkflowRunner;
pub use scheduler::TriggerScheduler;
