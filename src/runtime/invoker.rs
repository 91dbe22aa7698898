//! Per-node invocation pipeline
//!
//! input check -> output cache -> retry { breaker -> deadline -> execute }
//!
//! Progress is reported to the dispatch loop as [`NodeEvent`]s; the final
//! [`NodeOutcome`] is returned to the task that spawned the invocation.

use crate::error::NodeError;
use crate::nodes::{Node, NodeContext, NodeRegistry};
use crate::resilience::{retry, BreakerRegistry, CircuitBreaker, RetryPolicy};
use crate::runtime::cache::{CacheKey, OutputCache};
use crate::runtime::execution::{ExecutionId, NodeStatus};
use crate::sandbox::Sandbox;
use crate::workflow::types::{NodeSpec, ValueMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Progress of a node task, consumed by the dispatch loop
#[derive(Debug)]
pub(crate) enum NodeEvent {
    /// Attempt `attempt` (zero-based) is about to run
    Attempt { position: usize, attempt: u32 },
    /// Attempt failed with a retryable error; retry `retry` follows after `delay`
    Retrying {
        position: usize,
        retry: u32,
        error: String,
        delay: Duration,
    },
    /// Terminal outcome, with the outgoing expression conditions already
    /// evaluated against the outputs when the node completed
    Finished {
        position: usize,
        outcome: NodeOutcome,
        conditions: Vec<(usize, Result<bool, String>)>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct NodeOutcome {
    pub status: NodeStatus,
    pub outputs: ValueMap,
    pub error: Option<String>,
    pub retry_count: u32,
    pub cached: bool,
    /// Whether the node got past admission; false for nodes cancelled while queued
    pub started: bool,
    pub elapsed: Duration,
}

impl NodeOutcome {
    pub(crate) fn not_started(status: NodeStatus, error: impl Into<String>) -> Self {
        Self {
            status,
            outputs: ValueMap::new(),
            error: Some(error.into()),
            retry_count: 0,
            cached: false,
            started: false,
            elapsed: Duration::ZERO,
        }
    }

    fn failed(error: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            status: NodeStatus::Failed,
            started: true,
            elapsed,
            ..Self::not_started(NodeStatus::Failed, error)
        }
    }
}

/// One node invocation handed to a task
#[derive(Debug, Clone)]
pub(crate) struct Invocation {
    pub position: usize,
    pub execution_id: ExecutionId,
    pub workflow_id: String,
    pub spec: NodeSpec,
    pub inputs: ValueMap,
    /// Execution-wide token
    pub cancel: CancellationToken,
    /// Workflow deadline
    pub deadline: Instant,
}

/// Shared services every node task needs. Cloning is cheap.
#[derive(Clone)]
pub(crate) struct NodeInvoker {
    pub registry: Arc<NodeRegistry>,
    pub sandbox: Arc<Sandbox>,
    pub breakers: Arc<BreakerRegistry>,
    pub cache: Arc<OutputCache>,
    pub default_retry: RetryPolicy,
}

impl NodeInvoker {
    pub(crate) async fn invoke(&self, job: &Invocation, events: &UnboundedSender<NodeEvent>) -> NodeOutcome {
        let started = Instant::now();

        let entry = match self.registry.resolve(&job.spec.node_type) {
            Ok(entry) => entry,
            Err(e) => return NodeOutcome::failed(e.to_string(), started.elapsed()),
        };
        if let Err(message) = entry.definition.check_inputs(&job.inputs) {
            return NodeOutcome::failed(message, started.elapsed());
        }

        let cache_key = (entry.definition.cacheable && job.spec.cache)
            .then(|| CacheKey::new(&job.spec.node_type, &job.spec.config, &job.inputs));
        if let Some(outputs) = cache_key.as_ref().and_then(|key| self.cache.get(key)) {
            debug!(node_id = %job.spec.id, "💾 Output served from cache");
            return NodeOutcome {
                status: NodeStatus::Completed,
                outputs,
                error: None,
                retry_count: 0,
                cached: true,
                started: true,
                elapsed: started.elapsed(),
            };
        }

        let policy = job.spec.retry.clone().unwrap_or_else(|| self.default_retry.clone());
        let breaker = job.spec.breaker.as_deref().map(|name| self.breakers.get(name));
        let node = (entry.constructor)();

        let outcome = retry(
            &policy,
            &job.cancel,
            NodeError::is_retryable,
            |retry, error, delay| {
                warn!(
                    node_id = %job.spec.id,
                    retry,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "🔁 Retrying node"
                );
                let _ = events.send(NodeEvent::Retrying {
                    position: job.position,
                    retry,
                    error: error.to_string(),
                    delay,
                });
            },
            |attempt| self.attempt(node.as_ref(), breaker.as_deref(), job, attempt, events),
        )
        .await;

        let elapsed = started.elapsed();
        let (status, outputs, error) = match outcome.result {
            Ok(outputs) => (NodeStatus::Completed, outputs, None),
            Err(_) if outcome.cancelled => (NodeStatus::Cancelled, ValueMap::new(), Some(NodeError::Cancelled.to_string())),
            Err(e @ NodeError::Timeout) => (NodeStatus::Timeout, ValueMap::new(), Some(e.to_string())),
            Err(e @ NodeError::Cancelled) => (NodeStatus::Cancelled, ValueMap::new(), Some(e.to_string())),
            Err(e) => (NodeStatus::Failed, ValueMap::new(), Some(e.to_string())),
        };

        if let (NodeStatus::Completed, Some(key)) = (status, cache_key) {
            self.cache.insert(key, outputs.clone());
        }

        NodeOutcome {
            status,
            outputs,
            error,
            retry_count: outcome.retries,
            cached: false,
            started: true,
            elapsed,
        }
    }

    async fn attempt(
        &self,
        node: &dyn Node,
        breaker: Option<&CircuitBreaker>,
        job: &Invocation,
        attempt: u32,
        events: &UnboundedSender<NodeEvent>,
    ) -> Result<ValueMap, NodeError> {
        let _ = events.send(NodeEvent::Attempt {
            position: job.position,
            attempt,
        });

        let permit = match breaker {
            Some(breaker) => Some(
                breaker
                    .acquire()
                    .map_err(|rejection| NodeError::BreakerOpen(rejection.breaker().to_string()))?,
            ),
            None => None,
        };

        let deadline = match job.spec.timeout() {
            Some(timeout) => job.deadline.min(Instant::now() + timeout),
            None => job.deadline,
        };
        let ctx = NodeContext {
            execution_id: job.execution_id,
            workflow_id: job.workflow_id.clone(),
            node_id: job.spec.id.clone(),
            node_type: job.spec.node_type.clone(),
            config: job.spec.config.clone(),
            attempt,
            cancel: job.cancel.child_token(),
            deadline: Some(deadline),
            sandbox: Arc::clone(&self.sandbox),
        };

        let result = tokio::select! {
            result = node.execute(&ctx, job.inputs.clone()) => result,
            _ = tokio::time::sleep_until(deadline) => Err(NodeError::Timeout),
            _ = job.cancel.cancelled() => Err(NodeError::Cancelled),
        };
        // Stops anything the node left running on its child token
        ctx.cancel.cancel();

        if let Some(permit) = permit {
            match &result {
                Ok(_) => permit.success(),
                Err(NodeError::Cancelled) => drop(permit),
                Err(_) => permit.failure(),
            }
        }
        result
    }
}
