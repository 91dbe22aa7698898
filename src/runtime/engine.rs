//! Graph executor
//!
//! A single dispatch loop per execution owns the [`Execution`] record. It walks
//! the petgraph view of the workflow, dispatches every ready node onto its own
//! task and folds the tasks' [`NodeEvent`]s back into the record, publishing a
//! snapshot after each change. Node tasks never touch the record themselves.
//!
//! Readiness, per incoming connection of a `Pending` node:
//! - source `Completed`: the connection fires if its condition holds, otherwise
//!   it is satisfied without delivering a value
//! - source still running or pending: the node waits
//! - source ended otherwise: an optional connection is satisfied without a
//!   value, a required one makes the node `Skipped`

use crate::config::EngineConfig;
use crate::error::ValidationError;
use crate::nodes::NodeRegistry;
use crate::resilience::BreakerRegistry;
use crate::runtime::cache::OutputCache;
use crate::runtime::execution::{Execution, ExecutionObserver, ExecutionStatus, NodeResult, NodeStatus};
use crate::runtime::invoker::{Invocation, NodeEvent, NodeInvoker, NodeOutcome};
use crate::runtime::metrics::{EngineMetrics, MetricsSnapshot};
use crate::sandbox::{lua, Sandbox};
use crate::workflow::graph::WorkflowGraph;
use crate::workflow::types::{Condition, ValueMap, Workflow};
use crate::workflow::validation;
use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Runs workflows against a node registry with shared resilience state.
///
/// Breakers and the output cache live as long as the engine, so every
/// execution it runs sees the same per-dependency breaker.
pub struct ExecutionEngine {
    invoker: NodeInvoker,
    config: EngineConfig,
    metrics: Arc<EngineMetrics>,
    observer: Option<Arc<dyn ExecutionObserver>>,
}

impl ExecutionEngine {
    pub fn new(registry: Arc<NodeRegistry>, config: EngineConfig) -> Self {
        let metrics = Arc::new(EngineMetrics::new());
        let breakers = BreakerRegistry::new(config.breaker.clone()).with_callback(metrics.breaker_callback());
        let invoker = NodeInvoker {
            registry,
            sandbox: Arc::new(Sandbox::new(config.sandbox.clone())),
            breakers: Arc::new(breakers),
            cache: Arc::new(OutputCache::new()),
            default_retry: config.retry.clone(),
        };
        Self {
            invoker,
            config,
            metrics,
            observer: None,
        }
    }

    /// Share breakers with another engine or install a state-change callback.
    /// Breaker trips on a replaced registry only reach [`Self::metrics`] when it
    /// was built with [`EngineMetrics::breaker_callback`] from [`Self::engine_metrics`].
    pub fn with_breakers(mut self, breakers: Arc<BreakerRegistry>) -> Self {
        self.invoker.breakers = breakers;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.invoker.registry
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.invoker.breakers
    }

    pub fn cache(&self) -> &OutputCache {
        &self.invoker.cache
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn engine_metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn validate(&self, workflow: &Workflow) -> Result<(), ValidationError> {
        validation::validate(workflow, &self.invoker.registry)
    }

    /// Validate and run a workflow to completion on the current task
    pub async fn execute(&self, workflow: &Workflow, params: ValueMap) -> Result<Execution, ValidationError> {
        self.validate(workflow)?;
        let mut execution = Execution::new(workflow, params);
        execution.status = ExecutionStatus::Queued;
        let (snapshots, _) = watch::channel(execution.clone());
        Ok(self
            .drive(workflow, execution, CancellationToken::new(), &snapshots)
            .await)
    }

    /// Publish a snapshot to the watch channel and the observer
    pub(crate) fn publish(&self, snapshots: &watch::Sender<Execution>, execution: &Execution) {
        snapshots.send_replace(execution.clone());
        if let Some(observer) = &self.observer {
            observer.on_snapshot(execution);
        }
    }

    /// Drive an already validated execution to a terminal status
    #[instrument(name = "execution", skip_all, fields(execution_id = %execution.id, workflow_id = %workflow.id))]
    pub(crate) async fn drive(
        &self,
        workflow: &Workflow,
        mut execution: Execution,
        cancel: CancellationToken,
        snapshots: &watch::Sender<Execution>,
    ) -> Execution {
        let budget = workflow.timeout().unwrap_or(self.config.workflow_timeout);
        let started = Instant::now();
        let deadline = started + budget;

        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(Utc::now());
        info!(nodes = workflow.nodes.len(), budget_ms = budget.as_millis() as u64, "🚀 Starting workflow execution");

        let mut dispatch = Dispatch::new(workflow, execution, &self.metrics);
        self.publish(snapshots, &dispatch.execution);

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_nodes.max(1)));
        let mut tasks = JoinSet::new();

        let ready = dispatch.advance();
        self.spawn_ready(&dispatch, ready, &cancel, deadline, &permits, &events_tx, &mut tasks);
        self.publish(snapshots, &dispatch.execution);

        let interrupted = loop {
            if dispatch.active == 0 {
                break None;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Some(ExecutionStatus::Cancelled),
                _ = tokio::time::sleep_until(deadline) => break Some(ExecutionStatus::Timeout),
                event = events.recv() => {
                    let Some(event) = event else { break None };
                    let finished = dispatch.apply(event, None);
                    // Nothing new starts once the deadline has passed
                    if Instant::now() >= deadline {
                        break Some(ExecutionStatus::Timeout);
                    }
                    if finished {
                        let ready = dispatch.advance();
                        self.spawn_ready(&dispatch, ready, &cancel, deadline, &permits, &events_tx, &mut tasks);
                    }
                    self.publish(snapshots, &dispatch.execution);
                }
            }
        };

        if let Some(reason) = interrupted {
            if reason == ExecutionStatus::Cancelled {
                dispatch.execution.cancelled_at = Some(Utc::now());
                warn!(active = dispatch.active, "🛑 Execution cancelled");
            } else {
                warn!(active = dispatch.active, "⏰ Workflow deadline exceeded");
            }
            cancel.cancel();
            drop(events_tx);

            let grace = self.config.cancel_grace;
            let drained = tokio::time::timeout(grace, async {
                while dispatch.active > 0 {
                    match events.recv().await {
                        Some(event) => {
                            dispatch.apply(event, Some(reason));
                        }
                        None => break,
                    }
                }
            })
            .await;
            if drained.is_err() {
                warn!(grace_ms = grace.as_millis() as u64, "⚠️ Nodes ignored cancellation past the grace period");
            }
            tasks.abort_all();
            dispatch.settle_interrupted(reason);
        }
        while tasks.join_next().await.is_some() {}

        let execution = dispatch.finish(interrupted);
        self.metrics.record_workflow(execution.status, started.elapsed());
        info!(status = %execution.status, retries = execution.retry_count, "🎉 Workflow execution finished");
        self.publish(snapshots, &execution);
        execution
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_ready(
        &self,
        dispatch: &Dispatch<'_>,
        ready: Vec<(usize, ValueMap)>,
        cancel: &CancellationToken,
        deadline: Instant,
        permits: &Arc<Semaphore>,
        events: &mpsc::UnboundedSender<NodeEvent>,
        tasks: &mut JoinSet<()>,
    ) {
        for (position, inputs) in ready {
            let spec = &dispatch.workflow.nodes[position];
            debug!(node_id = %spec.id, node_type = %spec.node_type, "📍 Dispatching node");

            let job = Invocation {
                position,
                execution_id: dispatch.execution.id,
                workflow_id: dispatch.workflow.id.clone(),
                spec: spec.clone(),
                inputs,
                cancel: cancel.clone(),
                deadline,
            };
            let expressions = outgoing_expressions(dispatch.workflow, position);
            let invoker = self.invoker.clone();
            let permits = Arc::clone(permits);
            let events = events.clone();

            tasks.spawn(async move {
                let outcome = tokio::select! {
                    // Cancellation wins over a permit freed by a node that was just cancelled
                    biased;
                    _ = job.cancel.cancelled() => {
                        NodeOutcome::not_started(NodeStatus::Cancelled, "cancelled before start")
                    }
                    permit = permits.acquire_owned() => match permit {
                        Ok(_permit) if job.cancel.is_cancelled() => {
                            NodeOutcome::not_started(NodeStatus::Cancelled, "cancelled before start")
                        }
                        Ok(_permit) => AssertUnwindSafe(invoker.invoke(&job, &events))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|panic| {
                                let message = panic_message(panic.as_ref());
                                tracing::error!(node_id = %job.spec.id, %message, "❌ Node panicked");
                                NodeOutcome {
                                    started: true,
                                    ..NodeOutcome::not_started(NodeStatus::Failed, format!("node panicked: {message}"))
                                }
                            }),
                        Err(_) => NodeOutcome::not_started(NodeStatus::Cancelled, "execution closed"),
                    },
                };
                let conditions = if outcome.status == NodeStatus::Completed && !expressions.is_empty() {
                    evaluate_conditions(expressions, &outcome.outputs).await
                } else {
                    Vec::new()
                };
                let _ = events.send(NodeEvent::Finished {
                    position,
                    outcome,
                    conditions,
                });
            });
        }
    }
}

/// Expression conditions on connections leaving `position`
fn outgoing_expressions(workflow: &Workflow, position: usize) -> Vec<(usize, String)> {
    let source = &workflow.nodes[position].id;
    workflow
        .connections
        .iter()
        .enumerate()
        .filter(|(_, connection)| &connection.source == source)
        .filter_map(|(index, connection)| match &connection.condition {
            Some(Condition::Expr(expr)) => Some((index, expr.clone())),
            _ => None,
        })
        .collect()
}

/// Run the Lua conditions on the blocking pool, off the dispatch loop
async fn evaluate_conditions(
    expressions: Vec<(usize, String)>,
    outputs: &ValueMap,
) -> Vec<(usize, Result<bool, String>)> {
    let outputs = outputs.clone();
    let indexes: Vec<usize> = expressions.iter().map(|(index, _)| *index).collect();
    tokio::task::spawn_blocking(move || {
        expressions
            .into_iter()
            .map(|(index, expr)| (index, lua::eval_condition(&expr, &outputs)))
            .collect::<Vec<_>>()
    })
    .await
    .unwrap_or_else(|e| {
        indexes
            .into_iter()
            .map(|index| (index, Err(format!("condition evaluation aborted: {e}"))))
            .collect()
    })
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("config", &self.config)
            .field("node_types", &self.invoker.registry.len())
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Verdict on one pending node
enum Readiness {
    Wait,
    Ready(ValueMap),
    Skip(String),
    Fail(String),
}

/// Bookkeeping owned by the dispatch loop
struct Dispatch<'w> {
    workflow: &'w Workflow,
    metrics: &'w EngineMetrics,
    graph: WorkflowGraph,
    central: Vec<bool>,
    execution: Execution,
    /// Memoised condition results per connection
    conditions: Vec<Option<Result<bool, String>>>,
    /// Nodes dispatched and not finished
    active: usize,
}

impl<'w> Dispatch<'w> {
    fn new(workflow: &'w Workflow, execution: Execution, metrics: &'w EngineMetrics) -> Self {
        let graph = WorkflowGraph::build(workflow);
        let central = graph.central(workflow);
        Self {
            workflow,
            metrics,
            central,
            execution,
            conditions: vec![None; workflow.connections.len()],
            active: 0,
            graph,
        }
    }

    fn result(&self, position: usize) -> Option<&NodeResult> {
        self.execution.node_results.get(self.graph.node_id(position))
    }

    fn result_mut(&mut self, position: usize) -> Option<&mut NodeResult> {
        self.execution.node_results.get_mut(self.graph.node_id(position))
    }

    fn status(&self, position: usize) -> NodeStatus {
        self.result(position).map_or(NodeStatus::Pending, |result| result.status)
    }

    /// Settle or dispatch pending nodes until nothing changes; returns the
    /// nodes to spawn, in declaration order
    fn advance(&mut self) -> Vec<(usize, ValueMap)> {
        let mut ready = Vec::new();
        loop {
            let mut changed = false;
            for position in 0..self.graph.len() {
                if self.status(position) != NodeStatus::Pending {
                    continue;
                }
                match self.readiness(position) {
                    Readiness::Wait => continue,
                    Readiness::Ready(inputs) => {
                        if let Some(result) = self.result_mut(position) {
                            result.status = NodeStatus::Scheduled;
                            result.inputs_used = inputs.clone();
                        }
                        self.active += 1;
                        ready.push((position, inputs));
                    }
                    Readiness::Skip(reason) => {
                        info!(node_id = %self.graph.node_id(position), %reason, "⏭️ Skipping node");
                        if let Some(result) = self.result_mut(position) {
                            result.settle(NodeStatus::Skipped, Some(reason));
                        }
                    }
                    Readiness::Fail(reason) => {
                        warn!(node_id = %self.graph.node_id(position), %reason, "❌ Node failed before dispatch");
                        if let Some(result) = self.result_mut(position) {
                            result.settle(NodeStatus::Failed, Some(reason));
                        }
                    }
                }
                changed = true;
            }
            if !changed {
                return ready;
            }
        }
    }

    fn readiness(&mut self, position: usize) -> Readiness {
        let workflow = self.workflow;
        let incoming = self.graph.incoming(position).to_vec();
        if incoming.is_empty() {
            return Readiness::Ready(self.execution.trigger_params.clone());
        }

        let mut delivered: Vec<(String, Value)> = Vec::new();
        for index in incoming {
            let connection = &workflow.connections[index];
            let Some((source, _)) = self.graph.endpoints(index) else {
                continue;
            };

            match self.status(source) {
                NodeStatus::Completed => match self.condition(index, source) {
                    Ok(true) => {
                        let outputs = self.result(source).map(|result| &result.outputs);
                        let value = match (&connection.source_port, outputs) {
                            (Some(port), Some(outputs)) => outputs.get(port).cloned(),
                            (None, Some(outputs)) => {
                                Some(Value::Object(outputs.clone().into_iter().collect()))
                            }
                            (_, None) => None,
                        };
                        if let Some(value) = value {
                            delivered.push((connection.input_key().to_string(), value));
                        }
                    }
                    Ok(false) => {}
                    Err(message) => {
                        return Readiness::Fail(format!(
                            "condition on connection from '{}' failed: {message}",
                            connection.source
                        ))
                    }
                },
                status if !status.is_terminal() => return Readiness::Wait,
                _ if connection.optional => {}
                status => {
                    return Readiness::Skip(format!("upstream node '{}' ended {status}", connection.source))
                }
            }
        }

        Readiness::Ready(collect_inputs(delivered))
    }

    fn condition(&mut self, index: usize, source: usize) -> Result<bool, String> {
        if let Some(cached) = &self.conditions[index] {
            return cached.clone();
        }
        let workflow = self.workflow;
        let evaluated = match &workflow.connections[index].condition {
            None => Ok(true),
            Some(Condition::Bool(value)) => Ok(*value),
            // Normally memoised from the node task; evaluated inline only
            // when the event carried no verdict
            Some(Condition::Expr(expr)) => {
                let empty = ValueMap::new();
                let outputs = self.result(source).map_or(&empty, |result| &result.outputs);
                lua::eval_condition(expr, outputs)
            }
        };
        self.conditions[index] = Some(evaluated.clone());
        evaluated
    }

    /// Fold one event into the record; true when a node finished.
    /// `interrupted` turns nodes cancelled by a workflow timeout into `Timeout`.
    fn apply(&mut self, event: NodeEvent, interrupted: Option<ExecutionStatus>) -> bool {
        match event {
            NodeEvent::Attempt { position, attempt } => {
                if let Some(result) = self.result_mut(position) {
                    result.status = NodeStatus::Running;
                    result.started_at.get_or_insert_with(Utc::now);
                    if attempt == 0 {
                        debug!(node_id = %result.node_id, "node running");
                    }
                }
                false
            }
            NodeEvent::Retrying {
                position,
                retry,
                error,
                ..
            } => {
                self.metrics.record_retry();
                if let Some(result) = self.result_mut(position) {
                    result.status = NodeStatus::Retrying;
                    result.retry_count = retry;
                    result.error = Some(error);
                }
                false
            }
            NodeEvent::Finished {
                position,
                outcome,
                conditions,
            } => {
                self.active = self.active.saturating_sub(1);
                for (index, verdict) in conditions {
                    if let Some(slot) = self.conditions.get_mut(index) {
                        *slot = Some(verdict);
                    }
                }
                if outcome.started {
                    self.metrics.record_node(outcome.status, outcome.retry_count, outcome.elapsed);
                }
                let Some(result) = self.result_mut(position) else {
                    return true;
                };
                let status = match (outcome.status, interrupted) {
                    (NodeStatus::Cancelled, Some(ExecutionStatus::Timeout)) if outcome.started => {
                        NodeStatus::Timeout
                    }
                    (status, _) => status,
                };
                let now = Utc::now();
                if outcome.started {
                    result.started_at.get_or_insert(now);
                }
                result.status = status;
                result.outputs = outcome.outputs;
                result.error = outcome.error;
                result.retry_count = outcome.retry_count;
                result.outputs_cached = outcome.cached;
                result.execution_time_ms = outcome.elapsed.as_millis() as u64;
                result.ended_at = Some(now);

                match status {
                    NodeStatus::Completed => {
                        info!(node_id = %result.node_id, retries = result.retry_count, cached = result.outputs_cached, "✅ Node completed")
                    }
                    _ => warn!(node_id = %result.node_id, %status, error = ?result.error, "❌ Node did not complete"),
                }
                true
            }
        }
    }

    /// After an interruption: settle everything that is not terminal yet
    fn settle_interrupted(&mut self, reason: ExecutionStatus) {
        let (running_status, message) = match reason {
            ExecutionStatus::Timeout => (NodeStatus::Timeout, "workflow deadline exceeded"),
            _ => (NodeStatus::Cancelled, "execution cancelled"),
        };
        for result in self.execution.node_results.values_mut() {
            if result.status == NodeStatus::Pending {
                result.settle(NodeStatus::Cancelled, Some(message.to_string()));
            } else if result.status.is_active() {
                // Scheduled nodes never started; the rest were cut off mid-run
                let status = if result.started_at.is_some() {
                    running_status
                } else {
                    NodeStatus::Cancelled
                };
                result.settle(status, Some(message.to_string()));
            }
        }
        self.active = 0;
    }

    fn finish(mut self, interrupted: Option<ExecutionStatus>) -> Execution {
        // Only reachable if a graph that skipped validation has a cycle
        for result in self.execution.node_results.values_mut() {
            if !result.status.is_terminal() {
                result.settle(NodeStatus::Skipped, Some("never became ready".to_string()));
            }
        }

        let central_statuses: Vec<NodeStatus> = (0..self.graph.len())
            .filter(|&position| self.central[position])
            .map(|position| self.status(position))
            .collect();

        let status = match interrupted {
            Some(reason) => reason,
            None if central_statuses
                .iter()
                .any(|s| matches!(s, NodeStatus::Failed | NodeStatus::Cancelled)) =>
            {
                ExecutionStatus::Failed
            }
            None if central_statuses.contains(&NodeStatus::Timeout) => ExecutionStatus::Timeout,
            None => ExecutionStatus::Succeeded,
        };

        let first_failure = self
            .execution
            .node_results
            .values()
            .filter(|result| matches!(result.status, NodeStatus::Failed | NodeStatus::Timeout))
            .min_by_key(|result| (result.ended_at, result.node_id.clone()))
            .map(|result| (result.node_id.clone(), result.error.clone()));

        let execution = &mut self.execution;
        match first_failure {
            Some((node_id, error)) => {
                execution.error = error;
                execution.failed_node = Some(node_id);
            }
            None => {
                execution.error = match interrupted {
                    Some(ExecutionStatus::Cancelled) => Some("execution cancelled".to_string()),
                    Some(_) => Some("workflow deadline exceeded".to_string()),
                    None => None,
                };
            }
        }
        execution.retry_count = execution.node_results.values().map(|r| r.retry_count).sum();
        execution.status = status;
        execution.ended_at = Some(Utc::now());
        self.execution
    }
}

/// Deliver each key once; several values for one key become a list
fn collect_inputs(delivered: Vec<(String, Value)>) -> ValueMap {
    let mut grouped: Vec<(String, Vec<Value>)> = Vec::new();
    for (key, value) in delivered {
        match grouped.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, values)) => values.push(value),
            None => grouped.push((key, vec![value])),
        }
    }
    grouped
        .into_iter()
        .map(|(key, mut values)| {
            let value = if values.len() == 1 {
                values.remove(0)
            } else {
                Value::Array(values)
            };
            (key, value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::{Connection, NodeSpec};
    use serde_json::json;

    fn engine() -> ExecutionEngine {
        ExecutionEngine::new(Arc::new(NodeRegistry::with_builtins()), EngineConfig::default())
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

    fn set(id: &str, values: Value) -> NodeSpec {
        NodeSpec::new(id, "set").with_config("values", values)
    }

    #[test]
    fn repeated_ports_collect_into_a_list() {
        let inputs = collect_inputs(vec![
            ("items".into(), json!(1)),
            ("other".into(), json!("x")),
            ("items".into(), json!(2)),
        ]);
        assert_eq!(inputs["items"], json!([1, 2]));
        assert_eq!(inputs["other"], json!("x"));
    }

    #[tokio::test]
    async fn data_flows_along_ports() {
        let wf = workflow(
            vec![set("a", json!({"n": 2})), NodeSpec::new("b", "passthrough")],
            vec![Connection::new("a", "b").ports("n", "value")],
        );
        let execution = engine().execute(&wf, ValueMap::new()).await.unwrap();

        assert_eq!(execution.status, ExecutionStatus::Succeeded);
        let b = execution.node("b").unwrap();
        assert_eq!(b.inputs_used["value"], json!(2));
        assert_eq!(b.outputs["value"], json!(2));
    }

    #[tokio::test]
    async fn roots_receive_trigger_params() {
        let wf = workflow(vec![NodeSpec::new("a", "passthrough")], Vec::new());
        let params = ValueMap::from([("user".to_string(), json!("ada"))]);
        let execution = engine().execute(&wf, params.clone()).await.unwrap();
        assert_eq!(execution.node("a").unwrap().outputs, params);
    }

    #[tokio::test]
    async fn false_conditions_leave_the_input_absent() {
        let wf = workflow(
            vec![
                set("a", json!({"status": "ok"})),
                set("b", json!({"flag": true})),
                NodeSpec::new("c", "passthrough"),
            ],
            vec![
                Connection::new("a", "c")
                    .ports("status", "status")
                    .when(Condition::Expr("output.status == 'ok'".into())),
                Connection::new("b", "c")
                    .ports("flag", "flag")
                    .when(Condition::Expr("output.flag == false".into())),
            ],
        );
        let execution = engine().execute(&wf, ValueMap::new()).await.unwrap();

        let c = execution.node("c").unwrap();
        assert_eq!(c.status, NodeStatus::Completed);
        assert_eq!(c.inputs_used, ValueMap::from([("status".to_string(), json!("ok"))]));
    }

    #[tokio::test]
    async fn failures_skip_dependents_and_fail_the_execution() {
        let wf = workflow(
            vec![
                NodeSpec::new("bad", "code")
                    .with_config("language", json!("lua"))
                    .with_config("code", json!("error('no such record')")),
                NodeSpec::new("after", "passthrough"),
                NodeSpec::new("side", "passthrough"),
            ],
            vec![Connection::new("bad", "after")],
        );
        let execution = engine().execute(&wf, ValueMap::new()).await.unwrap();

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.node("bad").unwrap().status, NodeStatus::Failed);
        assert_eq!(execution.node("after").unwrap().status, NodeStatus::Skipped);
        assert_eq!(execution.node("side").unwrap().status, NodeStatus::Completed);
        assert_eq!(execution.failed_node.as_deref(), Some("bad"));
        assert!(execution.error.unwrap().contains("no such record"));
    }

    #[tokio::test]
    async fn failures_outside_the_declared_outputs_do_not_fail_the_execution() {
        let mut wf = workflow(
            vec![
                set("main", json!({"ok": true})),
                NodeSpec::new("audit", "code")
                    .with_config("language", json!("lua"))
                    .with_config("code", json!("error('audit sink down')")),
            ],
            Vec::new(),
        );
        wf.outputs = vec!["main".into()];
        let execution = engine().execute(&wf, ValueMap::new()).await.unwrap();

        assert_eq!(execution.status, ExecutionStatus::Succeeded);
        assert_eq!(execution.node("audit").unwrap().status, NodeStatus::Failed);
        assert_eq!(execution.failed_node.as_deref(), Some("audit"));
    }

    #[tokio::test(start_paused = true)]
    async fn workflow_deadline_times_out_running_nodes() {
        let mut wf = workflow(
            vec![
                NodeSpec::new("slow", "delay").with_config("ms", json!(60_000)),
                NodeSpec::new("next", "passthrough"),
            ],
            vec![Connection::new("slow", "next")],
        );
        wf.config.insert("timeout_ms".into(), json!(100));
        let execution = engine().execute(&wf, ValueMap::new()).await.unwrap();

        assert_eq!(execution.status, ExecutionStatus::Timeout);
        assert_eq!(execution.node("slow").unwrap().status, NodeStatus::Timeout);
        assert_eq!(execution.node("next").unwrap().status, NodeStatus::Cancelled);
        assert!(execution.node("next").unwrap().started_at.is_none());
    }

    #[tokio::test]
    async fn node_tasks_evaluate_their_outgoing_conditions() {
        let wf = workflow(
            vec![set("a", json!({"n": 3})), set("b", json!({})), NodeSpec::new("c", "passthrough")],
            vec![
                Connection::new("a", "c").when(Condition::Expr("output.n > 2".into())),
                Connection::new("b", "c").when(Condition::Expr("output.n > 2".into())),
                Connection::new("a", "b").when(Condition::Bool(true)),
                Connection::new("a", "c").when(Condition::Expr("output.n ~= 3".into())),
            ],
        );
        let expressions = outgoing_expressions(&wf, 0);
        assert_eq!(
            expressions,
            vec![(0, "output.n > 2".to_string()), (3, "output.n ~= 3".to_string())]
        );

        let outputs = ValueMap::from([("n".to_string(), json!(3))]);
        let verdicts = evaluate_conditions(expressions, &outputs).await;
        assert_eq!(verdicts, vec![(0, Ok(true)), (3, Ok(false))]);
    }

    #[test]
    fn dispatch_routes_on_verdicts_carried_by_the_event() {
        let wf = workflow(
            vec![set("a", json!({"flag": false})), NodeSpec::new("b", "passthrough")],
            vec![Connection::new("a", "b").when(Condition::Expr("output.flag".into()))],
        );
        let metrics = EngineMetrics::new();
        let mut dispatch = Dispatch::new(&wf, Execution::new(&wf, ValueMap::new()), &metrics);
        let ready = dispatch.advance();
        assert_eq!(ready.len(), 1);

        let outputs = ValueMap::from([("flag".to_string(), json!(false))]);
        let finished = dispatch.apply(
            NodeEvent::Finished {
                position: 0,
                outcome: NodeOutcome {
                    status: NodeStatus::Completed,
                    outputs,
                    error: None,
                    retry_count: 0,
                    cached: false,
                    started: true,
                    elapsed: std::time::Duration::from_millis(5),
                },
                // Disagrees with the expression so only the memo can open the edge
                conditions: vec![(0, Ok(true))],
            },
            None,
        );
        assert!(finished);

        let ready = dispatch.advance();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].0, 1);
        assert_eq!(ready[0].1["a"], json!({"flag": false}));
        assert_eq!(metrics.snapshot().nodes_succeeded, 1);
    }

    #[tokio::test]
    async fn metrics_follow_executions_retries_and_breakers() {
        let config = EngineConfig {
            breaker: crate::resilience::BreakerConfig {
                max_failures: 1,
                ..Default::default()
            },
            ..EngineConfig::default()
        };
        let engine = ExecutionEngine::new(Arc::new(NodeRegistry::with_builtins()), config);

        let ok = workflow(vec![set("a", json!({"n": 1})), NodeSpec::new("b", "passthrough")], vec![Connection::new("a", "b")]);
        engine.execute(&ok, ValueMap::new()).await.unwrap();

        let mut failing = NodeSpec::new("bad", "code")
            .with_config("language", json!("lua"))
            .with_config("code", json!("error('down')"));
        failing.breaker = Some("upstream".into());
        let failed = workflow(vec![failing], Vec::new());
        let execution = engine.execute(&failed, ValueMap::new()).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);

        let snapshot = engine.metrics();
        assert_eq!(snapshot.workflows_executed, 2);
        assert_eq!(snapshot.workflows_succeeded, 1);
        assert_eq!(snapshot.workflows_failed, 1);
        assert_eq!(snapshot.nodes_executed, 3);
        assert_eq!(snapshot.nodes_succeeded, 2);
        assert_eq!(snapshot.nodes_failed, 1);
        assert_eq!(snapshot.breaker_trips, 1);
        assert_eq!(engine.breakers().get("upstream").state(), crate::resilience::BreakerState::Open);
    }
}
