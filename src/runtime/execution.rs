//! Execution records and their state machines
//!
//! ```text
//! Execution: Created -> Queued -> Running -> Succeeded | Failed | Cancelled | Timeout
//! Node:      Pending -> Scheduled -> Running -> Completed | Failed | Skipped | Cancelled | Timeout
//!                           ^            |
//!                           +- Retrying -+
//! ```
//!
//! Records are mutated only by the dispatch loop that owns them and are frozen
//! once the execution reaches a terminal status.

use crate::workflow::types::{ValueMap, Workflow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

pub type ExecutionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Created,
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Timeout,
    /// Reserved for external suspension; the engine never enters it on its own
    Paused,
    Resuming,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::Timeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Created => "created",
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Resuming => "resuming",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Scheduled,
    Running,
    Retrying,
    Completed,
    Failed,
    Skipped,
    Cancelled,
    Timeout,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeStatus::Completed
                | NodeStatus::Failed
                | NodeStatus::Skipped
                | NodeStatus::Cancelled
                | NodeStatus::Timeout
        )
    }

    /// Dispatched and not finished yet
    pub fn is_active(self) -> bool {
        matches!(
            self,
            NodeStatus::Scheduled | NodeStatus::Running | NodeStatus::Retrying
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Scheduled => "scheduled",
            NodeStatus::Running => "running",
            NodeStatus::Retrying => "retrying",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
            NodeStatus::Cancelled => "cancelled",
            NodeStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one node within one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub node_id: String,
    pub status: NodeStatus,
    pub outputs: ValueMap,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Retries used, not counting the first attempt
    pub retry_count: u32,
    /// Inputs the node was invoked with
    pub inputs_used: ValueMap,
    /// Outputs were served from the output cache
    pub outputs_cached: bool,
    pub execution_time_ms: u64,
}

impl NodeResult {
    pub fn pending(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            status: NodeStatus::Pending,
            outputs: ValueMap::new(),
            error: None,
            started_at: None,
            ended_at: None,
            retry_count: 0,
            inputs_used: ValueMap::new(),
            outputs_cached: false,
            execution_time_ms: 0,
        }
    }

    /// Terminal transition without an invocation, e.g. skip or cancel before start
    pub(crate) fn settle(&mut self, status: NodeStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.ended_at = Some(Utc::now());
    }
}

/// One run of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub node_results: HashMap<String, NodeResult>,
    pub parent_execution_id: Option<ExecutionId>,
    /// Total retries used by all nodes
    pub retry_count: u32,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub trigger_params: ValueMap,
    /// Error message of the first node that failed
    pub error: Option<String>,
    pub failed_node: Option<String>,
}

impl Execution {
    pub fn new(workflow: &Workflow, trigger_params: ValueMap) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow.id.clone(),
            status: ExecutionStatus::Created,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            node_results: workflow
                .nodes
                .iter()
                .map(|node| (node.id.clone(), NodeResult::pending(&node.id)))
                .collect(),
            parent_execution_id: None,
            retry_count: 0,
            cancelled_at: None,
            trigger_params,
            error: None,
            failed_node: None,
        }
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeResult> {
        self.node_results.get(node_id)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Number of nodes currently in `status`
    pub fn count(&self, status: NodeStatus) -> usize {
        self.node_results
            .values()
            .filter(|result| result.status == status)
            .count()
    }
}

/// Receives every snapshot the dispatch loop publishes.
///
/// This is the persistence boundary: an embedding application stores
/// snapshots here; the engine itself keeps nothing durable.
pub trait ExecutionObserver: Send + Sync {
    fn on_snapshot(&self, execution: &Execution);
}
