//! Error taxonomy for the execution core.
//!
//! Validation and registry errors are fatal and never retried. Node errors are
//! captured into the failing node's result; only [`NodeError::Retryable`] is
//! eligible for the retry middleware.

use crate::runtime::execution::{ExecutionId, ExecutionStatus};
use std::time::Duration;
use thiserror::Error;

/// A workflow definition that cannot be scheduled.
///
/// Issues are collected in a deterministic order so repeated validation of the
/// same graph yields an equal error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("workflow '{}' is invalid: {}", .workflow_id, join_issues(.issues))]
pub struct ValidationError {
    pub workflow_id: String,
    pub issues: Vec<ValidationIssue>,
}

/// One problem found while validating a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationIssue {
    #[error("workflow has no nodes")]
    EmptyWorkflow,

    #[error("duplicate node id '{0}'")]
    DuplicateNodeId(String),

    #[error("node '{node_id}' has unknown type '{node_type}'")]
    UnknownNodeType { node_id: String, node_type: String },

    #[error("connection #{index} references missing node '{node_id}'")]
    DanglingConnection { index: usize, node_id: String },

    #[error("connection #{index} uses undeclared port '{port}' on node '{node_id}'")]
    UnknownPort {
        index: usize,
        node_id: String,
        port: String,
    },

    #[error("node '{0}' is connected to itself")]
    SelfLoop(String),

    #[error("cycle detected between nodes [{}]", .nodes.join(", "))]
    Cycle { nodes: Vec<String> },

    #[error("node '{node_id}' has invalid config: {message}")]
    InvalidConfig { node_id: String, message: String },

    #[error("node '{node_id}' has no connection feeding required input '{port}'")]
    MissingInput { node_id: String, port: String },

    #[error("declared output '{0}' is not a node of this workflow")]
    UnknownOutputNode(String),

    #[error("connection #{index} has an invalid condition: {message}")]
    InvalidCondition { index: usize, message: String },
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Node registry misuse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("node type '{0}' is already registered")]
    DuplicateType(String),

    #[error("node type '{0}' is not registered")]
    TypeNotFound(String),

    #[error("invalid definition for node type '{node_type}': {message}")]
    InvalidDefinition { node_type: String, message: String },
}

/// Failure of a single node invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    /// Transient failure, eligible for retry.
    #[error("{0}")]
    Retryable(String),

    /// Deterministic failure, surfaced immediately.
    #[error("{0}")]
    NonRetryable(String),

    #[error("sandbox setup failed: {0}")]
    SandboxSetupFailed(String),

    #[error("deadline exceeded")]
    Timeout,

    /// The named dependency's breaker rejected the call without running it.
    #[error("circuit breaker '{0}' is open")]
    BreakerOpen(String),

    #[error("cancelled")]
    Cancelled,
}

impl NodeError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable(message.into())
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self::NonRetryable(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Invocation-level failure of the sandboxed executor.
///
/// Application-level failures (script raised, non-zero exit, rejected code)
/// are reported through `ExecutionResult { success: false, .. }` instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SandboxError {
    #[error("failed to prepare sandbox: {0}")]
    SetupFailed(String),

    #[error("runtime '{0}' is not available")]
    RuntimeUnavailable(String),

    #[error("unsupported language '{0}'")]
    UnsupportedLanguage(String),

    #[error("sandboxed code exceeded its {0:?} budget")]
    Timeout(Duration),

    #[error("sandboxed execution cancelled")]
    Cancelled,

    #[error("sandbox i/o error: {0}")]
    Io(String),
}

impl From<SandboxError> for NodeError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::SetupFailed(message) => NodeError::SandboxSetupFailed(message),
            SandboxError::Timeout(_) => NodeError::Timeout,
            SandboxError::Cancelled => NodeError::Cancelled,
            SandboxError::Io(message) => NodeError::Retryable(message),
            other @ (SandboxError::RuntimeUnavailable(_) | SandboxError::UnsupportedLanguage(_)) => {
                NodeError::NonRetryable(other.to_string())
            }
        }
    }
}

/// Errors surfaced at the trigger boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("execution '{0}' not found")]
    ExecutionNotFound(ExecutionId),

    #[error("execution '{0}' already finished with status {1}")]
    AlreadyTerminal(ExecutionId, ExecutionStatus),

    #[error("workflow '{0}' is not registered with the scheduler")]
    WorkflowNotFound(String),

    #[error("scheduler is shutting down")]
    SchedulerClosed,

    #[error("scheduler error: {0}")]
    Scheduler(String),
}
