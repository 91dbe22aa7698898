//! Trigger boundary
//!
//! External callers start, cancel and poll executions here. Each execution runs
//! its dispatch loop on a spawned task; the runner keeps only a cancellation
//! token and the receiving end of the execution's snapshot channel. Finished
//! executions stay queryable up to the retention limit; each new launch
//! forgets the oldest finished ones beyond it.

use crate::error::EngineError;
use crate::runtime::engine::ExecutionEngine;
use crate::runtime::execution::{Execution, ExecutionId, ExecutionStatus};
use crate::workflow::types::{ValueMap, Workflow};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct ExecutionHandle {
    cancel: CancellationToken,
    snapshots: watch::Receiver<Execution>,
}

pub struct WorkflowRunner {
    engine: Arc<ExecutionEngine>,
    executions: RwLock<HashMap<ExecutionId, ExecutionHandle>>,
    retained: usize,
}

impl WorkflowRunner {
    pub fn new(engine: Arc<ExecutionEngine>) -> Self {
        let retained = engine.config().retained_executions;
        Self {
            engine,
            executions: RwLock::new(HashMap::new()),
            retained,
        }
    }

    /// Keep at most `max_finished` terminal executions around
    pub fn with_retention(mut self, max_finished: usize) -> Self {
        self.retained = max_finished;
        self
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    /// Validate `workflow` and start an execution of it.
    ///
    /// A workflow that fails validation never produces an execution. Must be
    /// called from within a Tokio runtime.
    pub fn start_execution(
        &self,
        workflow: impl Into<Arc<Workflow>>,
        params: ValueMap,
    ) -> Result<ExecutionId, EngineError> {
        self.launch(workflow.into(), params, None)
    }

    /// Start an execution on behalf of `parent`; cancelling the parent cancels it too
    pub fn start_child_execution(
        &self,
        parent: ExecutionId,
        workflow: impl Into<Arc<Workflow>>,
        params: ValueMap,
    ) -> Result<ExecutionId, EngineError> {
        let parent_cancel = self
            .read()
            .get(&parent)
            .map(|handle| handle.cancel.clone())
            .ok_or(EngineError::ExecutionNotFound(parent))?;
        self.launch(workflow.into(), params, Some((parent, parent_cancel)))
    }

    fn launch(
        &self,
        workflow: Arc<Workflow>,
        params: ValueMap,
        parent: Option<(ExecutionId, CancellationToken)>,
    ) -> Result<ExecutionId, EngineError> {
        self.engine.validate(&workflow)?;

        let mut execution = Execution::new(&workflow, params);
        let cancel = match &parent {
            Some((parent_id, parent_cancel)) => {
                execution.parent_execution_id = Some(*parent_id);
                parent_cancel.child_token()
            }
            None => CancellationToken::new(),
        };
        let id = execution.id;
        let (snapshots, receiver) = watch::channel(execution.clone());
        self.engine.publish(&snapshots, &execution);

        execution.status = ExecutionStatus::Queued;
        self.engine.publish(&snapshots, &execution);

        let mut executions = self.write();
        let forgotten = forget_oldest_finished(&mut executions, self.retained);
        if forgotten > 0 {
            debug!(forgotten, "🗑️ Dropped finished executions past retention");
        }
        executions.insert(
            id,
            ExecutionHandle {
                cancel: cancel.clone(),
                snapshots: receiver,
            },
        );
        drop(executions);
        info!(execution_id = %id, workflow_id = %workflow.id, "📥 Execution queued");

        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            engine.drive(&workflow, execution, cancel, &snapshots).await;
        });
        Ok(id)
    }

    /// Request cancellation; the execution settles asynchronously
    pub fn cancel_execution(&self, id: ExecutionId) -> Result<(), EngineError> {
        let executions = self.read();
        let handle = executions.get(&id).ok_or(EngineError::ExecutionNotFound(id))?;
        let status = handle.snapshots.borrow().status;
        if status.is_terminal() {
            return Err(EngineError::AlreadyTerminal(id, status));
        }
        info!(execution_id = %id, "🛑 Cancelling execution");
        handle.cancel.cancel();
        Ok(())
    }

    /// Latest snapshot
    pub fn get_execution(&self, id: ExecutionId) -> Option<Execution> {
        self.read()
            .get(&id)
            .map(|handle| handle.snapshots.borrow().clone())
    }

    /// Wait until the execution reaches a terminal status
    pub async fn wait(&self, id: ExecutionId) -> Result<Execution, EngineError> {
        let mut receiver = self
            .read()
            .get(&id)
            .map(|handle| handle.snapshots.clone())
            .ok_or(EngineError::ExecutionNotFound(id))?;

        // An error means the dispatch loop is gone; its last snapshot is all there is
        let _ = receiver.wait_for(Execution::is_terminal).await;
        let terminal = receiver.borrow().clone();
        Ok(terminal)
    }

    /// Latest snapshot of every known execution, oldest first
    pub fn list_executions(&self) -> Vec<Execution> {
        let mut executions: Vec<Execution> = self
            .read()
            .values()
            .map(|handle| handle.snapshots.borrow().clone())
            .collect();
        executions.sort_by_key(|execution| execution.created_at);
        executions
    }

    /// Ids of executions not yet terminal
    pub fn active_executions(&self) -> Vec<ExecutionId> {
        self.read()
            .iter()
            .filter(|(_, handle)| !handle.snapshots.borrow().is_terminal())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn is_active(&self, id: ExecutionId) -> bool {
        self.read()
            .get(&id)
            .is_some_and(|handle| !handle.snapshots.borrow().is_terminal())
    }

    /// Forget terminal executions; returns how many were dropped
    pub fn prune_finished(&self) -> usize {
        let mut executions = self.write();
        let before = executions.len();
        executions.retain(|_, handle| !handle.snapshots.borrow().is_terminal());
        before - executions.len()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ExecutionId, ExecutionHandle>> {
        self.executions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<ExecutionId, ExecutionHandle>> {
        self.executions.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drop the oldest terminal handles until at most `keep` remain
fn forget_oldest_finished(executions: &mut HashMap<ExecutionId, ExecutionHandle>, keep: usize) -> usize {
    let mut finished: Vec<_> = executions
        .iter()
        .filter_map(|(id, handle)| {
            let snapshot = handle.snapshots.borrow();
            snapshot
                .is_terminal()
                .then(|| (snapshot.ended_at.unwrap_or(snapshot.created_at), *id))
        })
        .collect();
    if finished.len() <= keep {
        return 0;
    }
    finished.sort();
    let excess = finished.len() - keep;
    for (_, id) in finished.into_iter().take(excess) {
        executions.remove(&id);
    }
    excess
}

impl std::fmt::Debug for WorkflowRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRunner")
            .field("engine", &self.engine)
            .field("executions", &self.read().len())
            .finish()
    }
}
