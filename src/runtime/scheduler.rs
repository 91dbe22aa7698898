//! Trigger scheduler
//!
//! Turns `Workflow.triggers` into executions: cron and interval timers run on
//! tokio-cron-scheduler, manual triggers come in through
//! [`TriggerScheduler::trigger_manual`]. Re-registering a workflow swaps its
//! timers in place; timer jobs look the workflow up on every fire, so a removed
//! workflow's late tick is skipped.

use crate::error::EngineError;
use crate::runtime::execution::ExecutionId;
use crate::runtime::runner::WorkflowRunner;
use crate::workflow::types::{TriggerSpec, ValueMap, Workflow};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

/// State the timer jobs need when they fire
struct Shared {
    runner: Arc<WorkflowRunner>,
    workflows: ArcSwap<HashMap<String, Arc<Workflow>>>,
    accepting: AtomicBool,
    /// Executions started by this scheduler and possibly still running, for
    /// graceful stop. Finished ones are dropped on every fire.
    launched: Mutex<Vec<ExecutionId>>,
}

impl Shared {
    fn fire(&self, workflow_id: &str, params: ValueMap, source: &str) -> Result<ExecutionId, EngineError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(EngineError::SchedulerClosed);
        }
        let workflow = self
            .workflows
            .load()
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))?;

        let id = self.runner.start_execution(workflow, params)?;
        let mut launched = self.launched.lock().unwrap_or_else(PoisonError::into_inner);
        launched.retain(|earlier| self.runner.is_active(*earlier));
        launched.push(id);
        drop(launched);
        tracing::info!(%workflow_id, execution_id = %id, source, "🔔 Trigger fired");
        Ok(id)
    }
}

pub struct TriggerScheduler {
    scheduler: RwLock<JobScheduler>,
    /// Timer job UUIDs per workflow id, for replacement and removal
    job_uuid_map: RwLock<HashMap<String, Vec<Uuid>>>,
    shared: Arc<Shared>,
}

impl TriggerScheduler {
    pub async fn new(runner: Arc<WorkflowRunner>) -> Result<Self, EngineError> {
        let scheduler = JobScheduler::new().await.map_err(scheduler_error)?;
        Ok(Self {
            scheduler: RwLock::new(scheduler),
            job_uuid_map: RwLock::new(HashMap::new()),
            shared: Arc::new(Shared {
                runner,
                workflows: ArcSwap::from_pointee(HashMap::new()),
                accepting: AtomicBool::new(true),
                launched: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn runner(&self) -> &Arc<WorkflowRunner> {
        &self.shared.runner
    }

    /// Start firing timers
    pub async fn start(&self) -> Result<(), EngineError> {
        tracing::info!("⏰ Starting trigger scheduler");
        self.scheduler
            .read()
            .await
            .start()
            .await
            .map_err(scheduler_error)?;
        tracing::info!("✅ Trigger scheduler started");
        Ok(())
    }

    /// Validate and register `workflow`, replacing any earlier version and its timers
    pub async fn register_workflow(&self, workflow: Workflow) -> Result<(), EngineError> {
        self.shared.runner.engine().validate(&workflow)?;
        let workflow = Arc::new(workflow);
        let workflow_id = workflow.id.clone();

        // Build every job before touching live state so a bad schedule changes nothing
        let mut jobs = Vec::new();
        for (index, trigger) in workflow.triggers.iter().enumerate() {
            let label = format!("{workflow_id}#{index}");
            let job = match trigger {
                TriggerSpec::Manual => continue,
                TriggerSpec::Cron { schedule, params } => {
                    let run = self.job_body(&workflow_id, params, &label);
                    Job::new_async(schedule.as_str(), move |_uuid, _l| run())
                }
                TriggerSpec::Interval { every_ms, params } => {
                    let run = self.job_body(&workflow_id, params, &label);
                    Job::new_repeated_async(Duration::from_millis((*every_ms).max(1)), move |_uuid, _l| run())
                }
            }
            .map_err(|e| EngineError::Scheduler(format!("trigger {label}: {e}")))?;
            jobs.push(job);
        }

        self.remove_jobs(&workflow_id).await;
        self.shared.workflows.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(workflow_id.clone(), Arc::clone(&workflow));
            next
        });

        let mut uuids = Vec::with_capacity(jobs.len());
        {
            let scheduler = self.scheduler.read().await;
            for job in jobs {
                uuids.push(scheduler.add(job).await.map_err(scheduler_error)?);
            }
        }
        let timers = uuids.len();
        self.job_uuid_map.write().await.insert(workflow_id.clone(), uuids);

        tracing::info!(%workflow_id, timers, "🔥 Registered workflow triggers");
        Ok(())
    }

    /// Forget a workflow and stop its timers; returns whether it was registered
    pub async fn remove_workflow(&self, workflow_id: &str) -> bool {
        self.remove_jobs(workflow_id).await;
        let mut removed = false;
        self.shared.workflows.rcu(|current| {
            let mut next = HashMap::clone(current);
            removed = next.remove(workflow_id).is_some();
            next
        });
        if removed {
            tracing::info!(%workflow_id, "🗑️ Removed workflow");
        }
        removed
    }

    pub fn workflow_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.workflows.load().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of live timer jobs for `workflow_id`
    pub async fn timer_count(&self, workflow_id: &str) -> usize {
        self.job_uuid_map
            .read()
            .await
            .get(workflow_id)
            .map_or(0, Vec::len)
    }

    /// Start an execution of a registered workflow right now
    pub fn trigger_manual(&self, workflow_id: &str, params: ValueMap) -> Result<ExecutionId, EngineError> {
        self.shared.fire(workflow_id, params, "manual")
    }

    /// Refuse new triggers, stop timers, give running executions `grace` to
    /// finish and cancel the rest; returns how many had to be cancelled
    pub async fn stop(&self, grace: Duration) -> Result<usize, EngineError> {
        tracing::info!(grace_ms = grace.as_millis() as u64, "⏹️ Stopping trigger scheduler");
        self.shared.accepting.store(false, Ordering::SeqCst);

        self.job_uuid_map.write().await.clear();
        self.scheduler
            .write()
            .await
            .shutdown()
            .await
            .map_err(scheduler_error)?;

        let launched: Vec<ExecutionId> = std::mem::take(
            &mut *self
                .shared
                .launched
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let runner = &self.shared.runner;
        let all_finished = futures::future::join_all(launched.iter().map(|id| runner.wait(*id)));

        let mut cancelled = 0;
        if tokio::time::timeout(grace, all_finished).await.is_err() {
            for id in &launched {
                if runner.cancel_execution(*id).is_ok() {
                    cancelled += 1;
                }
            }
            futures::future::join_all(launched.iter().map(|id| runner.wait(*id))).await;
            tracing::warn!(cancelled, "🛑 Cancelled executions still running at shutdown");
        }

        tracing::info!("✅ Trigger scheduler stopped");
        Ok(cancelled)
    }

    /// Closure producing the future a timer job runs on each fire
    fn job_body(
        &self,
        workflow_id: &str,
        params: &ValueMap,
        label: &str,
    ) -> impl Fn() -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> + Send + Sync + 'static
    {
        let shared = Arc::clone(&self.shared);
        let workflow_id = workflow_id.to_string();
        let params = params.clone();
        let label = label.to_string();

        move || {
            let shared = Arc::clone(&shared);
            let workflow_id = workflow_id.clone();
            let params = params.clone();
            let label = label.clone();

            Box::pin(async move {
                match shared.fire(&workflow_id, params, &label) {
                    Ok(_) => {}
                    Err(EngineError::SchedulerClosed) => {
                        tracing::debug!(%label, "⏭️ Skipping trigger during shutdown")
                    }
                    Err(EngineError::WorkflowNotFound(_)) => {
                        tracing::debug!(%label, "⏭️ Skipping trigger for removed workflow")
                    }
                    Err(e) => tracing::error!(%label, error = %e, "❌ Trigger failed to start execution"),
                }
            })
        }
    }

    async fn remove_jobs(&self, workflow_id: &str) {
        let Some(uuids) = self.job_uuid_map.write().await.remove(workflow_id) else {
            return;
        };
        let scheduler = self.scheduler.read().await;
        for uuid in uuids {
            if let Err(e) = scheduler.remove(&uuid).await {
                tracing::warn!(%workflow_id, %uuid, error = %e, "⚠️ Failed to remove timer job");
            }
        }
    }
}

fn scheduler_error(e: impl std::fmt::Display) -> EngineError {
    EngineError::Scheduler(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::nodes::NodeRegistry;
    use crate::runtime::engine::ExecutionEngine;
    use crate::runtime::execution::ExecutionStatus;
    use crate::workflow::types::NodeSpec;
    use serde_json::json;

    fn runner() -> Arc<WorkflowRunner> {
        let engine = ExecutionEngine::new(Arc::new(NodeRegistry::with_builtins()), EngineConfig::default());
        Arc::new(WorkflowRunner::new(Arc::new(engine)))
    }

    fn workflow(id: &str, node: NodeSpec, triggers: Vec<TriggerSpec>) -> Workflow {
        Workflow {
            id: id.into(),
            name: String::new(),
            nodes: vec![node],
            connections: Vec::new(),
            config: ValueMap::new(),
            outputs: Vec::new(),
            triggers,
        }
    }

    #[tokio::test]
    async fn manual_triggers_start_registered_workflows() {
        let scheduler = TriggerScheduler::new(runner()).await.unwrap();
        scheduler
            .register_workflow(workflow("echo", NodeSpec::new("a", "passthrough"), vec![TriggerSpec::Manual]))
            .await
            .unwrap();

        let params = ValueMap::from([("x".to_string(), json!(1))]);
        let id = scheduler.trigger_manual("echo", params.clone()).unwrap();
        let done = scheduler.runner().wait(id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Succeeded);
        assert_eq!(done.trigger_params, params);

        assert!(matches!(
            scheduler.trigger_manual("missing", ValueMap::new()),
            Err(EngineError::WorkflowNotFound(_))
        ));
        assert!(scheduler.remove_workflow("echo").await);
        assert!(scheduler.workflow_ids().is_empty());
    }

    #[tokio::test]
    async fn finished_launches_are_not_tracked_forever() {
        let scheduler = TriggerScheduler::new(runner()).await.unwrap();
        scheduler
            .register_workflow(workflow("echo", NodeSpec::new("a", "passthrough"), vec![TriggerSpec::Manual]))
            .await
            .unwrap();

        for _ in 0..50 {
            let id = scheduler.trigger_manual("echo", ValueMap::new()).unwrap();
            scheduler.runner().wait(id).await.unwrap();
        }
        let tracked = scheduler.shared.launched.lock().unwrap().len();
        assert_eq!(tracked, 1);
    }

    #[tokio::test]
    async fn bad_schedules_leave_the_previous_registration_in_place() {
        let scheduler = TriggerScheduler::new(runner()).await.unwrap();
        let good = workflow(
            "nightly",
            NodeSpec::new("a", "passthrough"),
            vec![TriggerSpec::Cron {
                schedule: "0 0 3 * * *".into(),
                params: ValueMap::new(),
            }],
        );
        scheduler.register_workflow(good).await.unwrap();
        assert_eq!(scheduler.timer_count("nightly").await, 1);

        let bad = workflow(
            "nightly",
            NodeSpec::new("a", "passthrough"),
            vec![TriggerSpec::Cron {
                schedule: "every tuesday".into(),
                params: ValueMap::new(),
            }],
        );
        assert!(matches!(
            scheduler.register_workflow(bad).await,
            Err(EngineError::Scheduler(_))
        ));
        assert_eq!(scheduler.timer_count("nightly").await, 1);
        assert_eq!(scheduler.workflow_ids(), vec!["nightly".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn interval_triggers_fire_until_stopped() {
        let scheduler = TriggerScheduler::new(runner()).await.unwrap();
        scheduler
            .register_workflow(workflow(
                "tick",
                NodeSpec::new("a", "passthrough"),
                vec![TriggerSpec::Interval {
                    every_ms: 1_000,
                    params: ValueMap::from([("source".to_string(), json!("timer"))]),
                }],
            ))
            .await
            .unwrap();
        scheduler.start().await.unwrap();

        let runner = Arc::clone(scheduler.runner());
        let fired = tokio::time::timeout(Duration::from_secs(10), async {
            while runner.list_executions().is_empty() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        assert!(fired.is_ok(), "interval trigger never fired");

        scheduler.stop(Duration::from_secs(5)).await.unwrap();
        assert!(matches!(
            scheduler.trigger_manual("tick", ValueMap::new()),
            Err(EngineError::SchedulerClosed)
        ));
        let first = &runner.list_executions()[0];
        assert_eq!(first.trigger_params["source"], json!("timer"));
    }

    #[tokio::test]
    async fn stop_cancels_executions_that_outlive_the_grace_period() {
        let scheduler = TriggerScheduler::new(runner()).await.unwrap();
        scheduler
            .register_workflow(workflow(
                "slow",
                NodeSpec::new("wait", "delay").with_config("ms", json!(60_000)),
                Vec::new(),
            ))
            .await
            .unwrap();
        let id = scheduler.trigger_manual("slow", ValueMap::new()).unwrap();

        let cancelled = scheduler.stop(Duration::from_millis(100)).await.unwrap();
        assert_eq!(cancelled, 1);
        let execution = scheduler.runner().get_execution(id).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
    }
}
