//! Orchestrator facade: owns the shared subsystems, accepts workflows, and
//! exposes progress, cancellation, and query surfaces.

use crate::cache::{CacheConfig, CacheStats, TaskCache};
use crate::dispatcher::{Dispatcher, WorkerRegistry};
use crate::metrics::{AggregateStats, MetricsCollector, WorkflowMetrics};
use crate::recommender::recommend_strategy;
use crate::router::{Router, WorkerRouting};
use crate::state::{Progress, StateManager, WorkflowStateSnapshot};
use crate::strategy::{strategy_for, ExecutionContext, Strategy};
use crate::types::{
    StrategyKind, TaskDefinition, TaskResult, WorkflowDefinition, WorkflowStatus,
};
use crate::worker::{InMemorySkillRegistry, SkillRegistry, Worker};
use crate::OrchestratorError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use crate::state::{ProgressCallback, ProgressUpdate};

/// Construction-time configuration for the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub routings: Vec<WorkerRouting>,
    pub cache: CacheConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            routings: Vec::new(),
            cache: CacheConfig::default(),
        }
    }
}

struct RunHandle {
    state: Arc<StateManager>,
    cancel: CancellationToken,
}

/// Entry point for executing and observing workflows.
pub struct Orchestrator {
    router: Arc<Router>,
    cache: Arc<TaskCache>,
    metrics: Arc<MetricsCollector>,
    workers: WorkerRegistry,
    skills: Arc<dyn SkillRegistry>,
    strategies: HashMap<StrategyKind, Arc<dyn Strategy>>,
    runs: DashMap<String, RunHandle>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        let mut strategies: HashMap<StrategyKind, Arc<dyn Strategy>> = HashMap::new();
        for kind in [
            StrategyKind::Sequential,
            StrategyKind::Parallel,
            StrategyKind::Dag,
            StrategyKind::Conditional,
        ] {
            if let Some(strategy) = strategy_for(kind) {
                strategies.insert(kind, strategy);
            }
        }
        Self {
            router: Arc::new(Router::new(config.routings)),
            cache: Arc::new(TaskCache::new(config.cache)),
            metrics: Arc::new(MetricsCollector::new()),
            workers: Arc::new(DashMap::new()),
            skills: Arc::new(InMemorySkillRegistry::new()),
            strategies,
            runs: DashMap::new(),
        }
    }

    pub fn with_skill_registry(mut self, skills: Arc<dyn SkillRegistry>) -> Self {
        self.skills = skills;
        self
    }

    pub fn register_worker(&self, worker_type: impl Into<String>, worker: Arc<dyn Worker>) {
        self.workers.insert(worker_type.into(), worker);
    }

    /// Validate and run a workflow to completion, returning the final state.
    ///
    /// With `auto_strategy` (or a declared `auto` strategy) the recommender
    /// picks the execution strategy. Validation errors raise synchronously;
    /// in-execution failures are captured in the returned snapshot.
    pub async fn execute_workflow(
        &self,
        workflow: WorkflowDefinition,
        auto_strategy: bool,
        progress: Option<ProgressCallback>,
    ) -> Result<WorkflowStateSnapshot, OrchestratorError> {
        let conditions = workflow.validate()?;

        let mut kind = workflow.strategy;
        if auto_strategy || kind == StrategyKind::Auto {
            let recommendation = recommend_strategy(&workflow);
            tracing::info!(
                workflow_id = %workflow.id,
                strategy = %recommendation.strategy,
                rationale = %recommendation.rationale,
                "strategy selected by recommender"
            );
            kind = recommendation.strategy;
        }
        if kind == StrategyKind::Parallel && workflow.has_dependencies() {
            return Err(OrchestratorError::Validation(format!(
                "workflow '{}': parallel strategy requires dependency-free tasks",
                workflow.id
            )));
        }
        let strategy = self
            .strategies
            .get(&kind)
            .cloned()
            .ok_or_else(|| OrchestratorError::Internal(format!("no strategy for kind {kind}")))?;

        let state = Arc::new(StateManager::new(
            &workflow,
            kind == StrategyKind::Conditional,
            progress,
        ));
        let cancel = CancellationToken::new();
        let workflow_id = workflow.id.clone();
        self.runs.insert(
            workflow_id.clone(),
            RunHandle {
                state: state.clone(),
                cancel: cancel.clone(),
            },
        );

        state.begin();
        self.metrics.workflow_started(&workflow_id);
        tracing::info!(
            workflow_id = %workflow_id,
            strategy = %kind,
            tasks = workflow.tasks.len(),
            "workflow execution started"
        );

        let dispatcher = Arc::new(Dispatcher::new(
            self.router.clone(),
            self.cache.clone(),
            self.metrics.clone(),
            self.workers.clone(),
            self.skills.clone(),
        ));
        let workflow = Arc::new(workflow);
        let ctx = ExecutionContext {
            workflow: workflow.clone(),
            dispatcher,
            state: state.clone(),
            conditions: Arc::new(conditions),
            cancel: cancel.clone(),
        };

        let run_result = strategy.run(ctx).await;

        let overall = if cancel.is_cancelled() {
            WorkflowStatus::Cancelled
        } else if !workflow.continue_on_failure && state.any_non_completed() {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Completed
        };
        state.finish(overall);
        self.metrics.workflow_finished(&workflow_id);
        tracing::info!(
            workflow_id = %workflow_id,
            status = %overall,
            "workflow execution finished"
        );

        run_result?;
        Ok(state.snapshot())
    }

    /// Convenience wrapper running one ad-hoc task as a workflow.
    pub async fn execute_task(&self, task: TaskDefinition) -> Result<TaskResult, OrchestratorError> {
        let task_id = task.id.clone();
        let workflow = WorkflowDefinition::new(
            format!("adhoc-{task_id}"),
            format!("ad-hoc execution of '{task_id}'"),
        )
        .with_strategy(StrategyKind::Sequential)
        .with_task(task);
        let snapshot = self.execute_workflow(workflow, false, None).await?;
        snapshot
            .results
            .get(&task_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::Internal(format!("no result for task '{task_id}'")))
    }

    /// Cooperative, idempotent cancellation: stops new dispatches and signals
    /// in-flight tasks at their next suspension point. Returns `false` for an
    /// unknown workflow id.
    pub fn cancel_workflow(&self, workflow_id: &str) -> bool {
        match self.runs.get(workflow_id) {
            Some(handle) => {
                handle.cancel.cancel();
                tracing::info!(workflow_id = %workflow_id, "workflow cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn get_workflow_state(&self, workflow_id: &str) -> Option<WorkflowStateSnapshot> {
        self.runs.get(workflow_id).map(|h| h.state.snapshot())
    }

    pub fn get_workflow_progress(&self, workflow_id: &str) -> Option<Progress> {
        self.runs.get(workflow_id).map(|h| h.state.progress())
    }

    pub fn get_workflow_metrics(&self, workflow_id: &str) -> Option<WorkflowMetrics> {
        self.metrics.workflow_metrics(workflow_id)
    }

    pub fn get_workflow_report(&self, workflow_id: &str) -> Option<String> {
        self.metrics.render_report(workflow_id)
    }

    pub fn get_aggregate_stats(&self) -> AggregateStats {
        self.metrics.aggregate()
    }

    pub fn list_workflows(&self) -> Vec<(String, WorkflowStatus)> {
        let mut known: Vec<(String, WorkflowStatus)> = self
            .runs
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state.overall_status()))
            .collect();
        known.sort_by(|a, b| a.0.cmp(&b.0));
        known
    }

    pub async fn get_cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    pub async fn invalidate_cache(&self, task_id: &str) -> usize {
        self.cache.invalidate(task_id).await
    }

    pub async fn clear_cache(&self) {
        self.cache.clear().await;
    }
}
