//! Shared single-task runner.
//!
//! Every strategy funnels task execution through here: cache check, skill
//! resolution, worker slot acquisition, the timeout/retry loop, cache store,
//! and metric recording. The invariant is that every dispatched task reaches
//! exactly one terminal status in the state manager before this returns.

use crate::cache::TaskCache;
use crate::metrics::{MetricsCollector, TaskExecutionRecord};
use crate::router::{RouteDecision, Router};
use crate::state::StateManager;
use crate::types::{
    TaskDefinition, TaskError, TaskErrorKind, TaskOutput, WorkflowDefinition,
};
use crate::worker::{SkillRegistry, Worker, WorkerRequest};
use crate::OrchestratorError;
use dashmap::DashMap;
use futures::FutureExt;
use rand::Rng;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Worker implementations keyed by worker type id.
pub type WorkerRegistry = Arc<DashMap<String, Arc<dyn Worker>>>;

enum AttemptOutcome {
    Success(TaskOutput),
    Failed(TaskError),
    Cancelled,
}

/// Runs one task end to end on behalf of a strategy.
pub struct Dispatcher {
    router: Arc<Router>,
    cache: Arc<TaskCache>,
    metrics: Arc<MetricsCollector>,
    workers: WorkerRegistry,
    skills: Arc<dyn SkillRegistry>,
}

impl Dispatcher {
    pub fn new(
        router: Arc<Router>,
        cache: Arc<TaskCache>,
        metrics: Arc<MetricsCollector>,
        workers: WorkerRegistry,
        skills: Arc<dyn SkillRegistry>,
    ) -> Self {
        Self {
            router,
            cache,
            metrics,
            workers,
            skills,
        }
    }

    /// Drive `task` to a terminal status and record its metrics.
    pub async fn run_task(
        &self,
        workflow: &WorkflowDefinition,
        task: &TaskDefinition,
        state: &StateManager,
        cancel: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        let started = Instant::now();
        let outcome = self.run_inner(workflow, task, state, cancel).await;
        self.record(state, task, started);
        outcome
    }

    async fn run_inner(
        &self,
        workflow: &WorkflowDefinition,
        task: &TaskDefinition,
        state: &StateManager,
        cancel: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        if cancel.is_cancelled() {
            return state.mark_cancelled(&task.id);
        }

        let cache_key = if self.cache.enabled() {
            let dep_outputs: Vec<(String, Option<TaskOutput>)> =
                if self.cache.include_dependencies() {
                    task.dependencies
                        .iter()
                        .map(|dep| {
                            (dep.clone(), state.result(dep).and_then(|r| r.output))
                        })
                        .collect()
                } else {
                    Vec::new()
                };
            let key = TaskCache::task_key(task, &dep_outputs);
            if let Some(output) = self.cache.get(&key).await {
                tracing::info!(task_id = %task.id, "cache hit; task execution elided");
                return state.mark_completed(&task.id, output, true);
            }
            Some(key)
        } else {
            None
        };

        let mut skills = HashMap::new();
        for name in &task.required_skills {
            match self.skills.lookup(name).await {
                Some(body) => {
                    skills.insert(name.clone(), body);
                }
                None => {
                    let available = self.skills.available().await;
                    let error = TaskError::new(
                        TaskErrorKind::RequiredSkillNotFound,
                        format!("required skill '{name}' not found"),
                    )
                    .with_payload(serde_json::json!({
                        "missing": name,
                        "available": available,
                    }));
                    return state.mark_failed(&task.id, error);
                }
            }
        }

        let slot = loop {
            if cancel.is_cancelled() {
                return state.mark_cancelled(&task.id);
            }
            match self.router.try_acquire(task) {
                RouteDecision::Slot(slot) => break slot,
                RouteDecision::Unroutable => {
                    let error = TaskError::new(
                        TaskErrorKind::NoWorkerAvailable,
                        format!("no worker routing satisfies task '{}'", task.id),
                    );
                    return state.mark_failed(&task.id, error);
                }
                RouteDecision::Waiting => {
                    if !self.router.wait_for_slot(cancel).await {
                        return state.mark_cancelled(&task.id);
                    }
                }
            }
        };

        let worker_type = slot.worker_type().to_string();
        let Some(worker) = self.workers.get(&worker_type).map(|w| w.value().clone()) else {
            let error = TaskError::new(
                TaskErrorKind::NoWorkerAvailable,
                format!("no worker registered for type '{worker_type}'"),
            );
            return state.mark_failed(&task.id, error);
        };

        let timeout = effective_timeout(task, workflow);
        let dependency_outputs = state.dependency_outputs(task);
        let max_attempts = task.retry_policy.max_retries.saturating_add(1);
        let mut attempt: u32 = 1;

        loop {
            state.mark_running(&task.id, &worker_type)?;
            let request = WorkerRequest {
                task_id: task.id.clone(),
                description: task.description.clone(),
                parameters: task.parameters.clone(),
                skills: skills.clone(),
                dependency_outputs: dependency_outputs.clone(),
                attempt,
            };

            match self.attempt(worker.clone(), request, timeout, cancel).await {
                AttemptOutcome::Success(output) => {
                    if let Some(key) = &cache_key {
                        let mut contributing = vec![task.id.clone()];
                        if self.cache.include_dependencies() {
                            contributing.extend(task.dependencies.iter().cloned());
                        }
                        self.cache.put(key, output.clone(), &contributing).await;
                    }
                    return state.mark_completed(&task.id, output, false);
                }
                AttemptOutcome::Cancelled => {
                    return state.mark_cancelled(&task.id);
                }
                AttemptOutcome::Failed(error) => {
                    if attempt < max_attempts {
                        let delay = backoff_delay(task, attempt);
                        tracing::warn!(
                            task_id = %task.id,
                            attempt,
                            error = %error,
                            delay_ms = delay.as_millis() as u64,
                            "task attempt failed; retrying"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                return state.mark_cancelled(&task.id);
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                        attempt += 1;
                    } else {
                        tracing::warn!(
                            task_id = %task.id,
                            attempts = attempt,
                            error = %error,
                            "task failed; retries exhausted"
                        );
                        return state.mark_failed(&task.id, error);
                    }
                }
            }
        }
    }

    async fn attempt(
        &self,
        worker: Arc<dyn Worker>,
        request: WorkerRequest,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> AttemptOutcome {
        let call = async move {
            match AssertUnwindSafe(worker.execute(request)).catch_unwind().await {
                Ok(Ok(output)) => AttemptOutcome::Success(output),
                Ok(Err(error)) => AttemptOutcome::Failed(error),
                Err(_) => AttemptOutcome::Failed(TaskError::new(
                    TaskErrorKind::TaskFailed,
                    "worker panicked",
                )),
            }
        };
        let timed = async {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, call).await {
                    Ok(outcome) => outcome,
                    Err(_) => AttemptOutcome::Failed(TaskError::new(
                        TaskErrorKind::TaskTimeout,
                        format!("worker call exceeded {:.3}s", limit.as_secs_f64()),
                    )),
                },
                None => call.await,
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => AttemptOutcome::Cancelled,
            outcome = timed => outcome,
        }
    }

    fn record(&self, state: &StateManager, task: &TaskDefinition, started: Instant) {
        let Some(result) = state.result(&task.id) else {
            return;
        };
        self.metrics.record_task(TaskExecutionRecord {
            workflow_id: state.workflow_id().to_string(),
            task_id: task.id.clone(),
            status: result.status,
            duration: result.duration().unwrap_or_else(|| {
                if result.from_cache {
                    Duration::ZERO
                } else {
                    started.elapsed()
                }
            }),
            started_at: result.started_at,
            completed_at: result.completed_at,
            retries: result.attempts.saturating_sub(1),
            worker_id: result.worker_id,
            error: result.error.map(|e| e.to_string()),
            from_cache: result.from_cache,
        });
    }
}

fn effective_timeout(task: &TaskDefinition, workflow: &WorkflowDefinition) -> Option<Duration> {
    match (task.timeout, workflow.default_timeout) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

fn backoff_delay(task: &TaskDefinition, attempt: u32) -> Duration {
    let base = task.retry_policy.delay_for_attempt(attempt);
    if task.retry_policy.jitter {
        let factor: f64 = rand::thread_rng().gen_range(0.75..=1.25);
        Duration::from_secs_f64(base.as_secs_f64() * factor)
    } else {
        base
    }
}
