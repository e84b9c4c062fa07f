//! Execution strategies: scheduling policies over the shared dispatcher.
//!
//! All four strategies decide only *which* tasks are eligible to run and in
//! what order; running a single task is always the dispatcher's job. When a
//! run stops early (failure without continue-on-failure, or cancellation),
//! every remaining non-terminal task is driven to `cancelled` so the final
//! state always has a complete picture.

use crate::condition::ConditionExpr;
use crate::dispatcher::Dispatcher;
use crate::state::{StateManager, SKIP_CONDITION_UNMET, SKIP_DEPENDENCY_FAILED, SKIP_DEPENDENCY_SKIPPED};
use crate::types::{StrategyKind, TaskStatus, WorkflowDefinition};
use crate::OrchestratorError;
use async_trait::async_trait;
use priority_queue::PriorityQueue;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Everything a strategy needs to run one workflow.
#[derive(Clone)]
pub struct ExecutionContext {
    pub workflow: Arc<WorkflowDefinition>,
    pub dispatcher: Arc<Dispatcher>,
    pub state: Arc<StateManager>,
    /// Condition ASTs parsed at validation, keyed by task id.
    pub conditions: Arc<HashMap<String, ConditionExpr>>,
    pub cancel: CancellationToken,
}

/// A scheduling policy over the dispatcher.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn kind(&self) -> StrategyKind;
    async fn run(&self, ctx: ExecutionContext) -> Result<(), OrchestratorError>;
}

/// Resolve a concrete strategy for a kind. `Auto` has no implementation; it
/// is resolved by the recommender before execution.
pub fn strategy_for(kind: StrategyKind) -> Option<Arc<dyn Strategy>> {
    match kind {
        StrategyKind::Sequential => Some(Arc::new(SequentialStrategy)),
        StrategyKind::Parallel => Some(Arc::new(ParallelStrategy)),
        StrategyKind::Dag => Some(Arc::new(DagStrategy)),
        StrategyKind::Conditional => Some(Arc::new(ConditionalStrategy)),
        StrategyKind::Auto => None,
    }
}

/// Stable topological order: dependency-respecting, ties broken by priority
/// (descending) then declared order.
pub(crate) fn topological_order(workflow: &WorkflowDefinition) -> Vec<String> {
    let index: HashMap<&str, usize> = workflow
        .tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.as_str(), i))
        .collect();
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for task in &workflow.tasks {
        in_degree.insert(task.id.as_str(), task.dependencies.len());
        for dep in &task.dependencies {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(task.id.as_str());
        }
    }

    let mut queue: PriorityQueue<&str, (u8, Reverse<usize>)> = PriorityQueue::new();
    for task in &workflow.tasks {
        if in_degree[task.id.as_str()] == 0 {
            queue.push(task.id.as_str(), (task.priority, Reverse(index[task.id.as_str()])));
        }
    }

    let mut order = Vec::with_capacity(workflow.tasks.len());
    while let Some((id, _)) = queue.pop() {
        order.push(id.to_string());
        if let Some(children) = dependents.get(id) {
            for &dependent in children {
                let degree = in_degree.entry(dependent).or_insert(0);
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    if let Some(task) = workflow.task(dependent) {
                        queue.push(dependent, (task.priority, Reverse(index[dependent])));
                    }
                }
            }
        }
    }
    order
}

/// Shared fan-out driver: pulls batches of dispatchable task ids, keeps up
/// to `max_parallel_tasks` in flight, and stops feeding new work after a
/// failure when continue-on-failure is off.
async fn drive_batches(
    ctx: &ExecutionContext,
    next_batch: &mut (dyn FnMut(&ExecutionContext) -> Result<Vec<String>, OrchestratorError> + Send),
) -> Result<(), OrchestratorError> {
    let max = ctx.workflow.max_parallel_tasks.max(1);
    let mut join: JoinSet<(String, Result<(), OrchestratorError>)> = JoinSet::new();
    let mut dispatched: HashSet<String> = HashSet::new();
    let mut stopped = false;

    loop {
        if ctx.cancel.is_cancelled() {
            stopped = true;
        }
        if !stopped {
            for id in next_batch(ctx)? {
                if join.len() >= max {
                    break;
                }
                if dispatched.contains(&id) {
                    continue;
                }
                let task = ctx.workflow.task(&id).cloned().ok_or_else(|| {
                    OrchestratorError::Internal(format!("batch produced unknown task '{id}'"))
                })?;
                if ctx.state.status(&id) == Some(TaskStatus::Pending) {
                    ctx.state.make_ready(&id)?;
                }
                dispatched.insert(id.clone());
                let ctx = ctx.clone();
                join.spawn(async move {
                    let outcome = ctx
                        .dispatcher
                        .run_task(&ctx.workflow, &task, &ctx.state, &ctx.cancel)
                        .await;
                    (task.id, outcome)
                });
            }
        }

        match join.join_next().await {
            Some(joined) => {
                let (id, outcome) = joined
                    .map_err(|e| OrchestratorError::Internal(format!("task join failed: {e}")))?;
                outcome?;
                if !stopped
                    && !ctx.workflow.continue_on_failure
                    && ctx.state.status(&id) == Some(TaskStatus::Failed)
                {
                    tracing::info!(
                        workflow_id = %ctx.workflow.id,
                        task_id = %id,
                        "task failed; halting new dispatches"
                    );
                    stopped = true;
                }
            }
            None => {
                if stopped {
                    break;
                }
                let remaining = next_batch(ctx)?;
                if remaining.iter().all(|id| dispatched.contains(id)) {
                    break;
                }
            }
        }
    }

    if !ctx.state.all_terminal() {
        ctx.state.cancel_all_non_terminal();
    }
    Ok(())
}

/// One task at a time in stable topological order; stops on first failure
/// unless continue-on-failure is set.
pub struct SequentialStrategy;

#[async_trait]
impl Strategy for SequentialStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Sequential
    }

    async fn run(&self, ctx: ExecutionContext) -> Result<(), OrchestratorError> {
        for id in topological_order(&ctx.workflow) {
            if ctx.cancel.is_cancelled() {
                break;
            }
            // Skip cascades may have resolved this task already.
            if ctx.state.status(&id) != Some(TaskStatus::Pending) {
                continue;
            }
            let task = ctx.workflow.task(&id).cloned().ok_or_else(|| {
                OrchestratorError::Internal(format!("order produced unknown task '{id}'"))
            })?;
            ctx.state.make_ready(&id)?;
            ctx.dispatcher
                .run_task(&ctx.workflow, &task, &ctx.state, &ctx.cancel)
                .await?;
            if ctx.state.status(&id) == Some(TaskStatus::Failed)
                && !ctx.workflow.continue_on_failure
            {
                break;
            }
        }
        if !ctx.state.all_terminal() {
            ctx.state.cancel_all_non_terminal();
        }
        Ok(())
    }
}

/// All tasks treated as independent; dependencies are rejected up front.
pub struct ParallelStrategy;

#[async_trait]
impl Strategy for ParallelStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Parallel
    }

    async fn run(&self, ctx: ExecutionContext) -> Result<(), OrchestratorError> {
        if ctx.workflow.has_dependencies() {
            return Err(OrchestratorError::Validation(format!(
                "workflow '{}': parallel strategy requires dependency-free tasks",
                ctx.workflow.id
            )));
        }
        let mut order: Vec<(usize, String, u8)> = ctx
            .workflow
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (i, t.id.clone(), t.priority))
            .collect();
        order.sort_by_key(|(i, _, priority)| (Reverse(*priority), *i));
        let ids: Vec<String> = order.into_iter().map(|(_, id, _)| id).collect();

        let mut batch = move |ctx: &ExecutionContext| {
            Ok::<Vec<String>, OrchestratorError>(
                ids.iter()
                    .filter(|id| ctx.state.status(id) == Some(TaskStatus::Pending))
                    .cloned()
                    .collect(),
            )
        };
        drive_batches(&ctx, &mut batch).await
    }
}

/// Dependency-graph scheduling: repeatedly dispatch the ready set, up to
/// the workflow's parallelism cap.
pub struct DagStrategy;

#[async_trait]
impl Strategy for DagStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Dag
    }

    async fn run(&self, ctx: ExecutionContext) -> Result<(), OrchestratorError> {
        let mut batch =
            |ctx: &ExecutionContext| Ok::<Vec<String>, OrchestratorError>(ctx.state.ready_tasks());
        drive_batches(&ctx, &mut batch).await
    }
}

/// DAG scheduling with condition gates: a conditioned task waits for its
/// referents to reach a terminal status, then either dispatches or is
/// skipped with `condition_unmet` / `dependency_skipped`.
pub struct ConditionalStrategy;

#[async_trait]
impl Strategy for ConditionalStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Conditional
    }

    async fn run(&self, ctx: ExecutionContext) -> Result<(), OrchestratorError> {
        let mut batch = |ctx: &ExecutionContext| conditional_batch(ctx);
        drive_batches(&ctx, &mut batch).await
    }
}

fn conditional_batch(ctx: &ExecutionContext) -> Result<Vec<String>, OrchestratorError> {
    let statuses = ctx.state.statuses();
    let is_completed =
        |id: &str| statuses.get(id).copied() == Some(TaskStatus::Completed);
    let mut eligible: Vec<(usize, String, u8)> = Vec::new();

    for (idx, task) in ctx.workflow.tasks.iter().enumerate() {
        if statuses.get(&task.id).copied() != Some(TaskStatus::Pending) {
            continue;
        }
        let dep_statuses: Vec<TaskStatus> = task
            .dependencies
            .iter()
            .filter_map(|dep| statuses.get(dep).copied())
            .collect();
        if dep_statuses.iter().any(|s| !s.is_terminal()) {
            continue;
        }
        if dep_statuses
            .iter()
            .any(|s| matches!(s, TaskStatus::Failed | TaskStatus::Cancelled))
        {
            ctx.state.mark_skipped(&task.id, SKIP_DEPENDENCY_FAILED)?;
            continue;
        }
        let any_skipped = dep_statuses.iter().any(|s| *s == TaskStatus::Skipped);

        match ctx.conditions.get(&task.id) {
            Some(expr) => {
                let referents = expr.referenced_tasks();
                if referents
                    .iter()
                    .any(|r| statuses.get(r).is_some_and(|s| !s.is_terminal()))
                {
                    continue;
                }
                if expr.evaluate(&|id| is_completed(id)) {
                    eligible.push((idx, task.id.clone(), task.priority));
                } else if any_skipped {
                    ctx.state.mark_skipped(&task.id, SKIP_DEPENDENCY_SKIPPED)?;
                } else {
                    ctx.state.mark_skipped(&task.id, SKIP_CONDITION_UNMET)?;
                }
            }
            None => {
                if any_skipped {
                    ctx.state.mark_skipped(&task.id, SKIP_DEPENDENCY_SKIPPED)?;
                } else {
                    eligible.push((idx, task.id.clone(), task.priority));
                }
            }
        }
    }

    eligible.sort_by_key(|(idx, _, priority)| (Reverse(*priority), *idx));
    Ok(eligible.into_iter().map(|(_, id, _)| id).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskDefinition;

    #[test]
    fn topological_order_respects_dependencies_and_priority() {
        let workflow = WorkflowDefinition::new("wf", "order")
            .with_task(TaskDefinition::new("low", "low root").with_priority(2))
            .with_task(TaskDefinition::new("high", "high root").with_priority(8))
            .with_task(
                TaskDefinition::new("child", "depends on low")
                    .with_priority(10)
                    .with_dependency("low"),
            );
        let order = topological_order(&workflow);
        assert_eq!(order, vec!["high", "low", "child"]);
    }

    #[test]
    fn topological_order_breaks_priority_ties_by_declaration() {
        let workflow = WorkflowDefinition::new("wf", "ties")
            .with_task(TaskDefinition::new("b", "second declared"))
            .with_task(TaskDefinition::new("a", "third declared"))
            .with_task(TaskDefinition::new("c", "first declared").with_priority(6));
        let order = topological_order(&workflow);
        assert_eq!(order, vec!["c", "b", "a"]);
    }

    #[test]
    fn strategy_lookup_covers_concrete_kinds() {
        for kind in [
            StrategyKind::Sequential,
            StrategyKind::Parallel,
            StrategyKind::Dag,
            StrategyKind::Conditional,
        ] {
            let strategy = strategy_for(kind).unwrap();
            assert_eq!(strategy.kind(), kind);
        }
        assert!(strategy_for(StrategyKind::Auto).is_none());
    }
}
