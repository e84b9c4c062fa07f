//! Authoritative per-task execution state.
//!
//! The state manager is the only component that mutates task status. All
//! transitions go through one critical section, append to the event log,
//! and notify the progress hook after the lock is released.

use crate::types::{
    TaskDefinition, TaskError, TaskErrorKind, TaskOutput, TaskResult, TaskStatus,
    WorkflowDefinition, WorkflowStatus,
};
use crate::OrchestratorError;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use uuid::Uuid;

pub const SKIP_DEPENDENCY_FAILED: &str = "dependency_failed";
pub const SKIP_DEPENDENCY_SKIPPED: &str = "dependency_skipped";
pub const SKIP_CONDITION_UNMET: &str = "condition_unmet";

/// One recorded state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEvent {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub task_id: String,
    pub from: Option<TaskStatus>,
    pub to: TaskStatus,
    pub note: Option<String>,
}

/// Status counts plus completion percentage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub workflow_id: String,
    pub total: usize,
    pub pending: usize,
    pub ready: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub percent_complete: f64,
}

/// Read-only snapshot handed to progress callbacks after each transition.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressUpdate {
    pub workflow_id: String,
    pub task_id: String,
    pub status: TaskStatus,
    pub progress: Progress,
}

/// Callback invoked after every state transition. Panics are caught and
/// logged, never propagated.
pub type ProgressCallback = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Full picture of a workflow run, returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowStateSnapshot {
    pub workflow_id: String,
    /// Unique identifier of this execution of the workflow.
    pub run_id: Uuid,
    pub status: WorkflowStatus,
    pub tasks: HashMap<String, TaskStatus>,
    pub results: HashMap<String, TaskResult>,
    pub events: Vec<StateEvent>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowStateSnapshot {
    pub fn result(&self, task_id: &str) -> Option<&TaskResult> {
        self.results.get(task_id)
    }
}

struct StateInner {
    statuses: HashMap<String, TaskStatus>,
    results: HashMap<String, TaskResult>,
    events: Vec<StateEvent>,
    seq: u64,
    overall: WorkflowStatus,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl StateInner {
    fn push_event(&mut self, task_id: &str, from: Option<TaskStatus>, to: TaskStatus, note: Option<String>) {
        self.seq += 1;
        self.events.push(StateEvent {
            seq: self.seq,
            timestamp: Utc::now(),
            task_id: task_id.to_string(),
            from,
            to,
            note,
        });
    }

    fn progress(&self, workflow_id: &str) -> Progress {
        let mut progress = Progress {
            workflow_id: workflow_id.to_string(),
            total: self.statuses.len(),
            pending: 0,
            ready: 0,
            running: 0,
            completed: 0,
            failed: 0,
            skipped: 0,
            cancelled: 0,
            percent_complete: 0.0,
        };
        for status in self.statuses.values() {
            match status {
                TaskStatus::Pending => progress.pending += 1,
                TaskStatus::Ready => progress.ready += 1,
                TaskStatus::Running => progress.running += 1,
                TaskStatus::Completed => progress.completed += 1,
                TaskStatus::Failed => progress.failed += 1,
                TaskStatus::Skipped => progress.skipped += 1,
                TaskStatus::Cancelled => progress.cancelled += 1,
            }
        }
        let terminal = progress.completed + progress.failed + progress.skipped + progress.cancelled;
        if progress.total > 0 {
            progress.percent_complete = terminal as f64 / progress.total as f64 * 100.0;
        }
        progress
    }
}

/// Owns the status map for a single workflow run.
pub struct StateManager {
    workflow_id: String,
    run_id: Uuid,
    order: Vec<String>,
    deps: HashMap<String, Vec<String>>,
    dependents: HashMap<String, Vec<String>>,
    priorities: HashMap<String, u8>,
    conditioned: HashSet<String>,
    conditional_mode: bool,
    inner: RwLock<StateInner>,
    progress_hook: Option<ProgressCallback>,
}

impl StateManager {
    pub fn new(
        workflow: &WorkflowDefinition,
        conditional_mode: bool,
        progress_hook: Option<ProgressCallback>,
    ) -> Self {
        let order: Vec<String> = workflow.tasks.iter().map(|t| t.id.clone()).collect();
        let mut deps = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        let mut priorities = HashMap::new();
        let mut conditioned = HashSet::new();
        let mut statuses = HashMap::new();
        let mut results = HashMap::new();

        for task in &workflow.tasks {
            deps.insert(task.id.clone(), task.dependencies.clone());
            priorities.insert(task.id.clone(), task.priority);
            if task.condition.as_deref().is_some_and(|c| !c.trim().is_empty()) {
                conditioned.insert(task.id.clone());
            }
            for dep in &task.dependencies {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(task.id.clone());
            }
            statuses.insert(task.id.clone(), TaskStatus::Pending);
            results.insert(task.id.clone(), TaskResult::pending(&task.id));
        }

        Self {
            workflow_id: workflow.id.clone(),
            run_id: Uuid::new_v4(),
            order,
            deps,
            dependents,
            priorities,
            conditioned,
            conditional_mode,
            inner: RwLock::new(StateInner {
                statuses,
                results,
                events: Vec::new(),
                seq: 0,
                overall: WorkflowStatus::Pending,
                started_at: None,
                finished_at: None,
            }),
            progress_hook,
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn begin(&self) {
        let mut inner = self.inner.write();
        inner.overall = WorkflowStatus::Running;
        inner.started_at = Some(Utc::now());
        tracing::debug!(
            workflow_id = %self.workflow_id,
            run_id = %self.run_id,
            "workflow state initialized"
        );
    }

    pub fn finish(&self, status: WorkflowStatus) {
        let mut inner = self.inner.write();
        inner.overall = status;
        inner.finished_at = Some(Utc::now());
    }

    pub fn overall_status(&self) -> WorkflowStatus {
        self.inner.read().overall
    }

    pub fn status(&self, task_id: &str) -> Option<TaskStatus> {
        self.inner.read().statuses.get(task_id).copied()
    }

    pub fn result(&self, task_id: &str) -> Option<TaskResult> {
        self.inner.read().results.get(task_id).cloned()
    }

    pub fn statuses(&self) -> HashMap<String, TaskStatus> {
        self.inner.read().statuses.clone()
    }

    pub fn events(&self) -> Vec<StateEvent> {
        self.inner.read().events.clone()
    }

    pub fn all_terminal(&self) -> bool {
        self.inner.read().statuses.values().all(|s| s.is_terminal())
    }

    pub fn any_non_completed(&self) -> bool {
        self.inner
            .read()
            .statuses
            .values()
            .any(|s| *s != TaskStatus::Completed)
    }

    /// Outputs of the task's completed dependencies, keyed by dependency id.
    pub fn dependency_outputs(&self, task: &TaskDefinition) -> HashMap<String, TaskOutput> {
        let inner = self.inner.read();
        let mut outputs = HashMap::new();
        for dep in &task.dependencies {
            if let Some(result) = inner.results.get(dep) {
                if let Some(output) = &result.output {
                    outputs.insert(dep.clone(), output.clone());
                }
            }
        }
        outputs
    }

    pub fn progress(&self) -> Progress {
        self.inner.read().progress(&self.workflow_id)
    }

    pub fn snapshot(&self) -> WorkflowStateSnapshot {
        let inner = self.inner.read();
        WorkflowStateSnapshot {
            workflow_id: self.workflow_id.clone(),
            run_id: self.run_id,
            status: inner.overall,
            tasks: inner.statuses.clone(),
            results: inner.results.clone(),
            events: inner.events.clone(),
            started_at: inner.started_at,
            finished_at: inner.finished_at,
        }
    }

    /// Ids of tasks whose dependencies have all completed, in dispatch
    /// order (priority descending, then declared order). Pending tasks
    /// crossing the threshold are transitioned to `ready`.
    pub fn ready_tasks(&self) -> Vec<String> {
        let mut updates = Vec::new();
        let mut ready = Vec::new();
        {
            let mut inner = self.inner.write();
            for id in &self.order {
                let status = inner.statuses[id];
                match status {
                    TaskStatus::Ready => ready.push(id.clone()),
                    TaskStatus::Pending => {
                        let deps_done = self.deps[id]
                            .iter()
                            .all(|dep| inner.statuses[dep] == TaskStatus::Completed);
                        if deps_done {
                            inner.statuses.insert(id.clone(), TaskStatus::Ready);
                            if let Some(result) = inner.results.get_mut(id) {
                                result.status = TaskStatus::Ready;
                            }
                            inner.push_event(id, Some(TaskStatus::Pending), TaskStatus::Ready, None);
                            updates.push(self.update_for(&inner, id, TaskStatus::Ready));
                            ready.push(id.clone());
                        }
                    }
                    _ => {}
                }
            }
        }
        for update in updates {
            self.emit(update);
        }
        let index: HashMap<&String, usize> =
            self.order.iter().enumerate().map(|(i, id)| (id, i)).collect();
        ready.sort_by_key(|id| (std::cmp::Reverse(self.priorities[id]), index[id]));
        ready
    }

    /// Explicit pending→ready promotion, used by the conditional strategy
    /// once a task's condition has been evaluated.
    pub fn make_ready(&self, task_id: &str) -> Result<(), OrchestratorError> {
        self.transition(task_id, TaskStatus::Ready, None, |_| {})
    }

    pub fn mark_running(&self, task_id: &str, worker_id: &str) -> Result<(), OrchestratorError> {
        let worker = worker_id.to_string();
        let note = Some(format!("worker={worker_id}"));
        self.transition(task_id, TaskStatus::Running, note, move |result| {
            result.attempts += 1;
            if result.started_at.is_none() {
                result.started_at = Some(Utc::now());
            }
            result.worker_id = Some(worker);
        })
    }

    pub fn mark_completed(
        &self,
        task_id: &str,
        output: TaskOutput,
        from_cache: bool,
    ) -> Result<(), OrchestratorError> {
        // Cache hits complete straight from pending/ready without a
        // running phase; route them through ready first.
        if from_cache {
            match self.status(task_id) {
                Some(TaskStatus::Pending) => {
                    self.transition(task_id, TaskStatus::Ready, None, |_| {})?;
                    self.transition(task_id, TaskStatus::Running, Some("cache".into()), |result| {
                        result.started_at = Some(Utc::now());
                    })?;
                }
                Some(TaskStatus::Ready) => {
                    self.transition(task_id, TaskStatus::Running, Some("cache".into()), |result| {
                        result.started_at = Some(Utc::now());
                    })?;
                }
                _ => {}
            }
        }
        let note = from_cache.then(|| "cache_hit".to_string());
        self.transition(task_id, TaskStatus::Completed, note, move |result| {
            result.completed_at = Some(Utc::now());
            result.output = Some(output);
            result.from_cache = from_cache;
        })
    }

    pub fn mark_failed(&self, task_id: &str, error: TaskError) -> Result<(), OrchestratorError> {
        let note = Some(error.to_string());
        self.transition(task_id, TaskStatus::Failed, note, move |result| {
            result.completed_at = Some(Utc::now());
            result.error = Some(error);
        })?;
        self.cascade_skips(task_id, SKIP_DEPENDENCY_FAILED);
        Ok(())
    }

    pub fn mark_skipped(&self, task_id: &str, reason: &str) -> Result<(), OrchestratorError> {
        let owned = reason.to_string();
        self.transition(task_id, TaskStatus::Skipped, Some(owned.clone()), move |result| {
            result.completed_at = Some(Utc::now());
            result.skip_reason = Some(owned);
        })?;
        self.cascade_skips(task_id, SKIP_DEPENDENCY_SKIPPED);
        Ok(())
    }

    pub fn mark_cancelled(&self, task_id: &str) -> Result<(), OrchestratorError> {
        self.transition(task_id, TaskStatus::Cancelled, None, |result| {
            result.completed_at = Some(Utc::now());
        })?;
        self.cascade_skips(task_id, SKIP_DEPENDENCY_FAILED);
        Ok(())
    }

    /// Drive every non-terminal task to `cancelled`. Used on workflow
    /// cancellation and on early stop, so the returned state never leaves a
    /// task without a terminal status.
    pub fn cancel_all_non_terminal(&self) -> Vec<String> {
        let non_terminal: Vec<String> = {
            let inner = self.inner.read();
            self.order
                .iter()
                .filter(|id| !inner.statuses[*id].is_terminal())
                .cloned()
                .collect()
        };
        let mut cancelled = Vec::new();
        for id in non_terminal {
            if self
                .transition(&id, TaskStatus::Cancelled, Some("workflow_stopped".into()), |result| {
                    result.completed_at = Some(Utc::now());
                })
                .is_ok()
            {
                cancelled.push(id);
            }
        }
        cancelled
    }

    /// Transitively skip pending/ready dependents of a terminally
    /// non-completed task. In conditional mode, a dependent carrying its own
    /// condition survives a *skipped* dependency; the strategy re-evaluates
    /// its condition instead.
    fn cascade_skips(&self, root: &str, direct_reason: &str) {
        let mut queue: VecDeque<(String, &str)> = VecDeque::new();
        queue.push_back((root.to_string(), direct_reason));
        while let Some((cause, reason)) = queue.pop_front() {
            let Some(children) = self.dependents.get(&cause) else {
                continue;
            };
            for child in children {
                let child_status = self.status(child);
                if !matches!(child_status, Some(TaskStatus::Pending | TaskStatus::Ready)) {
                    continue;
                }
                let cause_skipped = reason == SKIP_DEPENDENCY_SKIPPED;
                if self.conditional_mode && cause_skipped && self.conditioned.contains(child) {
                    continue;
                }
                let owned = reason.to_string();
                let cause_name = cause.clone();
                let applied = self.transition(
                    child,
                    TaskStatus::Skipped,
                    Some(owned.clone()),
                    move |result| {
                        result.completed_at = Some(Utc::now());
                        result.skip_reason = Some(owned);
                        result.error = Some(TaskError::new(
                            TaskErrorKind::DependencyFailed,
                            format!("dependency '{cause_name}' did not complete"),
                        ));
                    },
                );
                if applied.is_ok() {
                    queue.push_back((child.clone(), SKIP_DEPENDENCY_SKIPPED));
                }
            }
        }
    }

    fn transition(
        &self,
        task_id: &str,
        to: TaskStatus,
        note: Option<String>,
        mutate: impl FnOnce(&mut TaskResult),
    ) -> Result<(), OrchestratorError> {
        let update = {
            let mut inner = self.inner.write();
            let current = *inner.statuses.get(task_id).ok_or_else(|| {
                OrchestratorError::Internal(format!("unknown task '{task_id}'"))
            })?;
            if !current.can_transition_to(to) {
                return Err(OrchestratorError::Internal(format!(
                    "illegal transition for task '{task_id}': {current} -> {to}"
                )));
            }
            inner.statuses.insert(task_id.to_string(), to);
            let result = inner.results.get_mut(task_id).ok_or_else(|| {
                OrchestratorError::Internal(format!("missing result slot for '{task_id}'"))
            })?;
            result.status = to;
            mutate(result);
            inner.push_event(task_id, Some(current), to, note);
            self.update_for(&inner, task_id, to)
        };
        tracing::debug!(
            workflow_id = %self.workflow_id,
            task_id = %task_id,
            status = %to,
            "task state transition"
        );
        self.emit(update);
        Ok(())
    }

    fn update_for(&self, inner: &StateInner, task_id: &str, status: TaskStatus) -> ProgressUpdate {
        ProgressUpdate {
            workflow_id: self.workflow_id.clone(),
            task_id: task_id.to_string(),
            status,
            progress: inner.progress(&self.workflow_id),
        }
    }

    fn emit(&self, update: ProgressUpdate) {
        if let Some(hook) = &self.progress_hook {
            let hook = hook.clone();
            if catch_unwind(AssertUnwindSafe(|| hook(update))).is_err() {
                tracing::warn!(
                    workflow_id = %self.workflow_id,
                    "progress callback panicked; continuing"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskDefinition;

    fn diamond() -> WorkflowDefinition {
        WorkflowDefinition::new("wf", "diamond")
            .with_task(TaskDefinition::new("a", "root"))
            .with_task(TaskDefinition::new("b", "left").with_dependency("a"))
            .with_task(TaskDefinition::new("c", "right").with_dependency("a"))
            .with_task(TaskDefinition::new("d", "join").with_dependencies(["b", "c"]))
    }

    fn complete(state: &StateManager, id: &str) {
        state.mark_running(id, "w").unwrap();
        state
            .mark_completed(id, TaskOutput::Text(id.to_string()), false)
            .unwrap();
    }

    #[test]
    fn ready_set_follows_dependencies() {
        let state = StateManager::new(&diamond(), false, None);
        assert_eq!(state.ready_tasks(), vec!["a".to_string()]);
        complete(&state, "a");
        assert_eq!(state.ready_tasks(), vec!["b".to_string(), "c".to_string()]);
        complete(&state, "b");
        assert_eq!(state.ready_tasks(), vec!["c".to_string()]);
        complete(&state, "c");
        assert_eq!(state.ready_tasks(), vec!["d".to_string()]);
    }

    #[test]
    fn ready_set_orders_by_priority_then_declaration() {
        let workflow = WorkflowDefinition::new("wf", "prio")
            .with_task(TaskDefinition::new("low", "low").with_priority(2))
            .with_task(TaskDefinition::new("high", "high").with_priority(9))
            .with_task(TaskDefinition::new("mid", "mid").with_priority(2));
        let state = StateManager::new(&workflow, false, None);
        assert_eq!(
            state.ready_tasks(),
            vec!["high".to_string(), "low".to_string(), "mid".to_string()]
        );
    }

    #[test]
    fn failure_cascades_skips_to_dependents() {
        let state = StateManager::new(&diamond(), false, None);
        state.ready_tasks();
        state.mark_running("a", "w").unwrap();
        state
            .mark_failed("a", TaskError::new(TaskErrorKind::TaskFailed, "boom"))
            .unwrap();
        assert_eq!(state.status("b"), Some(TaskStatus::Skipped));
        assert_eq!(state.status("c"), Some(TaskStatus::Skipped));
        assert_eq!(state.status("d"), Some(TaskStatus::Skipped));
        let b = state.result("b").unwrap();
        assert_eq!(b.skip_reason.as_deref(), Some(SKIP_DEPENDENCY_FAILED));
        let d = state.result("d").unwrap();
        assert_eq!(d.skip_reason.as_deref(), Some(SKIP_DEPENDENCY_SKIPPED));
        assert!(state.all_terminal());
    }

    #[test]
    fn conditional_dependent_survives_skipped_dependency() {
        let workflow = WorkflowDefinition::new("wf", "cond")
            .with_task(TaskDefinition::new("a", "root"))
            .with_task(TaskDefinition::new("b", "gated").with_dependency("a").with_condition("NOT a"))
            .with_task(TaskDefinition::new("c", "plain").with_dependency("a"));
        let state = StateManager::new(&workflow, true, None);
        state.mark_skipped("a", SKIP_CONDITION_UNMET).unwrap();
        assert_eq!(state.status("b"), Some(TaskStatus::Pending));
        assert_eq!(state.status("c"), Some(TaskStatus::Skipped));
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let state = StateManager::new(&diamond(), false, None);
        assert!(state.mark_running("a", "w").is_err());
        state.ready_tasks();
        assert!(state.mark_running("d", "w").is_err());
    }

    #[test]
    fn progress_counts_and_percentage() {
        let state = StateManager::new(&diamond(), false, None);
        state.ready_tasks();
        complete(&state, "a");
        let progress = state.progress();
        assert_eq!(progress.total, 4);
        assert_eq!(progress.completed, 1);
        assert!((progress.percent_complete - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn events_record_transitions_in_order() {
        let state = StateManager::new(&diamond(), false, None);
        state.ready_tasks();
        complete(&state, "a");
        let events = state.events();
        let a_events: Vec<TaskStatus> = events
            .iter()
            .filter(|e| e.task_id == "a")
            .map(|e| e.to)
            .collect();
        assert_eq!(
            a_events,
            vec![TaskStatus::Ready, TaskStatus::Running, TaskStatus::Completed]
        );
        assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[test]
    fn progress_hook_sees_every_transition() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let hook: ProgressCallback = Arc::new(move |update: ProgressUpdate| {
            sink.lock().push((update.task_id, update.status));
        });
        let state = StateManager::new(&diamond(), false, Some(hook));
        state.ready_tasks();
        complete(&state, "a");
        let seen = seen.lock();
        assert!(seen.contains(&("a".to_string(), TaskStatus::Running)));
        assert!(seen.contains(&("a".to_string(), TaskStatus::Completed)));
    }

    #[test]
    fn cancel_all_drives_everything_terminal() {
        let state = StateManager::new(&diamond(), false, None);
        state.ready_tasks();
        state.mark_running("a", "w").unwrap();
        let cancelled = state.cancel_all_non_terminal();
        assert_eq!(cancelled.len(), 4);
        assert!(state.all_terminal());
    }
}
