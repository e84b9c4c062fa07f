//! Task and workflow definitions, statuses, and validation.
//!
//! Definitions are immutable once submitted; all runtime state lives in the
//! state manager. Validation runs before execution and rejects structural
//! problems synchronously.

use crate::condition::ConditionExpr;
use crate::OrchestratorError;
use chrono::{DateTime, Utc};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

/// Closed set of competences a worker can advertise and a task can require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    General,
    CodeAnalysis,
    CodeGeneration,
    Testing,
    Debugging,
    Documentation,
    DataProcessing,
    FileOperations,
    ApiIntegration,
    Research,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::General => "general",
            Capability::CodeAnalysis => "code_analysis",
            Capability::CodeGeneration => "code_generation",
            Capability::Testing => "testing",
            Capability::Debugging => "debugging",
            Capability::Documentation => "documentation",
            Capability::DataProcessing => "data_processing",
            Capability::FileOperations => "file_operations",
            Capability::ApiIntegration => "api_integration",
            Capability::Research => "research",
        }
    }
}

/// Retry policy for failed task attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(30_000),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff delay before the retry that follows `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exp);
        let capped = raw.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

/// A single unit of work with a worker-computable result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: String,
    pub description: String,
    pub task_type: Option<String>,
    pub dependencies: Vec<String>,
    pub required_capabilities: Vec<Capability>,
    pub required_skills: Vec<String>,
    /// Scheduling priority in `[1, 10]`; higher runs first.
    pub priority: u8,
    pub timeout: Option<Duration>,
    pub retry_policy: RetryPolicy,
    pub parameters: HashMap<String, serde_json::Value>,
    /// Explicit worker-type override; bypasses capability matching.
    pub worker_type: Option<String>,
    /// Boolean expression over other task ids, evaluated before dispatch.
    pub condition: Option<String>,
}

impl TaskDefinition {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            task_type: None,
            dependencies: Vec::new(),
            required_capabilities: Vec::new(),
            required_skills: Vec::new(),
            priority: 5,
            timeout: None,
            retry_policy: RetryPolicy::none(),
            parameters: HashMap::new(),
            worker_type: None,
            condition: None,
        }
    }

    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.dependencies.push(dep.into());
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.required_capabilities.push(capability);
        self
    }

    pub fn with_skill(mut self, skill: impl Into<String>) -> Self {
        self.required_skills.push(skill.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_worker_type(mut self, worker_type: impl Into<String>) -> Self {
        self.worker_type = Some(worker_type.into());
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

/// Execution strategy selector for a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Let the recommender pick based on workflow shape.
    Auto,
    Sequential,
    Parallel,
    Dag,
    Conditional,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StrategyKind::Auto => "auto",
            StrategyKind::Sequential => "sequential",
            StrategyKind::Parallel => "parallel",
            StrategyKind::Dag => "dag",
            StrategyKind::Conditional => "conditional",
        };
        f.write_str(name)
    }
}

/// A DAG of tasks submitted as a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    pub tasks: Vec<TaskDefinition>,
    pub strategy: StrategyKind,
    pub default_timeout: Option<Duration>,
    pub max_parallel_tasks: usize,
    /// Keep scheduling unrelated tasks after a failure. Dependents of a
    /// failed task are always skipped regardless of this flag.
    pub continue_on_failure: bool,
    pub metadata: HashMap<String, String>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            tasks: Vec::new(),
            strategy: StrategyKind::Auto,
            default_timeout: None,
            max_parallel_tasks: 4,
            continue_on_failure: false,
            metadata: HashMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_task(mut self, task: TaskDefinition) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn with_max_parallel_tasks(mut self, max: usize) -> Self {
        self.max_parallel_tasks = max;
        self
    }

    pub fn with_continue_on_failure(mut self, flag: bool) -> Self {
        self.continue_on_failure = flag;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn task(&self, id: &str) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn has_dependencies(&self) -> bool {
        self.tasks.iter().any(|t| !t.dependencies.is_empty())
    }

    pub fn has_conditions(&self) -> bool {
        self.tasks
            .iter()
            .any(|t| t.condition.as_deref().is_some_and(|c| !c.trim().is_empty()))
    }

    /// Validate structural invariants and parse condition expressions.
    ///
    /// Returns the parsed condition ASTs keyed by task id so evaluation
    /// never re-parses. Cycle detection covers declared dependencies plus
    /// condition references, since a condition referent must reach a
    /// terminal status before the conditioned task can be evaluated.
    pub fn validate(&self) -> Result<HashMap<String, ConditionExpr>, OrchestratorError> {
        if self.max_parallel_tasks < 1 {
            return Err(OrchestratorError::Validation(format!(
                "workflow '{}': max_parallel_tasks must be >= 1",
                self.id
            )));
        }

        let mut ids = HashSet::new();
        for task in &self.tasks {
            if !ids.insert(task.id.as_str()) {
                return Err(OrchestratorError::Validation(format!(
                    "duplicate task id '{}'",
                    task.id
                )));
            }
            if !(1..=10).contains(&task.priority) {
                return Err(OrchestratorError::Validation(format!(
                    "task '{}': priority {} outside [1, 10]",
                    task.id, task.priority
                )));
            }
            if task.retry_policy.max_delay < task.retry_policy.initial_delay {
                return Err(OrchestratorError::Validation(format!(
                    "task '{}': retry max_delay is below initial_delay",
                    task.id
                )));
            }
            if task.retry_policy.backoff_multiplier < 1.0 {
                return Err(OrchestratorError::Validation(format!(
                    "task '{}': backoff_multiplier must be >= 1.0",
                    task.id
                )));
            }
        }

        for task in &self.tasks {
            for dep in &task.dependencies {
                if !ids.contains(dep.as_str()) {
                    return Err(OrchestratorError::Validation(format!(
                        "task '{}' depends on unknown task '{}'",
                        task.id, dep
                    )));
                }
                if dep == &task.id {
                    return Err(OrchestratorError::CyclicDependency(vec![task.id.clone()]));
                }
            }
        }

        let mut conditions = HashMap::new();
        for task in &self.tasks {
            if let Some(raw) = task.condition.as_deref() {
                if raw.trim().is_empty() {
                    continue;
                }
                let expr = ConditionExpr::parse(raw).map_err(|e| {
                    OrchestratorError::Validation(format!(
                        "task '{}': invalid condition: {}",
                        task.id, e
                    ))
                })?;
                for referent in expr.referenced_tasks() {
                    if !ids.contains(referent.as_str()) {
                        return Err(OrchestratorError::Validation(format!(
                            "task '{}': condition references unknown task '{}'",
                            task.id, referent
                        )));
                    }
                }
                conditions.insert(task.id.clone(), expr);
            }
        }

        self.check_cycles(&conditions)?;
        Ok(conditions)
    }

    fn check_cycles(
        &self,
        conditions: &HashMap<String, ConditionExpr>,
    ) -> Result<(), OrchestratorError> {
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut indices: HashMap<&str, NodeIndex> = HashMap::new();
        for task in &self.tasks {
            let idx = graph.add_node(task.id.as_str());
            indices.insert(task.id.as_str(), idx);
        }
        for task in &self.tasks {
            let to = indices[task.id.as_str()];
            for dep in &task.dependencies {
                if let Some(&from) = indices.get(dep.as_str()) {
                    graph.add_edge(from, to, ());
                }
            }
            if let Some(expr) = conditions.get(&task.id) {
                for referent in expr.referenced_tasks() {
                    if referent != task.id {
                        if let Some(&from) = indices.get(referent.as_str()) {
                            graph.add_edge(from, to, ());
                        }
                    } else {
                        return Err(OrchestratorError::CyclicDependency(vec![task.id.clone()]));
                    }
                }
            }
        }

        for scc in tarjan_scc(&graph) {
            if scc.len() > 1 {
                let mut names: Vec<String> =
                    scc.iter().map(|idx| graph[*idx].to_string()).collect();
                names.sort();
                return Err(OrchestratorError::CyclicDependency(names));
            }
        }
        Ok(())
    }
}

/// Per-task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped | TaskStatus::Cancelled
        )
    }

    /// Transition legality: pending→ready→running→terminal, running→running
    /// on retry, skipped only from pending/ready, cancelled from any
    /// non-terminal status.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match (self, next) {
            (TaskStatus::Pending, TaskStatus::Ready) => true,
            (TaskStatus::Pending | TaskStatus::Ready, TaskStatus::Skipped) => true,
            (TaskStatus::Ready, TaskStatus::Running) => true,
            // Scheduling errors fail a task that never started running.
            (TaskStatus::Ready, TaskStatus::Failed) => true,
            (
                TaskStatus::Running,
                TaskStatus::Running | TaskStatus::Completed | TaskStatus::Failed,
            ) => true,
            (from, TaskStatus::Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Overall workflow status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Opaque task output envelope. Cache serialization goes through this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum TaskOutput {
    Text(String),
    Json(serde_json::Value),
    Binary(Vec<u8>),
}

impl TaskOutput {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            TaskOutput::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// String error kinds surfaced in task results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskErrorKind {
    ValidationError,
    CyclicDependency,
    NoWorkerAvailable,
    TaskTimeout,
    TaskFailed,
    DependencyFailed,
    RequiredSkillNotFound,
    Cancelled,
    InternalError,
}

impl TaskErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskErrorKind::ValidationError => "ValidationError",
            TaskErrorKind::CyclicDependency => "CyclicDependency",
            TaskErrorKind::NoWorkerAvailable => "NoWorkerAvailable",
            TaskErrorKind::TaskTimeout => "TaskTimeout",
            TaskErrorKind::TaskFailed => "TaskFailed",
            TaskErrorKind::DependencyFailed => "DependencyFailed",
            TaskErrorKind::RequiredSkillNotFound => "RequiredSkillNotFound",
            TaskErrorKind::Cancelled => "Cancelled",
            TaskErrorKind::InternalError => "InternalError",
        }
    }
}

/// Structured execution error recorded in a task result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
    pub payload: Option<serde_json::Value>,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

/// Terminal record for one task execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub worker_id: Option<String>,
    pub output: Option<TaskOutput>,
    pub error: Option<TaskError>,
    pub skip_reason: Option<String>,
    pub from_cache: bool,
}

impl TaskResult {
    pub(crate) fn pending(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Pending,
            started_at: None,
            completed_at: None,
            attempts: 0,
            worker_id: None,
            output: None,
            error: None,
            skip_reason: None,
            from_cache: false,
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => (end - start).to_std().ok(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_workflow() -> WorkflowDefinition {
        WorkflowDefinition::new("wf", "chain")
            .with_task(TaskDefinition::new("a", "first"))
            .with_task(TaskDefinition::new("b", "second").with_dependency("a"))
    }

    #[test]
    fn validate_accepts_simple_chain() {
        let conditions = chain_workflow().validate().unwrap();
        assert!(conditions.is_empty());
    }

    #[test]
    fn validate_rejects_duplicate_ids() {
        let workflow = WorkflowDefinition::new("wf", "dup")
            .with_task(TaskDefinition::new("a", "one"))
            .with_task(TaskDefinition::new("a", "two"));
        assert!(matches!(
            workflow.validate(),
            Err(OrchestratorError::Validation(_))
        ));
    }

    #[test]
    fn validate_rejects_unknown_dependency() {
        let workflow = WorkflowDefinition::new("wf", "missing")
            .with_task(TaskDefinition::new("a", "one").with_dependency("ghost"));
        assert!(matches!(
            workflow.validate(),
            Err(OrchestratorError::Validation(_))
        ));
    }

    #[test]
    fn validate_rejects_cycle_and_names_it() {
        let workflow = WorkflowDefinition::new("wf", "cycle")
            .with_task(TaskDefinition::new("a", "one").with_dependency("b"))
            .with_task(TaskDefinition::new("b", "two").with_dependency("a"));
        match workflow.validate() {
            Err(OrchestratorError::CyclicDependency(names)) => {
                assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_priority_out_of_range() {
        let workflow =
            WorkflowDefinition::new("wf", "prio").with_task(TaskDefinition::new("a", "one").with_priority(11));
        assert!(matches!(
            workflow.validate(),
            Err(OrchestratorError::Validation(_))
        ));
    }

    #[test]
    fn validate_rejects_condition_referencing_unknown_task() {
        let workflow = WorkflowDefinition::new("wf", "cond")
            .with_task(TaskDefinition::new("a", "one").with_condition("ghost"));
        assert!(matches!(
            workflow.validate(),
            Err(OrchestratorError::Validation(_))
        ));
    }

    #[test]
    fn validate_parses_conditions_once() {
        let workflow = WorkflowDefinition::new("wf", "cond")
            .with_task(TaskDefinition::new("check", "probe"))
            .with_task(TaskDefinition::new("fix", "repair").with_condition("NOT check"));
        let conditions = workflow.validate().unwrap();
        assert!(conditions.contains_key("fix"));
    }

    #[test]
    fn condition_reference_cycles_are_rejected() {
        let workflow = WorkflowDefinition::new("wf", "cond-cycle")
            .with_task(TaskDefinition::new("a", "one").with_condition("b"))
            .with_task(TaskDefinition::new("b", "two").with_dependency("a"));
        assert!(matches!(
            workflow.validate(),
            Err(OrchestratorError::CyclicDependency(_))
        ));
    }

    #[test]
    fn retry_delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(300),
            jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(300));
    }

    #[test]
    fn status_transitions_follow_lifecycle() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Ready));
        assert!(TaskStatus::Ready.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Cancelled));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Skipped));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Cancelled));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Running));
    }

    #[test]
    fn error_kinds_render_stable_codes() {
        assert_eq!(TaskErrorKind::TaskTimeout.as_str(), "TaskTimeout");
        assert_eq!(
            serde_json::to_string(&TaskErrorKind::NoWorkerAvailable).unwrap(),
            "\"NoWorkerAvailable\""
        );
    }
}
