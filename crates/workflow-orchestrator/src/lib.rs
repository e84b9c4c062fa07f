//! Multi-Agent Workflow Orchestration Engine
//!
//! This crate provides a dependency-aware task scheduler that executes
//! workflows of inter-dependent tasks by dispatching each task to a
//! pluggable asynchronous worker. It includes:
//! - Workflow and task definitions with validation
//! - Four execution strategies (sequential, parallel, DAG, conditional)
//! - Capability-based worker routing with per-worker concurrency limits
//! - Retry, timeout, and cooperative cancellation discipline
//! - Result caching with memory, disk, and hybrid backends
//! - Execution metrics collection and reporting
//! - Workflow graph visualization (Mermaid, DOT, ASCII, JSON)

pub mod cache;
pub mod condition;
pub mod dispatcher;
pub mod metrics;
pub mod orchestrator;
pub mod recommender;
pub mod router;
pub mod state;
pub mod strategy;
pub mod types;
pub mod visualizer;
pub mod worker;

pub use cache::{CacheConfig, CacheStats, CacheStorage, CacheStrategy, DiskCacheStorage, TaskCache};
pub use condition::ConditionExpr;
pub use dispatcher::Dispatcher;
pub use metrics::{AggregateStats, MetricsCollector, TaskExecutionRecord, WorkflowMetrics};
pub use orchestrator::{Orchestrator, OrchestratorConfig, ProgressCallback, ProgressUpdate};
pub use recommender::{recommend_strategy, StrategyRecommendation};
pub use router::{RouteDecision, Router, WorkerRouting, WorkerSlot};
pub use state::{Progress, StateEvent, StateManager, WorkflowStateSnapshot};
pub use strategy::{strategy_for, ExecutionContext, Strategy};
pub use types::{
    Capability, RetryPolicy, StrategyKind, TaskDefinition, TaskError, TaskErrorKind, TaskOutput,
    TaskResult, TaskStatus, WorkflowDefinition, WorkflowStatus,
};
pub use visualizer::{VisualizationFormat, Visualizer};
pub use worker::{InMemorySkillRegistry, SkillRegistry, Worker, WorkerRequest};

use thiserror::Error;

/// Errors surfaced to callers of the orchestration API.
///
/// Per-task execution failures are not represented here; they are captured
/// as [`TaskError`] values inside the returned workflow state.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("workflow validation failed: {0}")]
    Validation(String),

    #[error("cyclic dependency detected among tasks: {0:?}")]
    CyclicDependency(Vec<String>),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}
