//! Static workflow analysis producing a strategy recommendation.

use crate::types::{StrategyKind, WorkflowDefinition};
use serde::{Deserialize, Serialize};

/// Recommended strategy plus the analysis behind it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyRecommendation {
    pub strategy: StrategyKind,
    pub task_count: usize,
    pub independent_tasks: usize,
    pub has_dependencies: bool,
    pub has_conditions: bool,
    pub rationale: String,
}

/// Pure function: the same workflow always yields the same recommendation.
pub fn recommend_strategy(workflow: &WorkflowDefinition) -> StrategyRecommendation {
    let task_count = workflow.tasks.len();
    let independent_tasks = workflow
        .tasks
        .iter()
        .filter(|t| t.dependencies.is_empty())
        .count();
    let has_dependencies = workflow.has_dependencies();
    let has_conditions = workflow.has_conditions();

    let (strategy, rationale) = if has_conditions {
        (
            StrategyKind::Conditional,
            "tasks carry conditions, so dispatch must evaluate them against execution state"
                .to_string(),
        )
    } else if !has_dependencies && task_count >= 2 {
        (
            StrategyKind::Parallel,
            format!("all {task_count} tasks are independent and can run concurrently"),
        )
    } else if has_dependencies {
        (
            StrategyKind::Dag,
            "declared dependencies allow independent branches to overlap under graph scheduling"
                .to_string(),
        )
    } else {
        (
            StrategyKind::Sequential,
            "the workflow is small and unconstrained, so sequential execution is simplest"
                .to_string(),
        )
    };

    StrategyRecommendation {
        strategy,
        task_count,
        independent_tasks,
        has_dependencies,
        has_conditions,
        rationale,
    }
}
