//! Workflow graph rendering: Mermaid, Graphviz/DOT, ASCII, and JSON.
//!
//! JSON is the canonical machine-readable form; rendering is deterministic
//! (declared task order throughout), so re-rendering the same inputs is
//! byte-identical. The ASCII form is for humans only.

use crate::state::WorkflowStateSnapshot;
use crate::types::{TaskStatus, WorkflowDefinition};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;

/// Output format selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisualizationFormat {
    Mermaid,
    Dot,
    Ascii,
    Json,
}

/// Canonical JSON document: workflow metadata plus nodes and edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDocument {
    pub workflow: GraphWorkflow,
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphWorkflow {
    pub id: String,
    pub name: String,
    pub strategy: String,
    pub task_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
}

/// Renders a workflow (and optionally its execution state) for inspection.
pub struct Visualizer;

impl Visualizer {
    pub fn render(
        workflow: &WorkflowDefinition,
        state: Option<&WorkflowStateSnapshot>,
        format: VisualizationFormat,
    ) -> String {
        match format {
            VisualizationFormat::Mermaid => Self::mermaid(workflow, state),
            VisualizationFormat::Dot => Self::dot(workflow, state),
            VisualizationFormat::Ascii => Self::ascii(workflow, state),
            VisualizationFormat::Json => Self::json(workflow, state),
        }
    }

    /// Structured graph document backing the JSON rendering.
    pub fn document(
        workflow: &WorkflowDefinition,
        state: Option<&WorkflowStateSnapshot>,
    ) -> GraphDocument {
        let nodes = workflow
            .tasks
            .iter()
            .map(|task| {
                let status = status_of(state, &task.id);
                let result = state.and_then(|s| s.results.get(&task.id));
                GraphNode {
                    id: task.id.clone(),
                    description: task.description.clone(),
                    status,
                    duration_ms: result
                        .and_then(|r| r.duration())
                        .map(|d| d.as_millis() as u64),
                    retries: result
                        .map(|r| r.attempts.saturating_sub(1))
                        .filter(|r| *r > 0),
                }
            })
            .collect();
        let edges = workflow
            .tasks
            .iter()
            .flat_map(|task| {
                task.dependencies.iter().map(|dep| GraphEdge {
                    from: dep.clone(),
                    to: task.id.clone(),
                })
            })
            .collect();
        GraphDocument {
            workflow: GraphWorkflow {
                id: workflow.id.clone(),
                name: workflow.name.clone(),
                strategy: workflow.strategy.to_string(),
                task_count: workflow.tasks.len(),
            },
            nodes,
            edges,
        }
    }

    fn json(workflow: &WorkflowDefinition, state: Option<&WorkflowStateSnapshot>) -> String {
        let document = Self::document(workflow, state);
        serde_json::to_string(&document).unwrap_or_else(|_| "{}".to_string())
    }

    fn mermaid(workflow: &WorkflowDefinition, state: Option<&WorkflowStateSnapshot>) -> String {
        let mut out = String::from("graph TD\n");
        for task in &workflow.tasks {
            let label = node_label(workflow, state, &task.id);
            let _ = writeln!(out, "    {}[\"{}\"]", task.id, label);
        }
        for task in &workflow.tasks {
            for dep in &task.dependencies {
                let _ = writeln!(out, "    {} --> {}", dep, task.id);
            }
        }
        for task in &workflow.tasks {
            let style = match status_of(state, &task.id) {
                TaskStatus::Completed => Some("fill:#c8e6c9,stroke:#2e7d32"),
                TaskStatus::Failed => Some("fill:#ffcdd2,stroke:#c62828"),
                TaskStatus::Running => Some("fill:#bbdefb,stroke:#1565c0"),
                _ => None,
            };
            if let Some(style) = style {
                let _ = writeln!(out, "    style {} {}", task.id, style);
            }
        }
        out
    }

    fn dot(workflow: &WorkflowDefinition, state: Option<&WorkflowStateSnapshot>) -> String {
        let mut out = String::from("digraph Workflow {\n    rankdir=TB;\n");
        for task in &workflow.tasks {
            let label = node_label(workflow, state, &task.id);
            let fillcolor = match status_of(state, &task.id) {
                TaskStatus::Completed => "lightgreen",
                TaskStatus::Failed => "lightcoral",
                TaskStatus::Running => "lightblue",
                TaskStatus::Skipped | TaskStatus::Cancelled => "lightgray",
                _ => "white",
            };
            let _ = writeln!(
                out,
                "    \"{}\" [label=\"{}\", style=filled, fillcolor={}];",
                task.id, label, fillcolor
            );
        }
        for task in &workflow.tasks {
            for dep in &task.dependencies {
                let _ = writeln!(out, "    \"{}\" -> \"{}\";", dep, task.id);
            }
        }
        out.push_str("}\n");
        out
    }

    fn ascii(workflow: &WorkflowDefinition, state: Option<&WorkflowStateSnapshot>) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Workflow: {} ({})", workflow.name, workflow.id);
        for (depth, level) in topological_levels(workflow).iter().enumerate() {
            let rendered: Vec<String> = level
                .iter()
                .map(|id| {
                    let symbol = match status_of(state, id) {
                        TaskStatus::Completed => '✓',
                        TaskStatus::Failed => '✗',
                        TaskStatus::Running => '⟳',
                        TaskStatus::Skipped => '⊘',
                        TaskStatus::Cancelled => '⊗',
                        TaskStatus::Pending | TaskStatus::Ready => '○',
                    };
                    format!("{symbol} {id}")
                })
                .collect();
            let _ = writeln!(out, "  Level {}: {}", depth, rendered.join(" | "));
        }
        out
    }
}

fn status_of(state: Option<&WorkflowStateSnapshot>, task_id: &str) -> TaskStatus {
    state
        .and_then(|s| s.tasks.get(task_id).copied())
        .unwrap_or(TaskStatus::Pending)
}

fn node_label(
    workflow: &WorkflowDefinition,
    state: Option<&WorkflowStateSnapshot>,
    task_id: &str,
) -> String {
    let description = workflow
        .task(task_id)
        .map(|t| t.description.replace('"', "'"))
        .unwrap_or_default();
    let mut label = format!("{task_id}: {description}");
    if let Some(result) = state.and_then(|s| s.results.get(task_id)) {
        if let Some(duration) = result.duration() {
            let _ = write!(label, " ({:.2}s)", duration.as_secs_f64());
        }
        let retries = result.attempts.saturating_sub(1);
        if retries > 0 {
            let _ = write!(label, " [{retries} retries]");
        }
    }
    label
}

/// Group task ids by dependency depth, declared order within each level.
fn topological_levels(workflow: &WorkflowDefinition) -> Vec<Vec<String>> {
    let mut depth: HashMap<&str, usize> = HashMap::new();
    let mut remaining: Vec<&crate::types::TaskDefinition> = workflow.tasks.iter().collect();
    // Validated workflows are acyclic, so each pass settles at least one
    // task; the guard stops runaway loops on unvalidated input.
    let mut passes = 0;
    while !remaining.is_empty() && passes <= workflow.tasks.len() {
        passes += 1;
        remaining.retain(|task| {
            let resolved: Option<usize> = task
                .dependencies
                .iter()
                .map(|dep| depth.get(dep.as_str()).copied())
                .try_fold(0usize, |acc, d| d.map(|d| acc.max(d + 1)));
            match resolved {
                Some(level) => {
                    depth.insert(task.id.as_str(), level);
                    false
                }
                None => true,
            }
        });
    }

    let max_depth = depth.values().copied().max().unwrap_or(0);
    let mut levels = vec![Vec::new(); if depth.is_empty() { 0 } else { max_depth + 1 }];
    for task in &workflow.tasks {
        if let Some(&level) = depth.get(task.id.as_str()) {
            levels[level].push(task.id.clone());
        }
    }
    levels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateManager;
    use crate::types::{TaskDefinition, TaskOutput};

    fn diamond() -> WorkflowDefinition {
        WorkflowDefinition::new("wf", "diamond")
            .with_task(TaskDefinition::new("a", "root"))
            .with_task(TaskDefinition::new("b", "left").with_dependency("a"))
            .with_task(TaskDefinition::new("c", "right").with_dependency("a"))
            .with_task(TaskDefinition::new("d", "join").with_dependencies(["b", "c"]))
    }

    fn executed_snapshot(workflow: &WorkflowDefinition) -> WorkflowStateSnapshot {
        let state = StateManager::new(workflow, false, None);
        state.ready_tasks();
        state.mark_running("a", "w").unwrap();
        state
            .mark_completed("a", TaskOutput::Text("a".into()), false)
            .unwrap();
        state.ready_tasks();
        state.mark_running("b", "w").unwrap();
        state
            .mark_failed(
                "b",
                crate::types::TaskError::new(crate::types::TaskErrorKind::TaskFailed, "boom"),
            )
            .unwrap();
        state.snapshot()
    }

    #[test]
    fn mermaid_contains_nodes_edges_and_styles() {
        let workflow = diamond();
        let snapshot = executed_snapshot(&workflow);
        let rendered = Visualizer::render(&workflow, Some(&snapshot), VisualizationFormat::Mermaid);
        assert!(rendered.starts_with("graph TD"));
        assert!(rendered.contains("a --> b"));
        assert!(rendered.contains("style a fill:#c8e6c9"));
        assert!(rendered.contains("style b fill:#ffcdd2"));
    }

    #[test]
    fn dot_renders_digraph_with_fillcolors() {
        let workflow = diamond();
        let snapshot = executed_snapshot(&workflow);
        let rendered = Visualizer::render(&workflow, Some(&snapshot), VisualizationFormat::Dot);
        assert!(rendered.starts_with("digraph Workflow {"));
        assert!(rendered.contains("\"a\" -> \"b\";"));
        assert!(rendered.contains("fillcolor=lightgreen"));
        assert!(rendered.contains("fillcolor=lightcoral"));
    }

    #[test]
    fn ascii_groups_by_topological_level() {
        let workflow = diamond();
        let rendered = Visualizer::render(&workflow, None, VisualizationFormat::Ascii);
        assert!(rendered.contains("Level 0: ○ a"));
        assert!(rendered.contains("Level 1: ○ b | ○ c"));
        assert!(rendered.contains("Level 2: ○ d"));
    }

    #[test]
    fn json_round_trip_is_byte_identical() {
        let workflow = diamond();
        let snapshot = executed_snapshot(&workflow);
        let first = Visualizer::render(&workflow, Some(&snapshot), VisualizationFormat::Json);
        let parsed: GraphDocument = serde_json::from_str(&first).unwrap();
        let second = serde_json::to_string(&parsed).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn json_document_lists_nodes_and_edges_in_declared_order() {
        let workflow = diamond();
        let document = Visualizer::document(&workflow, None);
        let ids: Vec<&str> = document.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
        assert_eq!(document.edges.len(), 4);
        assert_eq!(document.edges[0].from, "a");
        assert_eq!(document.edges[0].to, "b");
        assert_eq!(document.workflow.task_count, 4);
    }
}
