//! Execution metrics: per-task records, per-workflow aggregates, and a
//! human-readable report.
//!
//! Writes are append-only under a short lock; aggregates are computed on
//! read so recording stays cheap on the dispatch path.

use crate::types::TaskStatus;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::Duration;

/// One terminal task execution as observed by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecutionRecord {
    pub workflow_id: String,
    pub task_id: String,
    pub status: TaskStatus,
    pub duration: Duration,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retries: u32,
    pub worker_id: Option<String>,
    pub error: Option<String>,
    pub from_cache: bool,
}

/// Aggregates for a single workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowMetrics {
    pub workflow_id: String,
    pub total_tasks: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub cache_hits: usize,
    pub average_duration: Duration,
    pub slowest_task: Option<(String, Duration)>,
    pub fastest_task: Option<(String, Duration)>,
    /// Percentage of recorded tasks that completed.
    pub success_rate: f64,
    /// Retries per recorded task.
    pub retry_rate: f64,
    pub total_wall_time: Duration,
}

/// Aggregates across every recorded workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateStats {
    pub workflows: usize,
    pub tasks: usize,
    pub average_success_rate: f64,
    pub average_task_duration: Duration,
}

#[derive(Debug, Default)]
struct WorkflowRun {
    records: Vec<TaskExecutionRecord>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

/// Collects execution records across workflow runs.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    runs: RwLock<HashMap<String, WorkflowRun>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workflow_started(&self, workflow_id: &str) {
        let mut runs = self.runs.write();
        let run = runs.entry(workflow_id.to_string()).or_default();
        run.started_at = Some(Utc::now());
    }

    pub fn workflow_finished(&self, workflow_id: &str) {
        let mut runs = self.runs.write();
        let run = runs.entry(workflow_id.to_string()).or_default();
        run.finished_at = Some(Utc::now());
    }

    pub fn record_task(&self, record: TaskExecutionRecord) {
        let mut runs = self.runs.write();
        runs.entry(record.workflow_id.clone())
            .or_default()
            .records
            .push(record);
    }

    pub fn workflow_metrics(&self, workflow_id: &str) -> Option<WorkflowMetrics> {
        let runs = self.runs.read();
        let run = runs.get(workflow_id)?;
        Some(summarize(workflow_id, run))
    }

    pub fn aggregate(&self) -> AggregateStats {
        let runs = self.runs.read();
        let mut tasks = 0usize;
        let mut success_rates = Vec::new();
        let mut total_duration = Duration::ZERO;
        for (id, run) in runs.iter() {
            let metrics = summarize(id, run);
            tasks += metrics.total_tasks;
            success_rates.push(metrics.success_rate);
            total_duration += run.records.iter().map(|r| r.duration).sum::<Duration>();
        }
        let average_success_rate = if success_rates.is_empty() {
            0.0
        } else {
            success_rates.iter().sum::<f64>() / success_rates.len() as f64
        };
        let average_task_duration = if tasks == 0 {
            Duration::ZERO
        } else {
            total_duration / tasks as u32
        };
        AggregateStats {
            workflows: runs.len(),
            tasks,
            average_success_rate,
            average_task_duration,
        }
    }

    /// Multi-line report for one workflow, highlighting the slowest and the
    /// failed tasks.
    pub fn render_report(&self, workflow_id: &str) -> Option<String> {
        let runs = self.runs.read();
        let run = runs.get(workflow_id)?;
        let metrics = summarize(workflow_id, run);

        let mut out = String::new();
        let _ = writeln!(out, "Workflow '{workflow_id}' execution report");
        let _ = writeln!(
            out,
            "  Tasks: {} total | {} completed | {} failed | {} skipped | {} cancelled | {} cache hits",
            metrics.total_tasks,
            metrics.completed,
            metrics.failed,
            metrics.skipped,
            metrics.cancelled,
            metrics.cache_hits,
        );
        let _ = writeln!(
            out,
            "  Success rate: {:.1}% | Retry rate: {:.2} retries/task",
            metrics.success_rate, metrics.retry_rate
        );
        let _ = writeln!(
            out,
            "  Wall time: {:.3}s | Average task: {:.3}s",
            metrics.total_wall_time.as_secs_f64(),
            metrics.average_duration.as_secs_f64()
        );
        if let Some((id, duration)) = &metrics.slowest_task {
            let _ = writeln!(out, "  Slowest: {id} ({:.3}s)", duration.as_secs_f64());
        }
        if let Some((id, duration)) = &metrics.fastest_task {
            let _ = writeln!(out, "  Fastest: {id} ({:.3}s)", duration.as_secs_f64());
        }
        let failed: Vec<&TaskExecutionRecord> = run
            .records
            .iter()
            .filter(|r| r.status == TaskStatus::Failed)
            .collect();
        if !failed.is_empty() {
            let _ = writeln!(out, "  Failed tasks:");
            for record in failed {
                let _ = writeln!(
                    out,
                    "    - {}: {}",
                    record.task_id,
                    record.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        Some(out)
    }
}

fn summarize(workflow_id: &str, run: &WorkflowRun) -> WorkflowMetrics {
    let records = &run.records;
    let total_tasks = records.len();
    let count = |status: TaskStatus| records.iter().filter(|r| r.status == status).count();
    let completed = count(TaskStatus::Completed);
    let failed = count(TaskStatus::Failed);
    let skipped = count(TaskStatus::Skipped);
    let cancelled = count(TaskStatus::Cancelled);
    let cache_hits = records.iter().filter(|r| r.from_cache).count();

    let executed: Vec<&TaskExecutionRecord> =
        records.iter().filter(|r| !r.from_cache && r.duration > Duration::ZERO).collect();
    let average_duration = if executed.is_empty() {
        Duration::ZERO
    } else {
        executed.iter().map(|r| r.duration).sum::<Duration>() / executed.len() as u32
    };
    let slowest_task = executed
        .iter()
        .max_by_key(|r| r.duration)
        .map(|r| (r.task_id.clone(), r.duration));
    let fastest_task = executed
        .iter()
        .min_by_key(|r| r.duration)
        .map(|r| (r.task_id.clone(), r.duration));

    let success_rate = if total_tasks == 0 {
        0.0
    } else {
        completed as f64 / total_tasks as f64 * 100.0
    };
    let retries: u32 = records.iter().map(|r| r.retries).sum();
    let retry_rate = if total_tasks == 0 {
        0.0
    } else {
        retries as f64 / total_tasks as f64
    };
    let total_wall_time = match (run.started_at, run.finished_at) {
        (Some(start), Some(end)) => (end - start).to_std().unwrap_or(Duration::ZERO),
        _ => Duration::ZERO,
    };

    WorkflowMetrics {
        workflow_id: workflow_id.to_string(),
        total_tasks,
        completed,
        failed,
        skipped,
        cancelled,
        cache_hits,
        average_duration,
        slowest_task,
        fastest_task,
        success_rate,
        retry_rate,
        total_wall_time,
    }
}
