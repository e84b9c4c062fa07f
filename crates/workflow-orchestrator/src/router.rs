//! Worker routing: capability matching and per-worker concurrency budgets.
//!
//! Selection honors an explicit worker-type override when present, otherwise
//! filters routings whose capability set covers the task's requirements,
//! discards routings at their concurrency cap, and picks by descending
//! routing priority, ascending current load, ascending worker type id.

use crate::types::{Capability, TaskDefinition};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Declared routing for one worker type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRouting {
    pub worker_type: String,
    pub capabilities: Vec<Capability>,
    pub priority: u8,
    pub max_concurrent_tasks: usize,
}

impl WorkerRouting {
    pub fn new(worker_type: impl Into<String>, capabilities: Vec<Capability>) -> Self {
        Self {
            worker_type: worker_type.into(),
            capabilities,
            priority: 5,
            max_concurrent_tasks: 4,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }
}

/// Outcome of a routing attempt.
pub enum RouteDecision {
    /// A slot was acquired on this worker type.
    Slot(WorkerSlot),
    /// All matching routings are at their concurrency cap.
    Waiting,
    /// No routing can ever satisfy the task.
    Unroutable,
}

/// RAII guard over one in-flight slot. Dropping releases the slot and wakes
/// waiters, on every exit path including cancellation and unwind.
pub struct WorkerSlot {
    worker_type: String,
    in_flight: Arc<DashMap<String, usize>>,
    released: Arc<Notify>,
}

impl WorkerSlot {
    pub fn worker_type(&self) -> &str {
        &self.worker_type
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        if let Some(mut count) = self.in_flight.get_mut(&self.worker_type) {
            *count = count.saturating_sub(1);
        }
        self.released.notify_waiters();
    }
}

/// Selects a worker type for each task, tracking in-flight counts.
pub struct Router {
    routings: Vec<WorkerRouting>,
    in_flight: Arc<DashMap<String, usize>>,
    released: Arc<Notify>,
}

impl Router {
    pub fn new(routings: Vec<WorkerRouting>) -> Self {
        let in_flight = Arc::new(DashMap::new());
        for routing in &routings {
            in_flight.insert(routing.worker_type.clone(), 0);
        }
        Self {
            routings,
            in_flight,
            released: Arc::new(Notify::new()),
        }
    }

    pub fn current_load(&self, worker_type: &str) -> usize {
        self.in_flight.get(worker_type).map(|c| *c).unwrap_or(0)
    }

    /// Sum of all declared concurrency caps.
    pub fn total_capacity(&self) -> usize {
        self.routings.iter().map(|r| r.max_concurrent_tasks).sum()
    }

    fn candidates(&self, task: &TaskDefinition) -> Vec<&WorkerRouting> {
        if let Some(explicit) = task.worker_type.as_deref() {
            return self
                .routings
                .iter()
                .filter(|r| r.worker_type == explicit)
                .collect();
        }
        let required: HashSet<Capability> = task.required_capabilities.iter().copied().collect();
        self.routings
            .iter()
            .filter(|r| {
                let offered: HashSet<Capability> = r.capabilities.iter().copied().collect();
                required.is_subset(&offered)
            })
            .collect()
    }

    /// Single routing attempt; never blocks.
    pub fn try_acquire(&self, task: &TaskDefinition) -> RouteDecision {
        let candidates = self.candidates(task);
        if candidates.is_empty() {
            return RouteDecision::Unroutable;
        }

        let mut available: Vec<(&WorkerRouting, usize)> = candidates
            .into_iter()
            .map(|r| (r, self.current_load(&r.worker_type)))
            .filter(|(r, load)| *load < r.max_concurrent_tasks)
            .collect();
        if available.is_empty() {
            return RouteDecision::Waiting;
        }

        available.sort_by(|(a, a_load), (b, b_load)| {
            b.priority
                .cmp(&a.priority)
                .then(a_load.cmp(b_load))
                .then(a.worker_type.cmp(&b.worker_type))
        });
        let chosen = available[0].0;
        *self
            .in_flight
            .entry(chosen.worker_type.clone())
            .or_insert(0) += 1;

        tracing::debug!(
            worker_type = %chosen.worker_type,
            task_id = %task.id,
            load = self.current_load(&chosen.worker_type),
            "worker slot acquired"
        );

        RouteDecision::Slot(WorkerSlot {
            worker_type: chosen.worker_type.clone(),
            in_flight: self.in_flight.clone(),
            released: self.released.clone(),
        })
    }

    /// Suspend until a slot may have freed or the workflow is cancelled.
    /// Returns `false` on cancellation. Re-polls periodically so a release
    /// racing the wait registration is never missed.
    pub async fn wait_for_slot(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = self.released.notified() => true,
            _ = tokio::time::sleep(Duration::from_millis(25)) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskDefinition;

    fn router() -> Router {
        Router::new(vec![
            WorkerRouting::new(
                "generalist",
                vec![Capability::General, Capability::Research],
            )
            .with_priority(3)
            .with_max_concurrent_tasks(2),
            WorkerRouting::new(
                "coder",
                vec![
                    Capability::CodeAnalysis,
                    Capability::CodeGeneration,
                    Capability::Testing,
                ],
            )
            .with_priority(7)
            .with_max_concurrent_tasks(1),
        ])
    }

    #[test]
    fn routes_by_capability_superset() {
        let router = router();
        let task = TaskDefinition::new("t", "code").with_capability(Capability::CodeGeneration);
        match router.try_acquire(&task) {
            RouteDecision::Slot(slot) => assert_eq!(slot.worker_type(), "coder"),
            _ => panic!("expected a slot"),
        }
    }

    #[test]
    fn explicit_worker_type_bypasses_capabilities() {
        let router = router();
        let task = TaskDefinition::new("t", "any")
            .with_capability(Capability::CodeGeneration)
            .with_worker_type("generalist");
        match router.try_acquire(&task) {
            RouteDecision::Slot(slot) => assert_eq!(slot.worker_type(), "generalist"),
            _ => panic!("expected a slot"),
        }
    }

    #[test]
    fn unroutable_when_no_capability_match() {
        let router = router();
        let task = TaskDefinition::new("t", "files").with_capability(Capability::FileOperations);
        assert!(matches!(router.try_acquire(&task), RouteDecision::Unroutable));
    }

    #[test]
    fn waits_at_cap_and_frees_on_drop() {
        let router = router();
        let task = TaskDefinition::new("t", "code").with_capability(Capability::Testing);
        let slot = match router.try_acquire(&task) {
            RouteDecision::Slot(slot) => slot,
            _ => panic!("expected a slot"),
        };
        assert!(matches!(router.try_acquire(&task), RouteDecision::Waiting));
        drop(slot);
        assert_eq!(router.current_load("coder"), 0);
        assert!(matches!(router.try_acquire(&task), RouteDecision::Slot(_)));
    }

    #[test]
    fn prefers_higher_priority_then_lower_load() {
        let router = Router::new(vec![
            WorkerRouting::new("a", vec![Capability::General])
                .with_priority(5)
                .with_max_concurrent_tasks(4),
            WorkerRouting::new("b", vec![Capability::General])
                .with_priority(5)
                .with_max_concurrent_tasks(4),
        ]);
        let task = TaskDefinition::new("t", "any").with_capability(Capability::General);
        // Equal priority and load: ties break on worker type id.
        let first = match router.try_acquire(&task) {
            RouteDecision::Slot(slot) => slot,
            _ => panic!("expected a slot"),
        };
        assert_eq!(first.worker_type(), "a");
        // "a" now carries load, so "b" wins.
        match router.try_acquire(&task) {
            RouteDecision::Slot(slot) => assert_eq!(slot.worker_type(), "b"),
            _ => panic!("expected a slot"),
        }
    }

    #[test]
    fn total_capacity_sums_caps() {
        assert_eq!(router().total_capacity(), 3);
    }
}
