//! External collaborator interfaces: workers and the skill registry.
//!
//! A worker is the component that actually performs a task; the router
//! selects its type, the dispatcher drives the call. Workers may touch
//! external systems but must tolerate re-execution across retry attempts.

use crate::types::{TaskError, TaskOutput};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Everything a worker receives for one attempt.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub task_id: String,
    pub description: String,
    pub parameters: HashMap<String, serde_json::Value>,
    /// Resolved skill bodies keyed by skill name.
    pub skills: HashMap<String, String>,
    /// Outputs of completed dependency tasks keyed by task id.
    pub dependency_outputs: HashMap<String, TaskOutput>,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// Pluggable asynchronous task executor.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn execute(&self, request: WorkerRequest) -> Result<TaskOutput, TaskError>;
}

/// Named reference content attached to tasks before dispatch.
#[async_trait]
pub trait SkillRegistry: Send + Sync {
    async fn lookup(&self, name: &str) -> Option<String>;
    async fn available(&self) -> Vec<String>;
}

/// Simple in-process skill registry.
#[derive(Debug, Default)]
pub struct InMemorySkillRegistry {
    skills: RwLock<HashMap<String, String>>,
}

impl InMemorySkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, body: impl Into<String>) {
        self.skills.write().insert(name.into(), body.into());
    }
}

#[async_trait]
impl SkillRegistry for InMemorySkillRegistry {
    async fn lookup(&self, name: &str) -> Option<String> {
        self.skills.read().get(name).cloned()
    }

    async fn available(&self) -> Vec<String> {
        let mut names: Vec<String> = self.skills.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_lookup_and_listing() {
        let registry = InMemorySkillRegistry::new();
        registry.register("rust-review", "review checklist body");
        assert_eq!(
            registry.lookup("rust-review").await.as_deref(),
            Some("review checklist body")
        );
        assert!(registry.lookup("missing").await.is_none());
        assert_eq!(registry.available().await, vec!["rust-review".to_string()]);
    }
}
