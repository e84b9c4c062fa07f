//! Task result caching with memory, disk, and hybrid strategies.
//!
//! Keys are SHA-256 fingerprints over a canonical serialization of the
//! task's logical inputs; with `include_dependencies` enabled the terminal
//! outputs of dependency tasks fold into the key, so a changed upstream
//! result misses cleanly downstream.

use crate::types::{TaskDefinition, TaskOutput};
use crate::OrchestratorError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Cache backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategy {
    None,
    Memory,
    Disk,
    Hybrid,
}

/// Cache construction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub strategy: CacheStrategy,
    /// Maximum entries held in the in-memory LRU.
    pub max_size: usize,
    pub ttl: Option<Duration>,
    /// Root directory for the disk and hybrid strategies.
    pub disk_root: Option<PathBuf>,
    /// Fold dependency outputs into the cache key.
    pub include_dependencies: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            strategy: CacheStrategy::Memory,
            max_size: 1024,
            ttl: None,
            disk_root: None,
            include_dependencies: true,
        }
    }
}

/// A stored result plus the metadata needed for TTL and integrity checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub output: TaskOutput,
    pub stored_at: DateTime<Utc>,
    pub ttl: Option<Duration>,
    pub digest: String,
}

impl CacheEntry {
    fn new(key: String, output: TaskOutput, ttl: Option<Duration>) -> Self {
        let digest = output_digest(&output);
        Self {
            key,
            output,
            stored_at: Utc::now(),
            ttl,
            digest,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl {
            Some(ttl) => match chrono::Duration::from_std(ttl) {
                Ok(ttl) => now - self.stored_at > ttl,
                Err(_) => false,
            },
            None => false,
        }
    }

    fn is_intact(&self) -> bool {
        self.digest == output_digest(&self.output)
    }
}

/// Counters exposed by [`TaskCache::stats`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub strategy: CacheStrategy,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub size: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64 * 100.0
        }
    }
}

/// Storage backend for the disk strategy. The backend chooses the on-disk
/// layout; keys are opaque hex strings.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, OrchestratorError>;
    async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), OrchestratorError>;
    async fn delete(&self, key: &str) -> Result<(), OrchestratorError>;
    async fn list_keys(&self) -> Result<Vec<String>, OrchestratorError>;
}

/// Content-addressed files under a root directory, one JSON file per key.
pub struct DiskCacheStorage {
    root: PathBuf,
}

impl DiskCacheStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }
}

#[async_trait]
impl CacheStorage for DiskCacheStorage {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, OrchestratorError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(OrchestratorError::Cache(format!("read {key}: {e}"))),
        }
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), OrchestratorError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| OrchestratorError::Cache(format!("create cache root: {e}")))?;
        tokio::fs::write(self.path_for(key), bytes)
            .await
            .map_err(|e| OrchestratorError::Cache(format!("write {key}: {e}")))
    }

    async fn delete(&self, key: &str) -> Result<(), OrchestratorError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(OrchestratorError::Cache(format!("delete {key}: {e}"))),
        }
    }

    async fn list_keys(&self) -> Result<Vec<String>, OrchestratorError> {
        let mut keys = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(OrchestratorError::Cache(format!("list keys: {e}"))),
        };
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let name = entry.file_name();
                    if let Some(stem) = name.to_string_lossy().strip_suffix(".json") {
                        keys.push(stem.to_string());
                    }
                }
                Ok(None) => break,
                Err(e) => return Err(OrchestratorError::Cache(format!("list keys: {e}"))),
            }
        }
        Ok(keys)
    }
}

/// Result cache consulted by the dispatcher before worker execution.
pub struct TaskCache {
    config: CacheConfig,
    memory: Option<Mutex<LruCache<String, CacheEntry>>>,
    storage: Option<Arc<dyn CacheStorage>>,
    /// task id -> keys derived using that task, for targeted invalidation.
    index: Mutex<HashMap<String, HashSet<String>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

impl TaskCache {
    pub fn new(config: CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_size).unwrap_or(NonZeroUsize::MIN);
        let memory = matches!(config.strategy, CacheStrategy::Memory | CacheStrategy::Hybrid)
            .then(|| Mutex::new(LruCache::new(capacity)));
        let storage: Option<Arc<dyn CacheStorage>> =
            if matches!(config.strategy, CacheStrategy::Disk | CacheStrategy::Hybrid) {
                let root = config
                    .disk_root
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(".workflow-cache"));
                Some(Arc::new(DiskCacheStorage::new(root)))
            } else {
                None
            };
        Self {
            config,
            memory,
            storage,
            index: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Cache with a caller-supplied storage backend (hybrid layout).
    pub fn with_storage(config: CacheConfig, storage: Arc<dyn CacheStorage>) -> Self {
        let mut cache = Self::new(config);
        cache.storage = Some(storage);
        cache
    }

    pub fn enabled(&self) -> bool {
        self.config.strategy != CacheStrategy::None
    }

    pub fn include_dependencies(&self) -> bool {
        self.config.include_dependencies
    }

    /// Deterministic fingerprint of a task's logical inputs.
    ///
    /// `dependency_outputs` must be in the task's declared dependency order;
    /// pass an empty slice when dependency keying is disabled.
    pub fn task_key(
        task: &TaskDefinition,
        dependency_outputs: &[(String, Option<TaskOutput>)],
    ) -> String {
        let mut capabilities: Vec<&str> = task
            .required_capabilities
            .iter()
            .map(|c| c.as_str())
            .collect();
        capabilities.sort_unstable();
        let mut skills: Vec<&str> = task.required_skills.iter().map(String::as_str).collect();
        skills.sort_unstable();

        let dependencies: Vec<Value> = dependency_outputs
            .iter()
            .map(|(id, output)| {
                serde_json::json!({
                    "task": id,
                    "output": output
                        .as_ref()
                        .and_then(|o| serde_json::to_value(o).ok())
                        .unwrap_or(Value::Null),
                })
            })
            .collect();

        let document = serde_json::json!({
            "task_id": task.id,
            "description": task.description,
            "capabilities": capabilities,
            "skills": skills,
            "parameters": task.parameters,
            "dependencies": dependencies,
        });

        let mut canonical = String::new();
        canonical_json(&document, &mut canonical);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Look up a prior result. Storage failures degrade to a miss.
    pub async fn get(&self, key: &str) -> Option<TaskOutput> {
        if !self.enabled() {
            return None;
        }
        let now = Utc::now();

        if let Some(memory) = &self.memory {
            let mut cached = memory.lock();
            if let Some(entry) = cached.get(key) {
                if entry.is_expired(now) {
                    cached.pop(key);
                } else {
                    let output = entry.output.clone();
                    drop(cached);
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(output);
                }
            }
        }

        if let Some(storage) = &self.storage {
            match storage.read(key).await {
                Ok(Some(bytes)) => match serde_json::from_slice::<CacheEntry>(&bytes) {
                    Ok(entry) if !entry.is_expired(now) && entry.is_intact() => {
                        if let Some(memory) = &self.memory {
                            self.insert_memory(memory, entry.clone());
                        }
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        return Some(entry.output);
                    }
                    Ok(_) => {
                        // Expired or corrupt on disk; drop it.
                        let _ = storage.delete(key).await;
                    }
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "unreadable cache entry dropped");
                        let _ = storage.delete(key).await;
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "cache read failed; treating as miss");
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a result under `key`, indexing it by every contributing task id.
    pub async fn put(&self, key: &str, output: TaskOutput, contributing_tasks: &[String]) {
        if !self.enabled() {
            return;
        }
        let entry = CacheEntry::new(key.to_string(), output, self.config.ttl);

        if let Some(memory) = &self.memory {
            self.insert_memory(memory, entry.clone());
        }
        if let Some(storage) = &self.storage {
            match serde_json::to_vec(&entry) {
                Ok(bytes) => {
                    if let Err(e) = storage.write(key, &bytes).await {
                        tracing::warn!(key = %key, error = %e, "cache write failed");
                    }
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "cache entry serialization failed");
                }
            }
        }

        let mut index = self.index.lock();
        for task_id in contributing_tasks {
            index
                .entry(task_id.clone())
                .or_default()
                .insert(key.to_string());
        }
    }

    /// Remove every entry whose key was derived using `task_id`.
    pub async fn invalidate(&self, task_id: &str) -> usize {
        let keys: Vec<String> = {
            let mut index = self.index.lock();
            let keys = index.remove(task_id).unwrap_or_default();
            for remaining in index.values_mut() {
                for key in &keys {
                    remaining.remove(key);
                }
            }
            keys.into_iter().collect()
        };

        for key in &keys {
            if let Some(memory) = &self.memory {
                memory.lock().pop(key);
            }
            if let Some(storage) = &self.storage {
                if let Err(e) = storage.delete(key).await {
                    tracing::warn!(key = %key, error = %e, "cache delete failed");
                }
            }
        }
        self.invalidations
            .fetch_add(keys.len() as u64, Ordering::Relaxed);
        keys.len()
    }

    /// Drop every entry across all backends.
    pub async fn clear(&self) {
        if let Some(memory) = &self.memory {
            memory.lock().clear();
        }
        if let Some(storage) = &self.storage {
            if let Ok(keys) = storage.list_keys().await {
                for key in keys {
                    let _ = storage.delete(&key).await;
                }
            }
        }
        self.index.lock().clear();
    }

    pub async fn stats(&self) -> CacheStats {
        let size = match self.config.strategy {
            CacheStrategy::None => 0,
            CacheStrategy::Memory => self.memory.as_ref().map(|m| m.lock().len()).unwrap_or(0),
            CacheStrategy::Disk | CacheStrategy::Hybrid => match &self.storage {
                Some(storage) => storage.list_keys().await.map(|k| k.len()).unwrap_or(0),
                None => 0,
            },
        };
        CacheStats {
            strategy: self.config.strategy,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            size,
        }
    }

    fn insert_memory(&self, memory: &Mutex<LruCache<String, CacheEntry>>, entry: CacheEntry) {
        let key = entry.key.clone();
        if let Some((evicted_key, _)) = memory.lock().push(key.clone(), entry) {
            if evicted_key != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                let mut index = self.index.lock();
                for keys in index.values_mut() {
                    keys.remove(&evicted_key);
                }
            }
        }
    }
}

fn output_digest(output: &TaskOutput) -> String {
    let value = serde_json::to_value(output).unwrap_or(Value::Null);
    let mut canonical = String::new();
    canonical_json(&value, &mut canonical);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Serialize with object keys sorted so equal values always produce equal
/// bytes. Numbers use serde_json's shortest round-trip rendering.
fn canonical_json(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push('{');
            for (i, (key, val)) in sorted.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                canonical_json(val, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                canonical_json(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}
