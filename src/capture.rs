//! Filtering and recording of command-execution outcomes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Raw outcome reported by an executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutput {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub execution_location: Option<String>,
}

fn default_status() -> String {
    "unknown".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedResult {
    pub id: String,
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub platform: String,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Gates which commands get captured.
pub type CaptureFilter = Box<dyn Fn(&str) -> bool + Send + Sync>;

#[async_trait]
pub trait CaptureCallback: Send + Sync {
    async fn on_captured(&self, result: &CapturedResult) -> anyhow::Result<()>;
}

#[derive(Default)]
struct Store {
    by_id: HashMap<String, CapturedResult>,
    order: VecDeque<String>,
}

pub struct ResultCapture {
    filters: RwLock<Vec<CaptureFilter>>,
    callbacks: RwLock<Vec<Arc<dyn CaptureCallback>>>,
    store: RwLock<Store>,
    max_results: usize,
    trim_to: usize,
}

impl ResultCapture {
    /// `max_results` caps storage; overflowing it keeps the newest `trim_to`.
    pub fn new(max_results: usize, trim_to: usize) -> Self {
        let max_results = max_results.max(1);
        Self {
            filters: RwLock::new(Vec::new()),
            callbacks: RwLock::new(Vec::new()),
            store: RwLock::new(Store::default()),
            max_results,
            trim_to: trim_to.min(max_results),
        }
    }

    pub fn add_filter<F>(&self, filter: F)
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.filters.write().push(Box::new(filter));
    }

    pub fn add_callback(&self, callback: Arc<dyn CaptureCallback>) {
        self.callbacks.write().push(callback);
    }

    fn should_capture(&self, command: &str) -> bool {
        let filters = self.filters.read();
        filters.is_empty() || filters.iter().any(|filter| filter(command))
    }

    /// Record `output` for `command` if any filter matches, then run every
    /// callback in registration order. Returns `None` when filtered out.
    pub async fn capture(
        &self,
        command: &str,
        output: &ExecutionOutput,
        platform: &str,
    ) -> Option<CapturedResult> {
        if !self.should_capture(command) {
            debug!(command = %command, "Command filtered out of capture");
            return None;
        }

        let mut metadata = Map::new();
        metadata.insert("status".to_string(), Value::String(output.status.clone()));
        metadata.insert(
            "executionLocation".to_string(),
            Value::String(
                output
                    .execution_location
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
            ),
        );

        let result = CapturedResult {
            id: format!("capture_{}", Uuid::new_v4().simple()),
            command: command.to_string(),
            stdout: output.stdout.clone(),
            stderr: output.stderr.clone(),
            exit_code: output.exit_code,
            duration_ms: output.duration_ms,
            platform: platform.to_string(),
            captured_at: Utc::now(),
            metadata,
        };

        self.store_result(result.clone());

        let callbacks: Vec<_> = self.callbacks.read().clone();
        for callback in callbacks {
            if let Err(e) = callback.on_captured(&result).await {
                warn!(result_id = %result.id, error = %e, "Capture callback failed");
            }
        }

        info!(result_id = %result.id, command = %command, platform = %platform, "Result captured");
        Some(result)
    }

    fn store_result(&self, result: CapturedResult) {
        let mut store = self.store.write();
        store.order.push_back(result.id.clone());
        store.by_id.insert(result.id.clone(), result);

        if store.order.len() > self.max_results {
            let evict = store.order.len() - self.trim_to;
            let evicted: Vec<String> = store.order.drain(..evict).collect();
            for id in &evicted {
                store.by_id.remove(id);
            }
            debug!(evicted = evicted.len(), "Evicted oldest captured results");
        }
    }

    /// The `limit` most recent results, newest first (ties broken by id).
    pub fn list(&self, limit: usize) -> Vec<CapturedResult> {
        let mut results: Vec<CapturedResult> = self.store.read().by_id.values().cloned().collect();
        results.sort_by(|a, b| {
            b.captured_at
                .cmp(&a.captured_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        results.truncate(limit);
        results
    }

    pub fn get(&self, id: &str) -> Option<CapturedResult> {
        self.store.read().by_id.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.store.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn filter_count(&self) -> usize {
        self.filters.read().len()
    }

    pub fn clear(&self) {
        let mut store = self.store.write();
        store.by_id.clear();
        store.order.clear();
    }
}
