//! Background synchronization tasks.
//!
//! Tasks are dispatched purely on [`SyncKind`]. Registered [`SyncRule`]s are
//! kept as metadata for collaborators and are not consulted by the worker.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::history::BoundedHistory;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SyncKind {
    ResultSync,
    FileSync,
    StatusSync,
}

impl SyncKind {
    pub const ALL: [SyncKind; 3] = [SyncKind::ResultSync, SyncKind::FileSync, SyncKind::StatusSync];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncKind::ResultSync => "result-sync",
            SyncKind::FileSync => "file-sync",
            SyncKind::StatusSync => "status-sync",
        }
    }
}

impl std::fmt::Display for SyncKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "result-sync" => Ok(SyncKind::ResultSync),
            "file-sync" => Ok(SyncKind::FileSync),
            "status-sync" => Ok(SyncKind::StatusSync),
            other => Err(EngineError::Dispatch(format!("unknown sync kind {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SyncDirection {
    LocalToRemote,
    RemoteToLocal,
    Bidirectional,
}

fn default_rule_id() -> String {
    format!("rule_{}", Uuid::new_v4().simple())
}

fn default_pattern() -> String {
    "*".to_string()
}

fn default_direction() -> SyncDirection {
    SyncDirection::Bidirectional
}

fn default_enabled() -> bool {
    true
}

/// Declarative replication metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncRule {
    #[serde(default = "default_rule_id")]
    pub id: String,
    #[serde(default = "default_pattern")]
    pub pattern: String,
    #[serde(default = "default_direction")]
    pub direction: SyncDirection,
    #[serde(default, alias = "target_platforms")]
    pub target_platforms: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl SyncRule {
    pub fn new(pattern: &str, direction: SyncDirection, target_platforms: Vec<String>) -> Self {
        Self {
            id: default_rule_id(),
            pattern: pattern.to_string(),
            direction,
            target_platforms,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncTask {
    pub id: String,
    pub kind: SyncKind,
    pub payload: Value,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub task_id: String,
    pub kind: SyncKind,
    pub timestamp: DateTime<Utc>,
    pub status: SyncStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Transport-specific work for one sync kind.
#[async_trait]
pub trait SyncHandler: Send + Sync {
    async fn sync(&self, payload: &Value) -> anyhow::Result<()>;
}

/// Default handler for kinds whose transport has not been supplied.
pub struct PassThrough;

#[async_trait]
impl SyncHandler for PassThrough {
    async fn sync(&self, payload: &Value) -> anyhow::Result<()> {
        debug!(payload = %payload, "Pass-through sync");
        Ok(())
    }
}

/// Notified after each outcome is recorded.
#[async_trait]
pub trait SyncObserver: Send + Sync {
    async fn on_outcome(&self, outcome: &SyncOutcome) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncManagerStatus {
    pub running: bool,
    pub rules: usize,
    pub queue_size: usize,
    pub history: usize,
}

pub struct SyncManager {
    sender: mpsc::UnboundedSender<SyncTask>,
    receiver: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<SyncTask>>>,
    handlers: Arc<RwLock<HashMap<SyncKind, Arc<dyn SyncHandler>>>>,
    observers: Arc<RwLock<Vec<Arc<dyn SyncObserver>>>>,
    rules: RwLock<Vec<SyncRule>>,
    history: Arc<BoundedHistory<SyncOutcome>>,
    pending: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
    timeout: Option<Duration>,
}

impl SyncManager {
    pub fn new(history_limit: usize, timeout: Option<Duration>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handlers: HashMap<SyncKind, Arc<dyn SyncHandler>> = SyncKind::ALL
            .into_iter()
            .map(|kind| (kind, Arc::new(PassThrough) as Arc<dyn SyncHandler>))
            .collect();

        Self {
            sender,
            receiver: parking_lot::Mutex::new(Some(receiver)),
            handlers: Arc::new(RwLock::new(handlers)),
            observers: Arc::new(RwLock::new(Vec::new())),
            rules: RwLock::new(Vec::new()),
            history: Arc::new(BoundedHistory::new(
                history_limit,
                (history_limit / 2).max(1),
            )),
            pending: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            timeout,
        }
    }

    /// Replace the handler for one kind. Takes effect for the next task
    /// dispatched, including after the worker has started.
    pub fn set_handler(&self, kind: SyncKind, handler: Arc<dyn SyncHandler>) {
        self.handlers.write().insert(kind, handler);
    }

    pub fn add_observer(&self, observer: Arc<dyn SyncObserver>) {
        self.observers.write().push(observer);
    }

    /// Register a rule. Rules have no effect on dispatch.
    pub fn add_rule(&self, rule: SyncRule) {
        info!(
            rule_id = %rule.id,
            pattern = %rule.pattern,
            direction = ?rule.direction,
            "Sync rule added"
        );
        self.rules.write().push(rule);
    }

    pub fn rules(&self) -> Vec<SyncRule> {
        self.rules.read().clone()
    }

    /// Enqueue without waiting for processing. Returns the task id.
    pub fn submit(&self, kind: SyncKind, payload: Value) -> Result<String> {
        let task = SyncTask {
            id: format!("sync_{}", Uuid::new_v4().simple()),
            kind,
            payload,
            submitted_at: Utc::now(),
        };
        let task_id = task.id.clone();

        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(task).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(EngineError::InvalidState("sync queue is closed".to_string()));
        }

        debug!(task_id = %task_id, kind = %kind, "Sync task submitted");
        Ok(task_id)
    }

    /// Spawn the consumer task. Can only be started once.
    pub fn start(&self, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let receiver = self
            .receiver
            .lock()
            .take()
            .ok_or_else(|| EngineError::InvalidState("sync worker already started".to_string()))?;

        let worker = SyncWorker {
            handlers: Arc::clone(&self.handlers),
            observers: Arc::clone(&self.observers),
            history: Arc::clone(&self.history),
            pending: Arc::clone(&self.pending),
            running: Arc::clone(&self.running),
            timeout: self.timeout,
        };
        self.running.store(true, Ordering::SeqCst);
        info!("Sync service started");

        Ok(tokio::spawn(worker.run(receiver, cancel)))
    }

    /// Outcomes, oldest first.
    pub fn history(&self) -> Vec<SyncOutcome> {
        self.history.snapshot()
    }

    pub fn status(&self) -> SyncManagerStatus {
        SyncManagerStatus {
            running: self.running.load(Ordering::SeqCst),
            rules: self.rules.read().len(),
            queue_size: self.pending.load(Ordering::SeqCst),
            history: self.history.len(),
        }
    }
}

struct SyncWorker {
    handlers: Arc<RwLock<HashMap<SyncKind, Arc<dyn SyncHandler>>>>,
    observers: Arc<RwLock<Vec<Arc<dyn SyncObserver>>>>,
    history: Arc<BoundedHistory<SyncOutcome>>,
    pending: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
    timeout: Option<Duration>,
}

impl SyncWorker {
    async fn run(self, mut receiver: mpsc::UnboundedReceiver<SyncTask>, cancel: CancellationToken) {
        loop {
            let task = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = receiver.recv() => match next {
                    Some(task) => task,
                    None => break,
                },
            };

            self.pending.fetch_sub(1, Ordering::SeqCst);
            let task_id = task.id.clone();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(task_id = %task_id, "Sync task aborted by shutdown");
                    break;
                }
                _ = self.process(task) => {}
            }
        }

        receiver.close();
        let mut dropped = 0usize;
        while receiver.try_recv().is_ok() {
            dropped += 1;
        }
        self.pending.store(0, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);

        if dropped > 0 {
            warn!(dropped, "Sync service stopped with queued tasks");
        } else {
            info!("Sync service stopped");
        }
    }

    async fn dispatch(&self, task: &SyncTask) -> anyhow::Result<()> {
        let handler = self
            .handlers
            .read()
            .get(&task.kind)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no handler for {}", task.kind))?;

        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, handler.sync(&task.payload))
                .await
                .map_err(|_| anyhow::anyhow!("sync timed out after {}s", limit.as_secs()))?,
            None => handler.sync(&task.payload).await,
        }
    }

    async fn process(&self, task: SyncTask) {
        debug!(task_id = %task.id, kind = %task.kind, "Processing sync task");

        let outcome = match self.dispatch(&task).await {
            Ok(()) => SyncOutcome {
                task_id: task.id.clone(),
                kind: task.kind,
                timestamp: Utc::now(),
                status: SyncStatus::Completed,
                error: None,
            },
            Err(e) => {
                error!(task_id = %task.id, kind = %task.kind, error = %e, "Sync task failed");
                SyncOutcome {
                    task_id: task.id.clone(),
                    kind: task.kind,
                    timestamp: Utc::now(),
                    status: SyncStatus::Failed,
                    error: Some(e.to_string()),
                }
            }
        };

        self.history.push(outcome.clone());

        let observers = self.observers.read().clone();
        for observer in &observers {
            if let Err(e) = observer.on_outcome(&outcome).await {
                warn!(task_id = %outcome.task_id, error = %e, "Sync observer failed");
            }
        }
    }
}
