//! Serialized queue of model-completion requests.
//!
//! Producers enqueue and return immediately. A single consumer task drains
//! the queue in submission order, so at most one completion is in flight.
//! Failed completions are logged and dropped; there is no retry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    Chat,
    CodeGeneration,
    CodeAnalysis,
    DebugAssistance,
    Refactoring,
    Documentation,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Chat => "chat",
            ServiceKind::CodeGeneration => "code-generation",
            ServiceKind::CodeAnalysis => "code-analysis",
            ServiceKind::DebugAssistance => "debug-assistance",
            ServiceKind::Refactoring => "refactoring",
            ServiceKind::Documentation => "documentation",
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "chat" => Ok(ServiceKind::Chat),
            "code-generation" => Ok(ServiceKind::CodeGeneration),
            "code-analysis" => Ok(ServiceKind::CodeAnalysis),
            "debug-assistance" => Ok(ServiceKind::DebugAssistance),
            "refactoring" => Ok(ServiceKind::Refactoring),
            "documentation" => Ok(ServiceKind::Documentation),
            other => Err(EngineError::Dispatch(format!(
                "unknown service kind {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequest {
    pub id: String,
    pub service_kind: ServiceKind,
    pub prompt: String,
    pub session_id: String,
    #[serde(default)]
    pub context: Map<String, Value>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn new(service_kind: ServiceKind, prompt: &str, session_id: &str) -> Self {
        Self {
            id: format!("completion_{}", Uuid::new_v4().simple()),
            service_kind,
            prompt: prompt.to_string(),
            session_id: session_id.to_string(),
            context: Map::new(),
            model: "claude-3-sonnet-20240229".to_string(),
            max_tokens: 4096,
            temperature: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionResponse {
    pub request_id: String,
    pub service_kind: ServiceKind,
    pub text: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// The external model backend.
#[async_trait]
pub trait CompletionEngine: Send + Sync {
    async fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn process(&self, request: &CompletionRequest) -> anyhow::Result<CompletionResponse>;
}

#[async_trait]
pub trait CompletionCallback: Send + Sync {
    async fn on_response(&self, response: &CompletionResponse) -> anyhow::Result<()>;
}

struct QueuedRequest {
    request: CompletionRequest,
    callback_id: Option<String>,
    submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionQueueStatus {
    pub processing: bool,
    pub queue_size: usize,
    pub processed: u64,
    pub failed: u64,
    pub callbacks: usize,
}

pub struct CompletionQueue {
    sender: mpsc::UnboundedSender<QueuedRequest>,
    receiver: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<QueuedRequest>>>,
    engine: Arc<dyn CompletionEngine>,
    callbacks: Arc<DashMap<String, Arc<dyn CompletionCallback>>>,
    pending: Arc<AtomicUsize>,
    processed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    timeout: Option<Duration>,
}

impl CompletionQueue {
    pub fn new(engine: Arc<dyn CompletionEngine>, timeout: Option<Duration>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: parking_lot::Mutex::new(Some(receiver)),
            engine,
            callbacks: Arc::new(DashMap::new()),
            pending: Arc::new(AtomicUsize::new(0)),
            processed: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            timeout,
        }
    }

    pub fn register_callback(&self, callback_id: &str, callback: Arc<dyn CompletionCallback>) {
        self.callbacks.insert(callback_id.to_string(), callback);
        debug!(callback_id = %callback_id, "Completion callback registered");
    }

    /// Enqueue without waiting for processing. Returns the request id.
    pub fn submit(
        &self,
        session_id: &str,
        mut request: CompletionRequest,
        callback_id: Option<&str>,
    ) -> Result<String> {
        request.session_id = session_id.to_string();
        let request_id = request.id.clone();
        let service_kind = request.service_kind;

        self.pending.fetch_add(1, Ordering::SeqCst);
        let queued = QueuedRequest {
            request,
            callback_id: callback_id.map(str::to_string),
            submitted_at: Utc::now(),
        };
        if self.sender.send(queued).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(EngineError::InvalidState(
                "completion queue is closed".to_string(),
            ));
        }

        info!(
            request_id = %request_id,
            session_id = %session_id,
            service_kind = %service_kind,
            "Completion request submitted"
        );
        Ok(request_id)
    }

    /// Spawn the consumer task. Can only be started once.
    pub fn start(&self, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let receiver = self.receiver.lock().take().ok_or_else(|| {
            EngineError::InvalidState("completion worker already started".to_string())
        })?;

        let worker = CompletionWorker {
            engine: Arc::clone(&self.engine),
            callbacks: Arc::clone(&self.callbacks),
            pending: Arc::clone(&self.pending),
            processed: Arc::clone(&self.processed),
            failed: Arc::clone(&self.failed),
            running: Arc::clone(&self.running),
            timeout: self.timeout,
        };
        self.running.store(true, Ordering::SeqCst);

        Ok(tokio::spawn(worker.run(receiver, cancel)))
    }

    pub fn status(&self) -> CompletionQueueStatus {
        CompletionQueueStatus {
            processing: self.running.load(Ordering::SeqCst),
            queue_size: self.pending.load(Ordering::SeqCst),
            processed: self.processed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            callbacks: self.callbacks.len(),
        }
    }
}

struct CompletionWorker {
    engine: Arc<dyn CompletionEngine>,
    callbacks: Arc<DashMap<String, Arc<dyn CompletionCallback>>>,
    pending: Arc<AtomicUsize>,
    processed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    timeout: Option<Duration>,
}

impl CompletionWorker {
    async fn run(
        self,
        mut receiver: mpsc::UnboundedReceiver<QueuedRequest>,
        cancel: CancellationToken,
    ) {
        info!("Completion worker started");

        loop {
            let queued = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = receiver.recv() => match next {
                    Some(queued) => queued,
                    None => break,
                },
            };

            self.pending.fetch_sub(1, Ordering::SeqCst);
            let request_id = queued.request.id.clone();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(request_id = %request_id, "Completion aborted by shutdown");
                    break;
                }
                _ = self.process(queued) => {}
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
            warn!(dropped, "Completion worker stopped with queued requests");
        } else {
            info!("Completion worker stopped");
        }
    }

    async fn process(&self, queued: QueuedRequest) {
        let request = &queued.request;
        trace!(
            request_id = %request.id,
            queued_ms = (Utc::now() - queued.submitted_at).num_milliseconds(),
            "Processing completion request"
        );

        let outcome = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.engine.process(request)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(anyhow::anyhow!(
                    "completion timed out after {}s",
                    limit.as_secs()
                )),
            },
            None => self.engine.process(request).await,
        };

        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                error!(request_id = %request.id, error = %e, "Completion request failed, dropping");
                return;
            }
        };
        self.processed.fetch_add(1, Ordering::SeqCst);

        let Some(callback_id) = queued.callback_id.as_deref() else {
            debug!(request_id = %request.id, "Completion finished without callback");
            return;
        };
        let callback = self
            .callbacks
            .get(callback_id)
            .map(|entry| Arc::clone(entry.value()));
        match callback {
            Some(callback) => {
                if let Err(e) = callback.on_response(&response).await {
                    warn!(
                        request_id = %request.id,
                        callback_id = %callback_id,
                        error = %e,
                        "Completion callback failed"
                    );
                }
            }
            None => {
                warn!(
                    request_id = %request.id,
                    callback_id = %callback_id,
                    "No completion callback registered under id"
                );
            }
        }
    }
}
