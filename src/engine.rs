//! The orchestrator.
//!
//! `MirrorEngine` owns every component, wires the cross-component callbacks
//! and exposes the initialize/status/stop lifecycle. Components never reach
//! into each other; all effects flow through the callbacks registered here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::capture::{CaptureCallback, CapturedResult, ResultCapture};
use crate::completion::{
    CompletionCallback, CompletionEngine, CompletionQueue, CompletionQueueStatus,
    CompletionRequest, CompletionResponse, ServiceKind,
};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::bus::{ChannelInfo, Delivery};
use crate::events::{
    preview, ChannelListener, ChannelMessage, Event, EventBus, EventKind, EventSubscriber,
};
use crate::executor::Executor;
use crate::history::BoundedHistory;
use crate::protocol::{
    self, CompletionRequestMessage, ExecuteCommandMessage, MessageKind, SyncRequestMessage,
};
use crate::session::{MessageHandler, SessionServer};
use crate::sync::{SyncKind, SyncManager, SyncManagerStatus, SyncObserver, SyncOutcome, SyncStatus};

/// Source/subscriber id the engine uses on the bus.
pub const ENGINE_ID: &str = "mirror-engine";

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Uninitialized,
    Initializing,
    Active,
    Stopped,
    Failed,
}

/// External components the engine drives but does not implement.
pub struct Collaborators {
    pub executor: Arc<dyn Executor>,
    pub completion_engine: Arc<dyn CompletionEngine>,
}

#[derive(Debug, Default)]
pub struct EngineMetrics {
    commands_executed: AtomicU64,
    results_captured: AtomicU64,
    completions_processed: AtomicU64,
    sync_operations: AtomicU64,
    events_published: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub commands_executed: u64,
    pub results_captured: u64,
    pub completions_processed: u64,
    pub sync_operations: u64,
    pub events_published: u64,
}

impl EngineMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            commands_executed: self.commands_executed.load(Ordering::Relaxed),
            results_captured: self.results_captured.load(Ordering::Relaxed),
            completions_processed: self.completions_processed.load(Ordering::Relaxed),
            sync_operations: self.sync_operations.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitReport {
    pub status: String,
    pub components: BTreeMap<String, bool>,
    pub websocket_address: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorStatus {
    pub platforms: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureStatus {
    pub results: usize,
    pub filters: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommunicationStatus {
    pub channels: Vec<ChannelInfo>,
    pub event_subscribers: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketStatus {
    pub status: String,
    pub sessions: usize,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    pub executor: ExecutorStatus,
    pub capture: CaptureStatus,
    pub completion: CompletionQueueStatus,
    pub sync: SyncManagerStatus,
    pub communication: CommunicationStatus,
    pub websocket: WebSocketStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub state: EngineState,
    pub initialized_at: Option<DateTime<Utc>>,
    pub components: ComponentStatus,
    pub metrics: MetricsSnapshot,
    pub event_history: usize,
    pub capabilities: BTreeMap<String, bool>,
}

/// State shared with the callbacks the engine registers.
struct Shared {
    bus: Arc<EventBus>,
    sessions: Arc<SessionServer>,
    history: BoundedHistory<Event>,
    metrics: EngineMetrics,
}

impl Shared {
    /// Append to the engine history, then deliver to typed subscribers.
    async fn publish_event(&self, event: Event) -> Delivery {
        self.history.push(event.clone());
        self.metrics.events_published.fetch_add(1, Ordering::Relaxed);
        self.bus.publish(&event).await
    }

    async fn mirror_to_channel(&self, channel_id: &str, content: Value) {
        if self
            .bus
            .send_message(channel_id, content, ENGINE_ID)
            .await
            .is_none()
        {
            trace!(channel_id = %channel_id, "Channel not configured, message not mirrored");
        }
    }
}

pub struct MirrorEngine {
    config: EngineConfig,
    state: RwLock<EngineState>,
    initialized_at: RwLock<Option<DateTime<Utc>>>,
    executor: Arc<dyn Executor>,
    completion_engine: Arc<dyn CompletionEngine>,
    capture: Arc<ResultCapture>,
    completion: Arc<CompletionQueue>,
    sync: Arc<SyncManager>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl MirrorEngine {
    /// Build every component from `config`. Nothing runs until
    /// [`MirrorEngine::initialize`].
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Self {
        let cancel = CancellationToken::new();
        let completion_timeout = config.completion.timeout_secs.map(Duration::from_secs);
        let sync_timeout = config.sync.timeout_secs.map(Duration::from_secs);

        let shared = Arc::new(Shared {
            bus: Arc::new(EventBus::new(config.communication.channel_history_limit)),
            sessions: Arc::new(SessionServer::new(
                config.websocket.clone(),
                cancel.child_token(),
            )),
            history: BoundedHistory::new(config.events.history_limit, config.events.history_trim_to),
            metrics: EngineMetrics::default(),
        });

        Self {
            capture: Arc::new(ResultCapture::new(
                config.capture.max_results,
                config.capture.trim_to,
            )),
            completion: Arc::new(CompletionQueue::new(
                Arc::clone(&collaborators.completion_engine),
                completion_timeout,
            )),
            sync: Arc::new(SyncManager::new(config.sync.history_limit, sync_timeout)),
            executor: collaborators.executor,
            completion_engine: collaborators.completion_engine,
            config,
            state: RwLock::new(EngineState::Uninitialized),
            initialized_at: RwLock::new(None),
            shared,
            cancel,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Run the ordered startup sequence. Any failure leaves the engine in
    /// `failed`, cancels whatever was already started and is returned as an
    /// initialization error.
    pub async fn initialize(&self) -> Result<InitReport> {
        {
            let mut state = self.state.write();
            if *state != EngineState::Uninitialized {
                return Err(EngineError::InvalidState(format!(
                    "engine cannot initialize from {:?}",
                    *state
                )));
            }
            *state = EngineState::Initializing;
        }
        info!("Initializing mirror engine");

        match self.startup().await {
            Ok(report) => {
                *self.state.write() = EngineState::Active;
                *self.initialized_at.write() = Some(report.timestamp);
                self.publish_status("active").await;
                info!(websocket = %report.websocket_address, "Mirror engine active");
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, "Mirror engine initialization failed");
                *self.state.write() = EngineState::Failed;
                self.cancel.cancel();
                Err(e)
            }
        }
    }

    async fn startup(&self) -> Result<InitReport> {
        // 1. executor
        self.executor
            .initialize()
            .await
            .map_err(|e| EngineError::initialization("executor", e))?;
        debug!(platforms = ?self.executor.platforms(), "Executor ready");

        // 2. result capture
        if self.config.capture.capture_all {
            self.capture.add_filter(|_| true);
        }
        self.capture.add_callback(Arc::new(CaptureBroadcaster {
            shared: Arc::clone(&self.shared),
            preview_chars: self.config.capture.output_preview_chars,
        }));
        debug!("Result capture ready");

        // 3. completion queue
        self.completion_engine
            .initialize()
            .await
            .map_err(|e| EngineError::initialization("completion", e))?;
        self.completion.register_callback(
            &self.config.completion.callback_id,
            Arc::new(CompletionBroadcaster {
                shared: Arc::clone(&self.shared),
                preview_chars: self.config.completion.response_preview_chars,
            }),
        );
        let handle = self
            .completion
            .start(self.cancel.clone())
            .map_err(|e| EngineError::initialization("completion", e))?;
        self.workers.lock().push(handle);

        // 4. sync manager
        for rule in &self.config.sync.rules {
            self.sync.add_rule(rule.clone());
        }
        self.sync.add_observer(Arc::new(SyncEventPublisher {
            shared: Arc::clone(&self.shared),
        }));
        let handle = self
            .sync
            .start(self.cancel.clone())
            .map_err(|e| EngineError::initialization("sync", e))?;
        self.workers.lock().push(handle);

        // 5. channels and subscribers
        let bus = &self.shared.bus;
        for channel in &self.config.communication.channels {
            bus.create_channel(&channel.id, &channel.kind);
            bus.subscribe(&channel.id, ENGINE_ID);
        }
        bus.register_listener(ENGINE_ID, Arc::new(ChannelLogger));
        let logger = Arc::new(EventLogger);
        for kind in EventKind::ALL {
            bus.register_event_subscriber(kind, logger.clone());
        }

        // 6. session server
        let sessions = &self.shared.sessions;
        sessions.register_handler(
            MessageKind::ExecuteCommand,
            Arc::new(ExecuteCommandHandler {
                executor: Arc::clone(&self.executor),
                capture: Arc::clone(&self.capture),
                shared: Arc::clone(&self.shared),
            }),
        );
        sessions.register_handler(
            MessageKind::CompletionRequest,
            Arc::new(CompletionRequestHandler {
                completion: Arc::clone(&self.completion),
                callback_id: self.config.completion.callback_id.clone(),
            }),
        );
        sessions.register_handler(
            MessageKind::SyncRequest,
            Arc::new(SyncRequestHandler {
                sync: Arc::clone(&self.sync),
                shared: Arc::clone(&self.shared),
            }),
        );
        let address = sessions
            .start()
            .await
            .map_err(|e| EngineError::initialization("websocket", e))?;

        let components = ["executor", "capture", "completion", "sync", "communication", "websocket"]
            .into_iter()
            .map(|name| (name.to_string(), true))
            .collect();

        Ok(InitReport {
            status: "initialized".to_string(),
            components,
            websocket_address: address.to_string(),
            timestamp: Utc::now(),
        })
    }

    /// Cancel both workers, close the session server and wait for the
    /// workers to exit. Items still queued are dropped.
    pub async fn stop(&self) {
        if *self.state.read() == EngineState::Stopped {
            return;
        }
        self.publish_status("stopping").await;

        self.cancel.cancel();
        self.shared.sessions.stop();

        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }

        *self.state.write() = EngineState::Stopped;
        info!("Mirror engine stopped");
    }

    /// Record an event in the engine history and deliver it to subscribers
    /// of its kind. With no subscribers the event is still recorded.
    pub async fn publish_event(&self, event: Event) -> Delivery {
        self.shared.publish_event(event).await
    }

    async fn publish_status(&self, state: &str) {
        let event = Event::new(
            EventKind::StatusUpdate,
            ENGINE_ID,
            "all",
            json!({ "state": state }),
        );
        self.shared
            .mirror_to_channel("status", json!({ "type": "status-update", "state": state }))
            .await;
        self.shared.publish_event(event).await;
    }

    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    /// Most recent events, newest first.
    pub fn recent_events(&self, limit: usize) -> Vec<Event> {
        self.shared.history.recent(limit)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn capture(&self) -> &Arc<ResultCapture> {
        &self.capture
    }

    pub fn completion(&self) -> &Arc<CompletionQueue> {
        &self.completion
    }

    pub fn sync(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.shared.bus
    }

    pub fn sessions(&self) -> &Arc<SessionServer> {
        &self.shared.sessions
    }

    pub fn status(&self) -> EngineStatus {
        let sessions = &self.shared.sessions;
        let websocket_config = sessions.config();
        let port = sessions
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(websocket_config.port);

        let capabilities = [
            "commandExecution",
            "resultCapture",
            "completions",
            "sync",
            "channels",
            "websocket",
        ]
        .into_iter()
        .map(|name| (name.to_string(), true))
        .collect();

        EngineStatus {
            state: self.state(),
            initialized_at: *self.initialized_at.read(),
            components: ComponentStatus {
                executor: ExecutorStatus {
                    platforms: self.executor.platforms().len(),
                },
                capture: CaptureStatus {
                    results: self.capture.len(),
                    filters: self.capture.filter_count(),
                },
                completion: self.completion.status(),
                sync: self.sync.status(),
                communication: CommunicationStatus {
                    channels: self.shared.bus.channels(),
                    event_subscribers: self.shared.bus.subscriber_count(),
                },
                websocket: WebSocketStatus {
                    status: if sessions.is_running() {
                        "running".to_string()
                    } else {
                        "stopped".to_string()
                    },
                    sessions: sessions.session_count(),
                    host: websocket_config.host.clone(),
                    port,
                },
            },
            metrics: self.metrics(),
            event_history: self.shared.history.len(),
            capabilities,
        }
    }
}

/// Publishes `result-captured` and fans the result out to every session.
struct CaptureBroadcaster {
    shared: Arc<Shared>,
    preview_chars: usize,
}

#[async_trait]
impl CaptureCallback for CaptureBroadcaster {
    async fn on_captured(&self, result: &CapturedResult) -> anyhow::Result<()> {
        self.shared
            .metrics
            .results_captured
            .fetch_add(1, Ordering::Relaxed);

        let payload = json!({
            "resultId": result.id,
            "command": result.command,
            "exitCode": result.exit_code,
            "platform": result.platform,
        });
        let event = Event::new(EventKind::ResultCaptured, ENGINE_ID, "all", payload.clone());
        self.shared.publish_event(event).await;

        let delivery = self
            .shared
            .sessions
            .broadcast(&protocol::result_captured(result, self.preview_chars));
        debug!(result_id = %result.id, ?delivery, "Captured result broadcast");

        self.shared
            .mirror_to_channel("events", json!({ "type": "result-captured", "result": payload }))
            .await;
        Ok(())
    }
}

/// Publishes `completion-response` and broadcasts the full response.
struct CompletionBroadcaster {
    shared: Arc<Shared>,
    preview_chars: usize,
}

#[async_trait]
impl CompletionCallback for CompletionBroadcaster {
    async fn on_response(&self, response: &CompletionResponse) -> anyhow::Result<()> {
        self.shared
            .metrics
            .completions_processed
            .fetch_add(1, Ordering::Relaxed);

        let payload = json!({
            "requestId": response.request_id,
            "serviceKind": response.service_kind,
            "preview": preview(&response.text, self.preview_chars),
            "durationMs": response.duration_ms,
        });
        let event = Event::new(EventKind::CompletionResponse, ENGINE_ID, "all", payload.clone());
        self.shared.publish_event(event).await;

        let delivery = self
            .shared
            .sessions
            .broadcast(&protocol::completion_response(response));
        debug!(request_id = %response.request_id, ?delivery, "Completion response broadcast");

        self.shared
            .mirror_to_channel(
                "completions",
                json!({ "type": "completion-response", "response": payload }),
            )
            .await;
        Ok(())
    }
}

/// Turns sync outcomes into `sync-completed` or `error` events.
struct SyncEventPublisher {
    shared: Arc<Shared>,
}

#[async_trait]
impl SyncObserver for SyncEventPublisher {
    async fn on_outcome(&self, outcome: &SyncOutcome) -> anyhow::Result<()> {
        let (kind, payload) = match outcome.status {
            SyncStatus::Completed => (
                EventKind::SyncCompleted,
                json!({ "taskId": outcome.task_id, "syncKind": outcome.kind }),
            ),
            SyncStatus::Failed => (
                EventKind::Error,
                json!({
                    "taskId": outcome.task_id,
                    "syncKind": outcome.kind,
                    "error": outcome.error,
                }),
            ),
        };
        self.shared
            .publish_event(Event::new(kind, ENGINE_ID, "all", payload))
            .await;
        Ok(())
    }
}

struct EventLogger;

#[async_trait]
impl EventSubscriber for EventLogger {
    async fn on_event(&self, event: &Event) -> anyhow::Result<()> {
        debug!(
            event_id = %event.id,
            kind = %event.kind,
            source = %event.source,
            target = %event.target,
            "Event"
        );
        Ok(())
    }
}

struct ChannelLogger;

#[async_trait]
impl ChannelListener for ChannelLogger {
    async fn on_message(&self, message: &ChannelMessage) -> anyhow::Result<()> {
        trace!(
            channel_id = %message.channel_id,
            message_id = %message.id,
            sender_id = %message.sender_id,
            "Channel message"
        );
        Ok(())
    }
}

struct ExecuteCommandHandler {
    executor: Arc<dyn Executor>,
    capture: Arc<ResultCapture>,
    shared: Arc<Shared>,
}

impl ExecuteCommandHandler {
    fn resolve_platform(&self, requested: &str) -> Result<String> {
        let platforms = self.executor.platforms();
        if requested == "auto" {
            return platforms.into_iter().next().ok_or_else(|| {
                EngineError::Dispatch("no platform adapters available".to_string())
            });
        }
        if platforms.iter().any(|p| p == requested) {
            Ok(requested.to_string())
        } else {
            Err(EngineError::Dispatch(format!(
                "platform {} is not available",
                requested
            )))
        }
    }
}

#[async_trait]
impl MessageHandler for ExecuteCommandHandler {
    async fn handle(&self, session_id: &str, payload: &Value) -> Result<Option<Value>> {
        let message: ExecuteCommandMessage = protocol::parse_payload(payload)?;
        if message.command.trim().is_empty() {
            return Err(EngineError::Dispatch("command must not be empty".to_string()));
        }
        let platform = self.resolve_platform(&message.platform)?;

        info!(session_id = %session_id, command = %message.command, platform = %platform, "Executing command");
        let output = self
            .executor
            .execute(&message.command, &platform)
            .await
            .map_err(|e| EngineError::Dispatch(format!("execution failed: {}", e)))?;
        self.shared
            .metrics
            .commands_executed
            .fetch_add(1, Ordering::Relaxed);

        let captured = self
            .capture
            .capture(&message.command, &output, &platform)
            .await;

        let event = Event::new(
            EventKind::CommandExecuted,
            ENGINE_ID,
            "all",
            json!({
                "command": message.command,
                "platform": platform,
                "exitCode": output.exit_code,
                "durationMs": output.duration_ms,
            }),
        )
        .with_metadata("sessionId", json!(session_id));
        self.shared.publish_event(event).await;

        Ok(Some(protocol::command_executed(
            &message.command,
            &platform,
            &output,
            captured.as_ref(),
        )))
    }
}

struct CompletionRequestHandler {
    completion: Arc<CompletionQueue>,
    callback_id: String,
}

#[async_trait]
impl MessageHandler for CompletionRequestHandler {
    async fn handle(&self, session_id: &str, payload: &Value) -> Result<Option<Value>> {
        let message: CompletionRequestMessage = protocol::parse_payload(payload)?;
        if message.prompt.trim().is_empty() {
            return Err(EngineError::Dispatch("prompt must not be empty".to_string()));
        }
        let service_kind: ServiceKind = message.service_kind.parse()?;

        let mut request = CompletionRequest::new(service_kind, &message.prompt, session_id);
        request.context = message.context;
        let request_id = self
            .completion
            .submit(session_id, request, Some(self.callback_id.as_str()))?;

        Ok(Some(protocol::completion_request_submitted(&request_id)))
    }
}

struct SyncRequestHandler {
    sync: Arc<SyncManager>,
    shared: Arc<Shared>,
}

#[async_trait]
impl MessageHandler for SyncRequestHandler {
    async fn handle(&self, session_id: &str, payload: &Value) -> Result<Option<Value>> {
        let message: SyncRequestMessage = protocol::parse_payload(payload)?;
        let kind: SyncKind = message.sync_kind.parse()?;

        let task_id = self.sync.submit(kind, message.data)?;
        self.shared
            .metrics
            .sync_operations
            .fetch_add(1, Ordering::Relaxed);
        debug!(session_id = %session_id, task_id = %task_id, kind = %kind, "Sync request accepted");

        Ok(Some(protocol::sync_request_submitted(&task_id)))
    }
}
