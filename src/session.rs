//! WebSocket session server.
//!
//! Each accepted connection becomes a session with its own id, an outgoing
//! queue drained by a writer task, and a receive loop that routes JSON frames
//! by their `type` field to the registered [`MessageHandler`]s.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::{Json, Response};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::config::WebSocketConfig;
use crate::error::{EngineError, Result};
use crate::events::bus::Delivery;
use crate::protocol::{self, MessageKind};

/// Handles one inbound message kind. A returned value is sent back to the
/// originating session only.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, session_id: &str, payload: &Value) -> Result<Option<Value>>;
}

#[derive(Debug, Clone)]
struct Session {
    sender: mpsc::UnboundedSender<Message>,
    connected_at: DateTime<Utc>,
}

pub struct SessionServer {
    config: WebSocketConfig,
    sessions: Arc<DashMap<String, Session>>,
    handlers: RwLock<HashMap<MessageKind, Arc<dyn MessageHandler>>>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl SessionServer {
    /// `cancel` ends the accept loop and every session when triggered.
    pub fn new(config: WebSocketConfig, cancel: CancellationToken) -> Self {
        Self {
            config,
            sessions: Arc::new(DashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            cancel,
            local_addr: Mutex::new(None),
        }
    }

    pub fn register_handler(&self, kind: MessageKind, handler: Arc<dyn MessageHandler>) {
        self.handlers.write().insert(kind, handler);
        debug!(message_type = %kind, "Message handler registered");
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Bind the listener and start accepting connections in the background.
    /// Returns the bound address, which differs from the configured one when
    /// port 0 was requested.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::InvalidState(
                "session server has been stopped".to_string(),
            ));
        }
        if self.local_addr.lock().is_some() {
            return Err(EngineError::InvalidState(
                "session server already started".to_string(),
            ));
        }

        let listener = tokio::net::TcpListener::bind(self.config.server_address()).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(addr);

        let app = Router::new()
            .route("/health", get(health_check))
            .route("/ws", get(websocket_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(self));

        let shutdown = self.cancel.clone();
        tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            match serve.await {
                Ok(()) => info!("Session server stopped"),
                Err(e) => error!(error = %e, "Session server error"),
            }
        });

        info!(address = %addr, "Session server listening");
        Ok(addr)
    }

    /// Stop accepting connections and close every open session.
    pub fn stop(&self) {
        self.cancel.cancel();
        for entry in self.sessions.iter() {
            let _ = entry.value().sender.send(Message::Close(None));
        }
        self.sessions.clear();
    }

    pub fn is_running(&self) -> bool {
        self.local_addr.lock().is_some() && !self.cancel.is_cancelled()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn config(&self) -> &WebSocketConfig {
        &self.config
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Send `payload` to every connected session. The frame is serialized
    /// once; a session whose writer has gone away is counted and skipped.
    pub fn broadcast(&self, payload: &Value) -> Delivery {
        let text = payload.to_string();
        let mut delivery = Delivery::default();

        for entry in self.sessions.iter() {
            if entry.value().sender.send(Message::Text(text.clone())).is_ok() {
                delivery.delivered += 1;
            } else {
                delivery.failed += 1;
                warn!(session_id = %entry.key(), "Broadcast to session failed");
            }
        }

        trace!(?delivery, "Broadcast sent");
        delivery
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let session_id = Uuid::new_v4().to_string();
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let writer_session = session_id.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    warn!(session_id = %writer_session, "Failed to send to session, connection broken");
                    break;
                }
            }
            trace!(session_id = %writer_session, "Session writer ended");
        });

        // Handshake is queued before registration so no broadcast can overtake it
        let handshake = protocol::connection_established(&session_id);
        if tx.send(Message::Text(handshake.to_string())).is_err() {
            return;
        }
        self.sessions.insert(
            session_id.clone(),
            Session {
                sender: tx.clone(),
                connected_at: Utc::now(),
            },
        );
        info!(session_id = %session_id, sessions = self.sessions.len(), "Session connected");

        loop {
            let msg = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    let _ = tx.send(Message::Close(None));
                    break;
                }
                msg = stream.next() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            match msg {
                Ok(Message::Text(text)) => {
                    if let Some(reply) = self.route(&session_id, &text).await {
                        if tx.send(Message::Text(reply.to_string())).is_err() {
                            warn!(session_id = %session_id, "Failed to queue reply");
                            break;
                        }
                    }
                }
                Ok(Message::Close(frame)) => {
                    debug!(session_id = %session_id, ?frame, "Session sent close frame");
                    break;
                }
                Ok(Message::Ping(data)) => {
                    if tx.send(Message::Pong(data)).is_err() {
                        break;
                    }
                }
                Ok(Message::Pong(_)) => {}
                Ok(Message::Binary(data)) => {
                    warn!(session_id = %session_id, bytes = data.len(), "Ignoring binary frame");
                }
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Session connection error");
                    break;
                }
            }
        }

        let duration = self
            .sessions
            .remove(&session_id)
            .map(|(_, session)| (Utc::now() - session.connected_at).num_seconds());
        info!(session_id = %session_id, connected_secs = ?duration, "Session disconnected");
    }

    /// Parse and dispatch one text frame, returning the reply if any.
    async fn route(&self, session_id: &str, text: &str) -> Option<Value> {
        let payload: Value = match serde_json::from_str(text) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "Malformed frame");
                return Some(protocol::error("invalid JSON"));
            }
        };

        let Some(message_type) = payload.get("type").and_then(Value::as_str) else {
            return Some(protocol::error("missing type field"));
        };
        debug!(session_id = %session_id, message_type = %message_type, "Frame received");

        let handler = message_type
            .parse::<MessageKind>()
            .ok()
            .and_then(|kind| self.handlers.read().get(&kind).cloned());
        let Some(handler) = handler else {
            return Some(protocol::error(&format!("unknown type {}", message_type)));
        };

        match handler.handle(session_id, &payload).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(session_id = %session_id, message_type = %message_type, error = %e, "Handler failed");
                Some(e.to_wire())
            }
        }
    }
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(server): State<Arc<SessionServer>>,
) -> Response {
    ws.on_upgrade(move |socket| server.handle_socket(socket))
}

async fn health_check(State(server): State<Arc<SessionServer>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "mirror-engine",
        "sessions": server.session_count(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}
