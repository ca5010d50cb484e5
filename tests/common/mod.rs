//! Shared helpers for the integration tests: a WebSocket client wrapper and
//! scripted collaborators.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use mirror_engine::capture::ExecutionOutput;
use mirror_engine::completion::{CompletionEngine, CompletionRequest, CompletionResponse};
use mirror_engine::config::{EngineConfig, WebSocketConfig};
use mirror_engine::executor::Executor;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestClient {
    pub session_id: String,
    sink: SplitSink<Stream, Message>,
    stream: SplitStream<Stream>,
}

impl TestClient {
    /// Connect and consume the handshake frame.
    pub async fn connect(addr: SocketAddr) -> Self {
        let url = format!("ws://127.0.0.1:{}/ws", addr.port());
        let (ws, _) = connect_async(url.as_str()).await.expect("websocket connect failed");
        let (sink, stream) = ws.split();
        let mut client = Self {
            session_id: String::new(),
            sink,
            stream,
        };

        let handshake = client.recv().await;
        assert_eq!(handshake["type"], "connection-established");
        client.session_id = handshake["sessionId"]
            .as_str()
            .expect("handshake without sessionId")
            .to_string();
        client
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.sink
            .send(Message::Text(text.to_string()))
            .await
            .expect("websocket send failed");
    }

    pub async fn send(&mut self, payload: &Value) {
        self.send_raw(&payload.to_string()).await;
    }

    /// Next JSON text frame, skipping control frames.
    pub async fn recv(&mut self) -> Value {
        loop {
            let msg = timeout(RECV_TIMEOUT, self.stream.next())
                .await
                .expect("timed out waiting for frame")
                .expect("connection closed")
                .expect("websocket error");
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).expect("server sent invalid JSON");
            }
        }
    }

    /// Read frames until one with the given `type` arrives.
    pub async fn recv_type(&mut self, message_type: &str) -> Value {
        loop {
            let frame = self.recv().await;
            if frame["type"] == message_type {
                return frame;
            }
        }
    }

    /// True once the server has closed the connection.
    pub async fn is_closed(&mut self) -> bool {
        loop {
            match timeout(RECV_TIMEOUT, self.stream.next()).await {
                Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return true,
                Ok(Some(Ok(_))) => continue,
                Err(_) => return false,
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
    }
}

/// Poll `condition` every 10ms until it holds or the receive timeout passes.
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    timeout(RECV_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub fn ephemeral_websocket() -> WebSocketConfig {
    WebSocketConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        websocket: ephemeral_websocket(),
        ..Default::default()
    }
}

/// Executor that answers every command from memory.
pub struct ScriptedExecutor {
    pub platforms: Vec<String>,
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self {
            platforms: vec!["linux".to_string()],
        }
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    fn platforms(&self) -> Vec<String> {
        self.platforms.clone()
    }

    async fn execute(&self, command: &str, platform: &str) -> anyhow::Result<ExecutionOutput> {
        let stdout = command
            .strip_prefix("echo ")
            .map(|rest| format!("{}\n", rest))
            .unwrap_or_default();
        Ok(ExecutionOutput {
            stdout,
            stderr: String::new(),
            exit_code: 0,
            duration_ms: 1,
            status: "success".to_string(),
            execution_location: Some(platform.to_string()),
        })
    }
}

/// Completion backend that upper-cases the prompt, or refuses to start.
#[derive(Default)]
pub struct ShoutingEngine {
    pub fail_init: bool,
}

#[async_trait]
impl CompletionEngine for ShoutingEngine {
    async fn initialize(&self) -> anyhow::Result<()> {
        if self.fail_init {
            anyhow::bail!("model credentials missing");
        }
        Ok(())
    }

    async fn process(&self, request: &CompletionRequest) -> anyhow::Result<CompletionResponse> {
        Ok(CompletionResponse {
            request_id: request.id.clone(),
            service_kind: request.service_kind,
            text: request.prompt.to_uppercase(),
            duration_ms: 1,
            metadata: Map::new(),
        })
    }
}
