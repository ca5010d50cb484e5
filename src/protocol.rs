//! JSON envelopes exchanged with session clients.
//!
//! Every frame is an object with a `type` field. Inbound frames are routed on
//! [`MessageKind`]; outbound frames are built by the helpers below so the
//! field names stay in one place.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::str::FromStr;

use crate::capture::{CapturedResult, ExecutionOutput};
use crate::completion::CompletionResponse;
use crate::error::{EngineError, Result};
use crate::events::preview;

/// Inbound message types a session may send.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    ExecuteCommand,
    CompletionRequest,
    SyncRequest,
}

impl MessageKind {
    pub const ALL: [MessageKind; 3] = [
        MessageKind::ExecuteCommand,
        MessageKind::CompletionRequest,
        MessageKind::SyncRequest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::ExecuteCommand => "execute-command",
            MessageKind::CompletionRequest => "completion-request",
            MessageKind::SyncRequest => "sync-request",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "execute-command" => Ok(MessageKind::ExecuteCommand),
            "completion-request" => Ok(MessageKind::CompletionRequest),
            "sync-request" => Ok(MessageKind::SyncRequest),
            other => Err(EngineError::Protocol(format!("unknown type {}", other))),
        }
    }
}

fn default_platform() -> String {
    "auto".to_string()
}

fn default_service_kind() -> String {
    "chat".to_string()
}

fn default_sync_kind() -> String {
    "result-sync".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteCommandMessage {
    #[serde(default)]
    pub command: String,
    #[serde(default = "default_platform")]
    pub platform: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequestMessage {
    #[serde(default = "default_service_kind")]
    pub service_kind: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub context: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequestMessage {
    #[serde(default = "default_sync_kind")]
    pub sync_kind: String,
    #[serde(default)]
    pub data: Value,
}

/// Decode a routed frame into its typed form.
pub fn parse_payload<T: DeserializeOwned>(payload: &Value) -> Result<T> {
    T::deserialize(payload).map_err(|e| EngineError::Protocol(format!("invalid payload: {}", e)))
}

/// Seconds since the Unix epoch, with millisecond precision.
fn epoch_seconds() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

pub fn connection_established(session_id: &str) -> Value {
    json!({
        "type": "connection-established",
        "sessionId": session_id,
        "serverTime": epoch_seconds(),
    })
}

pub fn error(message: &str) -> Value {
    json!({
        "type": "error",
        "message": message,
    })
}

pub fn command_executed(
    command: &str,
    platform: &str,
    output: &ExecutionOutput,
    captured: Option<&CapturedResult>,
) -> Value {
    json!({
        "type": "command-executed",
        "command": command,
        "platform": platform,
        "result": output,
        "resultId": captured.map(|r| r.id.as_str()),
    })
}

pub fn completion_request_submitted(request_id: &str) -> Value {
    json!({
        "type": "completion-request-submitted",
        "requestId": request_id,
    })
}

pub fn sync_request_submitted(task_id: &str) -> Value {
    json!({
        "type": "sync-request-submitted",
        "taskId": task_id,
    })
}

/// Broadcast form of a captured result; stdout is cut to `preview_chars`.
pub fn result_captured(result: &CapturedResult, preview_chars: usize) -> Value {
    json!({
        "type": "result-captured",
        "result": {
            "id": result.id,
            "command": result.command,
            "stdout": preview(&result.stdout, preview_chars),
            "stderr": preview(&result.stderr, preview_chars),
            "exitCode": result.exit_code,
            "durationMs": result.duration_ms,
            "platform": result.platform,
            "capturedAt": result.captured_at.to_rfc3339(),
        },
    })
}

pub fn completion_response(response: &CompletionResponse) -> Value {
    json!({
        "type": "completion-response",
        "response": response,
    })
}
