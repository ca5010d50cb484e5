//! Collaborator seams for running commands, plus local stand-ins used by the
//! binary when no external executor or model backend is wired in.

use async_trait::async_trait;
use serde_json::{json, Map};
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, info};

use crate::capture::ExecutionOutput;
use crate::completion::{CompletionEngine, CompletionRequest, CompletionResponse};

/// Runs a command on one of the platforms it advertises.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Platform labels in preference order. The first one is used for
    /// `auto` dispatch.
    fn platforms(&self) -> Vec<String>;

    async fn execute(&self, command: &str, platform: &str) -> anyhow::Result<ExecutionOutput>;
}

/// Runs commands through `sh -c` on the host.
pub struct LocalShellExecutor {
    platform: String,
}

impl Default for LocalShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalShellExecutor {
    pub fn new() -> Self {
        Self {
            platform: std::env::consts::OS.to_string(),
        }
    }
}

#[async_trait]
impl Executor for LocalShellExecutor {
    fn platforms(&self) -> Vec<String> {
        vec![self.platform.clone()]
    }

    async fn execute(&self, command: &str, platform: &str) -> anyhow::Result<ExecutionOutput> {
        let started = Instant::now();
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(command = %command, platform = %platform, "Spawning shell command");
        let output = cmd.spawn()?.wait_with_output().await?;
        let exit_code = output.status.code().unwrap_or(-1);

        info!(command = %command, exit_code, "Shell command completed");
        Ok(ExecutionOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code,
            duration_ms: started.elapsed().as_millis() as u64,
            status: if output.status.success() {
                "success".to_string()
            } else {
                "failed".to_string()
            },
            execution_location: Some("local".to_string()),
        })
    }
}

/// Answers every request by echoing the prompt back.
pub struct EchoCompletionEngine;

#[async_trait]
impl CompletionEngine for EchoCompletionEngine {
    async fn process(&self, request: &CompletionRequest) -> anyhow::Result<CompletionResponse> {
        let started = Instant::now();
        let mut metadata = Map::new();
        metadata.insert("model".to_string(), json!(request.model));
        metadata.insert("backend".to_string(), json!("echo"));

        Ok(CompletionResponse {
            request_id: request.id.clone(),
            service_kind: request.service_kind,
            text: format!("[{}] {}", request.service_kind, request.prompt),
            duration_ms: started.elapsed().as_millis() as u64,
            metadata,
        })
    }
}
