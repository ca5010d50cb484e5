use serde::Deserialize;
use std::path::Path;

use crate::{
    error::Result,
    sync::{SyncDirection, SyncRule},
};

/// Engine configuration, one section per component in initialization order.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub capture: CaptureConfig,
    pub completion: CompletionConfig,
    pub sync: SyncConfig,
    pub communication: CommunicationConfig,
    pub websocket: WebSocketConfig,
    pub events: EventHistoryConfig,
}

impl EngineConfig {
    /// Load configuration from an optional file plus `MIRROR_*` environment
    /// overrides (`MIRROR_WEBSOCKET__PORT=9000`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("MIRROR")
                .prefix_separator("_")
                .separator("__"),
        );
        Ok(builder.build()?.try_deserialize()?)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Install a match-everything filter at startup
    pub capture_all: bool,
    pub max_results: usize,
    pub trim_to: usize,
    /// Stdout characters included in `result-captured` broadcasts
    pub output_preview_chars: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            capture_all: true,
            max_results: 1000,
            trim_to: 500,
            output_preview_chars: 200,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    /// Callback id the engine registers its response handler under
    pub callback_id: String,
    /// No timeout unless set; a hung engine call stalls the whole queue
    pub timeout_secs: Option<u64>,
    pub response_preview_chars: usize,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            callback_id: "mirror-engine".to_string(),
            timeout_secs: None,
            response_preview_chars: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub rules: Vec<SyncRule>,
    pub history_limit: usize,
    pub timeout_secs: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            rules: vec![
                SyncRule::new("*.py", SyncDirection::Bidirectional, vec!["all".to_string()]),
                SyncRule::new(
                    "stdout",
                    SyncDirection::LocalToRemote,
                    vec!["remote".to_string()],
                ),
            ],
            history_limit: 1000,
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelSpec {
    pub id: String,
    #[serde(rename = "type", default = "default_channel_kind")]
    pub kind: String,
}

fn default_channel_kind() -> String {
    "general".to_string()
}

impl ChannelSpec {
    pub fn new(id: &str, kind: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: kind.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommunicationConfig {
    pub channels: Vec<ChannelSpec>,
    pub channel_history_limit: usize,
}

impl Default for CommunicationConfig {
    fn default() -> Self {
        Self {
            channels: vec![
                ChannelSpec::new("events", "events"),
                ChannelSpec::new("completions", "completions"),
                ChannelSpec::new("status", "status"),
            ],
            channel_history_limit: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    pub host: String,
    pub port: u16,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
        }
    }
}

impl WebSocketConfig {
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventHistoryConfig {
    pub history_limit: usize,
    pub history_trim_to: usize,
}

impl Default for EventHistoryConfig {
    fn default() -> Self {
        Self {
            history_limit: 1000,
            history_trim_to: 500,
        }
    }
}
