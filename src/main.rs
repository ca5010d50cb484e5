use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use mirror_engine::{
    config::EngineConfig,
    executor::{EchoCompletionEngine, LocalShellExecutor},
    Collaborators, MirrorEngine,
};

#[derive(Parser)]
#[command(name = "mirror-engine")]
#[command(about = "Orchestration hub for command execution, completions and sync")]
struct Args {
    /// Configuration file (TOML, JSON or YAML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// WebSocket host, overrides the config file
    #[arg(long)]
    host: Option<String>,

    /// WebSocket port, overrides the config file
    #[arg(long)]
    port: Option<u16>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Directory for daily rolling log files
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Console log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Capture the result of every executed command
    #[arg(long)]
    capture_all: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter =
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    let console = if args.log_format == "json" {
        tracing_subscriber::fmt::layer()
            .json()
            .with_filter(env_filter())
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_filter(env_filter())
            .boxed()
    };

    // Guard must outlive the runtime or buffered lines are lost
    let (file_layer, _guard) = match &args.log_dir {
        Some(logs_dir) => {
            std::fs::create_dir_all(logs_dir)?;
            let file_appender = tracing_appender::rolling::daily(logs_dir, "mirror-engine.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(env_filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .init();

    info!("Starting Mirror Engine");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = EngineConfig::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.websocket.host = host;
    }
    if let Some(port) = args.port {
        config.websocket.port = port;
    }
    if let Some(capture_all) = args.capture_all {
        config.capture.capture_all = capture_all;
    }
    info!("WebSocket: {}", config.websocket.server_address());

    let engine = MirrorEngine::new(
        config,
        Collaborators {
            executor: Arc::new(LocalShellExecutor::new()),
            completion_engine: Arc::new(EchoCompletionEngine),
        },
    );
    let report = engine.initialize().await?;
    info!("Engine initialized, sessions accepted at ws://{}/ws", report.websocket_address);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    engine.stop().await;

    Ok(())
}
