mod common;

use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;

use common::{test_config, wait_until, ScriptedExecutor, ShoutingEngine, TestClient};
use mirror_engine::config::EngineConfig;
use mirror_engine::engine::EngineState;
use mirror_engine::events::{Event, EventKind};
use mirror_engine::sync::SyncStatus;
use mirror_engine::{Collaborators, EngineError, MirrorEngine};

fn build_engine(config: EngineConfig) -> MirrorEngine {
    MirrorEngine::new(
        config,
        Collaborators {
            executor: Arc::new(ScriptedExecutor::default()),
            completion_engine: Arc::new(ShoutingEngine::default()),
        },
    )
}

async fn active_engine() -> (MirrorEngine, std::net::SocketAddr) {
    let engine = build_engine(test_config());
    engine.initialize().await.unwrap();
    let addr = engine.sessions().local_addr().unwrap();
    (engine, addr)
}

#[tokio::test]
async fn test_execute_command_broadcasts_to_all_sessions() {
    let (engine, addr) = active_engine().await;
    let mut a = TestClient::connect(addr).await;
    let mut b = TestClient::connect(addr).await;

    a.send(&json!({"type": "execute-command", "command": "echo hi"}))
        .await;

    let seen_by_a = a.recv_type("result-captured").await;
    let reply = a.recv_type("command-executed").await;
    let seen_by_b = b.recv_type("result-captured").await;

    assert_eq!(seen_by_a, seen_by_b);
    assert_eq!(seen_by_a["result"]["command"], "echo hi");
    assert_eq!(seen_by_a["result"]["stdout"], "hi\n");
    assert_eq!(reply["platform"], "linux");
    assert_eq!(reply["resultId"], seen_by_a["result"]["id"]);

    let metrics = engine.metrics();
    assert_eq!(metrics.commands_executed, 1);
    assert_eq!(metrics.results_captured, 1);
    assert_eq!(engine.capture().list(10).len(), 1);

    let kinds: Vec<EventKind> = engine.recent_events(10).iter().map(|e| e.kind).collect();
    assert!(kinds.contains(&EventKind::ResultCaptured));
    assert!(kinds.contains(&EventKind::CommandExecuted));
    assert_eq!(engine.bus().channel_history("events").len(), 1);

    engine.stop().await;
}

#[tokio::test]
async fn test_result_broadcast_truncates_long_output() {
    let mut config = test_config();
    config.capture.output_preview_chars = 5;
    let engine = build_engine(config);
    engine.initialize().await.unwrap();
    let mut client = TestClient::connect(engine.sessions().local_addr().unwrap()).await;

    client
        .send(&json!({"type": "execute-command", "command": "echo abcdefghij"}))
        .await;
    let frame = client.recv_type("result-captured").await;

    assert_eq!(frame["result"]["stdout"], "abcde...");
    let stored = engine.capture().list(1);
    assert_eq!(stored[0].stdout, "abcdefghij\n");
    engine.stop().await;
}

#[tokio::test]
async fn test_execute_command_dispatch_errors() {
    let (engine, addr) = active_engine().await;
    let mut client = TestClient::connect(addr).await;

    client
        .send(&json!({"type": "execute-command", "command": ""}))
        .await;
    assert_eq!(
        client.recv().await,
        json!({"type": "error", "message": "command must not be empty"})
    );

    client
        .send(&json!({"type": "execute-command", "command": "ls", "platform": "vms"}))
        .await;
    let reply = client.recv().await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["message"], "platform vms is not available");

    assert_eq!(engine.metrics().commands_executed, 0);
    engine.stop().await;
}

#[tokio::test]
async fn test_completion_request_round_trip() {
    let (engine, addr) = active_engine().await;
    let mut a = TestClient::connect(addr).await;
    let mut b = TestClient::connect(addr).await;

    a.send(&json!({
        "type": "completion-request",
        "serviceKind": "code-analysis",
        "prompt": "why is this slow"
    }))
    .await;

    // The worker may answer before the submit acknowledgement is queued
    let mut submitted = None;
    let mut response_for_a = None;
    while submitted.is_none() || response_for_a.is_none() {
        let frame = a.recv().await;
        match frame["type"].as_str() {
            Some("completion-request-submitted") => submitted = Some(frame),
            Some("completion-response") => response_for_a = Some(frame),
            _ => {}
        }
    }
    let request_id = submitted.unwrap()["requestId"].as_str().unwrap().to_string();
    let response_for_b = b.recv_type("completion-response").await;

    for frame in [response_for_a.unwrap(), response_for_b] {
        assert_eq!(frame["response"]["requestId"], request_id.as_str());
        assert_eq!(frame["response"]["serviceKind"], "code-analysis");
        assert_eq!(frame["response"]["text"], "WHY IS THIS SLOW");
    }

    wait_until(|| engine.bus().channel_history("completions").len() == 1).await;
    assert_eq!(engine.metrics().completions_processed, 1);
    engine.stop().await;
}

#[tokio::test]
async fn test_completion_request_validation() {
    let (engine, addr) = active_engine().await;
    let mut client = TestClient::connect(addr).await;

    client
        .send(&json!({"type": "completion-request", "prompt": ""}))
        .await;
    assert_eq!(client.recv().await["message"], "prompt must not be empty");

    client
        .send(&json!({"type": "completion-request", "serviceKind": "poetry", "prompt": "x"}))
        .await;
    assert_eq!(client.recv().await["message"], "unknown service kind poetry");

    engine.stop().await;
}

#[tokio::test]
async fn test_sync_request_records_outcome_and_event() {
    let (engine, addr) = active_engine().await;
    let mut client = TestClient::connect(addr).await;

    client
        .send(&json!({"type": "sync-request", "syncKind": "file-sync", "data": {"path": "main.py"}}))
        .await;
    let reply = client.recv_type("sync-request-submitted").await;
    let task_id = reply["taskId"].as_str().unwrap().to_string();

    wait_until(|| !engine.sync().history().is_empty()).await;
    let history = engine.sync().history();
    let outcome = &history[0];
    assert_eq!(outcome.task_id, task_id);
    assert_eq!(outcome.status, SyncStatus::Completed);

    wait_until(|| {
        engine
            .recent_events(10)
            .iter()
            .any(|e| e.kind == EventKind::SyncCompleted)
    })
    .await;

    client
        .send(&json!({"type": "sync-request", "syncKind": "ftp-sync"}))
        .await;
    assert_eq!(client.recv().await["message"], "unknown sync kind ftp-sync");

    assert_eq!(engine.metrics().sync_operations, 1);
    engine.stop().await;
}

#[tokio::test]
async fn test_publish_with_no_subscribers_lands_in_history() {
    let engine = build_engine(test_config());
    let event = Event::new(EventKind::ResultCaptured, "test", "all", json!({"resultId": "r1"}));
    let id = event.id.clone();

    let delivery = engine.publish_event(event).await;

    assert_eq!(delivery.delivered, 0);
    assert_eq!(engine.recent_events(1)[0].id, id);
    assert_eq!(engine.status().event_history, 1);
}

#[tokio::test]
async fn test_status_reports_components() {
    let (engine, addr) = active_engine().await;
    let _client = TestClient::connect(addr).await;

    let status = engine.status();
    assert_eq!(status.state, EngineState::Active);
    assert!(status.initialized_at.is_some());
    assert_eq!(status.components.executor.platforms, 1);
    assert_eq!(status.components.websocket.sessions, 1);
    assert_eq!(status.components.websocket.port, addr.port());
    assert_eq!(status.components.communication.channels.len(), 3);
    assert!(status.capabilities.values().all(|enabled| *enabled));

    let wire = serde_json::to_value(&status).unwrap();
    assert_eq!(wire["state"], "active");
    assert!(wire["metrics"]["eventsPublished"].as_u64().unwrap() >= 1);

    engine.stop().await;
    assert_eq!(engine.status().state, EngineState::Stopped);
}

#[tokio::test]
async fn test_stop_closes_sessions_and_workers() {
    let (engine, addr) = active_engine().await;
    let mut client = TestClient::connect(addr).await;

    engine.stop().await;

    assert!(client.is_closed().await);
    let status = engine.status();
    assert!(!status.components.completion.processing);
    assert!(!status.components.sync.running);
    assert!(engine
        .sync()
        .submit(mirror_engine::sync::SyncKind::StatusSync, json!({}))
        .is_err());
}

#[tokio::test]
async fn test_failing_collaborator_is_initialization_error() {
    let engine = MirrorEngine::new(
        test_config(),
        Collaborators {
            executor: Arc::new(ScriptedExecutor::default()),
            completion_engine: Arc::new(ShoutingEngine { fail_init: true }),
        },
    );

    let err = engine.initialize().await.unwrap_err();
    match err {
        EngineError::Initialization { step, message } => {
            assert_eq!(step, "completion");
            assert_eq!(message, "model credentials missing");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(engine.state(), EngineState::Failed);
}

#[tokio::test]
async fn test_port_in_use_is_initialization_error() {
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = test_config();
    config.websocket.port = taken.local_addr().unwrap().port();

    let engine = build_engine(config);
    let err = engine.initialize().await.unwrap_err();

    assert!(matches!(err, EngineError::Initialization { step: "websocket", .. }));
    assert_eq!(engine.state(), EngineState::Failed);
}
