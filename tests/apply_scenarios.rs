//! End-to-end apply runs against the in-process sandbox.

use std::sync::Arc;

use tokio::sync::mpsc;

use sandbox_sync::config::{ApplyConfig, PackagesConfig, SandboxConfig};
use sandbox_sync::parser::drive_stream;
use sandbox_sync::progress::{self, PackageStage};
use sandbox_sync::{
    ApplyPipeline, ApplyRequest, Error, MemorySandboxProvider, ParseEvent, ProgressEvent,
    SandboxSession, SandboxStatus,
};

fn sandbox_config() -> SandboxConfig {
    SandboxConfig {
        health_check_interval_secs: 0,
        ..SandboxConfig::default()
    }
}

async fn running_session(provider: &Arc<MemorySandboxProvider>) -> Arc<SandboxSession> {
    let session = Arc::new(SandboxSession::new(provider.clone(), sandbox_config()));
    session.create().await.expect("sandbox should start");
    session
}

fn pipeline() -> ApplyPipeline {
    ApplyPipeline::new(ApplyConfig::default(), PackagesConfig::default())
}

async fn drain(mut rx: mpsc::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn new_file_and_missing_package_are_applied() {
    let provider = Arc::new(MemorySandboxProvider::default());
    let session = running_session(&provider).await;
    let (tx, rx) = progress::channel(progress::DEFAULT_CAPACITY);

    let request = ApplyRequest {
        response: concat!(
            "<file path=\"src/App.jsx\">",
            "import axios from 'axios';\nexport default function App() { return null; }\n",
            "</file><package>axios</package>"
        )
        .to_string(),
        ..ApplyRequest::default()
    };
    let result = pipeline().apply(&session, request, &tx).await.unwrap();
    drop(tx);
    let events = drain(rx).await;

    assert_eq!(result.files_created, vec!["src/App.jsx"]);
    assert_eq!(result.packages_installed, vec!["axios"]);
    assert!(result.packages_failed.is_empty());

    let complete = serde_json::to_value(events.last().unwrap()).unwrap();
    assert_eq!(complete["type"], "complete");
    assert_eq!(complete["result"]["filesCreated"], serde_json::json!(["src/App.jsx"]));
    assert_eq!(complete["result"]["packagesInstalled"], serde_json::json!(["axios"]));

    let stages: Vec<PackageStage> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::PackageProgress { stage, .. } => Some(*stage),
            _ => None,
        })
        .collect();
    assert_eq!(
        stages,
        vec![
            PackageStage::Detecting,
            PackageStage::Installing,
            PackageStage::Restarting,
            PackageStage::Complete
        ]
    );

    let manifest = session.read_manifest().await.unwrap();
    assert!(manifest.dependencies.contains_key("axios"));
}

#[tokio::test]
async fn truncated_then_complete_stream_keeps_complete_version() {
    let provider = Arc::new(MemorySandboxProvider::default());
    let session = running_session(&provider).await;

    let unclosed = "const x = 1; //";
    let closed = "const x = 1; // and then the rest of it.";
    assert_eq!((unclosed.len(), closed.len()), (15, 40));

    let (chunk_tx, chunk_rx) = mpsc::channel(16);
    let (event_tx, mut event_rx) = mpsc::channel(256);
    let collector = tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(event) = event_rx.recv().await {
            events.push(event);
        }
        events
    });

    let full = format!(
        "Here you go.\n<file path=\"src/x.js\">{}\n<file path=\"src/x.js\">{}</file>",
        unclosed, closed
    );
    let chunks: Vec<String> = full
        .as_bytes()
        .chunks(7)
        .map(|c| String::from_utf8(c.to_vec()).unwrap())
        .collect();
    let producer = tokio::spawn(async move {
        for chunk in chunks {
            chunk_tx.send(chunk).await.unwrap();
        }
    });

    let text = drive_stream(chunk_rx, event_tx).await;
    producer.await.unwrap();
    let events = collector.await.unwrap();
    assert_eq!(text, full);
    assert!(events
        .iter()
        .any(|e| matches!(e, ParseEvent::FileOpen { path } if path == "src/x.js")));

    let request = ApplyRequest {
        response: text,
        ..ApplyRequest::default()
    };
    let result = pipeline()
        .apply(&session, request, &sandbox_sync::ProgressSender::noop())
        .await
        .unwrap();

    assert_eq!(result.files_created, vec!["src/x.js"]);
    assert_eq!(session.read_file("src/x.js").await.unwrap(), closed);
}

#[tokio::test]
async fn failed_reconnect_aborts_without_writes() {
    let provider = Arc::new(MemorySandboxProvider::default());
    let old = running_session(&provider).await;
    let old_id = old.id().await.unwrap();
    provider.expire(&old_id).await;
    let files_before = provider.files(&old_id).await;

    let session = Arc::new(SandboxSession::new(provider.clone(), sandbox_config()));
    let (tx, rx) = progress::channel(progress::DEFAULT_CAPACITY);
    let request = ApplyRequest {
        response: "<file path=\"src/A.jsx\">a</file><file path=\"src/B.jsx\">b</file>".to_string(),
        sandbox_id: Some(old_id.clone()),
        ..ApplyRequest::default()
    };

    let abort = pipeline().apply(&session, request, &tx).await.unwrap_err();
    drop(tx);
    let events = drain(rx).await;

    assert!(matches!(abort.error, Error::ReconnectFailure { ref sandbox_id, .. } if *sandbox_id == old_id));
    assert_eq!(abort.parsed_files, vec!["src/A.jsx", "src/B.jsx"]);
    assert_eq!(provider.files(&old_id).await, files_before);
    assert!(provider.command_log().await.is_empty());
    assert_ne!(session.status().await, SandboxStatus::Running);

    assert!(events.iter().any(|e| matches!(e, ProgressEvent::Error { .. })));
    assert!(!events.iter().any(|e| e.is_terminal()));
    assert!(!events
        .iter()
        .any(|e| matches!(e, ProgressEvent::FileProgress { .. })));
}

#[tokio::test]
async fn malformed_package_name_fails_batch_but_files_still_apply() {
    let provider = Arc::new(MemorySandboxProvider::default());
    let session = running_session(&provider).await;

    let request = ApplyRequest {
        response: "<file path=\"src/A.jsx\">export default 1;</file>".to_string(),
        packages: vec!["left-pad; rm -rf /".to_string(), "zod".to_string()],
        ..ApplyRequest::default()
    };
    let result = pipeline()
        .apply(&session, request, &sandbox_sync::ProgressSender::noop())
        .await
        .unwrap();

    assert_eq!(result.files_created, vec!["src/A.jsx"]);
    assert!(result.packages_installed.is_empty());
    assert_eq!(result.packages_failed.len(), 2);
    assert!(result.warnings.iter().any(|w| w.contains("package install skipped")));
    assert!(provider.command_log().await.is_empty());
}
