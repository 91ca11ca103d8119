//! Project persistence across sandbox lifetimes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use sandbox_sync::config::{ApplyConfig, PackagesConfig, SandboxConfig, SyncConfig};
use sandbox_sync::project::{FileChange, ProjectUpdate};
use sandbox_sync::{
    ApplyPipeline, ApplyRequest, AutoSaveStatus, MemoryProjectStore, MemorySandboxProvider,
    ProgressSender, ProjectOrchestrator, ProjectStore, ProjectSync, SandboxStatus,
};

struct Harness {
    provider: Arc<MemorySandboxProvider>,
    store: Arc<MemoryProjectStore>,
    sync: Arc<ProjectSync>,
    orchestrator: ProjectOrchestrator,
}

fn harness() -> Harness {
    let provider = Arc::new(MemorySandboxProvider::default());
    let store = Arc::new(MemoryProjectStore::new());
    let sync = Arc::new(ProjectSync::new(store.clone(), SyncConfig::default()));
    let config = SandboxConfig {
        health_check_interval_secs: 0,
        ..SandboxConfig::default()
    };
    let orchestrator = ProjectOrchestrator::new(provider.clone(), config, Arc::clone(&sync));
    Harness {
        provider,
        store,
        sync,
        orchestrator,
    }
}

fn files(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test]
async fn apply_save_reopen_round_trip() {
    let h = harness();
    h.orchestrator.open_project("p1").await.unwrap();
    let session = h.orchestrator.current_session().await.unwrap();

    let pipeline = ApplyPipeline::new(ApplyConfig::default(), PackagesConfig::default())
        .with_sync(Arc::clone(&h.sync));
    let request = ApplyRequest {
        response: "<file path=\"Hero.jsx\">export const Hero = () => null;</file>".to_string(),
        project_id: Some("p1".to_string()),
        ..ApplyRequest::default()
    };
    pipeline
        .apply(&session, request, &ProgressSender::noop())
        .await
        .unwrap();
    pipeline.flush_pending_sync().await;

    let saved = h.store.load("p1").await.unwrap().unwrap();
    assert_eq!(saved.version, 1);
    assert!(saved.files.contains_key("src/Hero.jsx"));
    assert!(!saved.files.keys().any(|p| p.starts_with("node_modules")));

    // Switching away and back lands the saved files in a brand-new sandbox.
    h.orchestrator.open_project("p2").await.unwrap();
    assert_eq!(session.status().await, SandboxStatus::Destroyed);
    let reopened = h.orchestrator.open_project("p1").await.unwrap();
    assert!(!reopened.sync.skipped);

    let fresh = h.orchestrator.current_session().await.unwrap();
    assert_ne!(fresh.id().await, session.id().await);
    assert_eq!(
        fresh.read_file("src/Hero.jsx").await.unwrap(),
        "export const Hero = () => null;"
    );
    assert_eq!(h.provider.provision_count().await, 3);
}

#[tokio::test]
async fn expired_sandbox_is_restored_from_storage() {
    let h = harness();
    h.store
        .save(
            "p1",
            ProjectUpdate::replace(files(&[("src/App.jsx", "export default 'saved';")])),
        )
        .await
        .unwrap();
    h.orchestrator.open_project("p1").await.unwrap();
    let session = h.orchestrator.current_session().await.unwrap();
    let old_id = session.id().await.unwrap();

    h.provider.expire(&old_id).await;
    let status = session.health_check().await.unwrap();

    assert_eq!(status, SandboxStatus::Running);
    assert_ne!(session.id().await.unwrap(), old_id);
    assert_eq!(
        session.read_file("src/App.jsx").await.unwrap(),
        "export default 'saved';"
    );
}

#[tokio::test]
async fn versions_only_move_forward() {
    let h = harness();
    h.orchestrator.open_project("p1").await.unwrap();
    let session = h.orchestrator.current_session().await.unwrap();

    let mut versions = Vec::new();
    let mut saved_at = Vec::new();
    let first = h.sync.save_from_sandbox(&session, "p1").await.unwrap();
    versions.push(first.version);
    saved_at.push(first.last_saved_at);

    session
        .write_file("src/App.jsx", "export default 'changed';")
        .await
        .unwrap();
    let second = h.sync.save_from_sandbox(&session, "p1").await.unwrap();
    versions.push(second.version);
    saved_at.push(second.last_saved_at);

    let deps = BTreeMap::from([("zod".to_string(), "^3.0.0".to_string())]);
    versions.push(h.sync.push_dependencies("p1", deps).await.unwrap().version);

    let restored = h.sync.restore_version("p1", first.version).await.unwrap();
    versions.push(restored.version);
    saved_at.push(restored.last_saved_at);

    assert!(versions.windows(2).all(|w| w[0] < w[1]), "{:?}", versions);
    assert!(saved_at.windows(2).all(|w| w[0] <= w[1]));

    let comparison = h
        .sync
        .compare_versions("p1", second.version, restored.version)
        .await
        .unwrap();
    let app = comparison
        .files
        .iter()
        .find(|f| f.path == "src/App.jsx")
        .unwrap();
    assert_eq!(app.change, FileChange::Modified);
}

#[tokio::test(start_paused = true)]
async fn empty_auto_save_never_bumps_version() {
    let h = harness();
    h.store
        .save("p1", ProjectUpdate::replace(files(&[("src/App.jsx", "x")])))
        .await
        .unwrap();

    let status = h
        .sync
        .auto_save("p1", files(&[("src/App.jsx", ""), ("src/Other.jsx", "\n\t ")]))
        .await;
    assert_eq!(status, AutoSaveStatus::Rejected);

    tokio::time::sleep(Duration::from_secs(10)).await;
    h.sync.flush_auto_save().await.unwrap();
    let project = h.store.load("p1").await.unwrap().unwrap();
    assert_eq!(project.version, 1);
    assert_eq!(project.files["src/App.jsx"], "x");
}
