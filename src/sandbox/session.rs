//! Lifecycle state machine for one ephemeral sandbox.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use super::provider::{CommandOutput, ProvisionRequest, RemoteStatus, SandboxInfo, SandboxProvider};
use crate::backoff::{retry, RetryPolicy};
use crate::config::SandboxConfig;
use crate::error::{Error, Result};
use crate::packages::PackageManifestSnapshot;
use crate::project::ProjectStore;

const RESTORE_BACKOFF_INITIAL: Duration = Duration::from_secs(2);
const RESTORE_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Lifecycle status of a [`SandboxSession`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    #[default]
    Absent,
    Creating,
    Running,
    Stopped,
    Error,
    Destroyed,
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SandboxStatus::Absent => "absent",
            SandboxStatus::Creating => "creating",
            SandboxStatus::Running => "running",
            SandboxStatus::Stopped => "stopped",
            SandboxStatus::Error => "error",
            SandboxStatus::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

impl SandboxStatus {
    /// Returns true if the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: SandboxStatus) -> bool {
        use SandboxStatus as S;
        matches!(
            (self, next),
            (S::Absent | S::Error | S::Stopped, S::Creating)
                | (S::Creating, S::Running | S::Error)
                | (S::Running, S::Stopped | S::Error)
                | (S::Absent | S::Stopped | S::Error, S::Running)
                | (
                    S::Absent | S::Creating | S::Running | S::Stopped | S::Error,
                    S::Destroyed
                )
        )
    }
}

/// Point-in-time view of a session, safe to hand to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: Option<String>,
    pub status: SandboxStatus,
    pub preview_url: Option<String>,
    pub host: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub lease_end: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub project_id: Option<String>,
}

/// Outcome of a batch write: per-file failures never abort the batch.
#[derive(Debug, Default)]
pub struct WriteReport {
    /// App-relative paths written successfully.
    pub written: Vec<String>,
    /// App-relative paths that failed, with their errors.
    pub failed: Vec<(String, Error)>,
}

#[derive(Debug)]
struct Inner {
    status: SandboxStatus,
    info: Option<SandboxInfo>,
    updated_at: DateTime<Utc>,
    last_error: Option<String>,
    known_files: BTreeSet<String>,
}

impl Inner {
    fn transition(&mut self, next: SandboxStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        tracing::debug!(from = %self.status, to = %next, "sandbox status transition");
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    fn fail(&mut self, message: String) {
        if self.status.can_transition_to(SandboxStatus::Error) {
            self.status = SandboxStatus::Error;
            self.updated_at = Utc::now();
        }
        self.last_error = Some(message);
    }
}

/// Durable project the session can rebuild itself from.
struct RestoreContext {
    project_id: String,
    store: Arc<dyn ProjectStore>,
}

/// One ephemeral sandbox and its lifecycle.
///
/// All file and command operations require [`SandboxStatus::Running`] and
/// fail with [`Error::SandboxUnavailable`] otherwise. Paths passed in and
/// returned are relative to the configured app root.
pub struct SandboxSession {
    provider: Arc<dyn SandboxProvider>,
    config: SandboxConfig,
    restore: Option<RestoreContext>,
    inner: RwLock<Inner>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for SandboxSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxSession")
            .field("provider", &self.provider.name())
            .field("app_root", &self.config.app_root)
            .finish_non_exhaustive()
    }
}

impl SandboxSession {
    /// Creates an `Absent` session.
    pub fn new(provider: Arc<dyn SandboxProvider>, config: SandboxConfig) -> Self {
        Self {
            provider,
            config,
            restore: None,
            inner: RwLock::new(Inner {
                status: SandboxStatus::Absent,
                info: None,
                updated_at: Utc::now(),
                last_error: None,
                known_files: BTreeSet::new(),
            }),
            health_task: Mutex::new(None),
        }
    }

    /// Enables auto-restore from the given durable project.
    pub fn with_restore(mut self, project_id: impl Into<String>, store: Arc<dyn ProjectStore>) -> Self {
        self.restore = Some(RestoreContext {
            project_id: project_id.into(),
            store,
        });
        self
    }

    /// Returns the app root inside the sandbox.
    pub fn app_root(&self) -> &str {
        &self.config.app_root
    }

    /// Returns the project this session restores from, if any.
    pub fn project_id(&self) -> Option<&str> {
        self.restore.as_ref().map(|r| r.project_id.as_str())
    }

    /// Returns the current status.
    pub async fn status(&self) -> SandboxStatus {
        self.inner.read().await.status
    }

    /// Returns the remote sandbox id, if one was ever attached.
    pub async fn id(&self) -> Option<String> {
        self.inner.read().await.info.as_ref().map(|i| i.id.clone())
    }

    /// Returns every app-relative path written through this session.
    pub async fn known_files(&self) -> BTreeSet<String> {
        self.inner.read().await.known_files.clone()
    }

    /// Returns a point-in-time view of the session.
    pub async fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.read().await;
        let info = inner.info.as_ref();
        SessionSnapshot {
            id: info.map(|i| i.id.clone()),
            status: inner.status,
            preview_url: info.map(|i| i.preview_url.clone()),
            host: info.map(|i| i.host.clone()),
            created_at: info.map(|i| i.created_at),
            updated_at: inner.updated_at,
            lease_end: info.and_then(|i| i.lease_end),
            last_error: inner.last_error.clone(),
            project_id: self.project_id().map(str::to_string),
        }
    }

    /// Provisions a new sandbox.
    ///
    /// Allowed from `Absent`, `Error`, and `Stopped`. On failure the session
    /// moves to `Error` and keeps the message; the caller may retry.
    pub async fn create(self: &Arc<Self>) -> Result<SandboxInfo> {
        self.inner.write().await.transition(SandboxStatus::Creating)?;

        let request = ProvisionRequest {
            template: self.config.template.clone(),
            lease_secs: self.config.lease_secs,
            project_id: self.project_id().map(str::to_string),
        };

        tracing::info!(provider = self.provider.name(), template = %request.template, "provisioning sandbox");

        let info = match self.provider.provision(&request).await {
            Ok(info) => info,
            Err(e) => {
                let message = e.to_string();
                tracing::error!(error = %message, "sandbox provisioning failed");
                self.inner.write().await.fail(message.clone());
                return Err(Error::SandboxCreation(message));
            }
        };

        {
            let mut inner = self.inner.write().await;
            if let Err(e) = inner.transition(SandboxStatus::Running) {
                drop(inner);
                // Destroyed while provisioning; do not leak the new sandbox.
                if let Err(kill_err) = self.provider.kill(&info.id).await {
                    tracing::warn!(sandbox_id = %info.id, error = %kill_err, "failed to kill orphaned sandbox");
                }
                return Err(e);
            }
            inner.info = Some(info.clone());
            inner.last_error = None;
            inner.known_files.clear();
        }

        tracing::info!(sandbox_id = %info.id, preview_url = %info.preview_url, "sandbox running");
        self.ensure_health_loop().await;
        Ok(info)
    }

    /// Reattaches to an existing sandbox.
    ///
    /// Failure is reported as [`Error::ReconnectFailure`] and is never retried.
    pub async fn connect(self: &Arc<Self>, sandbox_id: &str) -> Result<SandboxInfo> {
        {
            let inner = self.inner.read().await;
            if !inner.status.can_transition_to(SandboxStatus::Running) {
                return Err(Error::InvalidTransition {
                    from: inner.status,
                    to: SandboxStatus::Running,
                });
            }
        }

        let info = self
            .provider
            .connect(sandbox_id)
            .await
            .map_err(|e| {
                tracing::warn!(sandbox_id = %sandbox_id, error = %e, "reconnect failed");
                Error::ReconnectFailure {
                    sandbox_id: sandbox_id.to_string(),
                    reason: e.to_string(),
                }
            })?;

        {
            let mut inner = self.inner.write().await;
            inner.transition(SandboxStatus::Running)?;
            let same_sandbox = inner.info.as_ref().is_some_and(|i| i.id == info.id);
            if !same_sandbox {
                inner.known_files.clear();
            }
            inner.info = Some(info.clone());
            inner.last_error = None;
        }

        tracing::info!(sandbox_id = %info.id, "reconnected to sandbox");
        self.ensure_health_loop().await;
        Ok(info)
    }

    /// Polls the platform and reconciles the local status.
    ///
    /// Does nothing unless `Running`. Transient poll errors leave the
    /// session as is.
    pub async fn health_check(self: &Arc<Self>) -> Result<SandboxStatus> {
        let id = {
            let inner = self.inner.read().await;
            match (&inner.info, inner.status) {
                (Some(info), SandboxStatus::Running) => info.id.clone(),
                (_, status) => return Ok(status),
            }
        };

        let remote = match self.provider.status(&id).await {
            Ok(remote) => remote,
            Err(e) => {
                tracing::warn!(sandbox_id = %id, error = %e, "health check poll failed");
                return Ok(self.status().await);
            }
        };

        match remote {
            RemoteStatus::Active => Ok(SandboxStatus::Running),
            RemoteStatus::Stopped => {
                tracing::info!(sandbox_id = %id, "sandbox stopped");
                self.inner.write().await.transition(SandboxStatus::Stopped)?;
                Ok(SandboxStatus::Stopped)
            }
            RemoteStatus::NoSandbox | RemoteStatus::Expired | RemoteStatus::Unhealthy => {
                tracing::warn!(sandbox_id = %id, remote = ?remote, "sandbox lost");
                self.inner
                    .write()
                    .await
                    .fail(format!("sandbox {} reported {:?}", id, remote));
                if self.restore.is_some() {
                    self.auto_restore().await
                } else {
                    Ok(SandboxStatus::Error)
                }
            }
        }
    }

    /// Recreates the sandbox and rewrites every durable project file,
    /// retrying with exponential backoff.
    async fn auto_restore(self: &Arc<Self>) -> Result<SandboxStatus> {
        let Some(restore) = &self.restore else {
            return Ok(self.status().await);
        };

        let attempts = self.config.max_restore_attempts;
        if attempts == 0 {
            return Ok(self.status().await);
        }
        let policy = RetryPolicy::new(attempts, RESTORE_BACKOFF_INITIAL, RESTORE_BACKOFF_MAX);
        retry(policy, "sandbox restore", move |_| self.restore_once(restore)).await?;
        tracing::info!(project_id = %restore.project_id, "sandbox restored");
        Ok(SandboxStatus::Running)
    }

    async fn restore_once(self: &Arc<Self>, restore: &RestoreContext) -> Result<()> {
        // Load first so a storage failure leaves the session retryable from Error.
        let files = match restore.store.load(&restore.project_id).await? {
            Some(project) => project.files,
            None => BTreeMap::new(),
        };

        self.create().await?;

        let report = self.write_files(&files).await?;
        for (path, e) in &report.failed {
            tracing::warn!(path = %path, error = %e, "failed to restore file");
        }
        if let Err(e) = self.restart().await {
            tracing::warn!(error = %e, "dev server restart after restore failed");
        }
        Ok(())
    }

    /// Stops and relaunches the dev server in place. The status does not change.
    pub async fn restart(&self) -> Result<()> {
        let id = self.require_running().await?;
        tracing::info!(sandbox_id = %id, "restarting dev server");
        self.provider.restart_dev_server(&id).await
    }

    /// Tears the session down for good.
    ///
    /// Cancels the health check and kills the remote sandbox. Killing is
    /// best-effort; a failure is logged and not returned.
    pub async fn destroy(&self) -> Result<()> {
        if let Some(handle) = self.health_task.lock().await.take() {
            handle.abort();
        }

        let id = {
            let mut inner = self.inner.write().await;
            if inner.status == SandboxStatus::Destroyed {
                return Ok(());
            }
            inner.transition(SandboxStatus::Destroyed)?;
            inner.info.as_ref().map(|i| i.id.clone())
        };

        if let Some(id) = id {
            match self.provider.kill(&id).await {
                Ok(()) => tracing::info!(sandbox_id = %id, "sandbox destroyed"),
                Err(e) => tracing::warn!(sandbox_id = %id, error = %e, "failed to kill sandbox"),
            }
        }
        Ok(())
    }

    /// Writes one file.
    pub async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let id = self.require_running().await?;
        if path.split(['/', '\\']).any(|segment| segment == "..") {
            return Err(Error::FileWrite {
                path: path.to_string(),
                reason: "path escapes the app root".to_string(),
            });
        }
        let full = self.absolute(path);
        self.provider
            .write_file(&id, &full, content)
            .await
            .map_err(|e| Error::FileWrite {
                path: path.to_string(),
                reason: e.to_string(),
            })?;
        self.inner.write().await.known_files.insert(path.to_string());
        Ok(())
    }

    /// Writes many files, collecting per-file failures.
    pub async fn write_files(&self, files: &BTreeMap<String, String>) -> Result<WriteReport> {
        self.require_running().await?;
        let mut report = WriteReport::default();
        for (path, content) in files {
            match self.write_file(path, content).await {
                Ok(()) => report.written.push(path.clone()),
                Err(e @ Error::SandboxUnavailable { .. }) => return Err(e),
                Err(e) => report.failed.push((path.clone(), e)),
            }
        }
        Ok(report)
    }

    /// Reads one file.
    pub async fn read_file(&self, path: &str) -> Result<String> {
        let id = self.require_running().await?;
        self.provider.read_file(&id, &self.absolute(path)).await
    }

    /// Lists every file under the app root, as app-relative paths.
    pub async fn list_files(&self) -> Result<Vec<String>> {
        let id = self.require_running().await?;
        let root = self.config.app_root.trim_end_matches('/');
        let files = self.provider.list_files(&id, root).await?;
        Ok(files
            .into_iter()
            .filter_map(|p| {
                p.strip_prefix(root)
                    .map(|rel| rel.trim_start_matches('/').to_string())
            })
            .filter(|p| !p.is_empty())
            .collect())
    }

    /// Reads `package.json` from the app root.
    pub async fn read_manifest(&self) -> Result<PackageManifestSnapshot> {
        let raw = self.read_file("package.json").await?;
        PackageManifestSnapshot::from_json(&raw)
    }

    /// Runs `argv` in the app root, bounded by `timeout`.
    pub async fn run_command(&self, argv: &[String], timeout: Duration) -> Result<CommandOutput> {
        let id = self.require_running().await?;
        let command = argv.join(" ");
        tracing::debug!(sandbox_id = %id, command = %command, "running command");

        match tokio::time::timeout(
            timeout,
            self.provider.run_command(&id, argv, &self.config.app_root),
        )
        .await
        {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(Error::Command {
                command,
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::CommandTimeout {
                command,
                seconds: timeout.as_secs(),
            }),
        }
    }

    async fn require_running(&self) -> Result<String> {
        let inner = self.inner.read().await;
        match (&inner.info, inner.status) {
            (Some(info), SandboxStatus::Running) => Ok(info.id.clone()),
            (_, status) => Err(Error::SandboxUnavailable { status }),
        }
    }

    fn absolute(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.app_root.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn ensure_health_loop(self: &Arc<Self>) {
        let Some(interval) = self.config.health_check_interval() else {
            return;
        };
        let mut slot = self.health_task.lock().await;
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        *slot = Some(tokio::spawn(health_loop(Arc::downgrade(self), interval)));
    }
}

/// Background poll loop. Boxed because restoring from inside a health check
/// re-enters `create`, which spawns this loop.
fn health_loop(
    session: Weak<SandboxSession>,
    interval: Duration,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(session) = session.upgrade() else {
                break;
            };
            if session.status().await == SandboxStatus::Destroyed {
                break;
            }
            if let Err(e) = session.health_check().await {
                tracing::warn!(error = %e, "health check failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{MemoryProjectStore, ProjectUpdate};
    use crate::sandbox::MemorySandboxProvider;

    fn config() -> SandboxConfig {
        SandboxConfig {
            health_check_interval_secs: 0,
            ..SandboxConfig::default()
        }
    }

    fn session(provider: &Arc<MemorySandboxProvider>) -> Arc<SandboxSession> {
        Arc::new(SandboxSession::new(provider.clone(), config()))
    }

    #[test]
    fn transition_table_matches_lifecycle() {
        use SandboxStatus as S;
        assert!(S::Absent.can_transition_to(S::Creating));
        assert!(S::Creating.can_transition_to(S::Running));
        assert!(S::Running.can_transition_to(S::Error));
        assert!(S::Error.can_transition_to(S::Creating));
        assert!(S::Stopped.can_transition_to(S::Running));
        assert!(S::Running.can_transition_to(S::Destroyed));

        assert!(!S::Running.can_transition_to(S::Creating));
        assert!(!S::Running.can_transition_to(S::Running));
        assert!(!S::Destroyed.can_transition_to(S::Creating));
        assert!(!S::Destroyed.can_transition_to(S::Running));
        assert!(!S::Absent.can_transition_to(S::Stopped));
    }

    #[tokio::test]
    async fn create_populates_session() {
        let provider = Arc::new(MemorySandboxProvider::default());
        let session = session(&provider);

        let info = session.create().await.unwrap();
        let snap = session.snapshot().await;

        assert_eq!(snap.status, SandboxStatus::Running);
        assert_eq!(snap.id.as_deref(), Some(info.id.as_str()));
        assert_eq!(snap.preview_url, Some(info.preview_url));
        assert!(snap.lease_end.is_some());
    }

    #[tokio::test]
    async fn create_failure_moves_to_error_and_can_retry() {
        let provider = Arc::new(MemorySandboxProvider::default());
        provider.fail_next_provisions(1).await;
        let session = session(&provider);

        let err = session.create().await.unwrap_err();
        assert!(matches!(err, Error::SandboxCreation(_)));
        let snap = session.snapshot().await;
        assert_eq!(snap.status, SandboxStatus::Error);
        assert!(snap.last_error.is_some());

        session.create().await.unwrap();
        assert_eq!(session.status().await, SandboxStatus::Running);
    }

    #[tokio::test]
    async fn create_while_running_is_rejected() {
        let provider = Arc::new(MemorySandboxProvider::default());
        let session = session(&provider);
        session.create().await.unwrap();

        let err = session.create().await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: SandboxStatus::Running,
                to: SandboxStatus::Creating
            }
        ));
        assert_eq!(provider.provision_count().await, 1);
    }

    #[tokio::test]
    async fn operations_require_running() {
        let provider = Arc::new(MemorySandboxProvider::default());
        let session = session(&provider);

        let err = session.write_file("src/App.jsx", "x").await.unwrap_err();
        assert!(matches!(
            err,
            Error::SandboxUnavailable {
                status: SandboxStatus::Absent
            }
        ));
        assert!(session.read_manifest().await.is_err());
        assert!(session.restart().await.is_err());
        assert!(session
            .run_command(&["ls".to_string()], Duration::from_secs(1))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn connect_failure_is_reconnect_failure() {
        let provider = Arc::new(MemorySandboxProvider::default());
        let session = session(&provider);

        let err = session.connect("sb-gone").await.unwrap_err();
        assert!(matches!(err, Error::ReconnectFailure { .. }));
        assert!(err.is_fatal());
        assert_eq!(session.status().await, SandboxStatus::Absent);
    }

    #[tokio::test]
    async fn connect_attaches_existing_sandbox() {
        let provider = Arc::new(MemorySandboxProvider::default());
        let first = session(&provider);
        let info = first.create().await.unwrap();

        let second = session(&provider);
        second.connect(&info.id).await.unwrap();
        assert_eq!(second.id().await, Some(info.id));
        assert!(second.read_manifest().await.unwrap().is_installed("react"));
    }

    #[tokio::test]
    async fn write_and_list_use_app_relative_paths() {
        let provider = Arc::new(MemorySandboxProvider::default());
        let session = session(&provider);
        session.create().await.unwrap();

        session
            .write_file("src/components/Button.jsx", "export {}")
            .await
            .unwrap();
        let files = session.list_files().await.unwrap();
        assert!(files.contains(&"src/components/Button.jsx".to_string()));
        assert!(files.contains(&"package.json".to_string()));
        assert!(session
            .known_files()
            .await
            .contains("src/components/Button.jsx"));
    }

    #[tokio::test]
    async fn parent_segments_are_refused() {
        let provider = Arc::new(MemorySandboxProvider::default());
        let session = session(&provider);
        let info = session.create().await.unwrap();

        let err = session.write_file("src/../../etc/evil", "x").await.unwrap_err();
        assert!(matches!(err, Error::FileWrite { .. }));
        assert!(provider.files(&info.id).await.keys().all(|p| !p.contains("..")));
    }

    #[tokio::test]
    async fn write_files_collects_failures() {
        let provider = Arc::new(MemorySandboxProvider::default());
        provider.fail_writes_to("/home/user/app/src/Bad.jsx").await;
        let session = session(&provider);
        session.create().await.unwrap();

        let files = BTreeMap::from([
            ("src/Bad.jsx".to_string(), "x".to_string()),
            ("src/Good.jsx".to_string(), "y".to_string()),
        ]);
        let report = session.write_files(&files).await.unwrap();
        assert_eq!(report.written, vec!["src/Good.jsx"]);
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(report.failed[0].1, Error::FileWrite { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_command_times_out() {
        let provider = Arc::new(MemorySandboxProvider::default());
        provider
            .set_command_delay("npm", Duration::from_secs(120))
            .await;
        let session = session(&provider);
        session.create().await.unwrap();

        let argv = vec!["npm".to_string(), "run".to_string(), "build".to_string()];
        let err = session
            .run_command(&argv, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CommandTimeout { seconds: 60, .. }));
    }

    #[tokio::test]
    async fn restart_keeps_status() {
        let provider = Arc::new(MemorySandboxProvider::default());
        let session = session(&provider);
        let info = session.create().await.unwrap();

        session.restart().await.unwrap();
        assert_eq!(session.status().await, SandboxStatus::Running);
        assert_eq!(provider.dev_server_restarts(&info.id).await, 1);
    }

    #[tokio::test]
    async fn health_check_maps_remote_status() {
        let provider = Arc::new(MemorySandboxProvider::default());
        let session = session(&provider);
        let info = session.create().await.unwrap();

        assert_eq!(session.health_check().await.unwrap(), SandboxStatus::Running);

        provider
            .set_remote_status(&info.id, RemoteStatus::Stopped)
            .await;
        assert_eq!(session.health_check().await.unwrap(), SandboxStatus::Stopped);
        assert_eq!(session.status().await, SandboxStatus::Stopped);
    }

    #[tokio::test]
    async fn expired_without_project_moves_to_error() {
        let provider = Arc::new(MemorySandboxProvider::default());
        let session = session(&provider);
        let info = session.create().await.unwrap();
        provider.expire(&info.id).await;

        assert_eq!(session.health_check().await.unwrap(), SandboxStatus::Error);
        assert!(session.snapshot().await.last_error.is_some());
    }

    #[tokio::test]
    async fn expired_with_project_restores_files() {
        let provider = Arc::new(MemorySandboxProvider::default());
        let store = Arc::new(MemoryProjectStore::new());
        store
            .save(
                "p1",
                ProjectUpdate::replace(BTreeMap::from([(
                    "src/App.jsx".to_string(),
                    "export default () => 'restored';".to_string(),
                )])),
            )
            .await
            .unwrap();

        let session = Arc::new(
            SandboxSession::new(provider.clone(), config()).with_restore("p1", store.clone()),
        );
        let first = session.create().await.unwrap();
        provider.expire(&first.id).await;

        assert_eq!(session.health_check().await.unwrap(), SandboxStatus::Running);
        let second = session.id().await.unwrap();
        assert_ne!(second, first.id);
        assert_eq!(
            provider.files(&second).await["/home/user/app/src/App.jsx"],
            "export default () => 'restored';"
        );
        assert_eq!(provider.dev_server_restarts(&second).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restore_retries_with_backoff() {
        let provider = Arc::new(MemorySandboxProvider::default());
        let store = Arc::new(MemoryProjectStore::new());
        let session = Arc::new(
            SandboxSession::new(provider.clone(), config()).with_restore("p1", store),
        );
        let first = session.create().await.unwrap();
        provider.expire(&first.id).await;
        provider.fail_next_provisions(2).await;

        assert_eq!(session.health_check().await.unwrap(), SandboxStatus::Running);
        assert_eq!(provider.provision_count().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn background_health_check_detects_stop() {
        let provider = Arc::new(MemorySandboxProvider::default());
        let session = Arc::new(SandboxSession::new(
            provider.clone(),
            SandboxConfig {
                health_check_interval_secs: 300,
                ..SandboxConfig::default()
            },
        ));
        let info = session.create().await.unwrap();
        provider
            .set_remote_status(&info.id, RemoteStatus::Stopped)
            .await;

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(session.status().await, SandboxStatus::Stopped);
    }

    #[tokio::test]
    async fn destroyed_session_rejects_everything() {
        let provider = Arc::new(MemorySandboxProvider::default());
        let session = session(&provider);
        let info = session.create().await.unwrap();

        session.destroy().await.unwrap();
        assert_eq!(session.status().await, SandboxStatus::Destroyed);
        assert!(provider.connect(&info.id).await.is_err());

        assert!(session.write_file("src/a.js", "a").await.is_err());
        assert!(session.create().await.is_err());
        assert_eq!(session.health_check().await.unwrap(), SandboxStatus::Destroyed);
        // Idempotent.
        session.destroy().await.unwrap();
    }
}
