//! Per-project ownership of the live sandbox session.
//!
//! There is never a process-wide "current sandbox": the orchestrator owns at
//! most one [`SandboxSession`], tied to the open project. Opening another
//! project destroys the previous session first.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::SandboxConfig;
use crate::error::Result;
use crate::project::{ProjectSync, SyncOutcome};
use crate::sandbox::{SandboxProvider, SandboxSession, SandboxStatus, SessionSnapshot};

/// What opening a project produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenedProject {
    pub project_id: String,
    pub sandbox: SessionSnapshot,
    pub sync: SyncOutcome,
}

struct OpenProject {
    project_id: Option<String>,
    session: Arc<SandboxSession>,
}

/// Owns the single live sandbox session for the open project.
pub struct ProjectOrchestrator {
    provider: Arc<dyn SandboxProvider>,
    config: SandboxConfig,
    sync: Arc<ProjectSync>,
    current: RwLock<Option<OpenProject>>,
}

impl std::fmt::Debug for ProjectOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectOrchestrator")
            .field("provider", &self.provider.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ProjectOrchestrator {
    /// Creates an orchestrator with no open project.
    pub fn new(provider: Arc<dyn SandboxProvider>, config: SandboxConfig, sync: Arc<ProjectSync>) -> Self {
        Self {
            provider,
            config,
            sync,
            current: RwLock::new(None),
        }
    }

    /// Returns the project sync manager.
    pub fn sync(&self) -> &Arc<ProjectSync> {
        &self.sync
    }

    /// Returns the live session, if any.
    pub async fn current_session(&self) -> Option<Arc<SandboxSession>> {
        self.current
            .read()
            .await
            .as_ref()
            .map(|open| Arc::clone(&open.session))
    }

    /// Returns the open project id, if any.
    pub async fn current_project(&self) -> Option<String> {
        self.current
            .read()
            .await
            .as_ref()
            .and_then(|open| open.project_id.clone())
    }

    fn new_session(&self, project_id: Option<&str>) -> Arc<SandboxSession> {
        let session = SandboxSession::new(Arc::clone(&self.provider), self.config.clone());
        Arc::new(match project_id {
            Some(id) => session.with_restore(id, Arc::clone(self.sync.store())),
            None => session,
        })
    }

    /// Opens a project: a fresh sandbox is created and the stored files
    /// are synced into it.
    ///
    /// Re-opening the project that is already open with a running sandbox
    /// re-syncs into the existing session.
    pub async fn open_project(&self, project_id: &str) -> Result<OpenedProject> {
        let session = {
            let mut current = self.current.write().await;
            let existing = current
                .as_ref()
                .filter(|open| open.project_id.as_deref() == Some(project_id))
                .map(|open| Arc::clone(&open.session));
            let reusable = match &existing {
                Some(session) => session.status().await == SandboxStatus::Running,
                None => false,
            };

            match existing.filter(|_| reusable) {
                Some(session) => session,
                None => {
                    if let Some(previous) = current.take() {
                        self.retire(previous).await;
                    }
                    let session = self.new_session(Some(project_id));
                    *current = Some(OpenProject {
                        project_id: Some(project_id.to_string()),
                        session: Arc::clone(&session),
                    });
                    session.create().await?;
                    session
                }
            }
        };

        let sync = self.sync.sync_to_sandbox(&session, project_id).await?;
        tracing::info!(project_id = %project_id, skipped = sync.skipped, "project opened");
        Ok(OpenedProject {
            project_id: project_id.to_string(),
            sandbox: session.snapshot().await,
            sync,
        })
    }

    /// Returns a session for an apply call.
    ///
    /// The open session is reused when it belongs to `project_id` (or no
    /// project is given). Otherwise a fresh, not-yet-created session takes
    /// its place so the pipeline can reconnect by sandbox id.
    pub async fn session_for(&self, project_id: Option<&str>) -> Arc<SandboxSession> {
        let mut current = self.current.write().await;
        if let Some(open) = current.as_ref() {
            if project_id.is_none() || open.project_id.as_deref() == project_id {
                return Arc::clone(&open.session);
            }
        }

        if let Some(previous) = current.take() {
            self.retire(previous).await;
        }
        let session = self.new_session(project_id);
        *current = Some(OpenProject {
            project_id: project_id.map(String::from),
            session: Arc::clone(&session),
        });
        session
    }

    /// Destroys the live session, if any.
    pub async fn close(&self) -> Result<()> {
        if let Some(previous) = self.current.write().await.take() {
            self.retire(previous).await;
        }
        self.sync.flush_auto_save().await
    }

    async fn retire(&self, open: OpenProject) {
        if let Err(e) = open.session.destroy().await {
            tracing::warn!(project_id = ?open.project_id, error = %e, "failed to destroy previous session");
        } else {
            tracing::info!(project_id = ?open.project_id, "previous session destroyed");
        }
    }
}
