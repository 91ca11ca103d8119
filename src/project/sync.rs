//! Reconciliation between a sandbox and durable project storage.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

use super::store::{Project, ProjectStore, ProjectUpdate, SandboxRef};
use super::versions::{compare_snapshots, VersionComparison};
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::sandbox::SandboxSession;

/// What `sync_to_sandbox` did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    /// True for a brand-new project; nothing was written.
    pub skipped: bool,
    pub version: u64,
    pub written: Vec<String>,
    pub failed: Vec<String>,
    pub restarted: bool,
}

/// Result of an `auto_save` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum AutoSaveStatus {
    /// A debounced save is pending with this many files. Empty files from
    /// the batch were not scheduled and are listed in `dropped`.
    Scheduled {
        files: usize,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        dropped: Vec<String>,
    },
    /// Every candidate file was empty; nothing was scheduled.
    Rejected,
}

struct PendingAutoSave {
    generation: u64,
    files: BTreeMap<String, String>,
    handle: JoinHandle<()>,
}

/// Pull, push, versioning, and debounced auto-save for projects.
///
/// Every durable write holds the project's write lock across the store call
/// and [`ProjectSync::record_version`], which rejects a store that hands back
/// a version that did not advance.
pub struct ProjectSync {
    store: Arc<dyn ProjectStore>,
    config: SyncConfig,
    versions: Mutex<HashMap<String, u64>>,
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    autosave: Mutex<HashMap<String, PendingAutoSave>>,
    generation: AtomicU64,
}

impl std::fmt::Debug for ProjectSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectSync")
            .field("store", &self.store.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ProjectSync {
    /// Creates a sync manager over `store`.
    pub fn new(store: Arc<dyn ProjectStore>, config: SyncConfig) -> Self {
        Self {
            store,
            config,
            versions: Mutex::new(HashMap::new()),
            write_locks: Mutex::new(HashMap::new()),
            autosave: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &Arc<dyn ProjectStore> {
        &self.store
    }

    /// Returns the last version observed for a project.
    pub async fn last_known_version(&self, project_id: &str) -> Option<u64> {
        self.versions.lock().await.get(project_id).copied()
    }

    /// Serializes store calls for one project so versions are recorded in
    /// the order the store assigned them.
    async fn write_lock(&self, project_id: &str) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(
            self.write_locks
                .lock()
                .await
                .entry(project_id.to_string())
                .or_default(),
        );
        lock.lock_owned().await
    }

    /// Checks a version returned by the store against the last one seen.
    ///
    /// Writes must advance (`strict`); loads may return the same version.
    async fn record_version(&self, project_id: &str, returned: u64, strict: bool) -> Result<()> {
        let mut versions = self.versions.lock().await;
        if let Some(&previous) = versions.get(project_id) {
            if returned < previous || (strict && returned == previous) {
                tracing::error!(project_id = %project_id, previous, returned, "project version regressed");
                return Err(Error::VersionRegression {
                    project_id: project_id.to_string(),
                    previous,
                    returned,
                });
            }
        }
        versions.insert(project_id.to_string(), returned);
        Ok(())
    }

    fn is_ignored(&self, path: &str) -> bool {
        path.split('/')
            .any(|segment| self.config.ignored_dirs.iter().any(|d| d == segment))
    }

    /// Reads every project file from the sandbox and saves it durably.
    pub async fn save_from_sandbox(&self, session: &SandboxSession, project_id: &str) -> Result<Project> {
        let paths = session.list_files().await?;
        let mut files = BTreeMap::new();
        for path in paths.into_iter().filter(|p| !self.is_ignored(p)) {
            match session.read_file(&path).await {
                Ok(content) => {
                    files.insert(path, content);
                }
                Err(e) => tracing::warn!(path = %path, error = %e, "skipping unreadable file"),
            }
        }

        let mut update = ProjectUpdate {
            files,
            mode: self.config.save_mode,
            ..ProjectUpdate::default()
        };
        match session.read_manifest().await {
            Ok(manifest) => update = update.with_dependencies(manifest.dependencies),
            Err(e) => tracing::warn!(error = %e, "saving without manifest dependencies"),
        }
        let snapshot = session.snapshot().await;
        if let Some(id) = snapshot.id {
            update = update.with_sandbox(SandboxRef {
                id,
                preview_url: snapshot.preview_url,
            });
        }

        let file_count = update.files.len();
        let _guard = self.write_lock(project_id).await;
        let project = self
            .store
            .save(project_id, update)
            .await
            .map_err(|e| Error::PersistenceSync(e.to_string()))?;
        self.record_version(project_id, project.version, true).await?;

        tracing::info!(project_id = %project_id, version = project.version, files = file_count, "saved project from sandbox");
        Ok(project)
    }

    /// Writes the stored project into the sandbox.
    ///
    /// A brand-new project is skipped so the template stays untouched. The
    /// dev-server restart afterwards is best-effort.
    pub async fn sync_to_sandbox(&self, session: &SandboxSession, project_id: &str) -> Result<SyncOutcome> {
        let project = {
            let _guard = self.write_lock(project_id).await;
            match self.store.load(project_id).await? {
                Some(project) if !project.is_new() => {
                    self.record_version(project_id, project.version, false).await?;
                    project
                }
                _ => {
                    tracing::info!(project_id = %project_id, "new project; skipping sandbox sync");
                    return Ok(SyncOutcome {
                        skipped: true,
                        ..SyncOutcome::default()
                    });
                }
            }
        };

        let report = session.write_files(&project.files).await?;
        for (path, e) in &report.failed {
            tracing::warn!(path = %path, error = %e, "failed to sync file into sandbox");
        }

        let restarted = match session.restart().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "dev server restart after sync failed");
                false
            }
        };

        tracing::info!(project_id = %project_id, version = project.version, files = report.written.len(), "synced project to sandbox");
        Ok(SyncOutcome {
            skipped: false,
            version: project.version,
            written: report.written,
            failed: report.failed.into_iter().map(|(path, _)| path).collect(),
            restarted,
        })
    }

    /// Schedules a debounced save of changed files.
    ///
    /// One pending save per project: a later call restarts the timer and its
    /// files are merged over the pending ones. Empty files are never
    /// auto-saved: they are reported back as dropped, and a batch with
    /// nothing but empty files is rejected.
    pub async fn auto_save(
        self: &Arc<Self>,
        project_id: &str,
        changed_files: BTreeMap<String, String>,
    ) -> AutoSaveStatus {
        let (candidate, empty): (BTreeMap<String, String>, BTreeMap<String, String>) =
            changed_files
                .into_iter()
                .partition(|(_, content)| !content.trim().is_empty());
        if candidate.is_empty() {
            tracing::info!(project_id = %project_id, "auto-save rejected: no non-empty files");
            return AutoSaveStatus::Rejected;
        }
        let dropped: Vec<String> = empty.into_keys().collect();
        if !dropped.is_empty() {
            tracing::warn!(project_id = %project_id, dropped = ?dropped, "auto-save skipped empty files");
        }

        let mut slots = self.autosave.lock().await;
        let mut files = match slots.remove(project_id) {
            Some(pending) => {
                pending.handle.abort();
                pending.files
            }
            None => BTreeMap::new(),
        };
        files.extend(candidate);

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let count = files.len();
        let handle = tokio::spawn(Arc::clone(self).fire_auto_save(project_id.to_string(), generation));
        slots.insert(
            project_id.to_string(),
            PendingAutoSave {
                generation,
                files,
                handle,
            },
        );

        tracing::debug!(project_id = %project_id, files = count, "auto-save scheduled");
        AutoSaveStatus::Scheduled {
            files: count,
            dropped,
        }
    }

    async fn fire_auto_save(self: Arc<Self>, project_id: String, generation: u64) {
        tokio::time::sleep(self.config.autosave_debounce()).await;

        let files = {
            let mut slots = self.autosave.lock().await;
            let current = slots
                .get(&project_id)
                .is_some_and(|pending| pending.generation == generation);
            if current {
                slots.remove(&project_id).map(|p| p.files)
            } else {
                None
            }
        };

        if let Some(files) = files {
            if let Err(e) = self.persist_auto_save(&project_id, files).await {
                tracing::warn!(project_id = %project_id, error = %e, "auto-save failed");
            }
        }
    }

    async fn persist_auto_save(&self, project_id: &str, files: BTreeMap<String, String>) -> Result<Project> {
        let count = files.len();
        let _guard = self.write_lock(project_id).await;
        let project = self
            .store
            .patch_files(project_id, files)
            .await
            .map_err(|e| Error::PersistenceSync(e.to_string()))?;
        self.record_version(project_id, project.version, true).await?;
        tracing::info!(project_id = %project_id, version = project.version, files = count, "auto-saved project");
        Ok(project)
    }

    /// Persists every pending auto-save now.
    pub async fn flush_auto_save(&self) -> Result<()> {
        let pending: Vec<(String, PendingAutoSave)> = self.autosave.lock().await.drain().collect();
        let mut first_error = None;
        for (project_id, pending) in pending {
            pending.handle.abort();
            if let Err(e) = self.persist_auto_save(&project_id, pending.files).await {
                tracing::warn!(project_id = %project_id, error = %e, "auto-save flush failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Pushes manifest dependencies to durable storage.
    pub async fn push_dependencies(
        &self,
        project_id: &str,
        dependencies: BTreeMap<String, String>,
    ) -> Result<Project> {
        let _guard = self.write_lock(project_id).await;
        let project = self
            .store
            .update_dependencies(project_id, dependencies)
            .await
            .map_err(|e| Error::PersistenceSync(e.to_string()))?;
        self.record_version(project_id, project.version, true).await?;
        Ok(project)
    }

    /// Compares the files of two stored versions.
    pub async fn compare_versions(&self, project_id: &str, from: u64, to: u64) -> Result<VersionComparison> {
        let before = self.store.version_snapshot(project_id, from).await?;
        let after = self.store.version_snapshot(project_id, to).await?;
        Ok(compare_snapshots(from, &before.files, to, &after.files))
    }

    /// Writes an old version's files as a new version.
    pub async fn restore_version(&self, project_id: &str, version: u64) -> Result<Project> {
        let snapshot = self.store.version_snapshot(project_id, version).await?;
        let _guard = self.write_lock(project_id).await;
        let project = self
            .store
            .save(project_id, ProjectUpdate::replace(snapshot.files))
            .await?;
        self.record_version(project_id, project.version, true).await?;
        tracing::info!(project_id = %project_id, restored = version, version = project.version, "restored project version");
        Ok(project)
    }
}
