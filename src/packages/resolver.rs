//! Missing-package resolution and installation.

use std::sync::Arc;

use crate::config::PackagesConfig;
use crate::error::Error;
use crate::progress::{PackageStage, ProgressEvent, ProgressSender};
use crate::project::ProjectSync;
use crate::sandbox::SandboxSession;

use super::detect::{detect_packages, merge_packages, strip_version};
use super::PackageManifestSnapshot;

/// Footer appended to install output; success is `__install_exit=0`.
pub const INSTALL_SENTINEL: &str = "__install_exit=";

/// Drops every character outside `[A-Za-z0-9@\-_./ ]`.
pub fn sanitize_package_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '@' | '-' | '_' | '.' | '/' | ' '))
        .collect()
}

/// Returns true for a name that sanitizing would change or that npm would
/// read as an option (`-g`, `--global`).
pub fn is_malformed_package_name(name: &str) -> bool {
    name.starts_with('-') || sanitize_package_name(name) != name
}

/// Builds the install command for already-sanitized names.
///
/// Each name is single-quoted, and the script reports npm's exit code as a
/// machine-readable footer.
pub fn install_argv(app_root: &str, names: &[String]) -> Vec<String> {
    let quoted: Vec<String> = names.iter().map(|n| format!("'{}'", n)).collect();
    let script = format!(
        "cd '{}' && npm install --legacy-peer-deps {}; echo {}$?",
        app_root,
        quoted.join(" "),
        INSTALL_SENTINEL
    );
    vec!["sh".to_string(), "-c".to_string(), script]
}

/// Kind of best-effort work done after a successful install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffectKind {
    /// Push the updated manifest dependencies to durable storage.
    PersistDependencies,
    /// Restart the sandbox dev server.
    RestartDevServer,
}

/// Result of one best-effort side effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SideEffect {
    pub kind: SideEffectKind,
    /// `None` on success.
    pub error: Option<String>,
}

impl SideEffect {
    fn from_result<T>(kind: SideEffectKind, result: crate::error::Result<T>) -> Self {
        Self {
            kind,
            error: result.err().map(|e| e.to_string()),
        }
    }

    /// Returns true if the side effect succeeded.
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// What a resolve run did.
#[derive(Debug, Default)]
pub struct PackageOutcome {
    pub installed: Vec<String>,
    pub already_installed: Vec<String>,
    pub failed: Vec<String>,
    /// Why `failed` is non-empty.
    pub error: Option<Error>,
    pub side_effects: Vec<SideEffect>,
}

impl PackageOutcome {
    /// Returns warnings for failed side effects.
    pub fn warnings(&self) -> Vec<String> {
        self.side_effects
            .iter()
            .filter_map(|effect| {
                effect.error.as_ref().map(|e| match effect.kind {
                    SideEffectKind::PersistDependencies => {
                        format!("failed to persist installed dependencies: {}", e)
                    }
                    SideEffectKind::RestartDevServer => {
                        format!("dev server restart after install failed: {}", e)
                    }
                })
            })
            .collect()
    }
}

/// Detects, dedupes, and installs the packages a set of files needs.
#[derive(Clone)]
pub struct PackageResolver {
    config: PackagesConfig,
    persistence: Option<(Arc<ProjectSync>, String)>,
}

impl std::fmt::Debug for PackageResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageResolver")
            .field("config", &self.config)
            .field("project_id", &self.persistence.as_ref().map(|(_, id)| id))
            .finish()
    }
}

impl PackageResolver {
    /// Creates a resolver.
    pub fn new(config: PackagesConfig) -> Self {
        Self {
            config,
            persistence: None,
        }
    }

    /// Pushes installed dependencies to `project_id` after successful installs.
    pub fn with_persistence(mut self, sync: Arc<ProjectSync>, project_id: impl Into<String>) -> Self {
        self.persistence = Some((sync, project_id.into()));
        self
    }

    /// Installs whatever `files` import or `explicit` names that the sandbox
    /// manifest lacks.
    ///
    /// Never fails as a whole: install errors land in
    /// [`PackageOutcome::failed`] and side-effect errors in
    /// [`PackageOutcome::side_effects`].
    pub async fn resolve<'a, I>(
        &self,
        session: &SandboxSession,
        files: I,
        explicit: &[String],
        progress: &ProgressSender,
    ) -> PackageOutcome
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let detected = detect_packages(files, &self.config.runtime_provided);
        let explicit: Vec<String> = explicit
            .iter()
            .filter(|n| {
                let base = strip_version(n.trim());
                !self.config.runtime_provided.iter().any(|p| p == base)
            })
            .cloned()
            .collect();
        let candidates = merge_packages([explicit.as_slice(), detected.as_slice()]);

        let mut outcome = PackageOutcome::default();
        if candidates.is_empty() {
            return outcome;
        }

        progress
            .emit(ProgressEvent::PackageProgress {
                stage: PackageStage::Detecting,
                message: format!("Checking {} package(s)", candidates.len()),
                packages: candidates.clone(),
            })
            .await;

        let manifest = match session.read_manifest().await {
            Ok(manifest) => manifest,
            Err(e) => {
                tracing::warn!(error = %e, "could not read package.json; treating every package as missing");
                PackageManifestSnapshot::default()
            }
        };

        let (already, missing): (Vec<String>, Vec<String>) = candidates
            .into_iter()
            .partition(|name| manifest.is_installed(name));
        outcome.already_installed = already;

        if missing.is_empty() {
            tracing::debug!("all packages already installed");
            self.complete(progress, "All packages already installed").await;
            return outcome;
        }

        if let Some(bad) = missing.iter().find(|n| is_malformed_package_name(n)) {
            tracing::warn!(package = %bad, "refusing install batch with malformed package name");
            outcome.error = Some(Error::MalformedPackageName { name: bad.clone() });
            outcome.failed = missing;
            self.complete(progress, "Package install skipped").await;
            return outcome;
        }

        progress
            .emit(ProgressEvent::PackageProgress {
                stage: PackageStage::Installing,
                message: format!("Installing {}", missing.join(", ")),
                packages: missing.clone(),
            })
            .await;
        tracing::info!(packages = ?missing, "installing packages");

        let argv = install_argv(session.app_root(), &missing);
        let succeeded = match session
            .run_command(&argv, self.config.install_timeout())
            .await
        {
            Ok(output) if output.stdout.contains(&format!("{}0", INSTALL_SENTINEL)) => true,
            Ok(output) => {
                let combined = output.combined();
                let lines: Vec<&str> = combined.lines().collect();
                let tail = lines[lines.len().saturating_sub(5)..].join("\n");
                outcome.error = Some(Error::PackageInstall(tail));
                false
            }
            Err(e) => {
                outcome.error = Some(Error::PackageInstall(e.to_string()));
                false
            }
        };

        if !succeeded {
            tracing::error!(packages = ?missing, "package install failed");
            outcome.failed = missing;
            self.complete(progress, "Package install failed").await;
            return outcome;
        }

        outcome.installed = missing;
        progress
            .emit(ProgressEvent::PackageSuccess {
                installed: outcome.installed.clone(),
            })
            .await;

        if let Some((sync, project_id)) = &self.persistence {
            let result = match session.read_manifest().await {
                Ok(manifest) => sync
                    .push_dependencies(project_id, manifest.dependencies)
                    .await
                    .map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                tracing::warn!(project_id = %project_id, error = %e, "failed to persist dependencies");
            }
            outcome
                .side_effects
                .push(SideEffect::from_result(SideEffectKind::PersistDependencies, result));
        }

        if self.config.restart_after_install {
            progress
                .emit(ProgressEvent::PackageProgress {
                    stage: PackageStage::Restarting,
                    message: "Restarting dev server".to_string(),
                    packages: Vec::new(),
                })
                .await;
            let result = session.restart().await;
            if let Err(e) = &result {
                tracing::warn!(error = %e, "dev server restart failed");
            }
            outcome
                .side_effects
                .push(SideEffect::from_result(SideEffectKind::RestartDevServer, result));
        }

        self.complete(progress, "Packages installed").await;
        outcome
    }

    async fn complete(&self, progress: &ProgressSender, message: &str) {
        progress
            .emit(ProgressEvent::PackageProgress {
                stage: PackageStage::Complete,
                message: message.to_string(),
                packages: Vec::new(),
            })
            .await;
    }
}
