//! Applies a parsed LLM response to a live sandbox.
//!
//! One [`ApplyPipeline::apply`] call runs these steps in order, reporting
//! each through a [`ProgressSender`]:
//!
//! 1. resolve the sandbox (connect if needed, abort on failure)
//! 2. install missing packages
//! 3. write files
//! 4. run commands
//! 5. schedule a delayed save to durable storage
//!
//! Only step 1 can abort. Everything after it is collected into the
//! [`ApplyResult`] and the run always ends with a `complete` event.

pub mod paths;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::{ApplyConfig, PackagesConfig};
use crate::error::Error;
use crate::packages::detect::merge_packages;
use crate::packages::PackageResolver;
use crate::parser::{ParsedResponse, ResponseGrammar, TagGrammar};
use crate::progress::{FileAction, ProgressEvent, ProgressSender};
use crate::project::ProjectSync;
use crate::sandbox::{SandboxSession, SandboxStatus};
use paths::{is_protected, normalize_path, strip_code_fences, strip_stylesheet_imports};

const TOTAL_STEPS: usize = 5;

/// Files the conversation has already touched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    #[serde(default)]
    pub edited_files: Vec<String>,
    #[serde(default)]
    pub created_files: Vec<String>,
}

impl ConversationState {
    /// Every path the conversation knows to exist.
    pub fn known_paths(&self) -> impl Iterator<Item = &str> {
        self.edited_files
            .iter()
            .chain(&self.created_files)
            .map(String::as_str)
    }
}

/// Input to one apply run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyRequest {
    /// Raw LLM response text.
    pub response: String,
    /// Packages requested alongside the response.
    #[serde(default)]
    pub packages: Vec<String>,
    /// Sandbox to reconnect to when the session is not running.
    #[serde(default)]
    pub sandbox_id: Option<String>,
    /// Project whose durable copy is updated afterwards.
    #[serde(default)]
    pub project_id: Option<String>,
    /// Paths the caller knows exist in the sandbox.
    #[serde(default)]
    pub existing_files: Vec<String>,
    #[serde(default)]
    pub conversation: Option<ConversationState>,
}

/// Aggregate outcome of one apply run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyResult {
    pub files_created: Vec<String>,
    pub files_updated: Vec<String>,
    pub packages_installed: Vec<String>,
    pub packages_already_installed: Vec<String>,
    pub packages_failed: Vec<String>,
    pub commands_executed: Vec<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structure: Option<String>,
}

impl ApplyResult {
    /// Returns true if nothing failed.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.packages_failed.is_empty()
    }
}

/// The sandbox could not be resolved, so nothing was applied.
#[derive(Debug, thiserror::Error)]
#[error("apply aborted: {error}")]
pub struct ApplyAbort {
    #[source]
    pub error: Error,
    /// Paths that were parsed but not written.
    pub parsed_files: Vec<String>,
}

struct PendingSync {
    generation: u64,
    session: Arc<SandboxSession>,
    project_id: String,
    handle: JoinHandle<()>,
}

/// Orchestrates parsing, installs, file writes, commands, and the
/// follow-up save.
pub struct ApplyPipeline {
    grammar: Arc<dyn ResponseGrammar>,
    config: ApplyConfig,
    packages: PackagesConfig,
    sync: Option<Arc<ProjectSync>>,
    pending_sync: Arc<Mutex<Option<PendingSync>>>,
    generation: AtomicU64,
}

impl std::fmt::Debug for ApplyPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplyPipeline")
            .field("grammar", &self.grammar.name())
            .field("config", &self.config)
            .field("packages", &self.packages)
            .field("sync", &self.sync.is_some())
            .finish_non_exhaustive()
    }
}

impl ApplyPipeline {
    /// Creates a pipeline using [`TagGrammar`].
    pub fn new(config: ApplyConfig, packages: PackagesConfig) -> Self {
        let grammar = Arc::new(TagGrammar::new(packages.runtime_provided.clone()));
        Self {
            grammar,
            config,
            packages,
            sync: None,
            pending_sync: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
        }
    }

    /// Replaces the response grammar.
    pub fn with_grammar(mut self, grammar: Arc<dyn ResponseGrammar>) -> Self {
        self.grammar = grammar;
        self
    }

    /// Enables dependency persistence and the delayed save.
    pub fn with_sync(mut self, sync: Arc<ProjectSync>) -> Self {
        self.sync = Some(sync);
        self
    }

    /// Parses a response with the configured grammar.
    pub fn parse(&self, response: &str) -> ParsedResponse {
        self.grammar.parse(response)
    }

    /// Parses `request.response` and applies it.
    pub async fn apply(
        &self,
        session: &Arc<SandboxSession>,
        request: ApplyRequest,
        progress: &ProgressSender,
    ) -> Result<ApplyResult, ApplyAbort> {
        let parsed = self.parse(&request.response);
        self.apply_parsed(session, parsed, request, progress).await
    }

    /// Applies an already parsed response.
    pub async fn apply_parsed(
        &self,
        session: &Arc<SandboxSession>,
        parsed: ParsedResponse,
        request: ApplyRequest,
        progress: &ProgressSender,
    ) -> Result<ApplyResult, ApplyAbort> {
        progress
            .emit(ProgressEvent::Start {
                message: format!("Applying {} file(s)", parsed.files.len()),
                total_steps: TOTAL_STEPS,
            })
            .await;

        self.step(progress, 1, "Connecting to sandbox").await;
        if let Err(error) = self.resolve_sandbox(session, request.sandbox_id.as_deref()).await {
            tracing::error!(error = %error, "apply aborted before any write");
            progress.emit(ProgressEvent::error(&error)).await;
            return Err(ApplyAbort {
                error,
                parsed_files: parsed.file_paths(),
            });
        }

        let mut result = ApplyResult {
            explanation: parsed.explanation.clone(),
            structure: parsed.structure.clone(),
            ..ApplyResult::default()
        };

        self.step(progress, 2, "Resolving packages").await;
        self.install_packages(session, &parsed, &request, progress, &mut result)
            .await;

        self.step(progress, 3, "Writing files").await;
        self.write_files(session, &parsed, &request, progress, &mut result)
            .await;

        self.step(progress, 4, "Running commands").await;
        self.run_commands(session, &parsed, progress, &mut result)
            .await;

        self.step(progress, 5, "Scheduling project save").await;
        if let Some(project_id) = &request.project_id {
            self.schedule_sync(session, project_id).await;
        }

        tracing::info!(
            created = result.files_created.len(),
            updated = result.files_updated.len(),
            installed = result.packages_installed.len(),
            errors = result.errors.len(),
            "apply finished"
        );
        progress
            .emit(ProgressEvent::Complete {
                result: result.clone(),
            })
            .await;
        Ok(result)
    }

    async fn step(&self, progress: &ProgressSender, step: usize, message: &str) {
        progress
            .emit(ProgressEvent::Step {
                step,
                message: message.to_string(),
            })
            .await;
    }

    async fn resolve_sandbox(
        &self,
        session: &Arc<SandboxSession>,
        sandbox_id: Option<&str>,
    ) -> crate::error::Result<()> {
        let status = session.status().await;
        if status == SandboxStatus::Running {
            return Ok(());
        }
        match sandbox_id {
            Some(id) => session.connect(id).await.map(|_| ()),
            None => Err(Error::SandboxUnavailable { status }),
        }
    }

    async fn install_packages(
        &self,
        session: &SandboxSession,
        parsed: &ParsedResponse,
        request: &ApplyRequest,
        progress: &ProgressSender,
        result: &mut ApplyResult,
    ) {
        let mut resolver = PackageResolver::new(self.packages.clone());
        if let (Some(sync), Some(project_id)) = (&self.sync, &request.project_id) {
            resolver = resolver.with_persistence(Arc::clone(sync), project_id.clone());
        }

        let explicit = merge_packages([request.packages.as_slice(), parsed.packages.as_slice()]);
        let files = parsed
            .files
            .iter()
            .map(|f| (f.path.as_str(), f.content.as_str()));
        let outcome = resolver.resolve(session, files, &explicit, progress).await;

        result.packages_installed = outcome.installed.clone();
        result.packages_already_installed = outcome.already_installed.clone();
        result.packages_failed = outcome.failed.clone();

        if let Some(error) = &outcome.error {
            if matches!(error, Error::MalformedPackageName { .. }) {
                let message = format!("package install skipped: {}", error);
                progress.warning(message.clone()).await;
                result.warnings.push(message);
            }
            progress.emit(ProgressEvent::error(error)).await;
            result.errors.push(error.to_string());
        }
        for warning in outcome.warnings() {
            progress.warning(warning.clone()).await;
            result.warnings.push(warning);
        }
    }

    async fn write_files(
        &self,
        session: &SandboxSession,
        parsed: &ParsedResponse,
        request: &ApplyRequest,
        progress: &ProgressSender,
        result: &mut ApplyResult,
    ) {
        let root = &self.config.source_root;
        let mut known: HashSet<String> = request
            .existing_files
            .iter()
            .map(String::as_str)
            .chain(request.conversation.iter().flat_map(|c| c.known_paths()))
            .filter_map(|p| normalize_path(p, root))
            .collect();
        known.extend(session.known_files().await);

        let total = parsed.files.len();
        for (index, file) in parsed.files.iter().enumerate() {
            progress
                .emit(ProgressEvent::FileProgress {
                    current: index + 1,
                    total,
                    file_name: file.path.clone(),
                })
                .await;

            let Some(path) = normalize_path(&file.path, root) else {
                let error = Error::FileWrite {
                    path: file.path.clone(),
                    reason: "path escapes the app root".to_string(),
                };
                tracing::warn!(path = %file.path, "rejecting path outside the app root");
                result.errors.push(error.to_string());
                progress
                    .emit(ProgressEvent::FileError {
                        path: file.path.clone(),
                        error: error.to_string(),
                    })
                    .await;
                continue;
            };
            if path.is_empty() {
                continue;
            }
            if is_protected(&path, &self.config.protected_files) {
                let message = format!("skipped protected file {}", path);
                tracing::info!(path = %path, "skipping protected file");
                progress.warning(message.clone()).await;
                result.warnings.push(message);
                continue;
            }
            if !file.is_complete {
                let message = format!("{} was cut off; writing partial content", path);
                progress.warning(message.clone()).await;
                result.warnings.push(message);
            } else if file.suspected_truncated {
                let message = format!("{} may contain elided code", path);
                progress.warning(message.clone()).await;
                result.warnings.push(message);
            }

            let content = strip_stylesheet_imports(
                &path,
                &strip_code_fences(&file.content),
                &self.config.kept_stylesheets,
            );

            match session.write_file(&path, &content).await {
                Ok(()) => {
                    let action = if known.contains(&path) {
                        result.files_updated.push(path.clone());
                        FileAction::Updated
                    } else {
                        result.files_created.push(path.clone());
                        FileAction::Created
                    };
                    known.insert(path.clone());
                    progress
                        .emit(ProgressEvent::FileComplete { path, action })
                        .await;
                }
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "file write failed");
                    result.errors.push(e.to_string());
                    progress
                        .emit(ProgressEvent::FileError {
                            path,
                            error: e.to_string(),
                        })
                        .await;
                }
            }
        }
    }

    async fn run_commands(
        &self,
        session: &SandboxSession,
        parsed: &ParsedResponse,
        progress: &ProgressSender,
        result: &mut ApplyResult,
    ) {
        let total = parsed.commands.len();
        for (index, command) in parsed.commands.iter().enumerate() {
            progress
                .emit(ProgressEvent::CommandProgress {
                    current: index + 1,
                    total,
                    command: command.clone(),
                })
                .await;

            let argv: Vec<String> = command.split_whitespace().map(String::from).collect();
            if argv.is_empty() {
                continue;
            }

            let error = match session.run_command(&argv, self.config.command_timeout()).await {
                Ok(output) => {
                    progress
                        .emit(ProgressEvent::CommandComplete {
                            command: command.clone(),
                            success: output.success(),
                            output: output.combined(),
                        })
                        .await;
                    if output.success() {
                        result.commands_executed.push(command.clone());
                        continue;
                    }
                    Error::Command {
                        command: command.clone(),
                        reason: format!("exited with code {}", output.exit_code),
                    }
                }
                Err(e) => e,
            };

            tracing::warn!(command = %command, error = %error, "command failed");
            result.errors.push(error.to_string());
            progress
                .emit(ProgressEvent::CommandError {
                    command: command.clone(),
                    error: error.to_string(),
                })
                .await;
        }
    }

    /// Schedules a save after `sync_delay`, replacing a save that has not
    /// started yet.
    async fn schedule_sync(&self, session: &Arc<SandboxSession>, project_id: &str) {
        let Some(sync) = &self.sync else {
            return;
        };

        let mut slot = self.pending_sync.lock().await;
        if let Some(previous) = slot.take() {
            previous.handle.abort();
            tracing::debug!(project_id = %previous.project_id, "replaced pending project save");
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let delay = self.config.sync_delay();
        let pending = Arc::clone(&self.pending_sync);
        let sync = Arc::clone(sync);
        let task_session = Arc::clone(session);
        let task_project = project_id.to_string();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut slot = pending.lock().await;
                if !slot.as_ref().is_some_and(|p| p.generation == generation) {
                    return;
                }
                *slot = None;
            }
            save_best_effort(&sync, &task_session, &task_project).await;
        });

        *slot = Some(PendingSync {
            generation,
            session: Arc::clone(session),
            project_id: project_id.to_string(),
            handle,
        });
    }

    /// Runs a pending delayed save immediately.
    pub async fn flush_pending_sync(&self) {
        let Some(pending) = self.pending_sync.lock().await.take() else {
            return;
        };
        pending.handle.abort();
        if let Some(sync) = &self.sync {
            save_best_effort(sync, &pending.session, &pending.project_id).await;
        }
    }

    /// Returns true while a delayed save is waiting.
    pub async fn has_pending_sync(&self) -> bool {
        self.pending_sync.lock().await.is_some()
    }
}

async fn save_best_effort(sync: &ProjectSync, session: &SandboxSession, project_id: &str) {
    if let Err(e) = sync.save_from_sandbox(session, project_id).await {
        tracing::warn!(project_id = %project_id, error = %e, "delayed project save failed");
    }
}
