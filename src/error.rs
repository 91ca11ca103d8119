//! Error types for the sandbox-sync pipeline.

use thiserror::Error;

use crate::sandbox::SandboxStatus;

/// Top-level error type for sandbox, package, and persistence operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The session is not in the `Running` state.
    #[error("sandbox unavailable (status: {status})")]
    SandboxUnavailable { status: SandboxStatus },

    /// Reconnecting to a previously known sandbox failed.
    #[error("failed to reconnect to sandbox {sandbox_id}: {reason}; the sandbox has likely expired")]
    ReconnectFailure { sandbox_id: String, reason: String },

    /// Remote provisioning of a new sandbox failed.
    #[error("failed to create sandbox: {0}")]
    SandboxCreation(String),

    /// A status change the session state machine does not allow.
    #[error("invalid sandbox transition from {from} to {to}")]
    InvalidTransition { from: SandboxStatus, to: SandboxStatus },

    /// Writing a single file into the sandbox failed.
    #[error("failed to write {path}: {reason}")]
    FileWrite { path: String, reason: String },

    /// A single command failed to execute.
    #[error("command `{command}` failed: {reason}")]
    Command { command: String, reason: String },

    /// A command exceeded its time budget.
    #[error("command `{command}` timed out after {seconds}s")]
    CommandTimeout { command: String, seconds: u64 },

    /// The package install batch failed.
    #[error("package install failed: {0}")]
    PackageInstall(String),

    /// A requested package name contained characters outside the allowed set.
    #[error("refusing to install malformed package name {name:?}")]
    MalformedPackageName { name: String },

    /// Persisting sandbox state to durable storage failed.
    #[error("persistence sync failed: {0}")]
    PersistenceSync(String),

    /// The sandbox platform returned an error.
    #[error("sandbox platform error: {0}")]
    Remote(String),

    /// Durable storage returned an error.
    #[error("project storage error: {0}")]
    Storage(String),

    /// No durable project with this id.
    #[error("project {0} not found")]
    ProjectNotFound(String),

    /// No stored snapshot for this project version.
    #[error("version {version} of project {project_id} not found")]
    VersionNotFound { project_id: String, version: u64 },

    /// Durable storage handed back a version that did not advance.
    #[error("project {project_id} version regressed: {previous} -> {returned}")]
    VersionRegression {
        project_id: String,
        previous: u64,
        returned: u64,
    },

    /// An id that cannot be used as a single URL path segment.
    #[error("invalid identifier {0:?}")]
    InvalidId(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Stable, serializable tag for an [`Error`], used in progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SandboxUnavailable,
    ReconnectFailure,
    SandboxCreation,
    InvalidTransition,
    PerFileWriteError,
    PerCommandError,
    PackageInstallFailure,
    MalformedPackageName,
    PersistenceSyncFailure,
    Remote,
    Storage,
    NotFound,
    InvalidId,
    Config,
    Internal,
}

impl Error {
    /// Returns the stable kind tag for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::SandboxUnavailable { .. } => ErrorKind::SandboxUnavailable,
            Error::ReconnectFailure { .. } => ErrorKind::ReconnectFailure,
            Error::SandboxCreation(_) => ErrorKind::SandboxCreation,
            Error::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Error::FileWrite { .. } => ErrorKind::PerFileWriteError,
            Error::Command { .. } | Error::CommandTimeout { .. } => ErrorKind::PerCommandError,
            Error::PackageInstall(_) => ErrorKind::PackageInstallFailure,
            Error::MalformedPackageName { .. } => ErrorKind::MalformedPackageName,
            Error::PersistenceSync(_) | Error::VersionRegression { .. } => {
                ErrorKind::PersistenceSyncFailure
            }
            Error::Remote(_) | Error::Http(_) => ErrorKind::Remote,
            Error::Storage(_) => ErrorKind::Storage,
            Error::ProjectNotFound(_) | Error::VersionNotFound { .. } => ErrorKind::NotFound,
            Error::InvalidId(_) => ErrorKind::InvalidId,
            Error::Config(_) => ErrorKind::Config,
            Error::Io(_) | Error::Json(_) => ErrorKind::Internal,
        }
    }

    /// Returns true for errors that must stop an apply run before any step.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::SandboxUnavailable | ErrorKind::ReconnectFailure
        )
    }
}

/// Result type alias for sandbox-sync operations.
pub type Result<T> = std::result::Result<T, Error>;
