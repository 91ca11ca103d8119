//! Ordered, one-way progress events for a single operation.
//!
//! Each apply gets its own [`ProgressSender`]; events from one sender are
//! delivered in emission order. Over HTTP they are framed as NDJSON.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{Error, ErrorKind, Result};
use crate::pipeline::ApplyResult;

/// Default buffer size for progress channels.
pub const DEFAULT_CAPACITY: usize = 256;

/// Stage reported by the package resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageStage {
    Detecting,
    Installing,
    Restarting,
    Complete,
}

/// Whether an applied file was new or replaced an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Created,
    Updated,
}

/// One progress frame, discriminated on `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ProgressEvent {
    Start {
        message: String,
        total_steps: usize,
    },
    Step {
        step: usize,
        message: String,
    },
    Status {
        message: String,
    },
    Warning {
        message: String,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
    FileProgress {
        current: usize,
        total: usize,
        file_name: String,
    },
    FileComplete {
        path: String,
        action: FileAction,
    },
    FileError {
        path: String,
        error: String,
    },
    CommandProgress {
        current: usize,
        total: usize,
        command: String,
    },
    CommandComplete {
        command: String,
        success: bool,
        output: String,
    },
    CommandError {
        command: String,
        error: String,
    },
    PackageProgress {
        stage: PackageStage,
        message: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        packages: Vec<String>,
    },
    PackageSuccess {
        installed: Vec<String>,
    },
    Complete {
        result: ApplyResult,
    },
}

impl ProgressEvent {
    /// Builds a `status` event.
    pub fn status(message: impl Into<String>) -> Self {
        ProgressEvent::Status {
            message: message.into(),
        }
    }

    /// Builds a `warning` event.
    pub fn warning(message: impl Into<String>) -> Self {
        ProgressEvent::Warning {
            message: message.into(),
        }
    }

    /// Builds an `error` event from a crate error.
    pub fn error(error: &Error) -> Self {
        ProgressEvent::Error {
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    /// Returns true for the terminal `complete` event.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Complete { .. })
    }

    /// Serializes the event as one NDJSON line, newline included.
    pub fn to_ndjson(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Writer half of a progress channel.
///
/// Emitting never fails: a dropped receiver just stops delivery.
#[derive(Debug, Clone, Default)]
pub struct ProgressSender {
    tx: Option<mpsc::Sender<ProgressEvent>>,
}

impl ProgressSender {
    /// Returns a sender that discards every event.
    pub fn noop() -> Self {
        Self { tx: None }
    }

    /// Emits one event.
    pub async fn emit(&self, event: ProgressEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.send(event).await.is_err() {
            tracing::debug!("progress receiver dropped");
        }
    }

    /// Emits a `status` event.
    pub async fn status(&self, message: impl Into<String>) {
        self.emit(ProgressEvent::status(message)).await;
    }

    /// Emits a `warning` event.
    pub async fn warning(&self, message: impl Into<String>) {
        self.emit(ProgressEvent::warning(message)).await;
    }
}

/// Creates a progress channel.
pub fn channel(capacity: usize) -> (ProgressSender, mpsc::Receiver<ProgressEvent>) {
    let (tx, rx) = mpsc::channel(capacity);
    (ProgressSender { tx: Some(tx) }, rx)
}
