//! Sandbox Sync - applies streamed LLM code output to live preview sandboxes
//!
//! This library parses semi-structured LLM responses into file, package, and
//! command directives, applies them to an ephemeral compute sandbox, and
//! reconciles that sandbox with durable, versioned project storage.

pub mod backoff;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod packages;
pub mod parser;
pub mod pipeline;
pub mod progress;
pub mod project;
mod remote;
pub mod sandbox;
pub mod server;

pub use backoff::{retry, RetryPolicy};
pub use config::{Config, Validate, ValidationResult};
pub use error::{Error, ErrorKind, Result};
pub use orchestrator::{OpenedProject, ProjectOrchestrator};
pub use packages::{PackageManifestSnapshot, PackageOutcome, PackageResolver};
pub use parser::{
    Directive, FileDirective, ParseEvent, ParsedResponse, ResponseGrammar, StreamingParser,
    TagGrammar,
};
pub use pipeline::{ApplyAbort, ApplyPipeline, ApplyRequest, ApplyResult, ConversationState};
pub use progress::{ProgressEvent, ProgressSender};
pub use project::{
    AutoSaveStatus, HttpProjectStore, MemoryProjectStore, Project, ProjectStore, ProjectSync,
    SyncOutcome, VersionComparison,
};
pub use sandbox::{
    HttpSandboxProvider, MemorySandboxProvider, SandboxProvider, SandboxSession, SandboxStatus,
    SessionSnapshot,
};
