//! Durable project storage, versioning, and sandbox reconciliation.

mod store;
mod sync;
mod versions;

pub use store::{
    HttpProjectStore, MemoryProjectStore, Project, ProjectStore, ProjectUpdate, ProjectVersion,
    SandboxRef,
};
pub use sync::{AutoSaveStatus, ProjectSync, SyncOutcome};
pub use versions::{compare_snapshots, ChangeCounts, FileChange, FileDiff, VersionComparison};
