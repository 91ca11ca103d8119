//! Version-to-version comparison of project snapshots.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// How a single path changed between two versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileChange {
    Added,
    Modified,
    Removed,
    Unchanged,
}

/// Per-file comparison entry. Sizes are in bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDiff {
    pub path: String,
    pub change: FileChange,
    pub size_before: Option<usize>,
    pub size_after: Option<usize>,
}

/// Counts per change class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCounts {
    pub added: usize,
    pub modified: usize,
    pub removed: usize,
    pub unchanged: usize,
}

/// Result of comparing two project versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionComparison {
    pub from_version: u64,
    pub to_version: u64,
    pub counts: ChangeCounts,
    /// Sorted by path.
    pub files: Vec<FileDiff>,
}

impl VersionComparison {
    /// Returns true if nothing was added, modified, or removed.
    pub fn is_identical(&self) -> bool {
        self.counts.added == 0 && self.counts.modified == 0 && self.counts.removed == 0
    }
}

/// Classifies every path present in either snapshot.
pub fn compare_snapshots(
    from_version: u64,
    from: &BTreeMap<String, String>,
    to_version: u64,
    to: &BTreeMap<String, String>,
) -> VersionComparison {
    let paths: BTreeSet<&String> = from.keys().chain(to.keys()).collect();
    let mut counts = ChangeCounts::default();

    let files = paths
        .into_iter()
        .map(|path| {
            let before = from.get(path);
            let after = to.get(path);
            let change = match (before, after) {
                (None, Some(_)) => FileChange::Added,
                (Some(_), None) => FileChange::Removed,
                (Some(b), Some(a)) if b == a => FileChange::Unchanged,
                _ => FileChange::Modified,
            };
            match change {
                FileChange::Added => counts.added += 1,
                FileChange::Modified => counts.modified += 1,
                FileChange::Removed => counts.removed += 1,
                FileChange::Unchanged => counts.unchanged += 1,
            }
            FileDiff {
                path: path.clone(),
                change,
                size_before: before.map(String::len),
                size_after: after.map(String::len),
            }
        })
        .collect();

    VersionComparison {
        from_version,
        to_version,
        counts,
        files,
    }
}
