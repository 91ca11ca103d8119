//! Tolerant parsing of LLM responses into directives.
//!
//! Two passes cooperate:
//! - [`StreamingParser`] runs chunk by chunk and only drives live feedback.
//! - A [`ResponseGrammar`] (by default [`TagGrammar`]) runs once over the
//!   complete text and produces the authoritative [`ParsedResponse`].
//!
//! Neither pass has a fatal error condition; malformed regions degrade to
//! conversational text.

mod streaming;
mod structural;

pub use streaming::{drive_stream, ParseEvent, StreamingParser};
pub use structural::{looks_truncated, TagGrammar};

use serde::{Deserialize, Serialize};

/// A file block extracted from a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDirective {
    /// Path as written by the model (not yet normalized).
    pub path: String,
    /// File body.
    pub content: String,
    /// False when the block was cut off by stream truncation.
    pub is_complete: bool,
    /// True when the body contains an elision marker such as `...`.
    pub suspected_truncated: bool,
}

/// One parsed instruction unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Directive {
    File(FileDirective),
    Package { name: String },
    Command { cmd: String },
    Explanation { text: String },
    Structure { text: String },
}

/// The deduplicated directive set for one response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedResponse {
    /// At most one entry per path, in first-arrival order.
    pub files: Vec<FileDirective>,
    /// Explicit and import-detected packages, deduped.
    pub packages: Vec<String>,
    /// Commands in document order.
    pub commands: Vec<String>,
    pub explanation: Option<String>,
    pub structure: Option<String>,
}

impl ParsedResponse {
    /// Returns the file directive for a path, if any.
    pub fn file(&self, path: &str) -> Option<&FileDirective> {
        self.files.iter().find(|f| f.path == path)
    }

    /// Returns the paths of all parsed files.
    pub fn file_paths(&self) -> Vec<String> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }

    /// Returns true if nothing actionable was found.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.packages.is_empty() && self.commands.is_empty()
    }

    /// Flattens the response into an ordered directive list.
    pub fn directives(&self) -> Vec<Directive> {
        let mut directives: Vec<Directive> =
            self.files.iter().cloned().map(Directive::File).collect();
        directives.extend(
            self.packages
                .iter()
                .map(|name| Directive::Package { name: name.clone() }),
        );
        directives.extend(
            self.commands
                .iter()
                .map(|cmd| Directive::Command { cmd: cmd.clone() }),
        );
        if let Some(text) = &self.structure {
            directives.push(Directive::Structure { text: text.clone() });
        }
        if let Some(text) = &self.explanation {
            directives.push(Directive::Explanation { text: text.clone() });
        }
        directives
    }
}

/// A best-effort grammar that turns a complete response into directives.
///
/// Implementations must never fail; unrecognized input yields an empty
/// or partial [`ParsedResponse`].
pub trait ResponseGrammar: Send + Sync {
    /// Parses the fully accumulated response text.
    fn parse(&self, text: &str) -> ParsedResponse;

    /// Returns the name of this grammar.
    fn name(&self) -> &str;
}
