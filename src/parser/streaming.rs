//! Incremental parser used for live feedback while a response streams in.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tokio::sync::mpsc;

static OPEN_TAG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^<file\s+path\s*=\s*["']([^"']+)["'][^>]*>$"#).unwrap());

const OPEN_PREFIX: &str = "<file";
const CLOSE_TAG: &str = "</file>";

/// Tags whose bodies are directives rather than conversational text.
const SIMPLE_TAGS: &[&str] = &["packages", "package", "command", "structure", "explanation"];

/// An event emitted as chunks are pushed through a [`StreamingParser`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ParseEvent {
    /// Conversational text outside any file block.
    Text { text: String },
    /// A file block started.
    FileOpen { path: String },
    /// More body text for the open file.
    FileChunk { path: String, text: String },
    /// A file block ended; `complete` is false if the stream ended first.
    FileClose { path: String, complete: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Outside,
    InFile { path: String },
    /// Inside a non-file tag whose body is not conversational text.
    InTag { name: &'static str },
}

/// Returns how many trailing bytes of `s` could be the start of `tag`.
fn partial_suffix_len(s: &str, tag: &str) -> usize {
    (1..tag.len())
        .rev()
        .find(|&len| s.ends_with(&tag[..len]))
        .unwrap_or(0)
}

/// Returns true if `s` could still grow into a recognized open tag.
fn is_open_prefix(s: &str) -> bool {
    OPEN_PREFIX.starts_with(s)
        || SIMPLE_TAGS
            .iter()
            .any(|name| format!("<{}>", name).starts_with(s))
}

/// Chunk-by-chunk recognizer for `<file>` blocks.
///
/// Tags split across chunk boundaries are held back until they can be
/// classified, so no event ever contains half a tag.
#[derive(Debug)]
pub struct StreamingParser {
    state: State,
    pending: String,
    text: String,
    full: String,
}

impl Default for StreamingParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingParser {
    /// Creates a new parser.
    pub fn new() -> Self {
        Self {
            state: State::Outside,
            pending: String::new(),
            text: String::new(),
            full: String::new(),
        }
    }

    /// Returns everything pushed so far.
    pub fn accumulated(&self) -> &str {
        &self.full
    }

    /// Returns the path of the file block currently being streamed.
    pub fn current_file(&self) -> Option<&str> {
        match &self.state {
            State::InFile { path } => Some(path),
            State::Outside | State::InTag { .. } => None,
        }
    }

    /// Feeds one chunk and returns the events it completes.
    pub fn push(&mut self, chunk: &str) -> Vec<ParseEvent> {
        self.full.push_str(chunk);
        self.pending.push_str(chunk);

        let mut events = Vec::new();
        loop {
            let progressed = match self.state.clone() {
                State::Outside => self.step_outside(&mut events),
                State::InFile { path } => self.step_in_file(path, &mut events),
                State::InTag { name } => self.step_in_tag(name),
            };
            if !progressed {
                break;
            }
        }
        events
    }

    /// Ends the stream, closing any open block as incomplete.
    pub fn finish(&mut self) -> Vec<ParseEvent> {
        let mut events = Vec::new();
        let rest = std::mem::take(&mut self.pending);

        match std::mem::replace(&mut self.state, State::Outside) {
            State::InFile { path } => {
                if !rest.is_empty() {
                    events.push(ParseEvent::FileChunk {
                        path: path.clone(),
                        text: rest,
                    });
                }
                tracing::debug!(path = %path, "stream ended inside file block");
                events.push(ParseEvent::FileClose {
                    path,
                    complete: false,
                });
            }
            State::Outside => {
                self.text.push_str(&rest);
                self.flush_text(&mut events);
            }
            State::InTag { name } => {
                tracing::debug!(tag = name, "stream ended inside tag");
                self.flush_text(&mut events);
            }
        }

        events
    }

    fn flush_text(&mut self, events: &mut Vec<ParseEvent>) {
        if !self.text.is_empty() {
            events.push(ParseEvent::Text {
                text: std::mem::take(&mut self.text),
            });
        }
    }

    /// Consumes pending text outside any tag. Returns true if it made progress
    /// that may allow further steps.
    fn step_outside(&mut self, events: &mut Vec<ParseEvent>) -> bool {
        let Some(idx) = self.pending.find('<') else {
            self.text.push_str(&self.pending);
            self.pending.clear();
            return false;
        };

        let rest = &self.pending[idx..];

        if rest.starts_with(OPEN_PREFIX) {
            let Some(gt) = rest.find('>').map(|off| idx + off) else {
                // Open tag not finished yet.
                self.text.push_str(&self.pending[..idx]);
                self.pending.drain(..idx);
                return false;
            };
            let tag = &self.pending[idx..=gt];
            if let Some(cap) = OPEN_TAG_REGEX.captures(tag) {
                let path = cap[1].trim().to_string();
                self.text.push_str(&self.pending[..idx]);
                self.pending.drain(..=gt);
                self.flush_text(events);
                events.push(ParseEvent::FileOpen { path: path.clone() });
                self.state = State::InFile { path };
                return true;
            }
        } else if let Some(name) = SIMPLE_TAGS
            .iter()
            .find(|name| rest.starts_with(&format!("<{}>", name)))
        {
            let open_len = name.len() + 2;
            self.text.push_str(&self.pending[..idx]);
            self.pending.drain(..idx + open_len);
            self.flush_text(events);
            self.state = State::InTag { name: *name };
            return true;
        } else if is_open_prefix(rest) {
            self.text.push_str(&self.pending[..idx]);
            self.pending.drain(..idx);
            return false;
        }

        // Not a recognized tag; keep the `<` as text.
        self.text.push_str(&self.pending[..=idx]);
        self.pending.drain(..=idx);
        true
    }

    /// Skips the body of a non-file tag. Returns true once the tag closed.
    fn step_in_tag(&mut self, name: &'static str) -> bool {
        let close = format!("</{}>", name);
        if let Some(idx) = self.pending.find(&close) {
            self.pending.drain(..idx + close.len());
            self.state = State::Outside;
            return true;
        }
        let keep = partial_suffix_len(&self.pending, &close);
        let split = self.pending.len() - keep;
        self.pending.drain(..split);
        false
    }

    /// Consumes pending body text. Returns true if the block closed.
    fn step_in_file(&mut self, path: String, events: &mut Vec<ParseEvent>) -> bool {
        if let Some(idx) = self.pending.find(CLOSE_TAG) {
            if idx > 0 {
                events.push(ParseEvent::FileChunk {
                    path: path.clone(),
                    text: self.pending[..idx].to_string(),
                });
            }
            self.pending.drain(..idx + CLOSE_TAG.len());
            events.push(ParseEvent::FileClose {
                path,
                complete: true,
            });
            self.state = State::Outside;
            return true;
        }

        let keep = partial_suffix_len(&self.pending, CLOSE_TAG);
        let split = self.pending.len() - keep;
        if split > 0 {
            events.push(ParseEvent::FileChunk {
                path,
                text: self.pending[..split].to_string(),
            });
            self.pending.drain(..split);
        }
        false
    }
}

/// Runs a [`StreamingParser`] over a chunk channel, forwarding events.
///
/// Returns the full accumulated text once the input channel closes. A
/// dropped event receiver does not stop accumulation.
pub async fn drive_stream(
    mut chunks: mpsc::Receiver<String>,
    events: mpsc::Sender<ParseEvent>,
) -> String {
    let mut parser = StreamingParser::new();
    let mut forwarding = true;

    while let Some(chunk) = chunks.recv().await {
        for event in parser.push(&chunk) {
            if forwarding && events.send(event).await.is_err() {
                tracing::debug!("parse event receiver dropped");
                forwarding = false;
            }
        }
    }

    for event in parser.finish() {
        if forwarding && events.send(event).await.is_err() {
            forwarding = false;
        }
    }

    parser.full
}
