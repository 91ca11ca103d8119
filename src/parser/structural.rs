//! Final structural pass over a complete response.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::packages::detect::{detect_packages, merge_packages};

use super::{FileDirective, ParsedResponse, ResponseGrammar};

static FILE_BLOCK_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<file\s+path\s*=\s*["']([^"']+)["'][^>]*>(.*?)</file>"#).unwrap()
});

static FILE_OPEN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<file\s+path\s*=\s*["']([^"']+)["'][^>]*>"#).unwrap());

// ```jsx path="src/App.jsx"  /  ```tsx file=src/main.tsx
static FENCED_FILE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?s)```[\w+-]*[ \t]+(?:path|file|filename)\s*=\s*["']?([^"'\s`]+)["']?[^\n]*\n(.*?)```"#,
    )
    .unwrap()
});

static PACKAGE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<package>(.*?)</package>").unwrap());

static PACKAGES_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<packages>(.*?)</packages>").unwrap());

static COMMAND_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<command>(.*?)</command>").unwrap());

static STRUCTURE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<structure>(.*?)</structure>").unwrap());

static EXPLANATION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<explanation>(.*?)</explanation>").unwrap());

const FILE_CLOSE_TAG: &str = "</file>";

/// Spread patterns that legitimately contain `...`.
const SPREAD_EXCEPTIONS: &[&str] = &["props", "rest"];

/// Returns true if content contains an elision `...` other than a
/// `...props` / `...rest` spread.
pub fn looks_truncated(content: &str) -> bool {
    content.match_indices("...").any(|(idx, _)| {
        let rest = &content[idx + 3..];
        !SPREAD_EXCEPTIONS.iter().any(|p| rest.starts_with(p))
    })
}

/// A file candidate together with its position in the response.
struct Candidate {
    offset: usize,
    file: FileDirective,
}

fn make_file(path: &str, body: &str, is_complete: bool) -> FileDirective {
    let content = body.trim().to_string();
    FileDirective {
        path: path.trim().to_string(),
        suspected_truncated: looks_truncated(&content),
        content,
        is_complete,
    }
}

/// Drops a half-written closing tag left at the end of a truncated block.
fn strip_partial_close(body: &str) -> &str {
    for len in (2..FILE_CLOSE_TAG.len()).rev() {
        if body.ends_with(&FILE_CLOSE_TAG[..len]) {
            return &body[..body.len() - len];
        }
    }
    body
}

/// Decides whether `candidate` displaces the version already kept for its path.
fn should_replace(existing: &FileDirective, candidate: &FileDirective) -> bool {
    match (existing.is_complete, candidate.is_complete) {
        (false, true) => true,
        (true, false) => false,
        _ => candidate.content.len() > existing.content.len(),
    }
}

/// The default `<file>`/`<package>`/`<command>` tag grammar.
#[derive(Debug, Clone)]
pub struct TagGrammar {
    runtime_provided: Vec<String>,
}

impl Default for TagGrammar {
    fn default() -> Self {
        Self::new(vec!["react".to_string(), "react-dom".to_string()])
    }
}

impl TagGrammar {
    /// Creates a grammar that never reports `runtime_provided` packages.
    pub fn new(runtime_provided: Vec<String>) -> Self {
        Self { runtime_provided }
    }

    fn file_candidates(&self, text: &str) -> Vec<Candidate> {
        let mut candidates = Vec::new();
        let mut tag_regions: Vec<(usize, usize)> = Vec::new();
        let mut last_block_end = 0;

        for cap in FILE_BLOCK_REGEX.captures_iter(text) {
            let (Some(whole), Some(body)) = (cap.get(0), cap.get(2)) else {
                continue;
            };
            tag_regions.push((whole.start(), whole.end()));
            last_block_end = whole.end();

            // The lazy match swallows an unclosed block that runs straight into
            // the next opening tag; split those back out as incomplete.
            let mut path = cap[1].to_string();
            let mut offset = whole.start();
            let mut body_start = body.start();
            while let Some(inner) = FILE_OPEN_REGEX.captures(&text[body_start..body.end()]) {
                let Some(open) = inner.get(0) else { break };
                candidates.push(Candidate {
                    offset,
                    file: make_file(&path, &text[body_start..body_start + open.start()], false),
                });
                path = inner[1].to_string();
                offset = body_start + open.start();
                body_start += open.end();
            }
            candidates.push(Candidate {
                offset,
                file: make_file(&path, &text[body_start..body.end()], true),
            });
        }

        // Streaming truncation leaves at most one unclosed block after the last closed one.
        let dangling = FILE_OPEN_REGEX
            .captures(&text[last_block_end..])
            .and_then(|cap| cap.get(0).map(|open| (open.start(), open.end(), cap[1].to_string())));
        if let Some((open_start, open_end, path)) = dangling {
            let start = last_block_end + open_start;
            let body = strip_partial_close(&text[last_block_end + open_end..]);
            tag_regions.push((start, text.len()));
            candidates.push(Candidate {
                offset: start,
                file: make_file(&path, body, false),
            });
        }

        for cap in FENCED_FILE_REGEX.captures_iter(text) {
            let Some(whole) = cap.get(0) else { continue };
            let inside_tag = tag_regions
                .iter()
                .any(|(start, end)| whole.start() >= *start && whole.start() < *end);
            if inside_tag {
                continue;
            }
            candidates.push(Candidate {
                offset: whole.start(),
                file: make_file(&cap[1], &cap[2], true),
            });
        }

        candidates.sort_by_key(|c| c.offset);
        candidates
    }

    fn resolve_duplicates(candidates: Vec<Candidate>) -> Vec<FileDirective> {
        let mut files: Vec<FileDirective> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for Candidate { file, .. } in candidates {
            if file.path.is_empty() {
                continue;
            }
            match index.get(&file.path) {
                Some(&i) => {
                    if should_replace(&files[i], &file) {
                        tracing::debug!(
                            path = %file.path,
                            complete = file.is_complete,
                            len = file.content.len(),
                            "replacing earlier version of file"
                        );
                        files[i] = file;
                    }
                }
                None => {
                    index.insert(file.path.clone(), files.len());
                    files.push(file);
                }
            }
        }

        files
    }

    fn explicit_packages(text: &str) -> Vec<String> {
        let mut packages = Vec::new();

        for cap in PACKAGE_REGEX.captures_iter(text) {
            let name = cap[1].trim();
            if !name.is_empty() {
                packages.push(name.to_string());
            }
        }

        for cap in PACKAGES_REGEX.captures_iter(text) {
            for entry in cap[1].split(['\n', ',']) {
                let name = entry.trim().trim_start_matches(['-', '*']).trim();
                if !name.is_empty() {
                    packages.push(name.to_string());
                }
            }
        }

        packages
    }

    fn commands(text: &str) -> Vec<String> {
        let mut commands: Vec<String> = Vec::new();
        for cap in COMMAND_REGEX.captures_iter(text) {
            let cmd = cap[1].trim();
            if !cmd.is_empty() && !commands.iter().any(|c| c == cmd) {
                commands.push(cmd.to_string());
            }
        }
        commands
    }

    fn single(regex: &Regex, text: &str) -> Option<String> {
        regex
            .captures(text)
            .map(|cap| cap[1].trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

impl ResponseGrammar for TagGrammar {
    fn parse(&self, text: &str) -> ParsedResponse {
        let files = Self::resolve_duplicates(self.file_candidates(text));

        let explicit = Self::explicit_packages(text);
        let detected = detect_packages(
            files.iter().map(|f| (f.path.as_str(), f.content.as_str())),
            &self.runtime_provided,
        );
        let packages = merge_packages([explicit.as_slice(), detected.as_slice()]);

        let parsed = ParsedResponse {
            files,
            packages,
            commands: Self::commands(text),
            explanation: Self::single(&EXPLANATION_REGEX, text),
            structure: Self::single(&STRUCTURE_REGEX, text),
        };

        tracing::debug!(
            files = parsed.files.len(),
            packages = parsed.packages.len(),
            commands = parsed.commands.len(),
            "parsed response"
        );

        parsed
    }

    fn name(&self) -> &str {
        "tag-grammar"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> ParsedResponse {
        TagGrammar::default().parse(text)
    }

    #[test]
    fn parses_complete_file_blocks_in_order() {
        let parsed = parse(
            r#"Here you go.
<file path="src/App.jsx">
export default function App() { return <div/>; }
</file>
<file path='src/main.jsx'>
console.log("hi");
</file>"#,
        );

        assert_eq!(parsed.file_paths(), vec!["src/App.jsx", "src/main.jsx"]);
        let app = parsed.file("src/App.jsx").unwrap();
        assert!(app.is_complete);
        assert_eq!(app.content, "export default function App() { return <div/>; }");
    }

    #[test]
    fn dangling_block_is_marked_incomplete() {
        let parsed = parse(
            "<file path=\"src/a.js\">a</file>\n<file path=\"src/b.js\">const b = 1;\nconst c",
        );

        assert_eq!(parsed.files.len(), 2);
        let b = parsed.file("src/b.js").unwrap();
        assert!(!b.is_complete);
        assert_eq!(b.content, "const b = 1;\nconst c");
    }

    #[test]
    fn dangling_block_drops_partial_close_tag() {
        let parsed = parse("<file path=\"src/b.js\">const b = 1;</fi");
        assert_eq!(parsed.file("src/b.js").unwrap().content, "const b = 1;");
    }

    #[test]
    fn incomplete_then_complete_keeps_complete_version() {
        let short = "const a = 1;\n";
        let long = "const a = 1;\nconst b = 2;\nexport { a, b };";
        let text = format!(
            "<file path=\"src/x.js\">{}</file><file path=\"src/x.js\">{}</file>",
            short, long
        );
        // Both closed: the longer wins.
        assert_eq!(parse(&text).file("src/x.js").unwrap().content, long);

        let text = format!(
            "<file path=\"src/x.js\">{}</file>\n<file path=\"src/x.js\">{}",
            long, short
        );
        // Complete existing is never replaced by a later incomplete one.
        assert_eq!(parse(&text).file("src/x.js").unwrap().content, long);
    }

    #[test]
    fn unclosed_block_followed_by_reopen_is_split() {
        let unclosed = "const x = 1; //";
        let closed = "const x = 1; // and then the rest of it.";
        let text = format!(
            "<file path=\"src/x.jsx\">{}\n<file path=\"src/x.jsx\">{}</file>",
            unclosed, closed
        );
        let parsed = parse(&text);
        assert_eq!(parsed.files.len(), 1);
        let file = parsed.file("src/x.jsx").unwrap();
        assert_eq!(file.content, closed);
        assert!(file.is_complete);

        let text = format!(
            "<file path=\"src/a.jsx\">{}\n<file path=\"src/b.jsx\">{}</file>",
            unclosed, closed
        );
        let parsed = parse(&text);
        assert_eq!(parsed.file_paths(), vec!["src/a.jsx", "src/b.jsx"]);
        assert!(!parsed.file("src/a.jsx").unwrap().is_complete);
    }

    #[test]
    fn fenced_alternate_and_dangling_block_coexist() {
        let text = "<file path=\"src/App.jsx\">partial</file>";
        let parsed = parse(text);
        assert!(parsed.file("src/App.jsx").unwrap().is_complete);

        // A 15-char unclosed block followed by a 40-char closed fenced block.
        let unclosed = "const x = 1; //";
        let closed = "const x = 1; // and then the rest of it.";
        assert_eq!(unclosed.len(), 15);
        assert_eq!(closed.len(), 40);
        let text = format!(
            "```jsx path=\"src/x.jsx\"\n{}\n```\n<file path=\"src/y.jsx\">{}",
            closed, unclosed
        );
        let parsed = parse(&text);
        assert_eq!(parsed.file("src/x.jsx").unwrap().content, closed);
        assert!(!parsed.file("src/y.jsx").unwrap().is_complete);
    }

    #[test]
    fn fenced_block_inside_file_tag_is_not_a_second_source() {
        let text = "<file path=\"README.md\">\n```js path=\"src/other.js\"\nx\n```\n</file>";
        let parsed = parse(text);
        assert_eq!(parsed.file_paths(), vec!["README.md"]);
    }

    #[test]
    fn duplicate_policy_prefers_complete_then_longer() {
        let existing = FileDirective {
            path: "a".into(),
            content: "abc".into(),
            is_complete: false,
            suspected_truncated: false,
        };
        let longer = FileDirective {
            content: "abcdef".into(),
            ..existing.clone()
        };
        assert!(should_replace(&existing, &longer));
        assert!(!should_replace(&longer, &existing));

        let shorter_complete = FileDirective {
            content: "a".into(),
            is_complete: true,
            ..existing.clone()
        };
        assert!(should_replace(&longer, &shorter_complete));
        assert!(!should_replace(&shorter_complete, &longer));
    }

    #[test]
    fn truncation_guard_ignores_props_and_rest_spreads() {
        assert!(!looks_truncated("const A = (props) => <B {...props} />;"));
        assert!(!looks_truncated("const { a, ...rest } = obj;"));
        assert!(looks_truncated("function App() {\n  // ...\n}"));
        assert!(looks_truncated("const items = [1, 2, 3, ...];"));
    }

    #[test]
    fn suspected_truncated_file_is_still_kept() {
        let parsed = parse("<file path=\"src/App.jsx\">// ... existing code ...</file>");
        let file = parsed.file("src/App.jsx").unwrap();
        assert!(file.suspected_truncated);
        assert!(file.is_complete);
    }

    #[test]
    fn collects_package_and_packages_tags() {
        let parsed = parse(
            "<package>axios</package>\n<packages>\n- zod\nclsx, date-fns\n\n</packages><package>axios</package>",
        );
        assert_eq!(parsed.packages, vec!["axios", "zod", "clsx", "date-fns"]);
    }

    #[test]
    fn detects_packages_from_imports_without_tags() {
        let parsed = parse(
            "<file path=\"src/App.jsx\">import { motion } from 'framer-motion';\nimport Icon from '@heroicons/react/24/outline';\nimport React from 'react';\nimport './App.css';</file>",
        );
        assert_eq!(parsed.packages, vec!["framer-motion", "@heroicons/react"]);
    }

    #[test]
    fn commands_structure_and_explanation() {
        let parsed = parse(
            "<explanation>Built a todo app.</explanation>\n<structure>src/App.jsx</structure>\n<command>npm run lint</command>\n<command>npm run lint</command>\n<command> npm test </command>",
        );
        assert_eq!(parsed.commands, vec!["npm run lint", "npm test"]);
        assert_eq!(parsed.explanation.as_deref(), Some("Built a todo app."));
        assert_eq!(parsed.structure.as_deref(), Some("src/App.jsx"));
    }

    #[test]
    fn malformed_input_never_panics() {
        for text in [
            "",
            "<file",
            "<file path=>",
            "<file path=\"\"></file>",
            "</file></file><package></package>",
            "```js path=\n",
            "<packages>",
        ] {
            let parsed = parse(text);
            assert!(parsed.files.iter().all(|f| !f.path.is_empty()));
        }
    }
}
