//! Path normalization and content cleanup for applied files.

use std::sync::LazyLock;

use regex::Regex;

use crate::packages::detect::is_script_path;

/// Directories that are already rooted and never get the source prefix.
pub const ROOTED_DIRS: &[&str] = &["src/", "public/"];

/// Files that live at the app root.
pub const TOP_LEVEL_FILES: &[&str] = &[
    "index.html",
    "package.json",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "vite.config.js",
    "vite.config.ts",
    "tailwind.config.js",
    "tailwind.config.ts",
    "postcss.config.js",
    "postcss.config.cjs",
    "tsconfig.json",
    "tsconfig.node.json",
    "jsconfig.json",
    "eslint.config.js",
    ".eslintrc.cjs",
    ".gitignore",
    ".env",
    "README.md",
];

// `import './App.css';`
static STYLESHEET_IMPORT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^[ \t]*import\s+['"]\./([^'"/]+\.css)['"];?[ \t]*\r?\n?"#).unwrap()
});

/// Normalizes a model-supplied path to an app-relative one.
///
/// Leading `/` and `./` are removed and `.`/`..` segments are collapsed.
/// Bare paths get `source_root/` unless they are already under a rooted
/// directory or are a known top-level file. Returns `None` for a path that
/// climbs above the app root.
pub fn normalize_path(path: &str, source_root: &str) -> Option<String> {
    let p = collapse_segments(&path.trim().replace('\\', "/"))?;

    let rooted = ROOTED_DIRS.iter().any(|d| p.starts_with(d));
    if p.is_empty() || rooted || TOP_LEVEL_FILES.contains(&p.as_str()) {
        return Some(p);
    }

    let root = source_root.trim_matches('/');
    if p.starts_with(&format!("{}/", root)) {
        return Some(p);
    }
    Some(format!("{}/{}", root, p))
}

fn collapse_segments(path: &str) -> Option<String> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            other => segments.push(other),
        }
    }
    Some(segments.join("/"))
}

/// Returns true if a normalized path is on the deny-list.
pub fn is_protected(path: &str, protected: &[String]) -> bool {
    protected.iter().any(|p| p == path)
}

/// Removes a residual markdown fence wrapped around file content.
pub fn strip_code_fences(content: &str) -> String {
    let trimmed = content.trim();
    if !trimmed.starts_with("```") {
        return content.to_string();
    }

    let mut lines: Vec<&str> = trimmed.lines().collect();
    lines.remove(0);
    if lines.last().is_some_and(|l| l.trim() == "```") {
        lines.pop();
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Drops same-directory stylesheet imports from a script file, except `kept` ones.
pub fn strip_stylesheet_imports(path: &str, content: &str, kept: &[String]) -> String {
    if !is_script_path(path) {
        return content.to_string();
    }
    STYLESHEET_IMPORT_REGEX
        .replace_all(content, |caps: &regex::Captures| {
            if kept.iter().any(|k| k == &caps[1]) {
                caps[0].to_string()
            } else {
                String::new()
            }
        })
        .into_owned()
}
