//! Import specifier extraction and package-name normalization.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

// `import x from 'y'`, `import { a, b } from "y"`, `export * from 'y'`
static IMPORT_FROM_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\b(?:import|export)\s+(?:type\s+)?[\w*{}\s,$]*?\s*from\s*['"]([^'"\n]+)['"]"#)
        .unwrap()
});

// `import './styles.css'`
static IMPORT_BARE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\bimport\s*['"]([^'"\n]+)['"]"#).unwrap());

// `import('y')`
static IMPORT_DYNAMIC_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\bimport\s*\(\s*['"]([^'"\n]+)['"]\s*\)"#).unwrap());

// `require('y')`
static REQUIRE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\brequire\s*\(\s*['"]([^'"\n]+)['"]\s*\)"#).unwrap());

/// File extensions scanned for imports.
pub const SCRIPT_EXTENSIONS: &[&str] = &[".js", ".jsx", ".ts", ".tsx", ".mjs", ".cjs"];

/// Language builtins that are never installable packages.
pub const NODE_BUILTINS: &[&str] = &[
    "assert",
    "buffer",
    "child_process",
    "crypto",
    "events",
    "fs",
    "http",
    "https",
    "net",
    "os",
    "path",
    "process",
    "stream",
    "url",
    "util",
    "zlib",
];

/// Returns true if the path has a script extension worth scanning.
pub fn is_script_path(path: &str) -> bool {
    SCRIPT_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

/// Extracts raw import/require specifiers from source text, in document order.
pub fn extract_specifiers(source: &str) -> Vec<String> {
    let mut found: Vec<(usize, String)> = Vec::new();

    for regex in [
        &*IMPORT_FROM_REGEX,
        &*IMPORT_BARE_REGEX,
        &*IMPORT_DYNAMIC_REGEX,
        &*REQUIRE_REGEX,
    ] {
        for cap in regex.captures_iter(source) {
            if let Some(m) = cap.get(1) {
                found.push((m.start(), m.as_str().trim().to_string()));
            }
        }
    }

    found.sort_by_key(|(pos, _)| *pos);

    let mut seen = HashSet::new();
    found
        .into_iter()
        .filter_map(|(_, spec)| seen.insert(spec.clone()).then_some(spec))
        .collect()
}

/// Reduces a specifier to an installable package name.
///
/// Returns `None` for relative or absolute paths, the `@/` source alias,
/// builtins, and anything in `runtime_provided`.
pub fn package_name(specifier: &str, runtime_provided: &[String]) -> Option<String> {
    let spec = specifier.trim();
    if spec.is_empty() || spec.starts_with('.') || spec.starts_with('/') {
        return None;
    }
    if spec.starts_with("@/") || spec.starts_with("node:") {
        return None;
    }

    let mut segments = spec.split('/');
    let name = if spec.starts_with('@') {
        let scope = segments.next()?;
        let pkg = segments.next().filter(|s| !s.is_empty())?;
        format!("{}/{}", scope, pkg)
    } else {
        segments.next()?.to_string()
    };

    if NODE_BUILTINS.contains(&name.as_str()) || runtime_provided.iter().any(|p| *p == name) {
        return None;
    }

    Some(name)
}

/// Strips a trailing `@version` from a package name (`axios@1.6` -> `axios`).
pub fn strip_version(name: &str) -> &str {
    match name.rfind('@') {
        Some(idx) if idx > 0 => &name[..idx],
        _ => name,
    }
}

/// Detects installable packages across script files, deduped in first-seen order.
pub fn detect_packages<'a, I>(files: I, runtime_provided: &[String]) -> Vec<String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut seen = HashSet::new();
    let mut packages = Vec::new();

    for (path, content) in files {
        if !is_script_path(path) {
            continue;
        }
        for spec in extract_specifiers(content) {
            if let Some(name) = package_name(&spec, runtime_provided) {
                if seen.insert(name.clone()) {
                    packages.push(name);
                }
            }
        }
    }

    packages
}

/// Merges package lists, deduping by version-stripped name and keeping first-seen order.
pub fn merge_packages<'a, I>(lists: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a [String]>,
{
    let mut seen = HashSet::new();
    let mut merged = Vec::new();

    for list in lists {
        for name in list {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            if seen.insert(strip_version(name).to_string()) {
                merged.push(name.to_string());
            }
        }
    }

    merged
}
