//! Package detection, manifest inspection, and safe installation.

pub mod detect;
mod resolver;

pub use resolver::{
    install_argv, is_malformed_package_name, sanitize_package_name, PackageOutcome, PackageResolver, SideEffect,
    SideEffectKind, INSTALL_SENTINEL,
};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use detect::strip_version;

/// Dependencies declared in a sandbox's `package.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifestSnapshot {
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub dev_dependencies: BTreeMap<String, String>,
}

impl PackageManifestSnapshot {
    /// Parses a `package.json` document, ignoring unrelated fields.
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Returns true if `name` (version suffix ignored) is a dependency or dev dependency.
    pub fn is_installed(&self, name: &str) -> bool {
        let base = strip_version(name.trim());
        self.dependencies.contains_key(base) || self.dev_dependencies.contains_key(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_ignores_unrelated_fields() {
        let manifest = PackageManifestSnapshot::from_json(
            r#"{"name":"app","scripts":{"dev":"vite"},"dependencies":{"react":"^18.2.0"},"devDependencies":{"vite":"^5.0.0"}}"#,
        )
        .unwrap();

        assert!(manifest.is_installed("react"));
        assert!(manifest.is_installed("vite@5"));
        assert!(!manifest.is_installed("axios"));
    }

    #[test]
    fn manifest_without_dependency_sections_is_empty() {
        let manifest = PackageManifestSnapshot::from_json(r#"{"name":"app"}"#).unwrap();
        assert_eq!(manifest, PackageManifestSnapshot::default());
    }

    #[test]
    fn invalid_manifest_is_an_error() {
        assert!(PackageManifestSnapshot::from_json("not json").is_err());
    }
}
