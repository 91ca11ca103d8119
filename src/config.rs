//! Configuration loading and validation.
//!
//! Settings come from an optional TOML file and are then overridden by
//! environment variables:
//! - `SANDBOX_API_URL` / `SANDBOX_API_KEY` - remote sandbox platform
//! - `PROJECT_STORE_URL` / `PROJECT_STORE_TOKEN` - durable project storage
//! - `SANDBOX_SYNC_DEBUG=1` - verbose logging

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Remote sandbox platform settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Base URL of the sandbox platform API. `None` selects the in-process provider.
    #[serde(default)]
    pub api_url: Option<String>,
    /// API key sent as a bearer token.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Application root inside the sandbox; all normalized paths are relative to it.
    #[serde(default = "default_app_root")]
    pub app_root: String,
    /// Seconds between background health checks. Zero disables them.
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
    /// Maximum auto-restore attempts after the sandbox expires.
    #[serde(default = "default_max_restore_attempts")]
    pub max_restore_attempts: u32,
    /// Requested sandbox lifetime in seconds.
    #[serde(default = "default_lease")]
    pub lease_secs: u64,
    /// Template the platform boots the sandbox from.
    #[serde(default = "default_template")]
    pub template: String,
}

fn default_app_root() -> String {
    "/home/user/app".to_string()
}

fn default_health_check_interval() -> u64 {
    300
}

fn default_max_restore_attempts() -> u32 {
    3
}

fn default_lease() -> u64 {
    1800
}

fn default_template() -> String {
    "vite-react".to_string()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            api_key: None,
            app_root: default_app_root(),
            health_check_interval_secs: default_health_check_interval(),
            max_restore_attempts: default_max_restore_attempts(),
            lease_secs: default_lease(),
            template: default_template(),
        }
    }
}

impl SandboxConfig {
    /// Returns the health-check interval, or `None` when disabled.
    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_interval_secs > 0)
            .then(|| Duration::from_secs(self.health_check_interval_secs))
    }
}

/// Durable storage settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base URL of the project storage API. `None` selects the in-process store.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Bearer token for the storage API.
    #[serde(default)]
    pub token: Option<String>,
}

/// Apply pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyConfig {
    /// Default source root prefixed onto bare file paths.
    #[serde(default = "default_source_root")]
    pub source_root: String,
    /// Per-command timeout in seconds.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Delay in milliseconds before the post-apply persistence sync.
    #[serde(default = "default_sync_delay")]
    pub sync_delay_ms: u64,
    /// Files the model must never regenerate.
    #[serde(default = "default_protected_files")]
    pub protected_files: Vec<String>,
    /// Stylesheets whose same-directory imports survive stripping.
    #[serde(default = "default_kept_stylesheets")]
    pub kept_stylesheets: Vec<String>,
}

fn default_source_root() -> String {
    "src".to_string()
}

fn default_command_timeout() -> u64 {
    60
}

fn default_sync_delay() -> u64 {
    3000
}

fn default_protected_files() -> Vec<String> {
    [
        "package.json",
        "package-lock.json",
        "yarn.lock",
        "pnpm-lock.yaml",
        "vite.config.js",
        "vite.config.ts",
        "tailwind.config.js",
        "postcss.config.js",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_kept_stylesheets() -> Vec<String> {
    vec!["index.css".to_string()]
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            source_root: default_source_root(),
            command_timeout_secs: default_command_timeout(),
            sync_delay_ms: default_sync_delay(),
            protected_files: default_protected_files(),
            kept_stylesheets: default_kept_stylesheets(),
        }
    }
}

impl ApplyConfig {
    /// Returns the per-command timeout as a Duration.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Returns the post-apply sync delay as a Duration.
    pub fn sync_delay(&self) -> Duration {
        Duration::from_millis(self.sync_delay_ms)
    }
}

/// Package resolver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackagesConfig {
    /// Packages the runtime already provides; never installed.
    #[serde(default = "default_runtime_provided")]
    pub runtime_provided: Vec<String>,
    /// Install timeout in seconds.
    #[serde(default = "default_install_timeout")]
    pub install_timeout_secs: u64,
    /// Restart the dev server after a successful install.
    #[serde(default = "default_true")]
    pub restart_after_install: bool,
}

fn default_runtime_provided() -> Vec<String> {
    vec!["react".to_string(), "react-dom".to_string()]
}

fn default_install_timeout() -> u64 {
    180
}

fn default_true() -> bool {
    true
}

impl Default for PackagesConfig {
    fn default() -> Self {
        Self {
            runtime_provided: default_runtime_provided(),
            install_timeout_secs: default_install_timeout(),
            restart_after_install: true,
        }
    }
}

impl PackagesConfig {
    /// Returns the install timeout as a Duration.
    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }
}

/// How a sandbox save is written to durable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveMode {
    /// Sandbox contents replace the stored file set.
    #[default]
    Replace,
    /// Sandbox contents are merged over the stored file set.
    Merge,
}

/// Project sync settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Debounce interval for auto-save in milliseconds.
    #[serde(default = "default_autosave_debounce")]
    pub autosave_debounce_ms: u64,
    /// How `save_from_sandbox` writes to storage.
    #[serde(default)]
    pub save_mode: SaveMode,
    /// Directory names skipped when listing sandbox files.
    #[serde(default = "default_ignored_dirs")]
    pub ignored_dirs: Vec<String>,
}

fn default_autosave_debounce() -> u64 {
    2000
}

fn default_ignored_dirs() -> Vec<String> {
    ["node_modules", ".git", "dist", ".vite"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            autosave_debounce_ms: default_autosave_debounce(),
            save_mode: SaveMode::default(),
            ignored_dirs: default_ignored_dirs(),
        }
    }
}

impl SyncConfig {
    /// Returns the auto-save debounce interval as a Duration.
    pub fn autosave_debounce(&self) -> Duration {
        Duration::from_millis(self.autosave_debounce_ms)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub apply: ApplyConfig,
    #[serde(default)]
    pub packages: PackagesConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    /// Verbose logging.
    #[serde(default)]
    pub debug: bool,
}

impl Config {
    /// Loads configuration from an optional TOML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("failed to read {}: {}", path.display(), e))
                })?;
                Self::from_toml(&content)?
            }
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Parses configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("invalid TOML: {}", e)))
    }

    /// Applies environment variable overrides.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("SANDBOX_API_URL") {
            self.sandbox.api_url = Some(url);
        }
        if let Some(key) = lookup("SANDBOX_API_KEY") {
            self.sandbox.api_key = Some(key);
        }
        if let Some(url) = lookup("PROJECT_STORE_URL") {
            self.storage.base_url = Some(url);
        }
        if let Some(token) = lookup("PROJECT_STORE_TOKEN") {
            self.storage.token = Some(token);
        }
        if let Some(debug) = lookup("SANDBOX_SYNC_DEBUG") {
            self.debug = debug == "1" || debug.to_lowercase() == "true";
        }
    }
}

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Adds an error to the result.
    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Adds a warning to the result.
    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

impl Validate for SandboxConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if !self.app_root.starts_with('/') {
            result.add_error(format!("app_root '{}' must be absolute", self.app_root));
        }
        if self.app_root.len() > 1 && self.app_root.ends_with('/') {
            result.add_warning("app_root has a trailing slash; it will be trimmed");
        }
        if let Some(url) = &self.api_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                result.add_error(format!("sandbox api_url '{}' is not an http(s) URL", url));
            }
            if self.api_key.is_none() {
                result.add_warning("sandbox api_url set without api_key");
            }
        }
        if self.health_check_interval_secs > 0 && self.health_check_interval_secs < 10 {
            result.add_warning("health_check_interval under 10 seconds will hammer the platform");
        }
        if self.max_restore_attempts == 0 {
            result.add_warning("max_restore_attempts is 0; expired sandboxes will not be restored");
        }

        result
    }
}

impl Validate for ApplyConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.source_root.trim_matches('/').is_empty() {
            result.add_error("source_root cannot be empty");
        }
        if self.command_timeout_secs == 0 {
            result.add_error("command_timeout must be greater than zero");
        }
        if self.sync_delay_ms > 60_000 {
            result.add_warning("sync_delay over a minute delays persistence noticeably");
        }

        result
    }
}

impl Validate for PackagesConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.install_timeout_secs == 0 {
            result.add_error("install_timeout must be greater than zero");
        }
        if self.runtime_provided.is_empty() {
            result.add_warning("runtime_provided is empty; the framework core may be reinstalled");
        }

        result
    }
}

impl Validate for SyncConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.autosave_debounce_ms < 100 {
            result.add_warning("autosave_debounce under 100ms barely batches edits");
        }
        if !self.ignored_dirs.iter().any(|d| d == "node_modules") {
            result.add_warning("node_modules is not ignored; saves will be very large");
        }

        result
    }
}

impl Validate for Config {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();
        result.merge(self.sandbox.validate());
        result.merge(self.apply.validate());
        result.merge(self.packages.validate());
        result.merge(self.sync.validate());

        if let Some(url) = &self.storage.base_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                result.add_error(format!("storage base_url '{}' is not an http(s) URL", url));
            }
        }

        result
    }
}
