//! Sandbox platform trait and wire types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Parameters for provisioning a new sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionRequest {
    /// Platform template to boot (e.g. `vite-react`).
    pub template: String,
    /// Requested lease in seconds.
    pub lease_secs: u64,
    /// Project the sandbox is for, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

/// Identity and addressing of a live sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxInfo {
    pub id: String,
    pub preview_url: String,
    pub host: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub lease_end: Option<DateTime<Utc>>,
}

/// Health as reported by the sandbox platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    Active,
    NoSandbox,
    Expired,
    Unhealthy,
    Stopped,
}

/// Captured result of a command run inside a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl CommandOutput {
    /// Returns true if the command exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns stdout followed by stderr.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Remote compute-sandbox platform.
///
/// Every call addresses a sandbox by id; the provider keeps no notion of a
/// current sandbox.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Provisions a fresh sandbox.
    async fn provision(&self, request: &ProvisionRequest) -> Result<SandboxInfo>;

    /// Reattaches to an existing sandbox.
    async fn connect(&self, sandbox_id: &str) -> Result<SandboxInfo>;

    /// Reports platform-side health.
    async fn status(&self, sandbox_id: &str) -> Result<RemoteStatus>;

    /// Writes a file at an absolute path, creating parent directories.
    async fn write_file(&self, sandbox_id: &str, path: &str, content: &str) -> Result<()>;

    /// Reads a file at an absolute path.
    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<String>;

    /// Lists every regular file under `root`, as absolute paths.
    async fn list_files(&self, sandbox_id: &str, root: &str) -> Result<Vec<String>>;

    /// Runs `argv` in `cwd` and captures its output.
    async fn run_command(&self, sandbox_id: &str, argv: &[String], cwd: &str)
        -> Result<CommandOutput>;

    /// Stops and relaunches the dev server.
    async fn restart_dev_server(&self, sandbox_id: &str) -> Result<()>;

    /// Terminates the sandbox.
    async fn kill(&self, sandbox_id: &str) -> Result<()>;

    /// Returns the name of this provider.
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_status_uses_platform_names() {
        let status: RemoteStatus = serde_json::from_str("\"no_sandbox\"").unwrap();
        assert_eq!(status, RemoteStatus::NoSandbox);
        assert_eq!(
            serde_json::to_string(&RemoteStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test]
    fn combined_output_joins_streams() {
        let out = CommandOutput {
            exit_code: 1,
            stdout: "added 1 package".to_string(),
            stderr: "warn deprecated".to_string(),
        };
        assert!(!out.success());
        assert_eq!(out.combined(), "added 1 package\nwarn deprecated");

        let only_err = CommandOutput {
            exit_code: 2,
            stdout: String::new(),
            stderr: "boom".to_string(),
        };
        assert_eq!(only_err.combined(), "boom");
    }

    #[test]
    fn sandbox_info_round_trips_camel_case() {
        let json = r#"{"id":"sb-1","previewUrl":"https://5173-sb-1.example.dev","host":"5173-sb-1.example.dev","createdAt":"2026-01-01T00:00:00Z"}"#;
        let info: SandboxInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.id, "sb-1");
        assert!(info.lease_end.is_none());
    }
}
