//! In-process sandbox platform for local development and tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use tokio::sync::Mutex;

use super::provider::{CommandOutput, ProvisionRequest, RemoteStatus, SandboxInfo, SandboxProvider};
use crate::error::{Error, Result};
use crate::packages::detect::strip_version;

static QUOTED_ARG_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"'([^']*)'").unwrap());

const TEMPLATE_MANIFEST: &str = r#"{
  "name": "app",
  "private": true,
  "dependencies": {
    "react": "^18.2.0",
    "react-dom": "^18.2.0"
  },
  "devDependencies": {
    "vite": "^5.0.0",
    "@vitejs/plugin-react": "^4.2.0"
  }
}
"#;

const TEMPLATE_APP: &str =
    "export default function App() {\n  return <h1>Hello</h1>;\n}\n";

const TEMPLATE_MAIN: &str = "import React from 'react';\nimport ReactDOM from 'react-dom/client';\nimport App from './App.jsx';\nimport './index.css';\n\nReactDOM.createRoot(document.getElementById('root')).render(<App />);\n";

#[derive(Debug)]
struct MemorySandbox {
    info: SandboxInfo,
    status: RemoteStatus,
    files: BTreeMap<String, String>,
    dev_server_restarts: u32,
}

#[derive(Debug, Default)]
struct Faults {
    provision_failures: u32,
    install_fails: bool,
    write_failures: HashSet<String>,
    command_outputs: HashMap<String, CommandOutput>,
    command_delays: HashMap<String, Duration>,
}

#[derive(Debug, Default)]
struct State {
    sandboxes: HashMap<String, MemorySandbox>,
    faults: Faults,
    commands: Vec<Vec<String>>,
    provisions: u32,
}

/// A sandbox platform that keeps every sandbox's filesystem in memory.
///
/// `npm install` scripts are simulated by editing `package.json`. Failures
/// can be injected for provisioning, individual writes, installs, and
/// arbitrary programs.
#[derive(Debug)]
pub struct MemorySandboxProvider {
    app_root: String,
    state: Mutex<State>,
}

impl Default for MemorySandboxProvider {
    fn default() -> Self {
        Self::new("/home/user/app")
    }
}

impl MemorySandboxProvider {
    /// Creates a provider whose sandboxes boot a template under `app_root`.
    pub fn new(app_root: impl Into<String>) -> Self {
        Self {
            app_root: app_root.into().trim_end_matches('/').to_string(),
            state: Mutex::new(State::default()),
        }
    }

    /// Makes the next `count` provision calls fail.
    pub async fn fail_next_provisions(&self, count: u32) {
        self.state.lock().await.faults.provision_failures = count;
    }

    /// Makes simulated package installs fail.
    pub async fn fail_installs(&self, fail: bool) {
        self.state.lock().await.faults.install_fails = fail;
    }

    /// Makes writes to the given absolute path fail.
    pub async fn fail_writes_to(&self, path: impl Into<String>) {
        self.state.lock().await.faults.write_failures.insert(path.into());
    }

    /// Returns `output` whenever `program` runs.
    pub async fn set_command_output(&self, program: impl Into<String>, output: CommandOutput) {
        self.state
            .lock()
            .await
            .faults
            .command_outputs
            .insert(program.into(), output);
    }

    /// Makes `program` take `delay` before returning.
    pub async fn set_command_delay(&self, program: impl Into<String>, delay: Duration) {
        self.state
            .lock()
            .await
            .faults
            .command_delays
            .insert(program.into(), delay);
    }

    /// Overrides the health the platform reports for a sandbox.
    pub async fn set_remote_status(&self, sandbox_id: &str, status: RemoteStatus) {
        if let Some(sandbox) = self.state.lock().await.sandboxes.get_mut(sandbox_id) {
            sandbox.status = status;
        }
    }

    /// Simulates lease expiry: the sandbox is gone and cannot be reattached.
    pub async fn expire(&self, sandbox_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(sandbox) = state.sandboxes.get_mut(sandbox_id) {
            sandbox.status = RemoteStatus::Expired;
            sandbox.files.clear();
        }
    }

    /// Returns every argv passed to `run_command`, in order.
    pub async fn command_log(&self) -> Vec<Vec<String>> {
        self.state.lock().await.commands.clone()
    }

    /// Returns how many sandboxes were provisioned.
    pub async fn provision_count(&self) -> u32 {
        self.state.lock().await.provisions
    }

    /// Returns how many times the dev server of a sandbox was restarted.
    pub async fn dev_server_restarts(&self, sandbox_id: &str) -> u32 {
        self.state
            .lock()
            .await
            .sandboxes
            .get(sandbox_id)
            .map(|s| s.dev_server_restarts)
            .unwrap_or(0)
    }

    /// Returns a copy of a sandbox's filesystem.
    pub async fn files(&self, sandbox_id: &str) -> BTreeMap<String, String> {
        self.state
            .lock()
            .await
            .sandboxes
            .get(sandbox_id)
            .map(|s| s.files.clone())
            .unwrap_or_default()
    }

    fn template_files(&self) -> BTreeMap<String, String> {
        [
            ("package.json", TEMPLATE_MANIFEST),
            ("index.html", "<div id=\"root\"></div>\n"),
            ("src/main.jsx", TEMPLATE_MAIN),
            ("src/App.jsx", TEMPLATE_APP),
            ("src/index.css", "@tailwind base;\n"),
            ("node_modules/react/index.js", "module.exports = {};\n"),
        ]
        .into_iter()
        .map(|(path, content)| (format!("{}/{}", self.app_root, path), content.to_string()))
        .collect()
    }

    /// Simulates `sh -c "cd <dir> && npm install ... ; echo __install_exit=$?"`.
    fn simulate_install(sandbox: &mut MemorySandbox, script: &str, fails: bool) -> CommandOutput {
        if fails {
            return CommandOutput {
                exit_code: 0,
                stdout: "npm ERR! code E404\n__install_exit=1\n".to_string(),
                stderr: String::new(),
            };
        }

        let dir = script
            .strip_prefix("cd ")
            .and_then(|rest| rest.split("&&").next())
            .map(|d| d.trim().trim_matches('\'').to_string())
            .unwrap_or_default();
        let manifest_path = format!("{}/package.json", dir);

        let names: Vec<String> = QUOTED_ARG_REGEX
            .captures_iter(script)
            .map(|cap| cap[1].to_string())
            .filter(|n| !n.is_empty() && !n.starts_with('/'))
            .collect();

        let mut manifest: serde_json::Value = sandbox
            .files
            .get(&manifest_path)
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_else(|| serde_json::json!({}));

        if !manifest["dependencies"].is_object() {
            manifest["dependencies"] = serde_json::json!({});
        }
        for name in &names {
            let base = strip_version(name);
            let version = if name.len() > base.len() {
                name[base.len() + 1..].to_string()
            } else {
                "^1.0.0".to_string()
            };
            manifest["dependencies"][base] = serde_json::Value::String(version);
        }

        let rendered = serde_json::to_string_pretty(&manifest).unwrap_or_default();
        sandbox.files.insert(manifest_path, rendered);

        CommandOutput {
            exit_code: 0,
            stdout: format!("added {} packages\n__install_exit=0\n", names.len()),
            stderr: String::new(),
        }
    }

    fn missing(sandbox_id: &str) -> Error {
        Error::Remote(format!("sandbox {} not found", sandbox_id))
    }
}

fn live<'a>(state: &'a mut State, sandbox_id: &str) -> Result<&'a mut MemorySandbox> {
    match state.sandboxes.get_mut(sandbox_id) {
        Some(sandbox)
            if !matches!(sandbox.status, RemoteStatus::Expired | RemoteStatus::NoSandbox) =>
        {
            Ok(sandbox)
        }
        _ => Err(MemorySandboxProvider::missing(sandbox_id)),
    }
}

#[async_trait]
impl SandboxProvider for MemorySandboxProvider {
    async fn provision(&self, request: &ProvisionRequest) -> Result<SandboxInfo> {
        let mut state = self.state.lock().await;
        if state.faults.provision_failures > 0 {
            state.faults.provision_failures -= 1;
            return Err(Error::Remote("provisioning capacity exhausted".to_string()));
        }

        let short = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("sb-{}", &short[..8]);
        let host = format!("5173-{}.sandbox.local", id);
        let now = Utc::now();
        let info = SandboxInfo {
            id: id.clone(),
            preview_url: format!("https://{}", host),
            host,
            created_at: now,
            lease_end: Some(now + chrono::Duration::seconds(request.lease_secs as i64)),
        };

        state.provisions += 1;
        state.sandboxes.insert(
            id,
            MemorySandbox {
                info: info.clone(),
                status: RemoteStatus::Active,
                files: self.template_files(),
                dev_server_restarts: 0,
            },
        );
        Ok(info)
    }

    async fn connect(&self, sandbox_id: &str) -> Result<SandboxInfo> {
        let mut state = self.state.lock().await;
        live(&mut state, sandbox_id).map(|s| s.info.clone())
    }

    async fn status(&self, sandbox_id: &str) -> Result<RemoteStatus> {
        let state = self.state.lock().await;
        Ok(state
            .sandboxes
            .get(sandbox_id)
            .map(|s| s.status)
            .unwrap_or(RemoteStatus::NoSandbox))
    }

    async fn write_file(&self, sandbox_id: &str, path: &str, content: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.faults.write_failures.contains(path) {
            return Err(Error::Remote(format!("permission denied: {}", path)));
        }
        live(&mut state, sandbox_id)?
            .files
            .insert(path.to_string(), content.to_string());
        Ok(())
    }

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<String> {
        let mut state = self.state.lock().await;
        live(&mut state, sandbox_id)?
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| Error::Remote(format!("no such file: {}", path)))
    }

    async fn list_files(&self, sandbox_id: &str, root: &str) -> Result<Vec<String>> {
        let prefix = format!("{}/", root.trim_end_matches('/'));
        let mut state = self.state.lock().await;
        Ok(live(&mut state, sandbox_id)?
            .files
            .keys()
            .filter(|p| p.starts_with(&prefix))
            .cloned()
            .collect())
    }

    async fn run_command(
        &self,
        sandbox_id: &str,
        argv: &[String],
        _cwd: &str,
    ) -> Result<CommandOutput> {
        let program = argv.first().cloned().unwrap_or_default();
        let delay = {
            let mut state = self.state.lock().await;
            live(&mut state, sandbox_id)?;
            state.commands.push(argv.to_vec());
            state.faults.command_delays.get(&program).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        if let Some(output) = state.faults.command_outputs.get(&program) {
            return Ok(output.clone());
        }

        let script = match argv {
            [sh, flag, script] if sh == "sh" && flag == "-c" && script.contains("npm install") => {
                Some(script.clone())
            }
            _ => None,
        };
        let fails = state.faults.install_fails;
        let sandbox = live(&mut state, sandbox_id)?;
        Ok(match script {
            Some(script) => Self::simulate_install(sandbox, &script, fails),
            None => CommandOutput {
                exit_code: 0,
                stdout: format!("ran {}", argv.join(" ")),
                stderr: String::new(),
            },
        })
    }

    async fn restart_dev_server(&self, sandbox_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        live(&mut state, sandbox_id)?.dev_server_restarts += 1;
        Ok(())
    }

    async fn kill(&self, sandbox_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.sandboxes.get_mut(sandbox_id) {
            Some(sandbox) => {
                sandbox.status = RemoteStatus::NoSandbox;
                sandbox.files.clear();
                Ok(())
            }
            None => Err(Self::missing(sandbox_id)),
        }
    }

    fn name(&self) -> &str {
        "memory"
    }
}
