//! Durable project storage.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::{SaveMode, StorageConfig};
use crate::error::{Error, Result};
use crate::remote::{endpoint, parse_base_url};

/// Where a project was last previewed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxRef {
    pub id: String,
    pub preview_url: Option<String>,
}

/// A durable project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    /// App-relative path to content.
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    /// Manifest dependencies, name to version.
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    /// Bumped by the store on every successful write; 0 means never saved.
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub last_saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sandbox_info: Option<SandboxRef>,
}

impl Project {
    /// Creates an empty, never-saved project.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            files: BTreeMap::new(),
            dependencies: BTreeMap::new(),
            version: 0,
            last_saved_at: None,
            sandbox_info: None,
        }
    }

    /// Returns true if there is nothing to sync into a sandbox.
    pub fn is_new(&self) -> bool {
        self.version == 0 || self.files.is_empty()
    }
}

/// Files as of one stored version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectVersion {
    pub version: u64,
    pub files: BTreeMap<String, String>,
    pub saved_at: DateTime<Utc>,
}

/// One durable write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectUpdate {
    pub files: BTreeMap<String, String>,
    /// Replaces the stored dependencies when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<BTreeMap<String, String>>,
    pub mode: SaveMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_info: Option<SandboxRef>,
}

impl ProjectUpdate {
    /// An update whose files replace the stored file set.
    pub fn replace(files: BTreeMap<String, String>) -> Self {
        Self {
            files,
            mode: SaveMode::Replace,
            ..Self::default()
        }
    }

    /// An update whose files are merged over the stored file set.
    pub fn merge(files: BTreeMap<String, String>) -> Self {
        Self {
            files,
            mode: SaveMode::Merge,
            ..Self::default()
        }
    }

    /// Also replaces the stored dependencies.
    pub fn with_dependencies(mut self, dependencies: BTreeMap<String, String>) -> Self {
        self.dependencies = Some(dependencies);
        self
    }

    /// Records the sandbox the files came from.
    pub fn with_sandbox(mut self, sandbox: SandboxRef) -> Self {
        self.sandbox_info = Some(sandbox);
        self
    }
}

/// Durable project storage with per-write versioning.
///
/// Every successful write returns the stored project with a `version`
/// strictly greater than before.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Loads a project, or `None` if it does not exist.
    async fn load(&self, project_id: &str) -> Result<Option<Project>>;

    /// Writes an update, creating the project if needed.
    async fn save(&self, project_id: &str, update: ProjectUpdate) -> Result<Project>;

    /// Merges individual files into the stored set.
    async fn patch_files(
        &self,
        project_id: &str,
        files: BTreeMap<String, String>,
    ) -> Result<Project> {
        self.save(project_id, ProjectUpdate::merge(files)).await
    }

    /// Replaces the stored dependencies, leaving files alone.
    async fn update_dependencies(
        &self,
        project_id: &str,
        dependencies: BTreeMap<String, String>,
    ) -> Result<Project> {
        self.save(
            project_id,
            ProjectUpdate::merge(BTreeMap::new()).with_dependencies(dependencies),
        )
        .await
    }

    /// Returns the files as of `version`.
    async fn version_snapshot(&self, project_id: &str, version: u64) -> Result<ProjectVersion>;

    /// Returns the name of this store.
    fn name(&self) -> &str;
}

#[derive(Debug, Default)]
struct StoredProject {
    project: Option<Project>,
    versions: Vec<ProjectVersion>,
}

/// In-process [`ProjectStore`] that keeps every version.
#[derive(Debug, Default)]
pub struct MemoryProjectStore {
    projects: RwLock<HashMap<String, StoredProject>>,
}

impl MemoryProjectStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a project as-is, without bumping its version.
    pub async fn insert(&self, project: Project) {
        let mut projects = self.projects.write().await;
        let entry = projects.entry(project.id.clone()).or_default();
        entry.project = Some(project);
    }
}

#[async_trait]
impl ProjectStore for MemoryProjectStore {
    async fn load(&self, project_id: &str) -> Result<Option<Project>> {
        Ok(self
            .projects
            .read()
            .await
            .get(project_id)
            .and_then(|p| p.project.clone()))
    }

    async fn save(&self, project_id: &str, update: ProjectUpdate) -> Result<Project> {
        let mut projects = self.projects.write().await;
        let stored = projects.entry(project_id.to_string()).or_default();
        let mut project = stored
            .project
            .clone()
            .unwrap_or_else(|| Project::new(project_id));

        match update.mode {
            SaveMode::Replace => project.files = update.files,
            SaveMode::Merge => project.files.extend(update.files),
        }
        if let Some(dependencies) = update.dependencies {
            project.dependencies = dependencies;
        }
        if update.sandbox_info.is_some() {
            project.sandbox_info = update.sandbox_info;
        }

        let now = Utc::now();
        project.version += 1;
        project.last_saved_at = Some(match project.last_saved_at {
            Some(previous) if previous > now => previous,
            _ => now,
        });

        stored.versions.push(ProjectVersion {
            version: project.version,
            files: project.files.clone(),
            saved_at: now,
        });
        stored.project = Some(project.clone());
        Ok(project)
    }

    async fn version_snapshot(&self, project_id: &str, version: u64) -> Result<ProjectVersion> {
        let projects = self.projects.read().await;
        let stored = projects
            .get(project_id)
            .filter(|p| p.project.is_some())
            .ok_or_else(|| Error::ProjectNotFound(project_id.to_string()))?;
        stored
            .versions
            .iter()
            .find(|v| v.version == version)
            .cloned()
            .ok_or_else(|| Error::VersionNotFound {
                project_id: project_id.to_string(),
                version,
            })
    }

    fn name(&self) -> &str {
        "memory"
    }
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// [`ProjectStore`] backed by the storage service's REST API.
#[derive(Debug, Clone)]
pub struct HttpProjectStore {
    http: Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpProjectStore {
    /// Creates a client for the storage service at `base_url`.
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: parse_base_url(base_url)?,
            token,
        })
    }

    /// Creates a client from the `[storage]` config section.
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| Error::Config("storage.base_url is not set".to_string()))?;
        Self::new(&base_url, config.token.clone())
    }

    fn project_url(&self, project_id: &str, rest: &[&str]) -> Result<Url> {
        let mut segments = vec!["projects", project_id];
        segments.extend_from_slice(rest);
        endpoint(&self.base_url, &segments)
    }

    async fn execute(&self, request: RequestBuilder) -> Result<reqwest::Response> {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        Ok(request.send().await?)
    }

    async fn into_success(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, "project storage request failed");
            return Err(Error::Storage(format!(
                "{}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }
        Ok(response)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = Self::into_success(self.execute(request).await?).await?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl ProjectStore for HttpProjectStore {
    async fn load(&self, project_id: &str) -> Result<Option<Project>> {
        let response = self
            .execute(self.http.get(self.project_url(project_id, &[])?))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::into_success(response).await?.json().await?))
    }

    async fn save(&self, project_id: &str, update: ProjectUpdate) -> Result<Project> {
        self.send(
            self.http
                .put(self.project_url(project_id, &[])?)
                .json(&update),
        )
        .await
    }

    async fn patch_files(
        &self,
        project_id: &str,
        files: BTreeMap<String, String>,
    ) -> Result<Project> {
        self.send(
            self.http
                .patch(self.project_url(project_id, &["files"])?)
                .json(&files),
        )
        .await
    }

    async fn update_dependencies(
        &self,
        project_id: &str,
        dependencies: BTreeMap<String, String>,
    ) -> Result<Project> {
        self.send(
            self.http
                .put(self.project_url(project_id, &["dependencies"])?)
                .json(&dependencies),
        )
        .await
    }

    async fn version_snapshot(&self, project_id: &str, version: u64) -> Result<ProjectVersion> {
        let version_segment = version.to_string();
        let url = self.project_url(project_id, &["versions", &version_segment])?;
        let response = self.execute(self.http.get(url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::VersionNotFound {
                project_id: project_id.to_string(),
                version,
            });
        }
        Ok(Self::into_success(response).await?.json().await?)
    }

    fn name(&self) -> &str {
        "http"
    }
}
