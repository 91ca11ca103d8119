//! Sandbox platform client over its REST API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::provider::{CommandOutput, ProvisionRequest, RemoteStatus, SandboxInfo, SandboxProvider};
use crate::config::SandboxConfig;
use crate::error::{Error, Result};
use crate::remote::{endpoint, parse_base_url};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: RemoteStatus,
}

#[derive(Debug, Serialize)]
struct WriteBody<'a> {
    path: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ReadBody {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ListBody {
    files: Vec<String>,
}

#[derive(Debug, Serialize)]
struct CommandBody<'a> {
    argv: &'a [String],
    cwd: &'a str,
}

/// [`SandboxProvider`] backed by the remote platform's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpSandboxProvider {
    http: Client,
    base_url: Url,
    api_key: Option<String>,
}

impl HttpSandboxProvider {
    /// Creates a client for the platform at `base_url`.
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: parse_base_url(base_url)?,
            api_key,
        })
    }

    /// Creates a client from the `[sandbox]` config section.
    pub fn from_config(config: &SandboxConfig) -> Result<Self> {
        let base_url = config
            .api_url
            .clone()
            .ok_or_else(|| Error::Config("sandbox.api_url is not set".to_string()))?;
        Self::new(&base_url, config.api_key.clone())
    }

    fn sandbox_url(&self, sandbox_id: &str, rest: &[&str]) -> Result<Url> {
        let mut segments = vec!["sandboxes", sandbox_id];
        segments.extend_from_slice(rest);
        endpoint(&self.base_url, &segments)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send_raw(&self, request: RequestBuilder) -> Result<reqwest::Response> {
        let response = self.authorized(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, "sandbox platform request failed");
            return Err(Error::Remote(format!(
                "{}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }
        Ok(response)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        Ok(self.send_raw(request).await?.json().await?)
    }
}

#[async_trait]
impl SandboxProvider for HttpSandboxProvider {
    async fn provision(&self, request: &ProvisionRequest) -> Result<SandboxInfo> {
        self.send(
            self.http
                .post(endpoint(&self.base_url, &["sandboxes"])?)
                .json(request),
        )
        .await
    }

    async fn connect(&self, sandbox_id: &str) -> Result<SandboxInfo> {
        self.send(self.http.get(self.sandbox_url(sandbox_id, &[])?))
            .await
    }

    async fn status(&self, sandbox_id: &str) -> Result<RemoteStatus> {
        let body: StatusBody = self
            .send(self.http.get(self.sandbox_url(sandbox_id, &["status"])?))
            .await?;
        Ok(body.status)
    }

    async fn write_file(&self, sandbox_id: &str, path: &str, content: &str) -> Result<()> {
        self.send_raw(
            self.http
                .put(self.sandbox_url(sandbox_id, &["files"])?)
                .json(&WriteBody { path, content }),
        )
        .await?;
        Ok(())
    }

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<String> {
        let body: ReadBody = self
            .send(
                self.http
                    .get(self.sandbox_url(sandbox_id, &["files"])?)
                    .query(&[("path", path)]),
            )
            .await?;
        Ok(body.content)
    }

    async fn list_files(&self, sandbox_id: &str, root: &str) -> Result<Vec<String>> {
        let body: ListBody = self
            .send(
                self.http
                    .get(self.sandbox_url(sandbox_id, &["files", "list"])?)
                    .query(&[("root", root)]),
            )
            .await?;
        Ok(body.files)
    }

    async fn run_command(
        &self,
        sandbox_id: &str,
        argv: &[String],
        cwd: &str,
    ) -> Result<CommandOutput> {
        self.send(
            self.http
                .post(self.sandbox_url(sandbox_id, &["commands"])?)
                .json(&CommandBody { argv, cwd }),
        )
        .await
    }

    async fn restart_dev_server(&self, sandbox_id: &str) -> Result<()> {
        self.send_raw(self.http.post(self.sandbox_url(sandbox_id, &["restart"])?))
            .await?;
        Ok(())
    }

    async fn kill(&self, sandbox_id: &str) -> Result<()> {
        self.send_raw(self.http.delete(self.sandbox_url(sandbox_id, &[])?))
            .await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_urls_keep_ids_in_one_segment() {
        let provider = HttpSandboxProvider::new("https://sandbox.example.dev/v1/", None).unwrap();
        assert_eq!(
            provider.sandbox_url("sb-1", &["files", "list"]).unwrap().as_str(),
            "https://sandbox.example.dev/v1/sandboxes/sb-1/files/list"
        );
        assert_eq!(
            provider.sandbox_url("x/../../admin", &[]).unwrap().as_str(),
            "https://sandbox.example.dev/v1/sandboxes/x%2F..%2F..%2Fadmin"
        );
        assert!(matches!(
            provider.sandbox_url("..", &[]),
            Err(Error::InvalidId(_))
        ));
    }

    #[tokio::test]
    async fn kill_with_dot_id_never_sends() {
        // Nothing listens on this port; an attempted request would be an Http error.
        let provider = HttpSandboxProvider::new("http://127.0.0.1:9/", None).unwrap();
        let err = provider.kill("..").await.unwrap_err();
        assert!(matches!(err, Error::InvalidId(_)));
    }

    #[test]
    fn from_config_requires_api_url() {
        let config = SandboxConfig::default();
        let err = HttpSandboxProvider::from_config(&config).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let config = SandboxConfig {
            api_url: Some("http://localhost:9000".to_string()),
            ..SandboxConfig::default()
        };
        assert!(HttpSandboxProvider::from_config(&config).is_ok());
    }
}
