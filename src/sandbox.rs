//! Sandbox provisioner.
//!
//! Drives an external provisioning API: create one time-boxed environment
//! from the fragment's template image, wait for its server to settle,
//! optionally install dependencies, write the generated files, then either
//! execute the code in-process (interpreter templates) or hand back the
//! environment's routable URL (web-app templates).
//!
//! Every invocation provisions a brand-new environment; there is no pooling
//! or reuse, and the TTL is enforced by the provisioning service itself —
//! we set it at creation and never poll or cancel.

use std::time::Duration;

use futures::future::join_all;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::SandboxConfig;
use crate::errors::SandboxError;
use crate::server::models::{ExecutionResult, Fragment};

#[derive(Clone)]
pub struct SandboxClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    domain: String,
    timeout_secs: u64,
    settle: Duration,
}

#[derive(Debug, Deserialize)]
struct CreateSandboxResponse {
    #[serde(rename = "sandboxId")]
    sandbox_id: String,
}

#[derive(Debug, Deserialize)]
struct RunCommandResponse {
    #[serde(default)]
    exit_code: i32,
    #[serde(default)]
    stderr: String,
}

#[derive(Debug, Default, Deserialize)]
struct RunCodeResponse {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    results: Vec<serde_json::Value>,
}

impl SandboxClient {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            domain: config.domain.clone(),
            timeout_secs: config.timeout_secs,
            settle: Duration::from_millis(config.settle_ms),
        }
    }

    /// Provision an environment and run the fragment through it. A caller
    /// supplied key replaces the service key for every provisioning call.
    pub async fn execute(
        &self,
        fragment: &Fragment,
        user_id: &str,
        api_key: Option<&str>,
    ) -> Result<ExecutionResult, SandboxError> {
        let key = api_key.unwrap_or(&self.api_key);
        let sbx_id = self.provision(fragment, user_id, key).await?;
        info!(sbx_id = %sbx_id, template = %fragment.template, "sandbox provisioned");

        // The environment's own server needs a moment before it accepts
        // installs and file writes.
        tokio::time::sleep(self.settle).await;

        if fragment.has_additional_dependencies
            && !fragment.install_dependencies_command.is_empty()
        {
            self.install_dependencies(&sbx_id, &fragment.install_dependencies_command, key)
                .await?;
        }

        self.write_files(&sbx_id, fragment, key).await?;

        if fragment.template.is_interpreter() {
            let files = fragment.code.files();
            let code = files
                .first()
                .map(|(_, content)| content.clone())
                .unwrap_or_default();
            let run = self.run_code(&sbx_id, &code, key).await?;
            Ok(ExecutionResult::Interpreter {
                sbx_id,
                template: fragment.template,
                stdout: run.stdout,
                stderr: run.stderr,
                runtime_error: run.error,
                cell_results: run.results,
            })
        } else {
            let port = fragment
                .port
                .or_else(|| fragment.template.port())
                .unwrap_or(3000);
            let url = format!("https://{}-{}.{}", port, sbx_id, self.domain);
            Ok(ExecutionResult::WebApp {
                sbx_id,
                template: fragment.template,
                url,
                port,
            })
        }
    }

    async fn provision(
        &self,
        fragment: &Fragment,
        user_id: &str,
        key: &str,
    ) -> Result<String, SandboxError> {
        let body = serde_json::json!({
            "templateID": fragment.template.as_str(),
            "timeout": self.timeout_secs,
            "metadata": {"userID": user_id},
        });
        let resp = self
            .http
            .post(format!("{}/sandboxes", self.base_url))
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .map_err(SandboxError::Request)?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SandboxError::Provision(format!("{}: {}", status, body)));
        }
        let created: CreateSandboxResponse = resp.json().await.map_err(SandboxError::Request)?;
        Ok(created.sandbox_id)
    }

    async fn install_dependencies(
        &self,
        sbx_id: &str,
        command: &str,
        key: &str,
    ) -> Result<(), SandboxError> {
        debug!(sbx_id = %sbx_id, command = %command, "installing dependencies");
        let resp = self
            .http
            .post(format!("{}/sandboxes/{}/commands", self.base_url, sbx_id))
            .bearer_auth(key)
            .json(&serde_json::json!({"command": command}))
            .send()
            .await
            .map_err(SandboxError::Request)?;
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SandboxError::Install {
                command: command.to_string(),
                stderr: body,
            });
        }
        let run: RunCommandResponse = resp.json().await.map_err(SandboxError::Request)?;
        if run.exit_code != 0 {
            return Err(SandboxError::Install {
                command: command.to_string(),
                stderr: run.stderr,
            });
        }
        Ok(())
    }

    /// Fan out one write per generated file, then fan in: every outcome is
    /// collected, and any failure aborts with the full list of failed paths
    /// rather than silently succeeding for unrelated files.
    async fn write_files(
        &self,
        sbx_id: &str,
        fragment: &Fragment,
        key: &str,
    ) -> Result<(), SandboxError> {
        let files = fragment.code.files();
        let writes = files.iter().map(|(path, content)| {
            let path = path.clone();
            async move {
                self.write_file(sbx_id, &path, content, key)
                    .await
                    .map_err(|_| path)
            }
        });
        let failed: Vec<String> = join_all(writes)
            .await
            .into_iter()
            .filter_map(|outcome| outcome.err())
            .collect();
        if failed.is_empty() {
            Ok(())
        } else {
            Err(SandboxError::FileWrites { failed })
        }
    }

    async fn write_file(
        &self,
        sbx_id: &str,
        path: &str,
        content: &str,
        key: &str,
    ) -> Result<(), SandboxError> {
        let resp = self
            .http
            .post(format!("{}/sandboxes/{}/files", self.base_url, sbx_id))
            .bearer_auth(key)
            .json(&serde_json::json!({"path": path, "content": content}))
            .send()
            .await
            .map_err(SandboxError::Request)?;
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SandboxError::Execute(format!(
                "write {} failed: {}",
                path, body
            )));
        }
        Ok(())
    }

    async fn run_code(
        &self,
        sbx_id: &str,
        code: &str,
        key: &str,
    ) -> Result<RunCodeResponse, SandboxError> {
        let resp = self
            .http
            .post(format!("{}/sandboxes/{}/code", self.base_url, sbx_id))
            .bearer_auth(key)
            .json(&serde_json::json!({"code": code}))
            .send()
            .await
            .map_err(SandboxError::Request)?;
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SandboxError::Execute(body));
        }
        resp.json().await.map_err(SandboxError::Request)
    }
}
