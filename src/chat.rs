//! Messaging channel provisioning.
//!
//! When a task gains a distinct assignee, a private channel is created on the
//! external chat service so the owner and assignee can discuss it. Channel
//! ids are derived from the task id, so re-provisioning the same task is a
//! no-op on the provider side.

use serde::Deserialize;
use tracing::info;

use crate::config::ChatConfig;

#[derive(Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct ChannelResponse {
    channel_id: String,
}

impl ChatClient {
    pub fn new(config: &ChatConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        }
    }

    /// Create (or re-affirm) the channel for a task and its two participants.
    pub async fn create_channel(
        &self,
        task_id: i64,
        members: &[&str],
    ) -> anyhow::Result<String> {
        let channel_id = format!("task-{}", task_id);
        let resp = self
            .http
            .post(format!("{}/channels", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "id": channel_id,
                "type": "messaging",
                "members": members,
            }))
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("chat provider returned {}: {}", status, body);
        }
        let channel: ChannelResponse = resp.json().await?;
        info!(channel_id = %channel.channel_id, task_id, "chat channel created");
        Ok(channel.channel_id)
    }
}
