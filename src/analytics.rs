//! Product analytics capture.
//!
//! Fire-and-forget event delivery: `capture` spawns the send and returns
//! immediately, so analytics can never slow down or fail a request. When no
//! API key is configured the client is inert.

use serde_json::Value;
use tracing::debug;

use crate::config::AnalyticsConfig;

#[derive(Clone)]
pub struct AnalyticsClient {
    http: reqwest::Client,
    host: String,
    api_key: Option<String>,
}

impl AnalyticsClient {
    pub fn new(config: Option<&AnalyticsConfig>) -> Self {
        Self {
            http: reqwest::Client::new(),
            host: config
                .map(|c| c.host.trim_end_matches('/').to_string())
                .unwrap_or_default(),
            api_key: config.map(|c| c.api_key.clone()),
        }
    }

    /// Record `event` for `distinct_id`. Never blocks, never errors.
    pub fn capture(&self, distinct_id: &str, event: &str, properties: Value) {
        let Some(api_key) = self.api_key.clone() else {
            return;
        };
        let http = self.http.clone();
        let url = format!("{}/capture/", self.host);
        let body = serde_json::json!({
            "api_key": api_key,
            "event": event,
            "distinct_id": distinct_id,
            "properties": properties,
        });
        tokio::spawn(async move {
            if let Err(err) = http.post(url).json(&body).send().await {
                debug!(error = %err, "analytics capture dropped");
            }
        });
    }
}
