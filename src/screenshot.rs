//! Screenshot service.
//!
//! Captures a full-page PNG of a published app through an external browser
//! service. Each capture opens a fresh session, optionally asks the model to
//! identify overlay elements worth hiding (cookie banners, chat bubbles),
//! takes the shot, and closes the session on every exit path.
//!
//! Selector identification is best-effort: any failure there degrades to an
//! unfiltered capture rather than failing the whole operation.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::completion::CompletionClient;
use crate::config::BrowserConfig;
use crate::errors::ScreenshotError;

#[derive(Clone)]
pub struct BrowserClient {
    http: reqwest::Client,
    base_url: String,
    nav_timeout_ms: u64,
    settle: std::time::Duration,
}

#[derive(Debug, Deserialize)]
struct OpenSessionResponse {
    session_id: String,
}

impl BrowserClient {
    pub fn new(config: &BrowserConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            nav_timeout_ms: config.nav_timeout_ms,
            settle: std::time::Duration::from_millis(config.settle_ms),
        }
    }

    /// Capture `url` and return the PNG as a `data:image/png;base64,` URL.
    ///
    /// The session is closed whether the capture succeeds or fails.
    pub async fn capture(
        &self,
        url: &str,
        completions: &CompletionClient,
    ) -> Result<String, ScreenshotError> {
        let session_id = self.open_session(url).await?;
        let result = self.capture_in_session(&session_id, completions).await;
        self.close_session(&session_id).await;
        result
    }

    async fn capture_in_session(
        &self,
        session_id: &str,
        completions: &CompletionClient,
    ) -> Result<String, ScreenshotError> {
        // Let late-loading content paint before we look at the page.
        tokio::time::sleep(self.settle).await;

        let hide_selectors = match self.page_content(session_id).await {
            Ok(html) => match completions.identify_overlay_selectors(&html).await {
                Ok(selectors) => selectors,
                Err(err) => {
                    warn!(error = %err, "overlay selector identification failed, capturing unfiltered");
                    vec![]
                }
            },
            Err(err) => {
                warn!(error = %err, "could not read page content, capturing unfiltered");
                vec![]
            }
        };
        debug!(session_id = %session_id, hidden = hide_selectors.len(), "taking screenshot");

        let png = self.take_screenshot(session_id, &hide_selectors).await?;
        Ok(format!("data:image/png;base64,{}", BASE64.encode(&png)))
    }

    async fn open_session(&self, url: &str) -> Result<String, ScreenshotError> {
        let resp = self
            .http
            .post(format!("{}/sessions", self.base_url))
            .json(&serde_json::json!({"url": url, "timeout_ms": self.nav_timeout_ms}))
            .send()
            .await
            .map_err(ScreenshotError::Request)?;
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ScreenshotError::Navigation {
                url: url.to_string(),
                message,
            });
        }
        let opened: OpenSessionResponse = resp.json().await.map_err(ScreenshotError::Request)?;
        Ok(opened.session_id)
    }

    async fn page_content(&self, session_id: &str) -> Result<String, ScreenshotError> {
        let resp = self
            .http
            .get(format!("{}/sessions/{}/content", self.base_url, session_id))
            .send()
            .await
            .map_err(ScreenshotError::Request)?;
        if !resp.status().is_success() {
            return Err(ScreenshotError::Capture(format!(
                "content fetch returned {}",
                resp.status()
            )));
        }
        resp.text().await.map_err(ScreenshotError::Request)
    }

    async fn take_screenshot(
        &self,
        session_id: &str,
        hide_selectors: &[String],
    ) -> Result<Vec<u8>, ScreenshotError> {
        let resp = self
            .http
            .post(format!("{}/sessions/{}/screenshot", self.base_url, session_id))
            .json(&serde_json::json!({
                "full_page": true,
                "hide_selectors": hide_selectors,
            }))
            .send()
            .await
            .map_err(ScreenshotError::Request)?;
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ScreenshotError::Capture(body));
        }
        let bytes = resp.bytes().await.map_err(ScreenshotError::Request)?;
        Ok(bytes.to_vec())
    }

    async fn close_session(&self, session_id: &str) {
        let outcome = self
            .http
            .delete(format!("{}/sessions/{}", self.base_url, session_id))
            .send()
            .await;
        if let Err(err) = outcome {
            warn!(session_id = %session_id, error = %err, "failed to close browser session");
        }
    }
}
