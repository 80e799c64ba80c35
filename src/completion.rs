//! Completion stream consumer.
//!
//! Sends conversation history to an OpenAI-compatible chat-completions
//! endpoint requesting a schema-constrained fragment object, and forwards
//! progress as typed events: `Delta` for each partial text chunk, then a
//! terminal `Done` (fragment parsed) or `Error`. No automatic retry — a
//! failed stream is surfaced and the caller resubmits the full history.

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::CompletionConfig;
use crate::errors::CompletionError;
use crate::prompt::ChatMessage;
use crate::server::models::Fragment;

/// Cap on how much serialized DOM is sent to the selector-identification call.
const MAX_SELECTOR_HTML_BYTES: usize = 100_000;

/// Events emitted over the completion stream. One logical response,
/// progressively filled; the terminal event distinguishes success from
/// model/validation error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum CompletionEvent {
    Delta { text: String },
    Done { fragment: Fragment },
    Error { message: String },
}

#[derive(Clone)]
pub struct CompletionClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl CompletionClient {
    pub fn new(config: &CompletionConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        }
    }

    /// Stream a fragment generation. A caller-supplied API key replaces the
    /// configured one for this request only (bring-your-own-key).
    pub fn stream_fragment(
        &self,
        messages: Vec<ChatMessage>,
        api_key_override: Option<String>,
        model_override: Option<String>,
    ) -> mpsc::Receiver<CompletionEvent> {
        let (tx, rx) = mpsc::channel(64);
        let client = self.clone();
        tokio::spawn(async move {
            if let Err(e) = client
                .run_stream(messages, api_key_override, model_override, &tx)
                .await
            {
                warn!(error = %e, "completion stream failed");
                let _ = tx
                    .send(CompletionEvent::Error {
                        message: "failed to generate fragment".to_string(),
                    })
                    .await;
            }
        });
        rx
    }

    async fn run_stream(
        &self,
        messages: Vec<ChatMessage>,
        api_key_override: Option<String>,
        model_override: Option<String>,
        tx: &mpsc::Sender<CompletionEvent>,
    ) -> Result<(), CompletionError> {
        let api_key = api_key_override.as_deref().unwrap_or(&self.api_key);
        let model = model_override.as_deref().unwrap_or(&self.model);

        let body = serde_json::json!({
            "model": model,
            "messages": messages,
            "stream": true,
            "response_format": {"type": "json_object"},
        });
        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(CompletionError::Request)?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(CompletionError::Provider { status, body });
        }

        let mut accumulated = String::new();
        let mut buffer = String::new();
        let mut stream = resp.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(CompletionError::Request)?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline) = buffer.find('\n') {
                let line: String = buffer.drain(..=newline).collect();
                match parse_sse_line(line.trim_end()) {
                    Some(SseData::Done) => {
                        let fragment = parse_fragment(&accumulated)?;
                        tx.send(CompletionEvent::Done { fragment })
                            .await
                            .map_err(|_| CompletionError::TruncatedStream)?;
                        return Ok(());
                    }
                    Some(SseData::Delta(text)) => {
                        accumulated.push_str(&text);
                        let _ = tx.send(CompletionEvent::Delta { text }).await;
                    }
                    None => {}
                }
            }
        }

        // Some providers end the stream without a [DONE] marker.
        if accumulated.is_empty() {
            return Err(CompletionError::TruncatedStream);
        }
        let fragment = parse_fragment(&accumulated)?;
        tx.send(CompletionEvent::Done { fragment })
            .await
            .map_err(|_| CompletionError::TruncatedStream)?;
        Ok(())
    }

    /// Ask the model which page elements obstruct a screenshot. Returns CSS
    /// selectors for overlay/dialog/cookie/chat-widget elements. Callers
    /// treat any error here as "nothing to hide".
    pub async fn identify_overlay_selectors(
        &self,
        html: &str,
    ) -> Result<Vec<String>, CompletionError> {
        let truncated = truncate_utf8(html, MAX_SELECTOR_HTML_BYTES);
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": OVERLAY_SELECTOR_PROMPT},
                {"role": "user", "content": truncated},
            ],
        });
        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(CompletionError::Request)?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(CompletionError::Provider { status, body });
        }

        let completion: Completion = resp.json().await.map_err(CompletionError::Request)?;
        let content = completion
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or_default();
        parse_selectors(content)
    }
}

const OVERLAY_SELECTOR_PROMPT: &str = r##"You are given the serialized HTML of a rendered page. Identify elements that obstruct a clean full-page screenshot: cookie-consent banners, modal dialogs, newsletter popups, chat widgets, and fixed overlays.

Respond with a JSON array of CSS selectors only (no markdown, no explanation), e.g.:
["#cookie-banner", ".modal-backdrop", "div[aria-label='chat']"]

Return [] if nothing obstructs the page."##;

// ── Wire shapes ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Completion {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: String,
}

// ── Parsing helpers ───────────────────────────────────────────────────

enum SseData {
    Delta(String),
    Done,
}

fn parse_sse_line(line: &str) -> Option<SseData> {
    let data = line.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return Some(SseData::Done);
    }
    let chunk: StreamChunk = serde_json::from_str(data).ok()?;
    let content = chunk.choices.first()?.delta.content.clone()?;
    if content.is_empty() {
        None
    } else {
        Some(SseData::Delta(content))
    }
}

/// Parse the accumulated model output into a fragment, tolerating markdown
/// fences and surrounding prose by extracting the outermost JSON object.
pub fn parse_fragment(raw: &str) -> Result<Fragment, CompletionError> {
    let cleaned = match (raw.find('{'), raw.rfind('}')) {
        (Some(start), Some(end)) if start < end => &raw[start..=end],
        _ => raw,
    };
    serde_json::from_str(cleaned).map_err(|e| CompletionError::InvalidFragment(e.to_string()))
}

fn parse_selectors(raw: &str) -> Result<Vec<String>, CompletionError> {
    let cleaned = match (raw.find('['), raw.rfind(']')) {
        (Some(start), Some(end)) if start < end => &raw[start..=end],
        _ => raw,
    };
    serde_json::from_str(cleaned).map_err(|e| CompletionError::InvalidFragment(e.to_string()))
}

fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
