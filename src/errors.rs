//! Typed error hierarchy for the Minigram service.
//!
//! One enum per vendor-facing subsystem:
//! - `CompletionError` — model-provider streaming and parsing failures
//! - `SandboxError` — provisioning, install, file-write, and execution failures
//! - `ScreenshotError` — browser-session and capture failures
//! - `BillingError` — billing API and webhook-signature failures
//!
//! Route handlers map these onto `ApiError` in `server::api`, keeping vendor
//! detail in the logs and out of client-facing messages.

use thiserror::Error;

/// Errors from the completion stream consumer.
#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("completion request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("model provider returned status {status}: {body}")]
    Provider { status: u16, body: String },

    #[error("completion stream ended without a terminal chunk")]
    TruncatedStream,

    #[error("model output is not a valid fragment: {0}")]
    InvalidFragment(String),
}

/// Errors from the sandbox provisioner. Every provisioning step is caught
/// and typed; a partial file-write failure names the paths that failed.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to provision sandbox: {0}")]
    Provision(String),

    #[error("dependency install failed ({command}): {stderr}")]
    Install { command: String, stderr: String },

    #[error("failed to write {} file(s): {}", failed.len(), failed.join(", "))]
    FileWrites { failed: Vec<String> },

    #[error("code execution failed: {0}")]
    Execute(String),

    #[error("sandbox request failed: {0}")]
    Request(#[source] reqwest::Error),
}

/// Errors from the screenshot service.
///
/// Selector identification is deliberately absent: its failure is swallowed
/// by the capture flow, never surfaced.
#[derive(Debug, Error)]
pub enum ScreenshotError {
    #[error("failed to open browser session for {url}: {message}")]
    Navigation { url: String, message: String },

    #[error("failed to capture screenshot: {0}")]
    Capture(String),

    #[error("browser request failed: {0}")]
    Request(#[source] reqwest::Error),
}

/// Errors from the billing client and webhook processing.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("webhook signature header is malformed")]
    MalformedSignature,

    #[error("webhook signature does not match payload")]
    InvalidSignature,

    #[error("webhook timestamp outside tolerance")]
    StaleTimestamp,

    #[error("billing API returned status {status}: {body}")]
    Provider { status: u16, body: String },

    #[error("billing request failed: {0}")]
    Request(#[source] reqwest::Error),
}
