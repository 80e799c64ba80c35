//! Runtime configuration for the Minigram service.
//!
//! Everything is read once at startup: environment variables (via dotenvy)
//! provide vendor endpoints and secrets, and an optional `minigram.toml`
//! next to the database can override the operational tunables (rate-limit
//! threshold/window, sandbox timeout and settle delay). There is no
//! hot-reload; a restart picks up changes.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Model-provider settings for the completion stream consumer.
#[derive(Debug, Clone)]
pub struct CompletionConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

/// Fixed-window rate-limit policy for shared-quota completion requests.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: i64,
    pub window_secs: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window_secs: 86_400,
        }
    }
}

/// Sandbox provisioning settings.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub base_url: String,
    pub api_key: String,
    /// Domain used to build routable URLs for web-app sandboxes
    /// (`https://{port}-{sbx_id}.{domain}`).
    pub domain: String,
    /// Environment TTL, enforced by the provisioning service itself.
    pub timeout_secs: u64,
    /// Wait after provisioning for the environment's own server to come up.
    pub settle_ms: u64,
}

/// Headless-browser service settings for the screenshot flow.
#[derive(Debug, Clone)]
pub struct BrowserConfig {
    pub base_url: String,
    pub nav_timeout_ms: u64,
    pub settle_ms: u64,
}

/// Billing vendor settings.
#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub base_url: String,
    pub secret_key: String,
    pub webhook_secret: String,
}

/// Messaging vendor settings for per-task chat channels.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub base_url: String,
    pub api_key: String,
}

/// Analytics capture settings. Absent key disables capture entirely.
#[derive(Debug, Clone)]
pub struct AnalyticsConfig {
    pub host: String,
    pub api_key: String,
}

/// Aggregate configuration handed to `start_server` and threaded into
/// every explicitly constructed vendor client.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub completion: CompletionConfig,
    pub rate_limit: RateLimitConfig,
    pub sandbox: SandboxConfig,
    pub browser: BrowserConfig,
    pub billing: BillingConfig,
    pub chat: ChatConfig,
    pub analytics: Option<AnalyticsConfig>,
    /// Directory task attachments are written into.
    pub upload_dir: PathBuf,
}

fn env_var(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("{} is not set", name))
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("{} is not a valid value for {}", raw, name)),
        Err(_) => Ok(default),
    }
}

impl AppConfig {
    /// Build configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let defaults = RateLimitConfig::default();
        Ok(Self {
            completion: CompletionConfig {
                base_url: env_or("MODEL_API_BASE", "https://api.openai.com/v1"),
                api_key: env_var("MODEL_API_KEY")?,
                model: env_or("MODEL_ID", "gpt-4o"),
            },
            rate_limit: RateLimitConfig {
                max_requests: env_parse("RATE_LIMIT_MAX_REQUESTS", defaults.max_requests)?,
                window_secs: env_parse("RATE_LIMIT_WINDOW_SECS", defaults.window_secs)?,
            },
            sandbox: SandboxConfig {
                base_url: env_var("SANDBOX_API_BASE")?,
                api_key: env_var("SANDBOX_API_KEY")?,
                domain: env_or("SANDBOX_DOMAIN", "minigram.dev"),
                timeout_secs: env_parse("SANDBOX_TIMEOUT_SECS", 1800)?,
                settle_ms: env_parse("SANDBOX_SETTLE_MS", 3000)?,
            },
            browser: BrowserConfig {
                base_url: env_var("BROWSER_API_BASE")?,
                nav_timeout_ms: env_parse("BROWSER_NAV_TIMEOUT_MS", 30_000)?,
                settle_ms: env_parse("BROWSER_SETTLE_MS", 2000)?,
            },
            billing: BillingConfig {
                base_url: env_or("BILLING_API_BASE", "https://api.stripe.com"),
                secret_key: env_var("BILLING_SECRET_KEY")?,
                webhook_secret: env_var("BILLING_WEBHOOK_SECRET")?,
            },
            chat: ChatConfig {
                base_url: env_var("CHAT_API_BASE")?,
                api_key: env_var("CHAT_API_KEY")?,
            },
            analytics: match std::env::var("ANALYTICS_API_KEY") {
                Ok(api_key) => Some(AnalyticsConfig {
                    host: env_or("ANALYTICS_HOST", "https://app.posthog.com"),
                    api_key,
                }),
                Err(_) => None,
            },
            upload_dir: PathBuf::from(env_or("UPLOAD_DIR", ".minigram/uploads")),
        })
    }

    /// Apply overrides from `minigram.toml` in the given directory, if present.
    pub fn with_overrides(mut self, dir: &Path) -> Result<Self> {
        let path = dir.join("minigram.toml");
        if !path.exists() {
            return Ok(self);
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let overrides: Overrides = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        if let Some(section) = overrides.rate_limit {
            if let Some(max) = section.max_requests {
                self.rate_limit.max_requests = max;
            }
            if let Some(window) = section.window_secs {
                self.rate_limit.window_secs = window;
            }
        }
        if let Some(section) = overrides.sandbox {
            if let Some(timeout) = section.timeout_secs {
                self.sandbox.timeout_secs = timeout;
            }
            if let Some(settle) = section.settle_ms {
                self.sandbox.settle_ms = settle;
            }
        }

        Ok(self)
    }
}

/// Raw TOML structure for `minigram.toml`.
#[derive(Debug, Deserialize)]
struct Overrides {
    rate_limit: Option<RateLimitSection>,
    sandbox: Option<SandboxSection>,
}

#[derive(Debug, Deserialize)]
struct RateLimitSection {
    max_requests: Option<i64>,
    window_secs: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SandboxSection {
    timeout_secs: Option<u64>,
    settle_ms: Option<u64>,
}
