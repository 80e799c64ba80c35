use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tracing::info;

use super::api::{self, AppState};
use super::db::{DbHandle, MinigramDb};
use super::ws;
use crate::analytics::AnalyticsClient;
use crate::billing::BillingClient;
use crate::chat::ChatClient;
use crate::completion::CompletionClient;
use crate::config::AppConfig;
use crate::presence::PresenceHub;
use crate::ratelimit::RateLimiter;
use crate::sandbox::SandboxClient;
use crate::screenshot::BrowserClient;

/// Configuration for the Minigram server process.
pub struct ServerConfig {
    pub port: u16,
    pub db_path: std::path::PathBuf,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            db_path: std::path::PathBuf::from(".minigram/minigram.db"),
            dev_mode: false,
        }
    }
}

/// Build the full application router: REST API plus the presence WebSocket.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .route("/api/ws", get(ws::ws_handler))
        .with_state(state)
}

/// Assemble shared state from configuration: one database handle, one
/// client per vendor, one presence hub.
pub fn build_state(db: MinigramDb, app_config: &AppConfig) -> Arc<AppState> {
    let db = DbHandle::new(db);
    Arc::new(AppState {
        db: db.clone(),
        upload_dir: app_config.upload_dir.clone(),
        completions: CompletionClient::new(&app_config.completion),
        sandboxes: SandboxClient::new(&app_config.sandbox),
        browser: BrowserClient::new(&app_config.browser),
        billing: BillingClient::new(&app_config.billing),
        chat: ChatClient::new(&app_config.chat),
        analytics: AnalyticsClient::new(app_config.analytics.as_ref()),
        presence: PresenceHub::new(),
        rate_limiter: RateLimiter::new(db, &app_config.rate_limit),
        webhook_secret: app_config.billing.webhook_secret.clone(),
    })
}

/// Start the Minigram server.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let app_config = AppConfig::from_env()?.with_overrides(std::path::Path::new("."))?;

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = MinigramDb::new(&config.db_path).context("Failed to initialize database")?;

    let state = build_state(db, &app_config);
    let mut app = build_router(state);

    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!("Minigram running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::config::{
        BillingConfig, BrowserConfig, ChatConfig, CompletionConfig, RateLimitConfig,
        SandboxConfig,
    };

    fn test_config() -> AppConfig {
        AppConfig {
            completion: CompletionConfig {
                base_url: "http://127.0.0.1:9".into(),
                api_key: "test".into(),
                model: "test-model".into(),
            },
            rate_limit: RateLimitConfig::default(),
            sandbox: SandboxConfig {
                base_url: "http://127.0.0.1:9".into(),
                api_key: "test".into(),
                domain: "minigram.dev".into(),
                timeout_secs: 60,
                settle_ms: 0,
            },
            browser: BrowserConfig {
                base_url: "http://127.0.0.1:9".into(),
                nav_timeout_ms: 1000,
                settle_ms: 0,
            },
            billing: BillingConfig {
                base_url: "http://127.0.0.1:9".into(),
                secret_key: "sk_test".into(),
                webhook_secret: "whsec_test".into(),
            },
            chat: ChatConfig {
                base_url: "http://127.0.0.1:9".into(),
                api_key: "test".into(),
            },
            analytics: None,
            upload_dir: std::path::PathBuf::from("/tmp/minigram-test-uploads"),
        }
    }

    fn test_router() -> Router {
        let db = MinigramDb::new_in_memory().unwrap();
        build_router(build_state(db, &test_config()))
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let app = test_router();
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_routes_mounted() {
        let app = test_router();
        let req = Request::builder()
            .uri("/api/minigraphs")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ws_route_requires_user_id() {
        let app = test_router();
        // No user_id query parameter and no upgrade headers.
        let req = Request::builder().uri("/api/ws").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_ne!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_task_create_via_full_router() {
        let app = test_router();
        let req = Request::builder()
            .method("POST")
            .uri("/api/tasks")
            .header("x-user-id", "u1")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({"title": "wired through"}).to_string(),
            ))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let created: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(created["task"]["title"], "wired through");
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(
            config.db_path,
            std::path::PathBuf::from(".minigram/minigram.db")
        );
        assert!(!config.dev_mode);
    }
}
