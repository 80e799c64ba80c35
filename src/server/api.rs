use std::path::PathBuf;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::future::join_all;
use futures::stream;
use serde::{Deserialize, Deserializer};
use tracing::{error, warn};

use super::db::{DbHandle, SettingsUpdate, TaskUpdate};
use super::models::{Branding, Chat, Fragment, Task, TaskCreated, TaskStatus};
use crate::analytics::AnalyticsClient;
use crate::billing::{BillingClient, verify_signature};
use crate::chat::ChatClient;
use crate::completion::CompletionClient;
use crate::presence::PresenceHub;
use crate::prompt::{ChatMessage, apply_branding, build_system_prompt};
use crate::ratelimit::{LimitInfo, RateDecision, RateLimiter};
use crate::sandbox::SandboxClient;
use crate::screenshot::BrowserClient;
use crate::templates::{ALL_TEMPLATES, Template};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub upload_dir: PathBuf,
    pub completions: CompletionClient,
    pub sandboxes: SandboxClient,
    pub browser: BrowserClient,
    pub billing: BillingClient,
    pub chat: ChatClient,
    pub analytics: AnalyticsClient,
    pub presence: PresenceHub,
    pub rate_limiter: RateLimiter,
    pub webhook_secret: String,
}

pub type SharedState = Arc<AppState>;

// ── Identity ──────────────────────────────────────────────────────────

/// The caller's user id, taken from the `x-user-id` header. Authentication
/// itself happens upstream; by the time a request reaches this service the
/// header is trusted.
pub struct AuthUser(pub String);

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or(ApiError::Unauthorized)?;
        Ok(AuthUser(user_id.to_string()))
    }
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    /// Restrict generation to a single template; all templates otherwise.
    pub template: Option<Template>,
    /// Bring-your-own-key: replaces the configured model key and bypasses
    /// the per-user rate limit.
    pub api_key: Option<String>,
    pub model: Option<String>,
}

#[derive(Deserialize)]
pub struct SandboxRequest {
    pub fragment: Fragment,
    /// Bring-your-own-key: replaces the configured provisioning key.
    pub api_key: Option<String>,
}

#[derive(Deserialize)]
pub struct ScreenshotRequest {
    pub url: String,
}

#[derive(Deserialize)]
pub struct PublishMinigraphRequest {
    pub name: String,
    pub purpose: String,
    pub url: String,
    /// Taken as-is when present; captured from `url` otherwise.
    pub screenshot_url: Option<String>,
    #[serde(default)]
    pub facebook: bool,
    #[serde(default)]
    pub instagram: bool,
    #[serde(default)]
    pub twitter: bool,
}

#[derive(Deserialize)]
pub struct NotificationRequest {
    pub message: String,
}

/// Inbound event from the chat vendor. Fields beyond these are ignored.
#[derive(Deserialize)]
pub struct ChatWebhookEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub channel_id: Option<String>,
    pub user: Option<ChatWebhookUser>,
    #[serde(default)]
    pub members: Vec<ChatWebhookMember>,
    pub message: Option<ChatWebhookMessage>,
}

#[derive(Deserialize)]
pub struct ChatWebhookUser {
    pub id: String,
}

#[derive(Deserialize)]
pub struct ChatWebhookMember {
    pub user_id: String,
}

#[derive(Deserialize)]
pub struct ChatWebhookMessage {
    #[serde(default)]
    pub text: String,
}

#[derive(Deserialize)]
pub struct AttachmentUpload {
    pub file_name: String,
    pub content_base64: String,
}

#[derive(Deserialize)]
pub struct CreateTaskRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub team_id: Option<String>,
    pub assigned_user_id: Option<String>,
    pub due_date: Option<String>,
    pub due_time: Option<String>,
    #[serde(default)]
    pub not_urgent: bool,
    #[serde(default)]
    pub attachments: Vec<AttachmentUpload>,
}

/// Distinguishes "field absent" (keep) from "field null" (clear) for the
/// nullable task columns.
fn double_option<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(de).map(Some)
}

#[derive(Default, Deserialize)]
pub struct UpdateTaskRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub assigned_user_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub due_date: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub due_time: Option<Option<String>>,
    pub status: Option<TaskStatus>,
    pub not_urgent: Option<bool>,
}

#[derive(Deserialize)]
pub struct UpdateSettingsRequest {
    pub display_name: Option<String>,
    pub theme: Option<String>,
    pub email_notifications: Option<bool>,
    pub push_notifications: Option<bool>,
}

#[derive(Deserialize)]
pub struct BrandingRequest {
    pub header: Option<String>,
    pub footer: Option<String>,
    pub font: Option<String>,
    pub palette: Option<String>,
}

/// Fields default to empty so a missing `price_id` is our 400, not a
/// deserialization rejection.
#[derive(Deserialize)]
pub struct CheckoutRequest {
    #[serde(default)]
    pub price_id: String,
    #[serde(default)]
    pub success_url: String,
    #[serde(default)]
    pub cancel_url: String,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    Forbidden(String),
    NotFound(String),
    RateLimited(LimitInfo),
    Upstream(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "missing user identity".into()),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::RateLimited(info) => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(serde_json::json!({"error": "rate limit exceeded"})),
                )
                    .into_response();
                let headers = response.headers_mut();
                for (name, value) in [
                    ("x-ratelimit-limit", info.amount),
                    ("x-ratelimit-remaining", info.remaining),
                    ("x-ratelimit-reset", info.reset),
                ] {
                    if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
                        headers.insert(name, value);
                    }
                }
                return response;
            }
            ApiError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

fn internal(e: impl std::fmt::Display) -> ApiError {
    error!(error = %e, "internal error");
    ApiError::Internal("internal error".to_string())
}

fn upstream(e: impl std::fmt::Display) -> ApiError {
    error!(error = %e, "upstream vendor error");
    ApiError::Upstream("upstream service error".to_string())
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/chat/completion", post(chat_completion))
        .route("/api/sandbox", post(run_sandbox))
        .route("/api/screenshot", post(capture_screenshot))
        .route("/api/minigraphs", get(list_minigraphs).post(publish_minigraph))
        .route(
            "/api/minigraphs/{id}",
            get(get_minigraph).patch(update_minigraph).delete(delete_minigraph),
        )
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route(
            "/api/tasks/{id}",
            get(get_task).patch(update_task).delete(delete_task),
        )
        .route("/api/notifications", get(list_notifications).post(create_notification))
        .route("/api/notifications/{id}/read", patch(mark_notification_read))
        .route("/api/webhooks/chat", post(chat_message_webhook))
        .route("/api/settings", get(get_settings).patch(update_settings))
        .route("/api/settings/branding", get(get_branding).put(put_branding))
        .route("/api/billing/checkout", post(billing_checkout))
        .route("/api/billing/webhook", post(billing_webhook))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

/// Generate a fragment, streamed back as newline-delimited JSON events.
///
/// Requests on the service key count against the caller's daily quota;
/// bring-your-own-key requests do not.
async fn chat_completion(
    State(state): State<SharedState>,
    user: AuthUser,
    Json(req): Json<CompletionRequest>,
) -> Result<Response, ApiError> {
    if req.api_key.is_none() {
        match state.rate_limiter.check(&user.0).await.map_err(internal)? {
            RateDecision::Allowed { .. } => {}
            RateDecision::Limited(info) => return Err(ApiError::RateLimited(info)),
        }
    }

    let templates: Vec<Template> = match req.template {
        Some(template) => vec![template],
        None => ALL_TEMPLATES.to_vec(),
    };
    let mut messages = vec![ChatMessage::system(build_system_prompt(&templates))];
    messages.extend(req.messages);

    let user_id = user.0.clone();
    let branding = state
        .db
        .call(move |db| db.get_branding(&user_id))
        .await
        .map_err(internal)?;
    if let Some(branding) = branding {
        apply_branding(&mut messages, &branding);
    }

    state.analytics.capture(
        &user.0,
        "fragment_requested",
        serde_json::json!({"byo_key": req.api_key.is_some()}),
    );

    let rx = state
        .completions
        .stream_fragment(messages, req.api_key, req.model);
    let body_stream = stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        let mut line = serde_json::to_vec(&event).unwrap_or_default();
        line.push(b'\n');
        Some((Ok::<_, std::convert::Infallible>(Bytes::from(line)), rx))
    });
    Response::builder()
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(body_stream))
        .map_err(internal)
}

async fn run_sandbox(
    State(state): State<SharedState>,
    user: AuthUser,
    Json(req): Json<SandboxRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state
        .sandboxes
        .execute(&req.fragment, &user.0, req.api_key.as_deref())
        .await
        .map_err(upstream)?;
    state.analytics.capture(
        &user.0,
        "fragment_executed",
        serde_json::json!({"template": req.fragment.template.as_str()}),
    );
    Ok(Json(result))
}

async fn capture_screenshot(
    State(state): State<SharedState>,
    _user: AuthUser,
    Json(req): Json<ScreenshotRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let screenshot = state
        .browser
        .capture(&req.url, &state.completions)
        .await
        .map_err(upstream)?;
    Ok(Json(serde_json::json!({"screenshot": screenshot})))
}

// ── Gallery ───────────────────────────────────────────────────────────

async fn publish_minigraph(
    State(state): State<SharedState>,
    user: AuthUser,
    Json(req): Json<PublishMinigraphRequest>,
) -> Result<impl IntoResponse, ApiError> {
    // A publish without a screenshot gets one captured now; capture failure
    // downgrades to an empty thumbnail rather than blocking the publish.
    let screenshot_url = match req.screenshot_url {
        Some(url) => url,
        None => match state.browser.capture(&req.url, &state.completions).await {
            Ok(url) => url,
            Err(err) => {
                warn!(error = %err, url = %req.url, "publish-time screenshot failed");
                String::new()
            }
        },
    };

    let user_id = user.0.clone();
    let minigraph = state
        .db
        .call(move |db| {
            db.create_minigraph(
                &user_id,
                &req.name,
                &req.purpose,
                &req.url,
                &screenshot_url,
                req.facebook,
                req.instagram,
                req.twitter,
            )
        })
        .await
        .map_err(internal)?;
    state.analytics.capture(
        &user.0,
        "minigraph_published",
        serde_json::json!({"minigraph_id": minigraph.id}),
    );
    Ok((StatusCode::CREATED, Json(minigraph)))
}

/// The gallery is public; listing takes no identity.
async fn list_minigraphs(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let minigraphs = state
        .db
        .call(|db| db.list_minigraphs())
        .await
        .map_err(internal)?;
    Ok(Json(minigraphs))
}

async fn get_minigraph(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let minigraph = state
        .db
        .call(move |db| db.get_minigraph(id))
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::NotFound(format!("Minigraph {} not found", id)))?;
    Ok(Json(minigraph))
}

async fn update_minigraph(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
    Json(req): Json<PublishMinigraphRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_minigraph_owner(&state, id, &user.0).await?;
    let screenshot_url = req.screenshot_url.unwrap_or_default();
    let minigraph = state
        .db
        .call(move |db| {
            db.update_minigraph(
                id,
                &req.name,
                &req.purpose,
                &req.url,
                &screenshot_url,
                req.facebook,
                req.instagram,
                req.twitter,
            )
        })
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::NotFound(format!("Minigraph {} not found", id)))?;
    Ok(Json(minigraph))
}

async fn delete_minigraph(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    require_minigraph_owner(&state, id, &user.0).await?;
    state
        .db
        .call(move |db| db.delete_minigraph(id))
        .await
        .map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn require_minigraph_owner(
    state: &SharedState,
    id: i64,
    user_id: &str,
) -> Result<(), ApiError> {
    let minigraph = state
        .db
        .call(move |db| db.get_minigraph(id))
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::NotFound(format!("Minigraph {} not found", id)))?;
    if minigraph.user_id != user_id {
        return Err(ApiError::Forbidden("not the owner".to_string()));
    }
    Ok(())
}

// ── Tasks ─────────────────────────────────────────────────────────────

async fn create_task(
    State(state): State<SharedState>,
    user: AuthUser,
    Json(req): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.title.trim().is_empty() {
        return Err(ApiError::BadRequest("title must not be empty".to_string()));
    }

    let owner = user.0.clone();
    let task = state
        .db
        .call(move |db| {
            db.create_task(
                &req.title,
                &req.description,
                req.team_id.as_deref(),
                &owner,
                req.assigned_user_id.as_deref(),
                req.due_date.as_deref(),
                req.due_time.as_deref(),
                req.not_urgent,
            )
        })
        .await
        .map_err(internal)?;

    let failed_attachments = store_attachments(&state, task.id, &req.attachments).await;
    notify_assignment(&state, &task).await;
    let chat = provision_task_chat(&state, &task).await;

    Ok((
        StatusCode::CREATED,
        Json(TaskCreated {
            task,
            chat,
            failed_attachments,
        }),
    ))
}

/// Write every attachment concurrently; a failure skips that file and is
/// reported by name, the task itself is never rolled back.
async fn store_attachments(
    state: &SharedState,
    task_id: i64,
    attachments: &[AttachmentUpload],
) -> Vec<String> {
    if attachments.is_empty() {
        return vec![];
    }
    if let Err(err) = tokio::fs::create_dir_all(&state.upload_dir).await {
        warn!(error = %err, "upload directory unavailable, all attachments failed");
        return attachments.iter().map(|a| a.file_name.clone()).collect();
    }

    let writes = attachments.iter().map(|attachment| {
        let name = sanitize_file_name(&attachment.file_name);
        let path = state.upload_dir.join(format!("{}-{}", task_id, name));
        async move {
            let decoded = BASE64
                .decode(attachment.content_base64.as_bytes())
                .map_err(|_| attachment.file_name.clone())?;
            tokio::fs::write(&path, decoded)
                .await
                .map_err(|_| attachment.file_name.clone())?;
            Ok::<(String, String), String>((
                attachment.file_name.clone(),
                path.to_string_lossy().into_owned(),
            ))
        }
    });

    let mut failed = vec![];
    for outcome in join_all(writes).await {
        match outcome {
            Ok((file_name, stored_path)) => {
                let record = state
                    .db
                    .call(move |db| db.record_file_upload(task_id, &file_name, &stored_path))
                    .await;
                if let Err(err) = record {
                    warn!(error = %err, "attachment stored but not recorded");
                }
            }
            Err(file_name) => failed.push(file_name),
        }
    }
    failed
}

fn sanitize_file_name(name: &str) -> String {
    name.rsplit(['/', '\\']).next().unwrap_or(name).to_string()
}

/// Notify the assignee of a fresh assignment. No-op when the task is
/// unassigned or self-assigned. Kept separate from channel provisioning so
/// a provisioning retry cannot repeat the notification.
async fn notify_assignment(state: &SharedState, task: &Task) {
    let Some(assignee) = task.assigned_user_id.as_deref() else {
        return;
    };
    if assignee == task.owner_id {
        return;
    }
    let assignee_owned = assignee.to_string();
    let message = format!("You were assigned task \"{}\"", task.title);
    let notify = state
        .db
        .call(move |db| db.create_notification(&assignee_owned, &message))
        .await;
    if let Err(err) = notify {
        warn!(error = %err, "assignment notification failed");
    }
}

/// A task assigned to someone other than its owner gets a private channel.
/// Best-effort: a vendor failure leaves the task without a chat binding.
async fn provision_task_chat(state: &SharedState, task: &Task) -> Option<Chat> {
    let assignee = task.assigned_user_id.as_deref()?;
    if assignee == task.owner_id {
        return None;
    }

    match state
        .chat
        .create_channel(task.id, &[&task.owner_id, assignee])
        .await
    {
        Ok(channel_id) => {
            let task_id = task.id;
            let participants = vec![task.owner_id.clone(), assignee.to_string()];
            match state
                .db
                .call(move |db| db.create_chat(task_id, &channel_id, &participants))
                .await
            {
                Ok(chat) => Some(chat),
                Err(err) => {
                    warn!(error = %err, task_id = task.id, "chat binding not persisted");
                    None
                }
            }
        }
        Err(err) => {
            warn!(error = %err, task_id = task.id, "chat channel provisioning failed");
            None
        }
    }
}

async fn list_tasks(
    State(state): State<SharedState>,
    user: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = user.0;
    let tasks = state
        .db
        .call(move |db| db.list_tasks_for_user(&user_id))
        .await
        .map_err(internal)?;
    Ok(Json(tasks))
}

async fn get_task(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let task = fetch_task_for_participant(&state, id, &user.0).await?;
    Ok(Json(task))
}

async fn update_task(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
    Json(req): Json<UpdateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let previous = fetch_task_for_participant(&state, id, &user.0).await?;
    let assignment_changed = matches!(
        &req.assigned_user_id,
        Some(new) if new.as_deref() != previous.assigned_user_id.as_deref()
    );

    let update = TaskUpdate {
        title: req.title,
        description: req.description,
        assigned_user_id: req.assigned_user_id,
        due_date: req.due_date,
        due_time: req.due_time,
        status: req.status,
        not_urgent: req.not_urgent,
    };
    let task = state
        .db
        .call(move |db| db.update_task(id, &update))
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::NotFound(format!("Task {} not found", id)))?;

    // Notify only on an actual reassignment, not on every edit.
    if assignment_changed {
        notify_assignment(&state, &task).await;
    }

    // A fresh assignment on a task that never had a channel provisions one.
    let existing_chat = state
        .db
        .call(move |db| db.get_chat_for_task(id))
        .await
        .map_err(internal)?;
    if existing_chat.is_none() {
        provision_task_chat(&state, &task).await;
    }

    Ok(Json(task))
}

async fn delete_task(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state
        .db
        .call(move |db| db.get_task(id))
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::NotFound(format!("Task {} not found", id)))?;
    if task.owner_id != user.0 {
        return Err(ApiError::Forbidden("only the owner can delete a task".to_string()));
    }
    state
        .db
        .call(move |db| db.delete_task(id))
        .await
        .map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn fetch_task_for_participant(
    state: &SharedState,
    id: i64,
    user_id: &str,
) -> Result<Task, ApiError> {
    let task = state
        .db
        .call(move |db| db.get_task(id))
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::NotFound(format!("Task {} not found", id)))?;
    let participant =
        task.owner_id == user_id || task.assigned_user_id.as_deref() == Some(user_id);
    if !participant {
        return Err(ApiError::Forbidden("not a participant of this task".to_string()));
    }
    Ok(task)
}

// ── Notifications ─────────────────────────────────────────────────────

async fn list_notifications(
    State(state): State<SharedState>,
    user: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = user.0;
    let notifications = state
        .db
        .call(move |db| db.list_notifications(&user_id))
        .await
        .map_err(internal)?;
    Ok(Json(notifications))
}

async fn create_notification(
    State(state): State<SharedState>,
    user: AuthUser,
    Json(req): Json<NotificationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.message.trim().is_empty() {
        return Err(ApiError::BadRequest("message must not be empty".to_string()));
    }
    let user_id = user.0;
    let notification = state
        .db
        .call(move |db| db.create_notification(&user_id, &req.message))
        .await
        .map_err(internal)?;
    Ok((StatusCode::CREATED, Json(notification)))
}

/// Chat-vendor webhook. Only `message.new` is acted on: every channel
/// member other than the sender gets a notification row.
async fn chat_message_webhook(
    State(state): State<SharedState>,
    Json(event): Json<ChatWebhookEvent>,
) -> Result<impl IntoResponse, ApiError> {
    if event.event_type == "message.new" {
        let sender = event.user.map(|u| u.id).unwrap_or_default();
        let text = event.message.map(|m| m.text).unwrap_or_default();
        let message = match event.channel_id {
            Some(channel) => format!("New message in {}: {}", channel, text),
            None => format!("New message: {}", text),
        };
        let recipients: Vec<String> = event
            .members
            .into_iter()
            .map(|m| m.user_id)
            .filter(|id| *id != sender)
            .collect();
        state
            .db
            .call(move |db| {
                for recipient in &recipients {
                    db.create_notification(recipient, &message)?;
                }
                Ok(())
            })
            .await
            .map_err(internal)?;
    }
    Ok(Json(serde_json::json!({"received": true})))
}

async fn mark_notification_read(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = user.0;
    let notification = state
        .db
        .call(move |db| db.mark_notification_read(id, &user_id))
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::NotFound(format!("Notification {} not found", id)))?;
    Ok(Json(notification))
}

// ── Settings ──────────────────────────────────────────────────────────

async fn get_settings(
    State(state): State<SharedState>,
    user: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = user.0;
    let settings = state
        .db
        .call(move |db| db.get_or_create_settings(&user_id))
        .await
        .map_err(internal)?;
    Ok(Json(settings))
}

async fn update_settings(
    State(state): State<SharedState>,
    user: AuthUser,
    Json(req): Json<UpdateSettingsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let update = SettingsUpdate {
        display_name: req.display_name,
        theme: req.theme,
        email_notifications: req.email_notifications,
        push_notifications: req.push_notifications,
    };
    let user_id = user.0;
    let settings = state
        .db
        .call(move |db| db.update_settings(&user_id, &update))
        .await
        .map_err(internal)?;
    Ok(Json(settings))
}

async fn get_branding(
    State(state): State<SharedState>,
    user: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = user.0.clone();
    let branding = state
        .db
        .call(move |db| db.get_branding(&user_id))
        .await
        .map_err(internal)?
        .unwrap_or(Branding {
            user_id: user.0,
            header: None,
            footer: None,
            font: None,
            palette: None,
        });
    Ok(Json(branding))
}

async fn put_branding(
    State(state): State<SharedState>,
    user: AuthUser,
    Json(req): Json<BrandingRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let branding = Branding {
        user_id: user.0,
        header: req.header,
        footer: req.footer,
        font: req.font,
        palette: req.palette,
    };
    let stored = branding.clone();
    state
        .db
        .call(move |db| db.upsert_branding(&stored))
        .await
        .map_err(internal)?;
    Ok(Json(branding))
}

// ── Billing ───────────────────────────────────────────────────────────

async fn billing_checkout(
    State(state): State<SharedState>,
    user: AuthUser,
    Json(req): Json<CheckoutRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.price_id.trim().is_empty() {
        return Err(ApiError::BadRequest("price_id is required".to_string()));
    }

    let user_id = user.0.clone();
    let settings = state
        .db
        .call(move |db| db.get_or_create_settings(&user_id))
        .await
        .map_err(internal)?;

    let customer_id = match settings.stripe_customer_id {
        Some(id) => id,
        None => {
            let created = state.billing.create_customer(&user.0).await.map_err(upstream)?;
            let user_id = user.0.clone();
            // Concurrent first-checkouts race to create a customer; the
            // database keeps exactly one and everyone adopts it.
            state
                .db
                .call(move |db| db.set_stripe_customer_if_absent(&user_id, &created))
                .await
                .map_err(internal)?
        }
    };

    let session = state
        .billing
        .create_checkout_session(&customer_id, &req.price_id, &req.success_url, &req.cancel_url)
        .await
        .map_err(upstream)?;
    Ok(Json(serde_json::json!({
        "session_id": session.id,
        "url": session.url,
    })))
}

/// Billing webhook: signature is verified against the raw body before any
/// parsing. Events apply last-write-wins; replays within the timestamp
/// tolerance are harmless because every handled event is idempotent.
async fn billing_webhook(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("missing signature header".to_string()))?;
    verify_signature(
        &body,
        signature,
        &state.webhook_secret,
        chrono::Utc::now().timestamp(),
    )
    .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let event: serde_json::Value =
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let event_type = event["type"].as_str().unwrap_or_default();
    let object = &event["data"]["object"];
    let customer = object["customer"].as_str();

    let status = match event_type {
        "checkout.session.completed" => Some("active".to_string()),
        "customer.subscription.updated" => {
            Some(object["status"].as_str().unwrap_or("active").to_string())
        }
        "customer.subscription.deleted" => Some("canceled".to_string()),
        _ => None,
    };

    if let (Some(customer), Some(status)) = (customer, status) {
        let customer = customer.to_string();
        state
            .db
            .call(move |db| db.update_subscription_by_customer(&customer, &status))
            .await
            .map_err(internal)?;
    }

    Ok(Json(serde_json::json!({"received": true})))
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::super::db::MinigramDb;
    use crate::billing::sign_payload;
    use crate::completion::CompletionEvent;
    use crate::config::{
        BillingConfig, BrowserConfig, ChatConfig, CompletionConfig, RateLimitConfig,
        SandboxConfig,
    };

    const DEAD: &str = "http://127.0.0.1:9";

    #[derive(Default)]
    struct Overrides {
        chat_base: Option<String>,
        completion_base: Option<String>,
        billing_base: Option<String>,
        sandbox_base: Option<String>,
        browser_base: Option<String>,
        max_requests: Option<i64>,
        upload_dir: Option<PathBuf>,
    }

    fn make_state(overrides: Overrides) -> SharedState {
        let db = DbHandle::new(MinigramDb::new_in_memory().unwrap());
        let rate_limit = RateLimitConfig {
            max_requests: overrides.max_requests.unwrap_or(100),
            window_secs: 86_400,
        };
        Arc::new(AppState {
            db: db.clone(),
            upload_dir: overrides
                .upload_dir
                .unwrap_or_else(|| PathBuf::from("/tmp/minigram-test-uploads")),
            completions: CompletionClient::new(&CompletionConfig {
                base_url: overrides.completion_base.unwrap_or_else(|| DEAD.into()),
                api_key: "test".into(),
                model: "test-model".into(),
            }),
            sandboxes: SandboxClient::new(&SandboxConfig {
                base_url: overrides.sandbox_base.unwrap_or_else(|| DEAD.into()),
                api_key: "test".into(),
                domain: "minigram.dev".into(),
                timeout_secs: 60,
                settle_ms: 0,
            }),
            browser: BrowserClient::new(&BrowserConfig {
                base_url: overrides.browser_base.unwrap_or_else(|| DEAD.into()),
                nav_timeout_ms: 1000,
                settle_ms: 0,
            }),
            billing: BillingClient::new(&BillingConfig {
                base_url: overrides.billing_base.unwrap_or_else(|| DEAD.into()),
                secret_key: "sk_test".into(),
                webhook_secret: "whsec_test".into(),
            }),
            chat: ChatClient::new(&ChatConfig {
                base_url: overrides.chat_base.unwrap_or_else(|| DEAD.into()),
                api_key: "test".into(),
            }),
            analytics: AnalyticsClient::new(None),
            presence: PresenceHub::new(),
            rate_limiter: RateLimiter::new(db, &rate_limit),
            webhook_secret: "whsec_test".into(),
        })
    }

    fn app(state: &SharedState) -> Router {
        api_router().with_state(state.clone())
    }

    async fn spawn_chat_mock() -> String {
        use axum::routing::post;
        let mock = Router::new().route(
            "/channels",
            post(|Json(body): Json<serde_json::Value>| async move {
                Json(serde_json::json!({"channel_id": body["id"]}))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, mock).await.unwrap() });
        format!("http://{}", addr)
    }

    async fn spawn_sandbox_mock(auths: Arc<std::sync::Mutex<Vec<String>>>) -> String {
        use axum::routing::post;
        let mock = Router::new()
            .route(
                "/sandboxes",
                post(move |headers: HeaderMap| {
                    let auths = auths.clone();
                    async move {
                        let auth = headers
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        auths.lock().unwrap().push(auth);
                        Json(serde_json::json!({"sandboxId": "sbx-api"}))
                    }
                }),
            )
            .route(
                "/sandboxes/{id}/files",
                post(|| async { Json(serde_json::json!({"ok": true})) }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, mock).await.unwrap() });
        format!("http://{}", addr)
    }

    async fn spawn_browser_mock() -> String {
        use axum::routing::{delete, get, post};
        let mock = Router::new()
            .route(
                "/sessions",
                post(|| async { Json(serde_json::json!({"session_id": "sess-api"})) }),
            )
            .route(
                "/sessions/{id}/content",
                get(|| async { "<html></html>".to_string() }),
            )
            .route(
                "/sessions/{id}/screenshot",
                post(|| async { vec![0x89u8, 0x50, 0x4e, 0x47] }),
            )
            .route(
                "/sessions/{id}",
                delete(|| async { Json(serde_json::json!({"closed": true})) }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, mock).await.unwrap() });
        format!("http://{}", addr)
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(method: &str, uri: &str, user: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("x-user-id", user)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str, user: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .header("x-user-id", user)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let state = make_state(Overrides::default());
        let response = app(&state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_missing_identity_rejected() {
        let state = make_state(Overrides::default());
        let request = Request::builder()
            .method("GET")
            .uri("/api/tasks")
            .body(Body::empty())
            .unwrap();
        let response = app(&state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_publish_and_read_minigraphs() {
        let state = make_state(Overrides::default());
        let app = app(&state);

        let publish = json_request(
            "POST",
            "/api/minigraphs",
            "u1",
            serde_json::json!({
                "name": "Budget Buddy",
                "purpose": "personal budgeting",
                "url": "https://3000-sbx1.minigram.dev",
                "screenshot_url": "data:image/png;base64,AAAA",
                "twitter": true,
            }),
        );
        let response = app.clone().oneshot(publish).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(created["user_id"], "u1");
        assert_eq!(created["twitter"], true);
        assert_eq!(created["facebook"], false);
        let id = created["id"].as_i64().unwrap();

        // Listing and fetching are public, no identity header.
        let list = Request::builder()
            .uri("/api/minigraphs")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(list).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let listed: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(listed.len(), 1);

        let fetch = Request::builder()
            .uri(format!("/api/minigraphs/{}", id))
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(fetch).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let missing = Request::builder()
            .uri("/api/minigraphs/9999")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(missing).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_minigraph_owner_enforcement() {
        let state = make_state(Overrides::default());
        let app = app(&state);

        let publish = json_request(
            "POST",
            "/api/minigraphs",
            "u1",
            serde_json::json!({
                "name": "Mine",
                "purpose": "test",
                "url": "https://app.example",
                "screenshot_url": "",
            }),
        );
        let response = app.clone().oneshot(publish).await.unwrap();
        let created: serde_json::Value = body_json(response.into_body()).await;
        let id = created["id"].as_i64().unwrap();

        let foreign_delete = Request::builder()
            .method("DELETE")
            .uri(format!("/api/minigraphs/{}", id))
            .header("x-user-id", "u2")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(foreign_delete).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let foreign_update = json_request(
            "PATCH",
            &format!("/api/minigraphs/{}", id),
            "u2",
            serde_json::json!({"name": "Stolen", "purpose": "x", "url": "https://x"}),
        );
        let response = app.clone().oneshot(foreign_update).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let owner_delete = Request::builder()
            .method("DELETE")
            .uri(format!("/api/minigraphs/{}", id))
            .header("x-user-id", "u1")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(owner_delete).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_create_task_without_assignee_has_no_chat() {
        let state = make_state(Overrides::default());
        let request = json_request(
            "POST",
            "/api/tasks",
            "owner",
            serde_json::json!({"title": "solo work"}),
        );
        let response = app(&state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created: TaskCreated = body_json(response.into_body()).await;
        assert!(created.chat.is_none());
        assert!(created.failed_attachments.is_empty());
        assert_eq!(created.task.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_create_task_with_assignee_provisions_chat_and_notifies() {
        let chat_base = spawn_chat_mock().await;
        let state = make_state(Overrides {
            chat_base: Some(chat_base),
            ..Default::default()
        });
        let app = app(&state);

        let request = json_request(
            "POST",
            "/api/tasks",
            "owner",
            serde_json::json!({"title": "pair work", "assigned_user_id": "assignee"}),
        );
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created: TaskCreated = body_json(response.into_body()).await;
        let chat = created.chat.expect("distinct assignee must get a channel");
        assert_eq!(chat.channel_id, format!("task-{}", created.task.id));
        assert_eq!(chat.participants, vec!["owner".to_string(), "assignee".to_string()]);

        let response = app.oneshot(get_request("/api/notifications", "assignee")).await.unwrap();
        let notifications: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(notifications.len(), 1);
        assert!(notifications[0]["message"].as_str().unwrap().contains("pair work"));
        assert_eq!(notifications[0]["read"], false);
    }

    #[tokio::test]
    async fn test_self_assignment_creates_no_chat() {
        let chat_base = spawn_chat_mock().await;
        let state = make_state(Overrides {
            chat_base: Some(chat_base),
            ..Default::default()
        });
        let request = json_request(
            "POST",
            "/api/tasks",
            "owner",
            serde_json::json!({"title": "note to self", "assigned_user_id": "owner"}),
        );
        let response = app(&state).oneshot(request).await.unwrap();
        let created: TaskCreated = body_json(response.into_body()).await;
        assert!(created.chat.is_none());
    }

    #[tokio::test]
    async fn test_task_attachments_fan_out() {
        let dir = tempfile::tempdir().unwrap();
        let state = make_state(Overrides {
            upload_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        });

        let request = json_request(
            "POST",
            "/api/tasks",
            "owner",
            serde_json::json!({
                "title": "with files",
                "attachments": [
                    {"file_name": "notes.txt", "content_base64": BASE64.encode(b"hello")},
                    {"file_name": "bad.bin", "content_base64": "not-base64!!!"},
                    {"file_name": "plan.md", "content_base64": BASE64.encode(b"# plan")},
                ],
            }),
        );
        let response = app(&state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created: TaskCreated = body_json(response.into_body()).await;
        assert_eq!(created.failed_attachments, vec!["bad.bin".to_string()]);

        let stored = std::fs::read(dir.path().join(format!("{}-notes.txt", created.task.id))).unwrap();
        assert_eq!(stored, b"hello");
        assert!(dir.path().join(format!("{}-plan.md", created.task.id)).exists());
    }

    #[tokio::test]
    async fn test_task_visibility() {
        let state = make_state(Overrides::default());
        let app = app(&state);

        let request = json_request(
            "POST",
            "/api/tasks",
            "owner",
            serde_json::json!({"title": "shared", "assigned_user_id": "assignee"}),
        );
        let response = app.clone().oneshot(request).await.unwrap();
        let created: TaskCreated = body_json(response.into_body()).await;
        let id = created.task.id;

        let response = app
            .clone()
            .oneshot(get_request(&format!("/api/tasks/{}", id), "bystander"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .clone()
            .oneshot(get_request("/api/tasks", "assignee"))
            .await
            .unwrap();
        let tasks: Vec<Task> = body_json(response.into_body()).await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, id);
    }

    #[tokio::test]
    async fn test_patch_task_assignment_provisions_chat() {
        let chat_base = spawn_chat_mock().await;
        let state = make_state(Overrides {
            chat_base: Some(chat_base),
            ..Default::default()
        });
        let app = app(&state);

        let request = json_request(
            "POST",
            "/api/tasks",
            "owner",
            serde_json::json!({"title": "later assigned"}),
        );
        let response = app.clone().oneshot(request).await.unwrap();
        let created: TaskCreated = body_json(response.into_body()).await;
        assert!(created.chat.is_none());
        let id = created.task.id;

        let patch = json_request(
            "PATCH",
            &format!("/api/tasks/{}", id),
            "owner",
            serde_json::json!({"assigned_user_id": "assignee", "status": "accepted"}),
        );
        let response = app.oneshot(patch).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let task: Task = body_json(response.into_body()).await;
        assert_eq!(task.assigned_user_id.as_deref(), Some("assignee"));
        assert_eq!(task.status, TaskStatus::Accepted);

        let chat = state
            .db
            .call(move |db| db.get_chat_for_task(id))
            .await
            .unwrap()
            .expect("assignment via PATCH must provision a channel");
        assert_eq!(chat.channel_id, format!("task-{}", id));
    }

    #[tokio::test]
    async fn test_title_edits_do_not_repeat_assignment_notice() {
        // Chat vendor unreachable, so the task never gets a channel binding
        // and every PATCH retries provisioning.
        let state = make_state(Overrides::default());
        let app = app(&state);

        let request = json_request(
            "POST",
            "/api/tasks",
            "owner",
            serde_json::json!({"title": "pair work", "assigned_user_id": "assignee"}),
        );
        let response = app.clone().oneshot(request).await.unwrap();
        let created: TaskCreated = body_json(response.into_body()).await;
        assert!(created.chat.is_none());
        let id = created.task.id;

        for title in ["draft", "final"] {
            let patch = json_request(
                "PATCH",
                &format!("/api/tasks/{}", id),
                "owner",
                serde_json::json!({"title": title}),
            );
            let response = app.clone().oneshot(patch).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .clone()
            .oneshot(get_request("/api/notifications", "assignee"))
            .await
            .unwrap();
        let notifications: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(notifications.len(), 1);

        // An actual reassignment notifies the new assignee.
        let patch = json_request(
            "PATCH",
            &format!("/api/tasks/{}", id),
            "owner",
            serde_json::json!({"assigned_user_id": "other"}),
        );
        app.clone().oneshot(patch).await.unwrap();
        let response = app.oneshot(get_request("/api/notifications", "other")).await.unwrap();
        let notifications: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(notifications.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_task_owner_only() {
        let state = make_state(Overrides::default());
        let app = app(&state);

        let request = json_request(
            "POST",
            "/api/tasks",
            "owner",
            serde_json::json!({"title": "doomed", "assigned_user_id": "assignee"}),
        );
        let response = app.clone().oneshot(request).await.unwrap();
        let created: TaskCreated = body_json(response.into_body()).await;
        let id = created.task.id;

        let assignee_delete = Request::builder()
            .method("DELETE")
            .uri(format!("/api/tasks/{}", id))
            .header("x-user-id", "assignee")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(assignee_delete).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let owner_delete = Request::builder()
            .method("DELETE")
            .uri(format!("/api/tasks/{}", id))
            .header("x-user-id", "owner")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(owner_delete).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_notification_read_is_scoped() {
        let chat_base = spawn_chat_mock().await;
        let state = make_state(Overrides {
            chat_base: Some(chat_base),
            ..Default::default()
        });
        let app = app(&state);

        let request = json_request(
            "POST",
            "/api/tasks",
            "owner",
            serde_json::json!({"title": "ping", "assigned_user_id": "assignee"}),
        );
        app.clone().oneshot(request).await.unwrap();

        let response = app
            .clone()
            .oneshot(get_request("/api/notifications", "assignee"))
            .await
            .unwrap();
        let notifications: Vec<serde_json::Value> = body_json(response.into_body()).await;
        let id = notifications[0]["id"].as_i64().unwrap();

        // Another user cannot mark it.
        let foreign = json_request(
            "PATCH",
            &format!("/api/notifications/{}/read", id),
            "owner",
            serde_json::json!({}),
        );
        let response = app.clone().oneshot(foreign).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let own = json_request(
            "PATCH",
            &format!("/api/notifications/{}/read", id),
            "assignee",
            serde_json::json!({}),
        );
        let response = app.oneshot(own).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let marked: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(marked["read"], true);
    }

    #[tokio::test]
    async fn test_notification_insert() {
        let state = make_state(Overrides::default());
        let app = app(&state);

        let blank = json_request(
            "POST",
            "/api/notifications",
            "u1",
            serde_json::json!({"message": "   "}),
        );
        let response = app.clone().oneshot(blank).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let request = json_request(
            "POST",
            "/api/notifications",
            "u1",
            serde_json::json!({"message": "Standup moved to 10am"}),
        );
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(created["read"], false);

        let response = app.oneshot(get_request("/api/notifications", "u1")).await.unwrap();
        let notifications: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0]["message"], "Standup moved to 10am");
    }

    #[tokio::test]
    async fn test_chat_webhook_notifies_everyone_but_the_sender() {
        let state = make_state(Overrides::default());
        let app = app(&state);

        let event = serde_json::json!({
            "type": "message.new",
            "channel_id": "task-7",
            "user": {"id": "alice"},
            "members": [
                {"user_id": "alice"},
                {"user_id": "bob"},
                {"user_id": "carol"}
            ],
            "message": {"text": "draft is up"}
        });
        let request = Request::builder()
            .method("POST")
            .uri("/api/webhooks/chat")
            .header("content-type", "application/json")
            .body(Body::from(event.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let ack: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(ack["received"], true);

        for user in ["bob", "carol"] {
            let response = app.clone().oneshot(get_request("/api/notifications", user)).await.unwrap();
            let notifications: Vec<serde_json::Value> = body_json(response.into_body()).await;
            assert_eq!(notifications.len(), 1);
            assert!(
                notifications[0]["message"].as_str().unwrap().contains("task-7"),
                "notification should name the channel"
            );
        }
        let response = app.clone().oneshot(get_request("/api/notifications", "alice")).await.unwrap();
        let notifications: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert!(notifications.is_empty());

        // Other event types are acknowledged and otherwise ignored.
        let request = Request::builder()
            .method("POST")
            .uri("/api/webhooks/chat")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({"type": "channel.updated", "members": [{"user_id": "bob"}]})
                    .to_string(),
            ))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.oneshot(get_request("/api/notifications", "bob")).await.unwrap();
        let notifications: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(notifications.len(), 1);
    }

    #[tokio::test]
    async fn test_settings_defaults_and_update() {
        let state = make_state(Overrides::default());
        let app = app(&state);

        let response = app.clone().oneshot(get_request("/api/settings", "u1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let settings: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(settings["theme"], "system");
        assert_eq!(settings["email_notifications"], true);
        assert!(settings["stripe_customer_id"].is_null());

        let patch = json_request(
            "PATCH",
            "/api/settings",
            "u1",
            serde_json::json!({"theme": "dark", "push_notifications": false}),
        );
        let response = app.clone().oneshot(patch).await.unwrap();
        let settings: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(settings["theme"], "dark");
        assert_eq!(settings["push_notifications"], false);
        assert_eq!(settings["email_notifications"], true);
    }

    #[tokio::test]
    async fn test_branding_roundtrip() {
        let state = make_state(Overrides::default());
        let app = app(&state);

        // Unset branding reads back as all-empty, not 404.
        let response = app
            .clone()
            .oneshot(get_request("/api/settings/branding", "u1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let branding: Branding = body_json(response.into_body()).await;
        assert!(branding.header.is_none());

        let put = json_request(
            "PUT",
            "/api/settings/branding",
            "u1",
            serde_json::json!({"header": "<Header/>", "palette": "#112233,#445566"}),
        );
        let response = app.clone().oneshot(put).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(get_request("/api/settings/branding", "u1"))
            .await
            .unwrap();
        let branding: Branding = body_json(response.into_body()).await;
        assert_eq!(branding.header.as_deref(), Some("<Header/>"));
        assert_eq!(branding.palette.as_deref(), Some("#112233,#445566"));
        assert!(branding.font.is_none());
    }

    #[tokio::test]
    async fn test_completion_rate_limit_and_byo_key_bypass() {
        let state = make_state(Overrides {
            max_requests: Some(1),
            ..Default::default()
        });
        let app = app(&state);
        let body = serde_json::json!({"messages": [{"role": "user", "content": "make an app"}]});

        let response = app
            .clone()
            .oneshot(json_request("POST", "/api/chat/completion", "u1", body.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(json_request("POST", "/api/chat/completion", "u1", body.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["x-ratelimit-limit"], "1");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");

        // A caller-supplied key does not touch the quota.
        let byo = serde_json::json!({
            "messages": [{"role": "user", "content": "make an app"}],
            "api_key": "sk-user-own",
        });
        let response = app
            .oneshot(json_request("POST", "/api/chat/completion", "u1", byo))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_completion_streams_ndjson() {
        use axum::routing::post;
        let sse = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"{\\\"template\\\": \\\"nextjs-developer\\\", \"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"\\\"code\\\": {\\\"file_path\\\": \\\"pages/index.tsx\\\", \\\"code\\\": \\\"x\\\"}}\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let provider = Router::new().route(
            "/chat/completions",
            post(move || async move {
                ([(header::CONTENT_TYPE, "text/event-stream")], sse)
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, provider).await.unwrap() });

        let state = make_state(Overrides {
            completion_base: Some(format!("http://{}", addr)),
            ..Default::default()
        });
        let body = serde_json::json!({
            "messages": [{"role": "user", "content": "make an app"}],
            "template": "nextjs-developer",
        });
        let response = app(&state)
            .oneshot(json_request("POST", "/api/chat/completion", "u1", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/x-ndjson");

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let events: Vec<CompletionEvent> = String::from_utf8(bytes.to_vec())
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert!(events.len() >= 3);
        assert!(matches!(events[0], CompletionEvent::Delta { .. }));
        match events.last().unwrap() {
            CompletionEvent::Done { fragment } => {
                assert_eq!(fragment.template, Template::NextjsDeveloper);
            }
            other => panic!("stream must end in Done, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_webhook_updates_subscription_status() {
        let state = make_state(Overrides::default());
        let app = app(&state);

        // Seed a settings row bound to a billing customer.
        state
            .db
            .call(|db| db.set_stripe_customer_if_absent("u1", "cus_abc"))
            .await
            .unwrap();

        let payload = serde_json::json!({
            "type": "checkout.session.completed",
            "data": {"object": {"customer": "cus_abc"}},
        })
        .to_string();
        let now = chrono::Utc::now().timestamp();
        let request = Request::builder()
            .method("POST")
            .uri("/api/billing/webhook")
            .header("stripe-signature", sign_payload(payload.as_bytes(), "whsec_test", now))
            .body(Body::from(payload))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let ack: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(ack["received"], true);

        let response = app.clone().oneshot(get_request("/api/settings", "u1")).await.unwrap();
        let settings: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(settings["subscription_status"], "active");

        // Cancellation flips it back.
        let payload = serde_json::json!({
            "type": "customer.subscription.deleted",
            "data": {"object": {"customer": "cus_abc"}},
        })
        .to_string();
        let request = Request::builder()
            .method("POST")
            .uri("/api/billing/webhook")
            .header("stripe-signature", sign_payload(payload.as_bytes(), "whsec_test", now))
            .body(Body::from(payload))
            .unwrap();
        app.clone().oneshot(request).await.unwrap();

        let response = app.oneshot(get_request("/api/settings", "u1")).await.unwrap();
        let settings: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(settings["subscription_status"], "canceled");
    }

    #[tokio::test]
    async fn test_webhook_rejects_bad_signature() {
        let state = make_state(Overrides::default());
        let app = app(&state);
        let payload = serde_json::json!({"type": "checkout.session.completed"}).to_string();
        let now = chrono::Utc::now().timestamp();

        let tampered = Request::builder()
            .method("POST")
            .uri("/api/billing/webhook")
            .header("stripe-signature", sign_payload(b"other body", "whsec_test", now))
            .body(Body::from(payload.clone()))
            .unwrap();
        let response = app.clone().oneshot(tampered).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let unsigned = Request::builder()
            .method("POST")
            .uri("/api/billing/webhook")
            .body(Body::from(payload))
            .unwrap();
        let response = app.oneshot(unsigned).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_checkout_without_price_id_is_rejected_before_vendor_call() {
        // Billing vendor is unreachable; a 400 proves we never got there.
        let state = make_state(Overrides::default());
        let app = app(&state);

        let empty = json_request("POST", "/api/billing/checkout", "u1", serde_json::json!({}));
        let response = app.clone().oneshot(empty).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let blank = json_request(
            "POST",
            "/api/billing/checkout",
            "u1",
            serde_json::json!({"price_id": "  "}),
        );
        let response = app.oneshot(blank).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_sandbox_threads_caller_key() {
        let auths = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sandbox_base = spawn_sandbox_mock(auths.clone()).await;
        let state = make_state(Overrides {
            sandbox_base: Some(sandbox_base),
            ..Default::default()
        });

        let body = serde_json::json!({
            "fragment": {
                "template": "nextjs-developer",
                "code": [{"file_path": "pages/index.tsx", "file_content": "x"}]
            },
            "api_key": "sk-own"
        });
        let response = app(&state)
            .oneshot(json_request("POST", "/api/sandbox", "u1", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let result: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(result["url"], "https://3000-sbx-api.minigram.dev");
        assert_eq!(auths.lock().unwrap()[0], "Bearer sk-own");
    }

    #[tokio::test]
    async fn test_screenshot_body_uses_screenshot_key() {
        let browser_base = spawn_browser_mock().await;
        let state = make_state(Overrides {
            browser_base: Some(browser_base),
            ..Default::default()
        });

        let response = app(&state)
            .oneshot(json_request(
                "POST",
                "/api/screenshot",
                "u1",
                serde_json::json!({"url": "https://app.example"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(response.into_body()).await;
        let data_url = body["screenshot"].as_str().unwrap();
        assert!(data_url.starts_with("data:image/png;base64,"));
        assert!(body.get("screenshot_url").is_none());
    }

    #[tokio::test]
    async fn test_checkout_creates_customer_once() {
        use axum::routing::post;
        use std::sync::atomic::{AtomicUsize, Ordering};
        let customers = Arc::new(AtomicUsize::new(0));
        let counter = customers.clone();
        let billing = Router::new()
            .route(
                "/v1/customers",
                post(move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Json(serde_json::json!({"id": "cus_new"}))
                    }
                }),
            )
            .route(
                "/v1/checkout/sessions",
                post(|| async {
                    Json(serde_json::json!({"id": "cs_1", "url": "https://pay.example/cs_1"}))
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, billing).await.unwrap() });

        let state = make_state(Overrides {
            billing_base: Some(format!("http://{}", addr)),
            ..Default::default()
        });
        let app = app(&state);
        let body = serde_json::json!({
            "price_id": "price_pro",
            "success_url": "https://minigram.dev/ok",
            "cancel_url": "https://minigram.dev/no",
        });

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(json_request("POST", "/api/billing/checkout", "u1", body.clone()))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let checkout: serde_json::Value = body_json(response.into_body()).await;
            assert_eq!(checkout["url"], "https://pay.example/cs_1");
        }
        // Second checkout reuses the stored customer.
        assert_eq!(customers.load(Ordering::SeqCst), 1);
    }
}
