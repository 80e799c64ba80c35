//! Minigram — multi-tenant productivity and AI-app-generation back-end.
//!
//! ## Overview
//!
//! The server turns natural-language prompts into runnable app fragments:
//! a prompt is sent to the model provider, streamed back as a structured
//! fragment, executed in a freshly provisioned sandbox, screenshotted, and
//! optionally published to a public gallery. Around that core sit the
//! tenant features: tasks with attachments and per-task chat channels,
//! notifications, account settings with branding overrides, subscription
//! billing, and live presence over WebSocket.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP    ┌───────────────────────────────────────────────┐
//! │  Client  │ ────────> │  server.rs  (axum Router, ServerConfig)       │
//! │          │ <──────── │    └─ api.rs  (route handlers, AppState)      │
//! └──────────┘ WebSocket │         │                                     │
//!                        │         │ CompletionClient::stream_fragment() │
//!                        │         v                                     │
//!                        │  completion  (SSE consumer, NDJSON events)    │
//!                        │         │                                     │
//!                        │         │ SandboxClient::execute()            │
//!                        │         v                                     │
//!                        │  sandbox  (provision, install, write, run)    │
//!                        │         │                                     │
//!                        │         │ BrowserClient::capture()            │
//!                        │         v                                     │
//!                        │  screenshot  (session, overlay hiding, PNG)   │
//!                        └───────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module       | Responsibility                                         |
//! |--------------|--------------------------------------------------------|
//! | `models`     | Shared types: `Fragment`, `Task`, `Minigraph`          |
//! | `db`         | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)    |
//! | `ws`         | Presence socket: snapshot + join/leave feed            |
//! | `ratelimit`  | Per-user daily generation quota (crate root)           |
//! | `billing`    | Checkout sessions + webhook verification (crate root)  |
//! | `chat`       | Per-task channel provisioning (crate root)             |
//!
//! ## Typical Request Flow (generate → run → publish)
//!
//! 1. `POST /api/chat/completion` → quota check, system prompt assembled
//!    from the template catalog plus the tenant's branding overrides, then
//!    the model stream is relayed as NDJSON `CompletionEvent`s ending in
//!    `Done { fragment }`.
//! 2. `POST /api/sandbox` with that fragment → `SandboxClient::execute()`
//!    provisions an environment, installs extra dependencies, fans out the
//!    file writes, and answers with either interpreter output or the app's
//!    routable URL.
//! 3. `POST /api/minigraphs` publishes the app: a screenshot is captured
//!    through the browser service (model-suggested overlays hidden) and the
//!    entry becomes publicly listable.

pub mod api;
pub mod db;
pub mod models;
pub mod server;
pub mod ws;
