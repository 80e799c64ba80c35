pub mod analytics;
pub mod billing;
pub mod chat;
pub mod completion;
pub mod config;
pub mod errors;
pub mod presence;
pub mod prompt;
pub mod ratelimit;
pub mod sandbox;
pub mod screenshot;
pub mod server;
pub mod templates;
