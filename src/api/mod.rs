//! API module for all HTTP handlers
//!
//! The slash command endpoint plus a few read-only operational endpoints.

pub mod audit;
pub mod config;
pub mod handlers;
pub mod slash;

use axum::{Router, routing};

use crate::SharedState;

// Re-export handlers
pub use audit::{get_audit_record, get_audit_records};
pub use config::{get_config, reload_config_endpoint};
pub use handlers::{root, status};
pub use slash::handle_slash_command;

/// All routes, bound to the shared state.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/", routing::get(root))
        .route("/slack/command", routing::post(handle_slash_command))
        .route("/api/status", routing::get(status))
        .route("/api/audit", routing::get(get_audit_records))
        .route("/api/audit/{id}", routing::get(get_audit_record))
        .route("/api/config", routing::get(get_config))
        .route("/api/reload", routing::post(reload_config_endpoint))
        .with_state(state)
}
