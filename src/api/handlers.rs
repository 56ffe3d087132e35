//! Health and status endpoints

use axum::{
    Json,
    extract::{Query, State as AxumState},
    response::IntoResponse,
};
use serde_json::json;
use std::collections::HashMap;
use tracing::warn;

use crate::SharedState;

/// Root health check endpoint
/// Supports ?format=json for detailed JSON response
pub async fn root(
    AxumState(state): AxumState<SharedState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let format = params.get("format").map(|s| s.as_str());

    if format == Some("json") {
        Json(json!({
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_seconds": state.start_time.elapsed().as_secs(),
            "status": "healthy"
        }))
        .into_response()
    } else {
        format!("{} - healthy", env!("CARGO_PKG_NAME")).into_response()
    }
}

/// Server info, configured tables and audit totals
pub async fn status(AxumState(state): AxumState<SharedState>) -> impl IntoResponse {
    let config = state.config_snapshot();

    let audit_counts = match &state.audit_store {
        Some(store) => match store.get_outcome_counts().await {
            Ok(counts) => Some(counts),
            Err(e) => {
                warn!("Could not count audit records: {}", e);
                None
            }
        },
        None => None,
    };

    Json(json!({
        "server": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "started_at": state.started_at,
            "uptime_seconds": state.start_time.elapsed().as_secs(),
            "reply_mode": config.server.reply_mode,
        },
        "config": {
            "services": config.services.iter().map(|s| &s.alias).collect::<Vec<_>>(),
            "service_count": config.services.len(),
            "environments": config.environments.iter().map(|e| &e.alias).collect::<Vec<_>>(),
            "environment_count": config.environments.len(),
            "allowed_users": config.auth.allowed_user_ids.len(),
        },
        "audit": {
            "persistent": state.audit_store.is_some(),
            "counts": audit_counts,
        }
    }))
}
