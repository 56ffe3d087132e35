//! Config inspection and reload

use axum::{Json, extract::State as AxumState, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::{
    DispatchConfig, EnvironmentDescriptor, ReplyMode, ServiceDescriptor, SharedState,
    reload_config,
};

/// The tables a request would resolve against right now.
#[derive(Debug, Serialize)]
pub struct ActiveTables {
    pub reply_mode: ReplyMode,
    pub services: Vec<ServiceDescriptor>,
    pub environments: Vec<EnvironmentDescriptor>,
    pub allowed_users: usize,
    pub allowed_teams: usize,
}

impl From<&DispatchConfig> for ActiveTables {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            reply_mode: config.server.reply_mode,
            services: config.services.clone(),
            environments: config.environments.clone(),
            allowed_users: config.auth.allowed_user_ids.len(),
            allowed_teams: config.auth.allowed_team_ids.len(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ConfigView {
    pub path: String,
    /// File as it is on disk now; may be ahead of `active` until a reload.
    pub file_toml: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_error: Option<String>,
    pub active: ActiveTables,
}

/// GET /api/config
pub async fn get_config(AxumState(state): AxumState<SharedState>) -> impl IntoResponse {
    let active = ActiveTables::from(state.config_snapshot().as_ref());

    let (file_toml, file_error) = match tokio::fs::read_to_string(&state.config_path).await {
        Ok(content) => (Some(content), None),
        Err(e) => {
            warn!("Could not read {:?}: {}", state.config_path, e);
            (None, Some(e.to_string()))
        }
    };

    Json(ConfigView {
        path: state.config_path.to_string_lossy().into_owned(),
        file_toml,
        file_error,
        active,
    })
}

/// POST /api/reload - Swap in lookup tables and allowlists from disk
///
/// Requests already in flight keep the snapshot they started with.
/// `[build]` and `[audit]` settings only take effect on restart.
pub async fn reload_config_endpoint(AxumState(state): AxumState<SharedState>) -> impl IntoResponse {
    match reload_config(&state.config_path).await {
        Ok(new_config) => {
            let active = ActiveTables::from(&new_config);
            state.replace_config(new_config);
            info!(
                "Reloaded {:?}: {} services, {} environments",
                state.config_path,
                active.services.len(),
                active.environments.len()
            );
            Json(json!({ "reloaded": true, "active": active })).into_response()
        }
        Err(e) => {
            error!("Reload of {:?} rejected, keeping current tables: {}", state.config_path, e);
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({ "reloaded": false, "error": e.to_string() })),
            )
                .into_response()
        }
    }
}
