//! Audit log API endpoints

use axum::{
    Json,
    extract::{Path, Query, State as AxumState},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::SharedState;
use crate::audit::AuditRecord;

/// Query parameters for audit listing
#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    /// Filter by outcome (success, denied, error)
    pub outcome: Option<String>,
    /// Filter by chat user id
    pub user_id: Option<String>,
    /// Number of items (default: 50, max: 200)
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct AuditResponse {
    pub records: Vec<AuditRecord>,
    pub count: usize,
    pub limit: i64,
}

fn no_store() -> axum::response::Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "Audit database is not configured"})),
    )
        .into_response()
}

/// GET /api/audit - Recent audit records with filters
pub async fn get_audit_records(
    AxumState(state): AxumState<SharedState>,
    Query(params): Query<AuditQuery>,
) -> impl IntoResponse {
    let Some(store) = &state.audit_store else {
        return no_store();
    };
    let limit = params.limit.unwrap_or(50).clamp(1, 200);

    let outcome = match params.outcome.as_deref().map(str::to_lowercase) {
        Some(o) if !matches!(o.as_str(), "success" | "denied" | "error") => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Invalid outcome. Use: success, denied, error"})),
            )
                .into_response();
        }
        other => other,
    };

    let result = match (params.user_id.as_deref(), outcome.as_deref()) {
        (Some(user_id), Some(outcome)) => {
            store
                .get_records_by_user_and_outcome(user_id, outcome, limit)
                .await
        }
        (Some(user_id), None) => store.get_records_by_user(user_id, limit).await,
        (None, Some(outcome)) => store.get_records_by_outcome(outcome, limit).await,
        (None, None) => store.get_recent_records(limit).await,
    };

    match result {
        Ok(records) => Json(AuditResponse {
            count: records.len(),
            records,
            limit,
        })
        .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

/// GET /api/audit/{id} - One audit record
pub async fn get_audit_record(
    AxumState(state): AxumState<SharedState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let Some(store) = &state.audit_store else {
        return no_store();
    };

    match store.get_record(&id).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Audit record not found"})),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}
