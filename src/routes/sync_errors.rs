use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    middleware::tenant::TenantContext,
    models::sync_error::{SyncError, SyncStatus},
    services::sync::{RetryKind, SyncErrorFilter, SyncErrorService},
    AppState,
};

fn internal(e: anyhow::Error) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
}

fn not_found() -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "Sync error not found" })),
    )
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub external_service: Option<String>,
    pub entity_type: Option<String>,
    pub limit: Option<i64>,
}

pub async fn list_sync_errors(
    ctx: TenantContext,
    Query(params): Query<ListQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let status = match &params.status {
        Some(s) => Some(SyncStatus::parse(s).ok_or((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("Unknown status '{s}'") })),
        ))?),
        None => None,
    };

    let filter = SyncErrorFilter {
        status,
        external_service: params.external_service,
        entity_type: params.entity_type,
    };
    let limit = params.limit.unwrap_or(100).clamp(1, 500);

    let records = SyncErrorService::list(&ctx.db, &filter, limit)
        .await
        .map_err(internal)?;

    Ok(Json(serde_json::to_value(records).unwrap()))
}

pub async fn get_sync_error(
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> Result<Json<SyncError>, (StatusCode, Json<Value>)> {
    SyncErrorService::get(&ctx.db, id)
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or_else(not_found)
}

/// Operator-triggered retry. Only `pending` records are eligible: `failed`
/// ones must be reopened first, and `processing` means a retry already holds
/// the claim.
pub async fn retry_sync_error(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let record = SyncErrorService::get(&ctx.db, id)
        .await
        .map_err(internal)?
        .ok_or_else(not_found)?;

    if !record.can_retry_manually() {
        let reason = match record.status {
            SyncStatus::Processing => "A retry is already in progress",
            SyncStatus::Resolved => "Record is already resolved",
            SyncStatus::Failed => "Retries are exhausted — reopen the record first",
            SyncStatus::Pending => unreachable!(),
        };
        return Err((StatusCode::CONFLICT, Json(json!({ "error": reason }))));
    }

    let timeout = Duration::from_secs(state.config.sync_dispatch_timeout_secs);
    let outcome = SyncErrorService::run_retry(
        &ctx.db,
        state.dispatcher.as_ref(),
        &ctx.slug,
        id,
        RetryKind::Manual,
        timeout,
    )
    .await
    .map_err(internal)?;

    match outcome {
        Some(status) => Ok(Json(json!({ "id": id, "status": status.as_str() }))),
        None => Err((
            StatusCode::CONFLICT,
            Json(json!({ "error": "Record was claimed by another retry" })),
        )),
    }
}

/// Close an error out by hand, from any state.
pub async fn resolve_sync_error(
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> Result<Json<SyncError>, (StatusCode, Json<Value>)> {
    SyncErrorService::resolve_manual(&ctx.db, id)
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or_else(not_found)
}

/// Put an exhausted (`failed`) record back into rotation.
pub async fn reopen_sync_error(
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> Result<Json<SyncError>, (StatusCode, Json<Value>)> {
    if let Some(record) = SyncErrorService::reopen(&ctx.db, id).await.map_err(internal)? {
        return Ok(Json(record));
    }

    match SyncErrorService::get(&ctx.db, id).await.map_err(internal)? {
        None => Err(not_found()),
        Some(_) => Err((
            StatusCode::CONFLICT,
            Json(json!({ "error": "Only failed records can be reopened" })),
        )),
    }
}

/// Requeue records stuck in `processing` past the staleness threshold —
/// the manual recovery path when a worker died mid-retry.
pub async fn requeue_stuck(
    State(state): State<AppState>,
    ctx: TenantContext,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let stale_before = Utc::now() - chrono::Duration::seconds(state.config.sync_stuck_after_secs);
    let requeued = SyncErrorService::requeue_stuck(&ctx.db, stale_before)
        .await
        .map_err(internal)?;

    Ok(Json(json!({ "requeued": requeued })))
}
