use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::{middleware::tenant::TenantContext, AppState};

/// Resolved-tenant metadata for the frontend shell.
pub async fn get_company_info(
    State(state): State<AppState>,
    ctx: TenantContext,
) -> (StatusCode, Json<Value>) {
    let row: Option<(String, Option<String>)> = sqlx::query_as(
        "SELECT name, contact_email FROM companies WHERE slug = $1 AND deleted_at IS NULL",
    )
    .bind(&ctx.slug)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten();

    match row {
        Some((name, contact_email)) => (
            StatusCode::OK,
            Json(json!({
                "slug": ctx.slug,
                "name": name,
                "contact_email": contact_email,
                "quotas": {
                    "max_users": ctx.quotas.max_users,
                    "max_objects": ctx.quotas.max_objects,
                    "storage_quota_mb": ctx.quotas.storage_quota_mb,
                },
            })),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Tenant not found" })),
        ),
    }
}
