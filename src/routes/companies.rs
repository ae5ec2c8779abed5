use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    db::tenant::provision_tenant_schema,
    middleware::{admin::AdminAuth, rate_limit::check_rate_limit},
    models::tenant::{Company, CreateCompanyRequest, SignupRequest, UpdateCompanyRequest},
    AppState,
};

const RESERVED_SLUGS: &[&str] = &[
    "www", "api", "app", "admin", "login", "signup", "register", "support",
    "billing", "status", "about", "contact", "docs", "metrics", "health", "demo",
];

fn is_valid_signup_slug(s: &str) -> bool {
    let len = s.len();
    len >= 3
        && len <= 32
        && s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

/// Extracts the real client IP from nginx-forwarded headers.
/// Priority: X-Real-IP → first X-Forwarded-For entry.
fn real_ip(headers: &HeaderMap) -> String {
    if let Some(ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        return ip.to_string();
    }
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            return first.trim().to_string();
        }
    }
    "unknown".to_string()
}

/// Second phase of company creation. A provisioning failure rolls the
/// just-inserted catalog row back, so the two-phase create behaves like a
/// single transaction from the caller's point of view: either the company
/// exists with a working schema, or it does not exist at all.
async fn provision_or_rollback(
    state: &AppState,
    company: &Company,
) -> Result<(), (StatusCode, Json<Value>)> {
    if let Err(e) = provision_tenant_schema(&state.db, &company.slug).await {
        tracing::error!("Schema provisioning failed for '{}': {e}", company.slug);
        if let Err(cleanup) = sqlx::query("DELETE FROM companies WHERE id = $1")
            .bind(company.id)
            .execute(&state.db)
            .await
        {
            tracing::error!(
                "Rollback of company row '{}' failed, orphan row left behind: {cleanup}",
                company.slug
            );
        }
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("Schema provisioning failed: {e}") })),
        ));
    }
    Ok(())
}

fn map_insert_error(e: sqlx::Error) -> (StatusCode, Json<Value>) {
    let msg = e.to_string();
    if msg.contains("unique") || msg.contains("duplicate") || msg.contains("already exists") {
        (
            StatusCode::CONFLICT,
            Json(json!({ "error": "This identifier is already taken. Choose another one." })),
        )
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": msg })))
    }
}

// ─── Public self-serve signup ─────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CheckSlugQuery {
    pub slug: String,
}

pub async fn check_slug(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<CheckSlugQuery>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    // Rate limit: 30/min per IP (nginx already limits upstream, this is a backstop)
    {
        let ip = real_ip(&headers);
        let key = format!("rate:check-slug:ip:{ip}");
        let mut redis = state.redis.clone();
        check_rate_limit(&mut redis, &key, 30, 60).await?;
    }

    let slug = params.slug.to_lowercase();

    if !is_valid_signup_slug(&slug) {
        return Ok((
            StatusCode::OK,
            Json(json!({
                "available": false,
                "reason": "The identifier must be 3 to 32 characters (lowercase letters, digits, hyphens)."
            })),
        ));
    }

    if RESERVED_SLUGS.contains(&slug.as_str()) {
        return Ok((
            StatusCode::OK,
            Json(json!({ "available": false, "reason": "This identifier is reserved." })),
        ));
    }

    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM companies WHERE slug = $1)")
            .bind(&slug)
            .fetch_one(&state.db)
            .await
            .unwrap_or(true);

    if exists {
        Ok((
            StatusCode::OK,
            Json(json!({ "available": false, "reason": "This identifier is already taken." })),
        ))
    } else {
        Ok((StatusCode::OK, Json(json!({ "available": true }))))
    }
}

pub async fn signup(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SignupRequest>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let ip = real_ip(&headers);
    let mut redis = state.redis.clone();

    // Rate limit 1: 5 signups/hour per IP (prevents one source from abusing)
    check_rate_limit(&mut redis, &format!("rate:signup:ip:{ip}"), 5, 3600).await?;

    // Rate limit 2: 20 signups/hour globally (total cap across all IPs)
    check_rate_limit(&mut redis, "rate:signup:global", 20, 3600).await?;

    let slug = body.slug.to_lowercase();

    if !is_valid_signup_slug(&slug) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "The identifier must be 3 to 32 characters (lowercase letters, digits, hyphens), without a leading or trailing hyphen." })),
        ));
    }

    if RESERVED_SLUGS.contains(&slug.as_str()) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "This identifier is reserved." })),
        ));
    }

    if !body.email.contains('@') {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Invalid email address." })),
        ));
    }

    if body.name.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "The company name is required." })),
        ));
    }

    if body.first_name.trim().is_empty() || body.last_name.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "First and last name are required." })),
        ));
    }

    // 1. Insert the catalog row (default quotas)
    let company = sqlx::query_as::<_, Company>(
        "INSERT INTO companies (slug, name, contact_phone, contact_email)
         VALUES ($1, $2, $3, $4)
         RETURNING *",
    )
    .bind(&slug)
    .bind(body.name.trim())
    .bind(body.contact_phone.as_deref().filter(|s| !s.trim().is_empty()))
    .bind(&body.email)
    .fetch_one(&state.db)
    .await
    .map_err(map_insert_error)?;

    // 2. Provision the tenant schema (rolls the row back on failure)
    provision_or_rollback(&state, &company).await?;

    // 3. Seed the first admin user inside the new schema
    let tenant_db = state.tenants.get_or_create(&slug).await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
    })?;

    sqlx::query(
        "INSERT INTO users (email, first_name, last_name, role)
         VALUES ($1, $2, $3, 'admin'::user_role)",
    )
    .bind(&body.email)
    .bind(body.first_name.trim())
    .bind(body.last_name.trim())
    .execute(&tenant_db)
    .await
    .map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
    })?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": company.id,
            "slug": company.slug,
            "name": company.name,
        })),
    ))
}

// ─── Company administration ───────────────────────────────────────────────────

pub async fn list_companies(
    State(state): State<AppState>,
    _auth: AdminAuth,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    sqlx::query_as::<_, Company>(
        "SELECT * FROM companies WHERE deleted_at IS NULL ORDER BY name",
    )
    .fetch_all(&state.db)
    .await
    .map(|items| Json(serde_json::to_value(items).unwrap()))
    .map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
    })
}

pub async fn create_company(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Json(body): Json<CreateCompanyRequest>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let slug = body.slug.to_lowercase();
    if !is_valid_signup_slug(&slug) || RESERVED_SLUGS.contains(&slug.as_str()) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Invalid or reserved company identifier" })),
        ));
    }

    let company = sqlx::query_as::<_, Company>(
        "INSERT INTO companies
            (slug, name, contact_email, contact_phone, max_users, max_objects, storage_quota_mb)
         VALUES ($1, $2, $3, $4,
                 COALESCE($5, 25), COALESCE($6, 500), COALESCE($7, 1024))
         RETURNING *",
    )
    .bind(&slug)
    .bind(&body.name)
    .bind(&body.contact_email)
    .bind(&body.contact_phone)
    .bind(body.max_users)
    .bind(body.max_objects)
    .bind(body.storage_quota_mb)
    .fetch_one(&state.db)
    .await
    .map_err(map_insert_error)?;

    provision_or_rollback(&state, &company).await?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::to_value(company).unwrap()),
    ))
}

pub async fn update_company(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Path(slug): Path<String>,
    Json(body): Json<UpdateCompanyRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let company = sqlx::query_as::<_, Company>(
        "UPDATE companies SET
           name             = COALESCE($2, name),
           contact_email    = COALESCE($3, contact_email),
           contact_phone    = COALESCE($4, contact_phone),
           is_active        = COALESCE($5, is_active),
           max_users        = COALESCE($6, max_users),
           max_objects      = COALESCE($7, max_objects),
           storage_quota_mb = COALESCE($8, storage_quota_mb),
           updated_at       = NOW()
         WHERE slug = $1 AND deleted_at IS NULL
         RETURNING *",
    )
    .bind(&slug)
    .bind(&body.name)
    .bind(&body.contact_email)
    .bind(&body.contact_phone)
    .bind(body.is_active)
    .bind(body.max_users)
    .bind(body.max_objects)
    .bind(body.storage_quota_mb)
    .fetch_optional(&state.db)
    .await
    .map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
    })?
    .ok_or((
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "Company not found" })),
    ))?;

    // Deactivation must evict the cached handle so the next resolution sees
    // the inactive row instead of reusing a stale schema-bound pool.
    if body.is_active == Some(false) {
        state.tenants.invalidate(&slug).await;
    }

    Ok(Json(serde_json::to_value(company).unwrap()))
}

/// Soft delete: the schema and its rows stay for audit retention; the company
/// disappears from resolution and listings.
pub async fn delete_company(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Path(slug): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let deleted = sqlx::query(
        "UPDATE companies SET is_active = FALSE, deleted_at = NOW()
         WHERE slug = $1 AND deleted_at IS NULL",
    )
    .bind(&slug)
    .execute(&state.db)
    .await
    .map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
    })?;

    if deleted.rows_affected() == 0 {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Company not found" })),
        ));
    }

    state.tenants.invalidate(&slug).await;

    Ok(Json(json!({ "message": "Company deleted" })))
}

// ─── Cache administration ─────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ClearCacheQuery {
    pub slug: Option<String>,
}

/// Evict one or all cached tenant handles. Used after credential rotation or
/// out-of-band tenant changes.
pub async fn clear_cache(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Query(params): Query<ClearCacheQuery>,
) -> Json<Value> {
    match params.slug {
        Some(slug) => {
            state.tenants.invalidate(&slug).await;
            Json(json!({ "message": format!("Cache cleared for '{slug}'") }))
        }
        None => {
            state.tenants.invalidate_all().await;
            Json(json!({ "message": "Cache cleared for all tenants" }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signup_slug_rules() {
        assert!(is_valid_signup_slug("acme"));
        assert!(is_valid_signup_slug("north-west-42"));
        assert!(!is_valid_signup_slug("ab"));
        assert!(!is_valid_signup_slug("Acme"));
        assert!(!is_valid_signup_slug("-acme"));
        assert!(!is_valid_signup_slug(&"x".repeat(33)));
    }

    #[test]
    fn reserved_slugs_cover_public_routes() {
        for slug in ["www", "api", "admin", "signup", "metrics", "health"] {
            assert!(RESERVED_SLUGS.contains(&slug));
        }
    }
}
