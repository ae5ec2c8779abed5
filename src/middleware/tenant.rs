use axum::{
    extract::{FromRequestParts, Request, State},
    http::{request::Parts, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use sqlx::PgPool;
use thiserror::Error;

use crate::db::tenant::schema_name;
use crate::models::tenant::CompanyQuotas;
use crate::AppState;

/// Validates that a slug only contains lowercase ASCII letters, digits and hyphens,
/// does not start or end with a hyphen, and is between 2 and 63 characters.
/// This prevents SQL injection via the slug used in format!() schema DDL.
pub fn is_valid_slug(s: &str) -> bool {
    let len = s.len();
    len >= 2
        && len <= 63
        && s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

/// Why a request could not be routed to a tenant. Malformed or unknown
/// identities are unauthorized; a known-but-deactivated tenant is forbidden.
#[derive(Debug, Error)]
pub enum TenantError {
    #[error("Invalid tenant identifier")]
    IdentityMalformed,
    #[error("Tenant not found")]
    NotFound,
    #[error("Account is inactive")]
    Inactive,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Handle(#[from] anyhow::Error),
}

impl TenantError {
    pub fn status(&self) -> StatusCode {
        match self {
            TenantError::IdentityMalformed | TenantError::NotFound => StatusCode::UNAUTHORIZED,
            TenantError::Inactive => StatusCode::FORBIDDEN,
            TenantError::Database(_) | TenantError::Handle(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for TenantError {
    fn into_response(self) -> Response {
        let message = match &self {
            TenantError::Database(e) => {
                tracing::error!("Tenant resolution: database error: {e}");
                "Database error".to_string()
            }
            TenantError::Handle(e) => {
                tracing::error!("Tenant resolution: handle error: {e}");
                "Could not open tenant database handle".to_string()
            }
            other => other.to_string(),
        };
        (self.status(), Json(json!({ "error": message }))).into_response()
    }
}

/// Everything downstream handlers need about the acting tenant: the slug, the
/// schema it maps to, the quota snapshot, and the schema-bound handle.
#[derive(Clone)]
pub struct TenantContext {
    pub slug: String,
    pub schema: String,
    pub quotas: CompanyQuotas,
    pub db: PgPool,
}

/// Extracts the tenant slug from the `X-Tenant` header or first subdomain.
fn extract_slug(headers: &HeaderMap) -> Result<String, TenantError> {
    // 1. X-Tenant header
    if let Some(tenant) = headers
        .get("X-Tenant")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
        .filter(|s| !s.is_empty())
    {
        if !is_valid_slug(&tenant) {
            return Err(TenantError::IdentityMalformed);
        }
        return Ok(tenant);
    }

    // 2. Subdomain from Host header
    if let Some(host) = headers.get("Host").and_then(|v| v.to_str().ok()) {
        let domain = host.split(':').next().unwrap_or(host);
        let parts: Vec<&str> = domain.split('.').collect();
        if parts.len() >= 3 {
            let subdomain = parts[0].to_lowercase();
            if subdomain != "www" && subdomain != "api" {
                if !is_valid_slug(&subdomain) {
                    return Err(TenantError::IdentityMalformed);
                }
                return Ok(subdomain);
            }
        }
    }

    // Absence on a tenant-scoped route is a rejection, not a default.
    Err(TenantError::IdentityMalformed)
}

/// Looks the slug up in the catalog and, for an active tenant, obtains the
/// schema-bound handle from the cache. The activity check always runs against
/// the catalog row, so a deactivated tenant is rejected even while its handle
/// is still cached.
async fn resolve(state: &AppState, slug: &str) -> Result<TenantContext, TenantError> {
    let row: Option<(bool, i32, i32, i32)> = sqlx::query_as(
        "SELECT is_active, max_users, max_objects, storage_quota_mb
         FROM companies WHERE slug = $1 AND deleted_at IS NULL",
    )
    .bind(slug)
    .fetch_optional(&state.db)
    .await?;

    let (is_active, max_users, max_objects, storage_quota_mb) =
        row.ok_or(TenantError::NotFound)?;
    if !is_active {
        return Err(TenantError::Inactive);
    }

    let db = state.tenants.get_or_create(slug).await?;

    Ok(TenantContext {
        slug: slug.to_string(),
        schema: schema_name(slug),
        quotas: CompanyQuotas {
            max_users,
            max_objects,
            storage_quota_mb,
        },
        db,
    })
}

/// Middleware for tenant-scoped routes: resolve once, attach the context to
/// the request, short-circuit on failure before any business handler runs.
/// Public routes are simply not layered with this. Repeated invocation within
/// one request is a no-op — an already-attached context is reused.
pub async fn resolve_tenant(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, TenantError> {
    if request.extensions().get::<TenantContext>().is_none() {
        let slug = extract_slug(request.headers())?;
        let ctx = resolve(&state, &slug).await?;
        request.extensions_mut().insert(ctx);
    }
    Ok(next.run(request).await)
}

impl<S> FromRequestParts<S> for TenantContext
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<Value>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<TenantContext>().cloned().ok_or((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "Tenant middleware not applied to this route" })),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn slug_validation() {
        assert!(is_valid_slug("acme"));
        assert!(is_valid_slug("north-west-42"));
        assert!(is_valid_slug("ab"));

        assert!(!is_valid_slug("a"));
        assert!(!is_valid_slug("Acme"));
        assert!(!is_valid_slug("-acme"));
        assert!(!is_valid_slug("acme-"));
        assert!(!is_valid_slug("acme_corp"));
        assert!(!is_valid_slug("acme; DROP SCHEMA public"));
        assert!(!is_valid_slug(&"x".repeat(64)));
    }

    #[test]
    fn header_takes_priority_and_is_lowercased() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Tenant", HeaderValue::from_static("Acme"));
        headers.insert("Host", HeaderValue::from_static("beta.fieldserve.app"));
        assert_eq!(extract_slug(&headers).unwrap(), "acme");
    }

    #[test]
    fn subdomain_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert("Host", HeaderValue::from_static("acme.fieldserve.app:8080"));
        assert_eq!(extract_slug(&headers).unwrap(), "acme");

        let mut www = HeaderMap::new();
        www.insert("Host", HeaderValue::from_static("www.fieldserve.app"));
        assert!(matches!(
            extract_slug(&www),
            Err(TenantError::IdentityMalformed)
        ));
    }

    #[test]
    fn missing_identity_is_rejected() {
        let headers = HeaderMap::new();
        assert!(matches!(
            extract_slug(&headers),
            Err(TenantError::IdentityMalformed)
        ));
    }

    #[test]
    fn error_status_mapping() {
        assert_eq!(TenantError::IdentityMalformed.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(TenantError::NotFound.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(TenantError::Inactive.status(), StatusCode::FORBIDDEN);
    }
}
