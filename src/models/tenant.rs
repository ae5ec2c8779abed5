use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A customer company. One row per tenant in `public.companies`; all of the
/// company's business data lives in its own schema (`tenant_<slug>`).
/// The slug — and therefore the schema name — is immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Company {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub max_users: i32,
    pub max_objects: i32,
    pub storage_quota_mb: i32,
    pub is_active: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Resource limits snapshot handed to request handlers at resolution time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, FromRow)]
pub struct CompanyQuotas {
    pub max_users: i32,
    pub max_objects: i32,
    pub storage_quota_mb: i32,
}

#[derive(Debug, Deserialize)]
pub struct CreateCompanyRequest {
    pub slug: String,
    pub name: String,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub max_users: Option<i32>,
    pub max_objects: Option<i32>,
    pub storage_quota_mb: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateCompanyRequest {
    pub name: Option<String>,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub is_active: Option<bool>,
    pub max_users: Option<i32>,
    pub max_objects: Option<i32>,
    pub storage_quota_mb: Option<i32>,
}

/// Self-serve onboarding payload. Creates the company row, provisions the
/// schema and seeds the first admin user inside it.
#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub slug: String,
    pub name: String,
    pub contact_phone: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}
