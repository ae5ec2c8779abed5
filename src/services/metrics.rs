use std::sync::Arc;

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec, Counter,
    CounterVec, Gauge, GaugeVec,
};
use sqlx::PgPool;
use tracing::{info, warn};

use crate::db::handle::TenantPools;

lazy_static! {
    // ── Routing layer ───────────────────────────────────────────────────────
    pub static ref HANDLE_CACHE_HITS: CounterVec = register_counter_vec!(
        "tenant_handle_cache_hits_total",
        "Schema-handle cache hits per tenant",
        &["tenant"]
    ).unwrap();

    pub static ref HANDLE_CACHE_MISSES: CounterVec = register_counter_vec!(
        "tenant_handle_cache_misses_total",
        "Schema-handle cache misses per tenant",
        &["tenant"]
    ).unwrap();

    pub static ref HANDLES_CACHED: Gauge = register_gauge!(
        "tenant_handles_cached",
        "Schema-bound handles currently cached"
    ).unwrap();

    pub static ref SCHEMAS_PROVISIONED: Counter = register_counter!(
        "tenant_schemas_provisioned_total",
        "Provisioner runs completed, including idempotent re-runs"
    ).unwrap();

    // ── Sync resilience ─────────────────────────────────────────────────────
    pub static ref SYNC_RETRIES: CounterVec = register_counter_vec!(
        "sync_retries_total",
        "Sync retry attempts per tenant and resulting status",
        &["tenant", "outcome"]
    ).unwrap();

    pub static ref SYNC_ERRORS_OPEN: GaugeVec = register_gauge_vec!(
        "sync_errors_open",
        "Unresolved sync errors per tenant and status",
        &["tenant", "status"]
    ).unwrap();

    pub static ref COMPANIES_ACTIVE: Gauge = register_gauge!(
        "companies_active_total",
        "Number of active companies"
    ).unwrap();
}

/// Spawn the background metrics collector (refreshes every 5 minutes).
pub fn start(pool: PgPool, tenants: Arc<TenantPools>) {
    tokio::spawn(async move {
        // Initial collection on startup
        if let Err(e) = collect(&pool, &tenants).await {
            warn!("Metrics: initial collection failed: {e}");
        }
        loop {
            tokio::time::sleep(tokio::time::Duration::from_secs(300)).await;
            if let Err(e) = collect(&pool, &tenants).await {
                warn!("Metrics: collection failed: {e}");
            }
        }
    });
}

async fn collect(pool: &PgPool, tenants: &TenantPools) -> anyhow::Result<()> {
    let slugs: Vec<String> = sqlx::query_scalar(
        "SELECT slug FROM companies WHERE is_active = TRUE AND deleted_at IS NULL",
    )
    .fetch_all(pool)
    .await?;

    COMPANIES_ACTIVE.set(slugs.len() as f64);

    for slug in &slugs {
        let db = match tenants.get_or_create(slug).await {
            Ok(db) => db,
            Err(e) => {
                warn!("Metrics: no handle for '{slug}': {e}");
                continue;
            }
        };

        // Unresolved error counts; runs on the schema-bound handle.
        let counts: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status::TEXT, COUNT(*)::BIGINT FROM sync_errors
             WHERE status <> 'resolved' GROUP BY status",
        )
        .fetch_all(&db)
        .await
        .unwrap_or_default();

        for status in ["pending", "processing", "failed"] {
            let count = counts
                .iter()
                .find(|(s, _)| s == status)
                .map(|(_, c)| *c)
                .unwrap_or(0);
            SYNC_ERRORS_OPEN
                .with_label_values(&[slug, status])
                .set(count as f64);
        }
    }

    info!("Metrics: collected for {} tenant(s)", slugs.len());
    Ok(())
}
