use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::handle::TenantPools;
use crate::services::sync::{RetryKind, SyncDispatcher, SyncErrorService};

/// Due retries picked up per tenant per sweep.
const BATCH_SIZE: i64 = 20;

/// Spawn the background retry worker. Every poll interval it walks the active
/// tenants, requeues sync errors stuck in `processing`, and dispatches the
/// retries that have come due. Runs detached from any request for the whole
/// process lifetime.
pub fn start(
    catalog: PgPool,
    tenants: Arc<TenantPools>,
    dispatcher: Arc<dyn SyncDispatcher>,
    config: Arc<Config>,
) {
    tokio::spawn(async move {
        let poll = Duration::from_secs(config.sync_poll_secs);
        loop {
            tokio::time::sleep(poll).await;
            if let Err(e) = sweep(&catalog, &tenants, dispatcher.as_ref(), &config).await {
                warn!("Sync retry worker: sweep failed: {e}");
            }
        }
    });
}

async fn sweep(
    catalog: &PgPool,
    tenants: &TenantPools,
    dispatcher: &dyn SyncDispatcher,
    config: &Config,
) -> anyhow::Result<()> {
    let slugs: Vec<String> = sqlx::query_scalar(
        "SELECT slug FROM companies WHERE is_active = TRUE AND deleted_at IS NULL",
    )
    .fetch_all(catalog)
    .await?;

    let timeout = Duration::from_secs(config.sync_dispatch_timeout_secs);
    let stale_before = Utc::now() - chrono::Duration::seconds(config.sync_stuck_after_secs);

    for slug in slugs {
        let db = match tenants.get_or_create(&slug).await {
            Ok(db) => db,
            Err(e) => {
                warn!("Sync retry worker: no handle for '{slug}': {e}");
                continue;
            }
        };

        match SyncErrorService::requeue_stuck(&db, stale_before).await {
            Ok(0) => {}
            Ok(n) => info!("Sync retry worker: requeued {n} stuck record(s) for '{slug}'"),
            Err(e) => warn!("Sync retry worker: requeue for '{slug}' failed: {e}"),
        }

        let due = match SyncErrorService::due(&db, BATCH_SIZE).await {
            Ok(due) => due,
            Err(e) => {
                warn!("Sync retry worker: due scan for '{slug}' failed: {e}");
                continue;
            }
        };

        for record in due {
            match SyncErrorService::run_retry(
                &db,
                dispatcher,
                &slug,
                record.id,
                RetryKind::Auto,
                timeout,
            )
            .await
            {
                Ok(_) => {}
                Err(e) => warn!(
                    "Sync retry worker: attempt for {} ('{slug}') failed: {e}",
                    record.id
                ),
            }
        }
    }

    Ok(())
}
