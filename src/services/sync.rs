use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::sync_error::{NewSyncError, SyncError, SyncStatus, backoff_delay};
use crate::services::metrics;

/// Re-dispatches a previously failed synchronization against its external
/// system. Implementations must be safe to call concurrently for different
/// records; the tracker guarantees a single record is never dispatched twice
/// at the same time.
#[async_trait]
pub trait SyncDispatcher: Send + Sync {
    async fn dispatch(&self, tenant: &str, record: &SyncError) -> anyhow::Result<()>;
}

/// Default dispatcher: posts the operation to the webhook endpoint configured
/// for the record's external service. The client carries a hard timeout so an
/// unreachable system cannot pin a worker.
pub struct HttpSyncDispatcher {
    client: reqwest::Client,
    endpoints: HashMap<String, String>,
}

impl HttpSyncDispatcher {
    pub fn new(endpoints: HashMap<String, String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoints })
    }
}

#[async_trait]
impl SyncDispatcher for HttpSyncDispatcher {
    async fn dispatch(&self, tenant: &str, record: &SyncError) -> anyhow::Result<()> {
        let endpoint = self.endpoints.get(&record.external_service).ok_or_else(|| {
            anyhow::anyhow!(
                "no endpoint configured for external service '{}'",
                record.external_service
            )
        })?;

        let response = self
            .client
            .post(endpoint)
            .json(&serde_json::json!({
                "tenant": tenant,
                "action": record.operation.as_str(),
                "entity_type": record.entity_type,
                "entity_id": record.entity_id,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("{} returned {}", record.external_service, response.status());
        }
        Ok(())
    }
}

/// Who triggered a retry — determines the `resolved_by` marker on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryKind {
    Auto,
    Manual,
}

impl RetryKind {
    pub fn resolved_by(self) -> &'static str {
        match self {
            RetryKind::Auto => crate::models::sync_error::RESOLVED_BY_AUTO_RETRY,
            RetryKind::Manual => crate::models::sync_error::RESOLVED_BY_MANUAL_RETRY,
        }
    }
}

#[derive(Debug, Default)]
pub struct SyncErrorFilter {
    pub status: Option<SyncStatus>,
    pub external_service: Option<String>,
    pub entity_type: Option<String>,
}

/// Persistence operations for the tenant's `sync_errors` table. Every query
/// runs on a schema-bound handle, so table names stay unqualified.
pub struct SyncErrorService;

impl SyncErrorService {
    /// Record a fresh failure from an asynchronous sync job. The first retry
    /// is scheduled one backoff step out.
    pub async fn record_failure(db: &PgPool, new: NewSyncError) -> anyhow::Result<SyncError> {
        let next_retry_at = if new.retryable {
            Some(Utc::now() + backoff_delay(0))
        } else {
            None
        };

        let record = sqlx::query_as::<_, SyncError>(
            "INSERT INTO sync_errors
                (operation, entity_type, entity_id, external_service, message,
                 retryable, max_retries, next_retry_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING *",
        )
        .bind(new.operation)
        .bind(&new.entity_type)
        .bind(new.entity_id)
        .bind(&new.external_service)
        .bind(&new.message)
        .bind(new.retryable)
        .bind(new.max_retries)
        .bind(next_retry_at)
        .fetch_one(db)
        .await?;

        // Not retryable: park it as terminally failed right away.
        if !record.retryable {
            let failed = sqlx::query_as::<_, SyncError>(
                "UPDATE sync_errors SET status = $2 WHERE id = $1 RETURNING *",
            )
            .bind(record.id)
            .bind(SyncStatus::Failed)
            .fetch_one(db)
            .await?;
            return Ok(failed);
        }

        Ok(record)
    }

    pub async fn get(db: &PgPool, id: Uuid) -> anyhow::Result<Option<SyncError>> {
        let record = sqlx::query_as::<_, SyncError>("SELECT * FROM sync_errors WHERE id = $1")
            .bind(id)
            .fetch_optional(db)
            .await?;
        Ok(record)
    }

    pub async fn list(
        db: &PgPool,
        filter: &SyncErrorFilter,
        limit: i64,
    ) -> anyhow::Result<Vec<SyncError>> {
        let records = sqlx::query_as::<_, SyncError>(
            "SELECT * FROM sync_errors
             WHERE ($1::sync_status IS NULL OR status = $1)
               AND ($2::VARCHAR IS NULL OR external_service = $2)
               AND ($3::VARCHAR IS NULL OR entity_type = $3)
             ORDER BY created_at DESC
             LIMIT $4",
        )
        .bind(filter.status)
        .bind(&filter.external_service)
        .bind(&filter.entity_type)
        .bind(limit)
        .fetch_all(db)
        .await?;
        Ok(records)
    }

    /// Records whose scheduled retry is due.
    pub async fn due(db: &PgPool, limit: i64) -> anyhow::Result<Vec<SyncError>> {
        let records = sqlx::query_as::<_, SyncError>(
            "SELECT * FROM sync_errors
             WHERE status = $1 AND retryable AND next_retry_at <= NOW()
             ORDER BY next_retry_at
             LIMIT $2",
        )
        .bind(SyncStatus::Pending)
        .bind(limit)
        .fetch_all(db)
        .await?;
        Ok(records)
    }

    /// Claim a record for one retry attempt: `pending → processing`.
    /// The conditional UPDATE is the lock — a second concurrent claim for the
    /// same record matches zero rows and returns None. The transition is
    /// persisted before anything is dispatched, so a crash mid-retry leaves
    /// the record in `processing` where the staleness requeue can find it.
    pub async fn claim(db: &PgPool, id: Uuid) -> anyhow::Result<Option<SyncError>> {
        let record = sqlx::query_as::<_, SyncError>(
            "UPDATE sync_errors SET status = $2 WHERE id = $1 AND status = $3 RETURNING *",
        )
        .bind(id)
        .bind(SyncStatus::Processing)
        .bind(SyncStatus::Pending)
        .fetch_optional(db)
        .await?;
        Ok(record)
    }

    async fn complete(db: &PgPool, id: Uuid, resolved_by: &str) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE sync_errors SET status = $2, resolved_at = NOW(), resolved_by = $3
             WHERE id = $1 AND status = $4",
        )
        .bind(id)
        .bind(SyncStatus::Resolved)
        .bind(resolved_by)
        .bind(SyncStatus::Processing)
        .execute(db)
        .await?;
        Ok(())
    }

    async fn persist_attempt(db: &PgPool, record: &SyncError) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE sync_errors
             SET status = $2, retry_count = $3, next_retry_at = $4, message = $5
             WHERE id = $1",
        )
        .bind(record.id)
        .bind(record.status)
        .bind(record.retry_count)
        .bind(record.next_retry_at)
        .bind(&record.message)
        .execute(db)
        .await?;
        Ok(())
    }

    /// Operator action: close an error out by hand, from any state.
    pub async fn resolve_manual(db: &PgPool, id: Uuid) -> anyhow::Result<Option<SyncError>> {
        let record = sqlx::query_as::<_, SyncError>(
            "UPDATE sync_errors SET status = $2, resolved_at = NOW(), resolved_by = $3
             WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(SyncStatus::Resolved)
        .bind(crate::models::sync_error::RESOLVED_BY_MANUAL_RESOLVE)
        .fetch_optional(db)
        .await?;
        Ok(record)
    }

    /// Operator action: put an exhausted record back into rotation.
    /// Only `failed` records can be reopened.
    pub async fn reopen(db: &PgPool, id: Uuid) -> anyhow::Result<Option<SyncError>> {
        let record = sqlx::query_as::<_, SyncError>(
            "UPDATE sync_errors
             SET status = $2, retry_count = 0, next_retry_at = NOW(),
                 resolved_at = NULL, resolved_by = NULL
             WHERE id = $1 AND status = $3 RETURNING *",
        )
        .bind(id)
        .bind(SyncStatus::Pending)
        .bind(SyncStatus::Failed)
        .fetch_optional(db)
        .await?;
        Ok(record)
    }

    /// Requeue records stuck in `processing` since before `stale_before` —
    /// the recovery path for a worker that crashed mid-retry. Does not touch
    /// `retry_count`: the interrupted attempt never completed.
    pub async fn requeue_stuck(db: &PgPool, stale_before: DateTime<Utc>) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "UPDATE sync_errors SET status = $1, next_retry_at = NOW()
             WHERE status = $2 AND updated_at < $3",
        )
        .bind(SyncStatus::Pending)
        .bind(SyncStatus::Processing)
        .bind(stale_before)
        .execute(db)
        .await?;
        Ok(result.rows_affected())
    }

    /// One full retry attempt: claim, dispatch with a timeout, record the
    /// outcome. Returns None when the record was not claimable (someone else
    /// holds it, or it reached a terminal state in the meantime).
    pub async fn run_retry(
        db: &PgPool,
        dispatcher: &dyn SyncDispatcher,
        tenant: &str,
        id: Uuid,
        kind: RetryKind,
        timeout: Duration,
    ) -> anyhow::Result<Option<SyncStatus>> {
        let Some(mut record) = Self::claim(db, id).await? else {
            return Ok(None);
        };

        let outcome = match tokio::time::timeout(timeout, dispatcher.dispatch(tenant, &record)).await
        {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "dispatch timed out after {}s",
                timeout.as_secs()
            )),
        };

        match outcome {
            Ok(()) => {
                Self::complete(db, record.id, kind.resolved_by()).await?;
                metrics::SYNC_RETRIES
                    .with_label_values(&[tenant, "resolved"])
                    .inc();
                info!(
                    "Sync retry resolved {} ({tenant}/{}, {} {})",
                    record.id,
                    record.external_service,
                    record.operation.as_str(),
                    record.entity_type
                );
                Ok(Some(SyncStatus::Resolved))
            }
            Err(e) => {
                warn!(
                    "Sync retry failed for {} ({tenant}/{}): {e}",
                    record.id, record.external_service
                );
                record.message = e.to_string();
                let status = record.register_failure(Utc::now());
                Self::persist_attempt(db, &record).await?;
                metrics::SYNC_RETRIES
                    .with_label_values(&[tenant, status.as_str()])
                    .inc();
                Ok(Some(status))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::sync_error::SyncOperation;

    fn record_for(service: &str) -> SyncError {
        let now = Utc::now();
        SyncError {
            id: Uuid::new_v4(),
            operation: SyncOperation::Create,
            entity_type: "object".to_string(),
            entity_id: Uuid::new_v4(),
            external_service: service.to_string(),
            message: "boom".to_string(),
            retryable: true,
            retry_count: 0,
            max_retries: 3,
            next_retry_at: Some(now),
            status: SyncStatus::Pending,
            resolved_at: None,
            resolved_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn dispatch_rejects_unconfigured_service() {
        let dispatcher =
            HttpSyncDispatcher::new(HashMap::new(), Duration::from_secs(5)).unwrap();
        let err = dispatcher
            .dispatch("acme", &record_for("one_c"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("one_c"));
    }

    #[test]
    fn retry_kind_markers() {
        assert_eq!(RetryKind::Auto.resolved_by(), "auto_retry");
        assert_eq!(RetryKind::Manual.resolved_by(), "manual_retry");
    }
}
