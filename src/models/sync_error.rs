use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

pub const RESOLVED_BY_AUTO_RETRY: &str = "auto_retry";
pub const RESOLVED_BY_MANUAL_RETRY: &str = "manual_retry";
pub const RESOLVED_BY_MANUAL_RESOLVE: &str = "manual_resolve";

/// What the failed synchronization was trying to do against the external system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "sync_operation", rename_all = "snake_case")]
#[serde(rename_all = "lowercase")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

impl SyncOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOperation::Create => "create",
            SyncOperation::Update => "update",
            SyncOperation::Delete => "delete",
        }
    }
}

/// Lifecycle of a recorded sync failure:
/// `pending → processing → resolved`, or back to `pending` while retries
/// remain, or `failed` once retries are exhausted / the error is not retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "sync_status", rename_all = "snake_case")]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Processing,
    Resolved,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Processing => "processing",
            SyncStatus::Resolved => "resolved",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SyncStatus::Pending),
            "processing" => Some(SyncStatus::Processing),
            "resolved" => Some(SyncStatus::Resolved),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }
}

/// One failed synchronization attempt against an external system, recorded in
/// the tenant's `sync_errors` table. Rows are kept for audit and only ever
/// marked resolved, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SyncError {
    pub id: Uuid,
    pub operation: SyncOperation,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub external_service: String,
    pub message: String,
    pub retryable: bool,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub status: SyncStatus,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for recording a fresh failure.
#[derive(Debug, Clone, Deserialize)]
pub struct NewSyncError {
    pub operation: SyncOperation,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub external_service: String,
    pub message: String,
    pub retryable: bool,
    pub max_retries: i32,
}

/// Delay before retry attempt `retry_count + 1`: 60s doubling per attempt,
/// capped at one hour, with ±10s of jitter to spread worker wakeups.
pub fn backoff_delay(retry_count: i32) -> Duration {
    use rand::Rng;
    let exp = retry_count.clamp(0, 10) as u32;
    let secs = 60i64.saturating_mul(1i64 << exp).min(3600);
    let jitter: i64 = rand::thread_rng().gen_range(-10..=10);
    Duration::seconds((secs + jitter).max(1))
}

impl SyncError {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, SyncStatus::Resolved | SyncStatus::Failed)
    }

    /// Whether an operator may trigger a retry right now. `failed` records
    /// must be reopened first; `processing` means a retry already holds the claim.
    pub fn can_retry_manually(&self) -> bool {
        self.status == SyncStatus::Pending
    }

    /// Apply the outcome of a dispatch attempt that failed. Increments the
    /// attempt counter (never past `max_retries`) and either schedules the
    /// next retry or marks the record terminally failed.
    pub fn register_failure(&mut self, now: DateTime<Utc>) -> SyncStatus {
        self.retry_count = (self.retry_count + 1).min(self.max_retries);
        if !self.retryable || self.retry_count >= self.max_retries {
            self.status = SyncStatus::Failed;
            self.next_retry_at = None;
        } else {
            self.status = SyncStatus::Pending;
            self.next_retry_at = Some(now + backoff_delay(self.retry_count));
        }
        self.status
    }

    /// Mark resolved by hand. Allowed from any state — an operator closing an
    /// error out is final regardless of what the retry machinery was doing.
    pub fn resolve(&mut self, resolved_by: &str, now: DateTime<Utc>) {
        self.status = SyncStatus::Resolved;
        self.resolved_at = Some(now);
        self.resolved_by = Some(resolved_by.to_string());
    }

    /// Reopen an exhausted record for another round of retries.
    /// Only valid from `failed`.
    pub fn reopen(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != SyncStatus::Failed {
            return false;
        }
        self.status = SyncStatus::Pending;
        self.retry_count = 0;
        self.next_retry_at = Some(now);
        self.resolved_at = None;
        self.resolved_by = None;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(retryable: bool, max_retries: i32) -> SyncError {
        let now = Utc::now();
        SyncError {
            id: Uuid::new_v4(),
            operation: SyncOperation::Update,
            entity_type: "contract".to_string(),
            entity_id: Uuid::new_v4(),
            external_service: "one_c".to_string(),
            message: "connection refused".to_string(),
            retryable,
            retry_count: 0,
            max_retries,
            next_retry_at: Some(now),
            status: SyncStatus::Pending,
            resolved_at: None,
            resolved_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn backoff_is_monotonic_with_hard_cap() {
        // Jitter is ±10s, so adjacent steps stay ordered until the cap.
        for n in 0..5 {
            let shorter = backoff_delay(n).num_seconds();
            let longer = backoff_delay(n + 1).num_seconds();
            assert!(longer > shorter, "delay({}) = {} !< delay({}) = {}", n, shorter, n + 1, longer);
        }
        // 60 * 2^6 > 3600 → capped
        let capped = backoff_delay(6).num_seconds();
        assert!((3590..=3610).contains(&capped));
        let still_capped = backoff_delay(20).num_seconds();
        assert!((3590..=3610).contains(&still_capped));
    }

    #[test]
    fn retryable_record_fails_after_max_retries() {
        let mut err = sample(true, 3);
        let now = Utc::now();

        assert_eq!(err.register_failure(now), SyncStatus::Pending);
        assert_eq!(err.retry_count, 1);
        assert!(err.next_retry_at.unwrap() > now);

        assert_eq!(err.register_failure(now), SyncStatus::Pending);
        assert_eq!(err.retry_count, 2);

        assert_eq!(err.register_failure(now), SyncStatus::Failed);
        assert_eq!(err.retry_count, 3);
        assert!(err.next_retry_at.is_none());
        assert!(err.is_terminal());
        assert!(!err.can_retry_manually());

        // A further failure must never push retry_count past max_retries.
        err.register_failure(now);
        assert_eq!(err.retry_count, 3);
    }

    #[test]
    fn non_retryable_record_fails_on_first_failure() {
        let mut err = sample(false, 3);
        assert_eq!(err.register_failure(Utc::now()), SyncStatus::Failed);
        assert_eq!(err.retry_count, 1);
        assert!(err.is_terminal());
    }

    #[test]
    fn backoff_schedule_grows_between_attempts() {
        let mut err = sample(true, 5);
        let now = Utc::now();
        err.register_failure(now);
        let first = err.next_retry_at.unwrap() - now;
        err.register_failure(now);
        let second = err.next_retry_at.unwrap() - now;
        assert!(second > first);
    }

    #[test]
    fn manual_resolve_works_from_any_state() {
        let now = Utc::now();
        for status in [SyncStatus::Pending, SyncStatus::Processing, SyncStatus::Failed] {
            let mut err = sample(true, 3);
            err.status = status;
            err.resolve(RESOLVED_BY_MANUAL_RESOLVE, now);
            assert_eq!(err.status, SyncStatus::Resolved);
            assert_eq!(err.resolved_by.as_deref(), Some("manual_resolve"));
            assert_eq!(err.resolved_at, Some(now));
        }
    }

    #[test]
    fn reopen_only_from_failed() {
        let now = Utc::now();

        let mut failed = sample(true, 3);
        failed.status = SyncStatus::Failed;
        failed.retry_count = 3;
        assert!(failed.reopen(now));
        assert_eq!(failed.status, SyncStatus::Pending);
        assert_eq!(failed.retry_count, 0);
        assert_eq!(failed.next_retry_at, Some(now));

        let mut pending = sample(true, 3);
        assert!(!pending.reopen(now));
        let mut resolved = sample(true, 3);
        resolved.resolve(RESOLVED_BY_MANUAL_RESOLVE, now);
        assert!(!resolved.reopen(now));
        assert_eq!(resolved.status, SyncStatus::Resolved);
    }

    #[test]
    fn status_parse_round_trips() {
        for status in [
            SyncStatus::Pending,
            SyncStatus::Processing,
            SyncStatus::Resolved,
            SyncStatus::Failed,
        ] {
            assert_eq!(SyncStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SyncStatus::parse("cancelled"), None);
    }
}
