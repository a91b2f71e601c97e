//! Queue store abstraction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use leadflow_core::{JobId, TenantId};
use leadflow_ingest::{FailureDisposition, NewJob, QueueJob, RetryPolicy};

/// Result of an enqueue call.
///
/// A duplicate is informational, not a failure: repeated delivery of the same
/// external event is expected, and the producer gets the identity of the job
/// already holding the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Created(JobId),
    Duplicate(JobId),
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> JobId {
        match self {
            EnqueueOutcome::Created(id) | EnqueueOutcome::Duplicate(id) => *id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, EnqueueOutcome::Duplicate(_))
    }
}

/// Per-tenant job counts by status, for operational tooling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueCounts {
    pub pending: u64,
    pub processing: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub dead: u64,
}

/// Queue store error.
#[derive(Debug, thiserror::Error)]
pub enum QueueStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("tenant isolation violation")]
    TenantIsolation,

    #[error("validation failed: {0}")]
    Validation(String),

    /// Illegal transition (e.g. marking a job that isn't processing, or
    /// replaying a job that isn't dead).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The backing store is unreachable or misbehaving. Transient: callers
    /// retry the store operation itself, not the job.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl QueueStoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueStoreError::Unavailable(_))
    }
}

/// Durable, crash-safe storage of queue jobs with atomic claim semantics.
///
/// Implementations must:
/// - enforce enqueue idempotency on `(tenant_id, event_key)` across all
///   statuses
/// - guarantee that no two concurrent `claim_due` callers receive the same
///   job (atomic read-and-update)
/// - keep terminal jobs immutable (operator replay excepted)
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Enqueue a job, or return the identity of the job already holding the
    /// idempotency key. Rejects empty event keys.
    async fn enqueue(
        &self,
        job: NewJob,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, QueueStoreError>;

    /// Claim up to `limit` due jobs (`pending`/`failed` with
    /// `next_attempt_at <= now`, oldest `next_attempt_at` first), atomically
    /// transitioning each to `processing` under a lease of the given length.
    async fn claim_due(
        &self,
        limit: usize,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueJob>, QueueStoreError>;

    /// Terminal success for a processing job.
    async fn mark_succeeded(&self, job_id: JobId, now: DateTime<Utc>)
    -> Result<(), QueueStoreError>;

    /// Record a failed attempt for a processing job: increments the attempt
    /// count, records the error, and consults the policy with the new count.
    async fn mark_failed(
        &self,
        job_id: JobId,
        error: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailureDisposition, QueueStoreError>;

    /// The lease sweep: every processing job whose lease expired before `now`
    /// is treated as a failed attempt (worker crash). Returns the affected
    /// job ids.
    async fn release_expired(
        &self,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, QueueStoreError>;

    /// Fetch one job, tenant-scoped.
    async fn get(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
    ) -> Result<Option<QueueJob>, QueueStoreError>;

    /// Job counts by status for one tenant.
    async fn counts(&self, tenant_id: TenantId) -> Result<QueueCounts, QueueStoreError>;

    /// Dead jobs for one tenant, oldest first, for triage.
    async fn list_dead(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> Result<Vec<QueueJob>, QueueStoreError>;

    /// Operator replay: reset a dead job to pending with a fresh attempt
    /// budget. The only externally triggered status transition.
    async fn replay_dead(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<QueueJob, QueueStoreError>;
}

#[async_trait]
impl<S> QueueStore for Arc<S>
where
    S: QueueStore + ?Sized,
{
    async fn enqueue(
        &self,
        job: NewJob,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, QueueStoreError> {
        (**self).enqueue(job, now).await
    }

    async fn claim_due(
        &self,
        limit: usize,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueJob>, QueueStoreError> {
        (**self).claim_due(limit, lease, now).await
    }

    async fn mark_succeeded(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<(), QueueStoreError> {
        (**self).mark_succeeded(job_id, now).await
    }

    async fn mark_failed(
        &self,
        job_id: JobId,
        error: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailureDisposition, QueueStoreError> {
        (**self).mark_failed(job_id, error, policy, now).await
    }

    async fn release_expired(
        &self,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, QueueStoreError> {
        (**self).release_expired(policy, now).await
    }

    async fn get(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
    ) -> Result<Option<QueueJob>, QueueStoreError> {
        (**self).get(tenant_id, job_id).await
    }

    async fn counts(&self, tenant_id: TenantId) -> Result<QueueCounts, QueueStoreError> {
        (**self).counts(tenant_id).await
    }

    async fn list_dead(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> Result<Vec<QueueJob>, QueueStoreError> {
        (**self).list_dead(tenant_id, limit).await
    }

    async fn replay_dead(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<QueueJob, QueueStoreError> {
        (**self).replay_dead(tenant_id, job_id, now).await
    }
}
