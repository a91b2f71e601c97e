//! Postgres-backed queue store.
//!
//! Claim exclusivity comes from `FOR UPDATE SKIP LOCKED`: concurrent
//! `claim_due` callers each lock a disjoint set of due rows, so exactly one
//! caller wins each job. Everything else is plain row updates guarded by the
//! status column.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::instrument;
use uuid::Uuid;

use leadflow_core::{JobId, TenantId};
use leadflow_ingest::{
    EventKind, FailureDisposition, JobStatus, NewJob, QueueJob, RetryDecision, RetryPolicy,
};

use super::store::{EnqueueOutcome, QueueCounts, QueueStore, QueueStoreError};
use crate::postgres::unavailable;

/// Postgres-backed queue store.
#[derive(Debug, Clone)]
pub struct PostgresQueueStore {
    pool: PgPool,
}

impl PostgresQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Distinguish a missing job from an illegal transition after an
    /// `UPDATE ... WHERE status = ...` matched nothing.
    async fn diagnose_missed_update(
        &self,
        job_id: JobId,
        wanted: JobStatus,
    ) -> QueueStoreError {
        let row: Result<Option<(String,)>, sqlx::Error> =
            sqlx::query_as("SELECT status FROM ingest_jobs WHERE id = $1")
                .bind(job_id.as_uuid())
                .fetch_optional(&self.pool)
                .await;

        match row {
            Ok(Some((status,))) => QueueStoreError::Conflict(format!(
                "job is {status}, expected {}",
                wanted.as_str()
            )),
            Ok(None) => QueueStoreError::NotFound(job_id),
            Err(e) => QueueStoreError::Unavailable(unavailable("diagnose job status", e)),
        }
    }
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    tenant_id: Uuid,
    kind: String,
    event_key: String,
    occurred_at: DateTime<Utc>,
    payload: serde_json::Value,
    status: String,
    attempt_count: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    next_attempt_at: DateTime<Utc>,
    dead_lettered_at: Option<DateTime<Utc>>,
    lease_expires_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for QueueJob {
    type Error = QueueStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let kind: EventKind = row
            .kind
            .parse()
            .map_err(|e| QueueStoreError::Unavailable(format!("job row decode: {e}")))?;
        let status: JobStatus = row
            .status
            .parse()
            .map_err(|e| QueueStoreError::Unavailable(format!("job row decode: {e}")))?;

        Ok(QueueJob {
            id: JobId::from_uuid(row.id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            kind,
            event_key: row.event_key,
            occurred_at: row.occurred_at,
            payload: row.payload,
            status,
            attempt_count: row.attempt_count.max(0) as u32,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
            processed_at: row.processed_at,
            next_attempt_at: row.next_attempt_at,
            dead_lettered_at: row.dead_lettered_at,
            lease_expires_at: row.lease_expires_at,
        })
    }
}

const JOB_COLUMNS: &str = "id, tenant_id, kind, event_key, occurred_at, payload, status, \
     attempt_count, last_error, created_at, updated_at, processed_at, next_attempt_at, \
     dead_lettered_at, lease_expires_at";

#[async_trait]
impl QueueStore for PostgresQueueStore {
    #[instrument(skip(self, job), fields(tenant_id = %job.tenant_id, kind = %job.kind), err)]
    async fn enqueue(
        &self,
        job: NewJob,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, QueueStoreError> {
        job.validate()
            .map_err(|e| QueueStoreError::Validation(e.to_string()))?;

        let id = JobId::new();
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO ingest_jobs
                (id, tenant_id, kind, event_key, occurred_at, payload, status,
                 attempt_count, created_at, updated_at, next_attempt_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', 0, $7, $7, $7)
            ON CONFLICT (tenant_id, event_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(id.as_uuid())
        .bind(job.tenant_id.as_uuid())
        .bind(job.kind.as_str())
        .bind(&job.event_key)
        .bind(job.occurred_at)
        .bind(&job.payload)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| QueueStoreError::Unavailable(unavailable("enqueue", e)))?;

        if let Some((id,)) = inserted {
            return Ok(EnqueueOutcome::Created(JobId::from_uuid(id)));
        }

        // Lost to an existing row; report its identity. Rows are never
        // deleted, so the follow-up read cannot miss.
        let (existing,): (Uuid,) =
            sqlx::query_as("SELECT id FROM ingest_jobs WHERE tenant_id = $1 AND event_key = $2")
                .bind(job.tenant_id.as_uuid())
                .bind(&job.event_key)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| QueueStoreError::Unavailable(unavailable("enqueue dedup read", e)))?;

        Ok(EnqueueOutcome::Duplicate(JobId::from_uuid(existing)))
    }

    #[instrument(skip(self), err)]
    async fn claim_due(
        &self,
        limit: usize,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueJob>, QueueStoreError> {
        let lease_expires_at = now + chrono::Duration::from_std(lease).unwrap_or_default();

        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            r#"
            UPDATE ingest_jobs
            SET status = 'processing', lease_expires_at = $1, updated_at = $2
            WHERE id IN (
                SELECT id FROM ingest_jobs
                WHERE status IN ('pending', 'failed') AND next_attempt_at <= $2
                ORDER BY next_attempt_at ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(lease_expires_at)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QueueStoreError::Unavailable(unavailable("claim_due", e)))?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            jobs.push(QueueJob::try_from(row)?);
        }
        jobs.sort_by_key(|j| (j.next_attempt_at, j.id));
        Ok(jobs)
    }

    async fn mark_succeeded(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<(), QueueStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE ingest_jobs
            SET status = 'succeeded', processed_at = $2, lease_expires_at = NULL, updated_at = $2
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueStoreError::Unavailable(unavailable("mark_succeeded", e)))?;

        if result.rows_affected() == 0 {
            return Err(self.diagnose_missed_update(job_id, JobStatus::Processing).await);
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        job_id: JobId,
        error: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailureDisposition, QueueStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| QueueStoreError::Unavailable(unavailable("mark_failed begin", e)))?;

        let row: Option<(String, i32)> =
            sqlx::query_as("SELECT status, attempt_count FROM ingest_jobs WHERE id = $1 FOR UPDATE")
                .bind(job_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| QueueStoreError::Unavailable(unavailable("mark_failed read", e)))?;

        let (status, attempts) = row.ok_or(QueueStoreError::NotFound(job_id))?;
        if status != "processing" {
            return Err(QueueStoreError::Conflict(format!(
                "job is {status}, expected processing"
            )));
        }

        let attempt_count = attempts.max(0) as u32 + 1;
        let disposition = apply_failure(&mut tx, job_id, attempt_count, error, policy, now).await?;

        tx.commit()
            .await
            .map_err(|e| QueueStoreError::Unavailable(unavailable("mark_failed commit", e)))?;
        Ok(disposition)
    }

    async fn release_expired(
        &self,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, QueueStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| QueueStoreError::Unavailable(unavailable("release_expired begin", e)))?;

        let expired: Vec<(Uuid, i32)> = sqlx::query_as(
            r#"
            SELECT id, attempt_count FROM ingest_jobs
            WHERE status = 'processing' AND lease_expires_at < $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| QueueStoreError::Unavailable(unavailable("release_expired scan", e)))?;

        let mut released = Vec::with_capacity(expired.len());
        for (id, attempts) in expired {
            let job_id = JobId::from_uuid(id);
            let attempt_count = attempts.max(0) as u32 + 1;
            apply_failure(
                &mut tx,
                job_id,
                attempt_count,
                "lease expired (worker presumed crashed)",
                policy,
                now,
            )
            .await?;
            released.push(job_id);
        }

        tx.commit()
            .await
            .map_err(|e| QueueStoreError::Unavailable(unavailable("release_expired commit", e)))?;
        Ok(released)
    }

    async fn get(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
    ) -> Result<Option<QueueJob>, QueueStoreError> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM ingest_jobs WHERE id = $1"
        ))
        .bind(job_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| QueueStoreError::Unavailable(unavailable("get", e)))?;

        match row {
            Some(row) if row.tenant_id == *tenant_id.as_uuid() => {
                Ok(Some(QueueJob::try_from(row)?))
            }
            Some(_) => Err(QueueStoreError::TenantIsolation),
            None => Ok(None),
        }
    }

    async fn counts(&self, tenant_id: TenantId) -> Result<QueueCounts, QueueStoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM ingest_jobs WHERE tenant_id = $1 GROUP BY status",
        )
        .bind(tenant_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QueueStoreError::Unavailable(unavailable("counts", e)))?;

        let mut counts = QueueCounts::default();
        for (status, count) in rows {
            let count = count.max(0) as u64;
            match status.as_str() {
                "pending" => counts.pending = count,
                "processing" => counts.processing = count,
                "succeeded" => counts.succeeded = count,
                "failed" => counts.failed = count,
                "dead" => counts.dead = count,
                _ => {}
            }
        }
        Ok(counts)
    }

    async fn list_dead(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> Result<Vec<QueueJob>, QueueStoreError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM ingest_jobs
            WHERE tenant_id = $1 AND status = 'dead'
            ORDER BY dead_lettered_at ASC
            LIMIT $2
            "#
        ))
        .bind(tenant_id.as_uuid())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QueueStoreError::Unavailable(unavailable("list_dead", e)))?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            jobs.push(QueueJob::try_from(row)?);
        }
        Ok(jobs)
    }

    async fn replay_dead(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<QueueJob, QueueStoreError> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            r#"
            UPDATE ingest_jobs
            SET status = 'pending', attempt_count = 0, next_attempt_at = $3,
                dead_lettered_at = NULL, lease_expires_at = NULL, updated_at = $3
            WHERE id = $2 AND tenant_id = $1 AND status = 'dead'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(tenant_id.as_uuid())
        .bind(job_id.as_uuid())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| QueueStoreError::Unavailable(unavailable("replay_dead", e)))?;

        match row {
            Some(row) => QueueJob::try_from(row),
            None => {
                let found: Option<(Uuid, String)> =
                    sqlx::query_as("SELECT tenant_id, status FROM ingest_jobs WHERE id = $1")
                        .bind(job_id.as_uuid())
                        .fetch_optional(&self.pool)
                        .await
                        .map_err(|e| {
                            QueueStoreError::Unavailable(unavailable("replay_dead read", e))
                        })?;
                match found {
                    None => Err(QueueStoreError::NotFound(job_id)),
                    Some((owner, _)) if owner != *tenant_id.as_uuid() => {
                        Err(QueueStoreError::TenantIsolation)
                    }
                    Some((_, status)) => Err(QueueStoreError::Conflict(format!(
                        "job is {status}, expected dead"
                    ))),
                }
            }
        }
    }
}

/// Record one failed attempt inside an open transaction.
async fn apply_failure(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    job_id: JobId,
    attempt_count: u32,
    error: &str,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<FailureDisposition, QueueStoreError> {
    match policy.decide(attempt_count) {
        RetryDecision::Retry(delay) => {
            let next_attempt_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
            sqlx::query(
                r#"
                UPDATE ingest_jobs
                SET status = 'failed', attempt_count = $2, last_error = $3,
                    next_attempt_at = $4, lease_expires_at = NULL, updated_at = $5
                WHERE id = $1
                "#,
            )
            .bind(job_id.as_uuid())
            .bind(attempt_count as i32)
            .bind(error)
            .bind(next_attempt_at)
            .bind(now)
            .execute(&mut **tx)
            .await
            .map_err(|e| QueueStoreError::Unavailable(unavailable("apply_failure", e)))?;
            Ok(FailureDisposition::Rescheduled(next_attempt_at))
        }
        RetryDecision::DeadLetter => {
            sqlx::query(
                r#"
                UPDATE ingest_jobs
                SET status = 'dead', attempt_count = $2, last_error = $3,
                    dead_lettered_at = $4, lease_expires_at = NULL, updated_at = $4
                WHERE id = $1
                "#,
            )
            .bind(job_id.as_uuid())
            .bind(attempt_count as i32)
            .bind(error)
            .bind(now)
            .execute(&mut **tx)
            .await
            .map_err(|e| QueueStoreError::Unavailable(unavailable("apply_failure", e)))?;
            Ok(FailureDisposition::DeadLettered)
        }
    }
}
