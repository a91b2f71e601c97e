//! In-memory queue store for tests/dev.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use leadflow_core::{JobId, TenantId};
use leadflow_ingest::{FailureDisposition, JobStatus, NewJob, QueueJob, RetryPolicy};

use super::store::{EnqueueOutcome, QueueCounts, QueueStore, QueueStoreError};

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<JobId, QueueJob>,
    /// Idempotency index: one job per `(tenant, event_key)`, any status.
    by_key: HashMap<(TenantId, String), JobId>,
}

/// In-memory queue store.
///
/// A single lock makes every operation atomic, which is exactly the claim
/// guarantee the trait demands; the Postgres backend gets the same property
/// from row locking.
#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    state: RwLock<QueueState>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn enqueue(
        &self,
        job: NewJob,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, QueueStoreError> {
        job.validate()
            .map_err(|e| QueueStoreError::Validation(e.to_string()))?;

        let mut state = self.state.write().unwrap();
        let key = (job.tenant_id, job.event_key.clone());
        if let Some(existing) = state.by_key.get(&key) {
            return Ok(EnqueueOutcome::Duplicate(*existing));
        }

        let job = QueueJob::create(job, now)
            .map_err(|e| QueueStoreError::Validation(e.to_string()))?;
        let id = job.id;
        state.by_key.insert(key, id);
        state.jobs.insert(id, job);
        Ok(EnqueueOutcome::Created(id))
    }

    async fn claim_due(
        &self,
        limit: usize,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueJob>, QueueStoreError> {
        let mut state = self.state.write().unwrap();

        let mut due: Vec<JobId> = state
            .jobs
            .values()
            .filter(|j| j.is_due(now))
            .map(|j| j.id)
            .collect();

        // Oldest next_attempt_at first; the id tiebreak keeps order stable.
        due.sort_by_key(|id| (state.jobs[id].next_attempt_at, *id));
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            if let Some(job) = state.jobs.get_mut(&id) {
                job.begin_processing(lease, now);
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_succeeded(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<(), QueueStoreError> {
        let mut state = self.state.write().unwrap();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueStoreError::NotFound(job_id))?;
        if job.status != JobStatus::Processing {
            return Err(QueueStoreError::Conflict(format!(
                "cannot mark {} job as succeeded",
                job.status.as_str()
            )));
        }
        job.succeed(now);
        Ok(())
    }

    async fn mark_failed(
        &self,
        job_id: JobId,
        error: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailureDisposition, QueueStoreError> {
        let mut state = self.state.write().unwrap();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueStoreError::NotFound(job_id))?;
        if job.status != JobStatus::Processing {
            return Err(QueueStoreError::Conflict(format!(
                "cannot mark {} job as failed",
                job.status.as_str()
            )));
        }
        Ok(job.fail(error, policy, now))
    }

    async fn release_expired(
        &self,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, QueueStoreError> {
        let mut state = self.state.write().unwrap();
        let expired: Vec<JobId> = state
            .jobs
            .values()
            .filter(|j| j.lease_expired(now))
            .map(|j| j.id)
            .collect();

        for id in &expired {
            if let Some(job) = state.jobs.get_mut(id) {
                job.fail("lease expired (worker presumed crashed)", policy, now);
            }
        }
        Ok(expired)
    }

    async fn get(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
    ) -> Result<Option<QueueJob>, QueueStoreError> {
        let state = self.state.read().unwrap();
        match state.jobs.get(&job_id) {
            Some(job) if job.tenant_id == tenant_id => Ok(Some(job.clone())),
            Some(_) => Err(QueueStoreError::TenantIsolation),
            None => Ok(None),
        }
    }

    async fn counts(&self, tenant_id: TenantId) -> Result<QueueCounts, QueueStoreError> {
        let state = self.state.read().unwrap();
        let mut counts = QueueCounts::default();
        for job in state.jobs.values() {
            if job.tenant_id != tenant_id {
                continue;
            }
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Processing => counts.processing += 1,
                JobStatus::Succeeded => counts.succeeded += 1,
                JobStatus::Failed => counts.failed += 1,
                JobStatus::Dead => counts.dead += 1,
            }
        }
        Ok(counts)
    }

    async fn list_dead(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> Result<Vec<QueueJob>, QueueStoreError> {
        let state = self.state.read().unwrap();
        let mut dead: Vec<QueueJob> = state
            .jobs
            .values()
            .filter(|j| j.tenant_id == tenant_id && j.status == JobStatus::Dead)
            .cloned()
            .collect();
        dead.sort_by_key(|j| j.dead_lettered_at);
        dead.truncate(limit);
        Ok(dead)
    }

    async fn replay_dead(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<QueueJob, QueueStoreError> {
        let mut state = self.state.write().unwrap();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueStoreError::NotFound(job_id))?;
        if job.tenant_id != tenant_id {
            return Err(QueueStoreError::TenantIsolation);
        }
        job.replay(now)
            .map_err(|e| QueueStoreError::Conflict(e.to_string()))?;
        Ok(job.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadflow_ingest::EventKind;
    use serde_json::json;

    fn test_tenant_id() -> TenantId {
        TenantId::new()
    }

    fn new_job(tenant_id: TenantId, event_key: &str) -> NewJob {
        NewJob {
            tenant_id,
            kind: EventKind::FormSubmitted,
            event_key: event_key.to_string(),
            occurred_at: Utc::now(),
            payload: json!({"email": "jane@example.com", "form_id": "f-1"}),
        }
    }

    fn short_policy() -> RetryPolicy {
        RetryPolicy::new(
            3,
            Duration::from_millis(100),
            Duration::from_secs(1),
        )
        .without_jitter()
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_per_key() {
        let store = InMemoryQueueStore::new();
        let tenant_id = test_tenant_id();
        let now = Utc::now();

        let first = store.enqueue(new_job(tenant_id, "evt-1"), now).await.unwrap();
        let second = store.enqueue(new_job(tenant_id, "evt-1"), now).await.unwrap();

        assert!(!first.is_duplicate());
        assert!(second.is_duplicate());
        assert_eq!(first.job_id(), second.job_id());

        let counts = store.counts(tenant_id).await.unwrap();
        assert_eq!(counts.pending, 1);
    }

    #[tokio::test]
    async fn same_key_different_tenant_is_independent() {
        let store = InMemoryQueueStore::new();
        let now = Utc::now();

        let a = store
            .enqueue(new_job(test_tenant_id(), "evt-1"), now)
            .await
            .unwrap();
        let b = store
            .enqueue(new_job(test_tenant_id(), "evt-1"), now)
            .await
            .unwrap();

        assert!(!a.is_duplicate());
        assert!(!b.is_duplicate());
        assert_ne!(a.job_id(), b.job_id());
    }

    #[tokio::test]
    async fn empty_event_key_is_rejected() {
        let store = InMemoryQueueStore::new();
        let err = store
            .enqueue(new_job(test_tenant_id(), "  "), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueStoreError::Validation(_)));
    }

    #[tokio::test]
    async fn claim_transitions_to_processing_and_excludes_future_jobs() {
        let store = InMemoryQueueStore::new();
        let tenant_id = test_tenant_id();
        let now = Utc::now();

        store.enqueue(new_job(tenant_id, "evt-1"), now).await.unwrap();

        let claimed = store
            .claim_due(10, Duration::from_secs(30), now)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, JobStatus::Processing);
        assert!(claimed[0].lease_expires_at.is_some());

        // Already claimed; nothing left.
        let claimed = store
            .claim_due(10, Duration::from_secs(30), now)
            .await
            .unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn claim_respects_limit_and_order() {
        let store = InMemoryQueueStore::new();
        let tenant_id = test_tenant_id();
        let base = Utc::now();

        for (i, offset) in [3i64, 1, 2].iter().enumerate() {
            let now = base + chrono::Duration::seconds(*offset);
            store
                .enqueue(new_job(tenant_id, &format!("evt-{i}")), now)
                .await
                .unwrap();
        }

        let later = base + chrono::Duration::seconds(10);
        let claimed = store
            .claim_due(2, Duration::from_secs(30), later)
            .await
            .unwrap();

        assert_eq!(claimed.len(), 2);
        // Oldest next_attempt_at first: offsets 1 then 2.
        assert_eq!(claimed[0].event_key, "evt-1");
        assert_eq!(claimed[1].event_key, "evt-2");
    }

    #[tokio::test]
    async fn failed_job_becomes_due_after_backoff() {
        let store = InMemoryQueueStore::new();
        let tenant_id = test_tenant_id();
        let now = Utc::now();
        let policy = short_policy();

        let id = store
            .enqueue(new_job(tenant_id, "evt-1"), now)
            .await
            .unwrap()
            .job_id();
        store
            .claim_due(1, Duration::from_secs(30), now)
            .await
            .unwrap();

        let disposition = store.mark_failed(id, "boom", &policy, now).await.unwrap();
        let next = match disposition {
            FailureDisposition::Rescheduled(at) => at,
            other => panic!("expected Rescheduled, got {other:?}"),
        };

        // Not due before the backoff elapses.
        assert!(
            store
                .claim_due(1, Duration::from_secs(30), now)
                .await
                .unwrap()
                .is_empty()
        );

        let claimed = store
            .claim_due(1, Duration::from_secs(30), next)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempt_count, 1);
    }

    #[tokio::test]
    async fn dead_letter_boundary_is_exact() {
        let store = InMemoryQueueStore::new();
        let tenant_id = test_tenant_id();
        let mut now = Utc::now();
        let policy = short_policy();

        let id = store
            .enqueue(new_job(tenant_id, "evt-1"), now)
            .await
            .unwrap()
            .job_id();

        for attempt in 1..=2u32 {
            now += chrono::Duration::seconds(5);
            let claimed = store
                .claim_due(1, Duration::from_secs(30), now)
                .await
                .unwrap();
            assert_eq!(claimed.len(), 1, "attempt {attempt} should be claimable");
            let disposition = store.mark_failed(id, "boom", &policy, now).await.unwrap();
            assert!(matches!(disposition, FailureDisposition::Rescheduled(_)));
        }

        now += chrono::Duration::seconds(5);
        store
            .claim_due(1, Duration::from_secs(30), now)
            .await
            .unwrap();
        let disposition = store.mark_failed(id, "boom", &policy, now).await.unwrap();
        assert_eq!(disposition, FailureDisposition::DeadLettered);

        let job = store.get(tenant_id, id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Dead);
        assert_eq!(job.attempt_count, 3);
        assert!(job.dead_lettered_at.is_some());

        // Terminal: no longer claimable.
        now += chrono::Duration::days(1);
        assert!(
            store
                .claim_due(10, Duration::from_secs(30), now)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn terminal_jobs_reject_outcome_marks() {
        let store = InMemoryQueueStore::new();
        let tenant_id = test_tenant_id();
        let now = Utc::now();
        let policy = short_policy();

        let id = store
            .enqueue(new_job(tenant_id, "evt-1"), now)
            .await
            .unwrap()
            .job_id();
        store
            .claim_due(1, Duration::from_secs(30), now)
            .await
            .unwrap();
        store.mark_succeeded(id, now).await.unwrap();

        assert!(matches!(
            store.mark_succeeded(id, now).await,
            Err(QueueStoreError::Conflict(_))
        ));
        assert!(matches!(
            store.mark_failed(id, "late", &policy, now).await,
            Err(QueueStoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn lease_sweep_requeues_expired_processing_jobs() {
        let store = InMemoryQueueStore::new();
        let tenant_id = test_tenant_id();
        let now = Utc::now();
        let policy = short_policy();

        let id = store
            .enqueue(new_job(tenant_id, "evt-1"), now)
            .await
            .unwrap()
            .job_id();
        store
            .claim_due(1, Duration::from_secs(30), now)
            .await
            .unwrap();

        // Lease still live: sweep is a no-op.
        let released = store.release_expired(&policy, now).await.unwrap();
        assert!(released.is_empty());

        let after_lease = now + chrono::Duration::seconds(31);
        let released = store.release_expired(&policy, after_lease).await.unwrap();
        assert_eq!(released, vec![id]);

        let job = store.get(tenant_id, id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt_count, 1);
        assert!(job.last_error.as_deref().unwrap().contains("lease expired"));

        // Eligible again once the backoff elapses.
        let retry_at = job.next_attempt_at;
        let claimed = store
            .claim_due(1, Duration::from_secs(30), retry_at)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
    }

    #[tokio::test]
    async fn replay_resets_dead_job_and_guards_tenant() {
        let store = InMemoryQueueStore::new();
        let tenant_id = test_tenant_id();
        let now = Utc::now();
        let policy = RetryPolicy::new(1, Duration::from_millis(10), Duration::from_secs(1));

        let id = store
            .enqueue(new_job(tenant_id, "evt-1"), now)
            .await
            .unwrap()
            .job_id();
        store
            .claim_due(1, Duration::from_secs(30), now)
            .await
            .unwrap();
        store.mark_failed(id, "boom", &policy, now).await.unwrap();

        assert!(matches!(
            store.replay_dead(test_tenant_id(), id, now).await,
            Err(QueueStoreError::TenantIsolation)
        ));

        let replayed = store.replay_dead(tenant_id, id, now).await.unwrap();
        assert_eq!(replayed.status, JobStatus::Pending);
        assert_eq!(replayed.attempt_count, 0);

        assert_eq!(store.list_dead(tenant_id, 10).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn exclusive_claim_under_concurrency() {
        use std::collections::HashSet;
        use std::sync::Arc;

        let store = Arc::new(InMemoryQueueStore::new());
        let tenant_id = test_tenant_id();
        let now = Utc::now();

        for i in 0..40 {
            store
                .enqueue(new_job(tenant_id, &format!("evt-{i}")), now)
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.claim_due(10, Duration::from_secs(30), now).await.unwrap()
            }));
        }

        let mut seen: HashSet<JobId> = HashSet::new();
        let mut total = 0usize;
        for handle in handles {
            for job in handle.await.unwrap() {
                assert!(seen.insert(job.id), "job {} claimed twice", job.id);
                total += 1;
            }
        }
        assert_eq!(total, 40);
    }
}
