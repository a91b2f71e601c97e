//! Queue job state machine.
//!
//! All transitions take `now` explicitly; the store owns when they run, the
//! job owns what they mean.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;

use leadflow_core::{DomainError, DomainResult, IdempotencyKey, JobId, TenantId};

use crate::event::EventKind;
use crate::retry::{RetryDecision, RetryPolicy};

/// Job execution status.
///
/// `succeeded` and `dead` are terminal and immutable; the single exception is
/// the operator replay of a dead job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
    Dead,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Dead)
    }

    /// Whether a job in this status can be claimed (once due).
    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
        }
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "dead" => Ok(JobStatus::Dead),
            other => Err(DomainError::validation(format!(
                "unknown job status: {other}"
            ))),
        }
    }
}

/// What a failed attempt turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    Rescheduled(DateTime<Utc>),
    DeadLettered,
}

/// What producers hand to `QueueStore::enqueue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub tenant_id: TenantId,
    pub kind: EventKind,
    /// Caller-supplied idempotency component; non-empty after trimming.
    pub event_key: String,
    /// Business time of the source event. Ordering/audit only — never a
    /// scheduling input.
    pub occurred_at: DateTime<Utc>,
    pub payload: JsonValue,
}

impl NewJob {
    pub fn validate(&self) -> DomainResult<()> {
        if self.event_key.trim().is_empty() {
            return Err(DomainError::validation("event_key cannot be empty"));
        }
        Ok(())
    }

    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey::new(self.tenant_id, self.event_key.clone())
    }
}

/// One unit of ingestion work, owned exclusively by the queue store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueJob {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub kind: EventKind,
    pub event_key: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: JsonValue,
    pub status: JobStatus,
    /// Claimed-and-failed attempts so far; incremented exactly once per
    /// failure (lease expiry included).
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set iff the job succeeded.
    pub processed_at: Option<DateTime<Utc>>,
    /// When the job becomes claimable. Meaningless once terminal, but
    /// retained for audit.
    pub next_attempt_at: DateTime<Utc>,
    /// Set iff the job is dead.
    pub dead_lettered_at: Option<DateTime<Utc>>,
    /// Set iff the job is processing; the crash-recovery lease.
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl QueueJob {
    /// Build a pending job from an enqueue request.
    pub fn create(new: NewJob, now: DateTime<Utc>) -> DomainResult<Self> {
        new.validate()?;
        Ok(Self {
            id: JobId::new(),
            tenant_id: new.tenant_id,
            kind: new.kind,
            event_key: new.event_key,
            occurred_at: new.occurred_at,
            payload: new.payload,
            status: JobStatus::Pending,
            attempt_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            processed_at: None,
            next_attempt_at: now,
            dead_lettered_at: None,
            lease_expires_at: None,
        })
    }

    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey::new(self.tenant_id, self.event_key.clone())
    }

    /// Whether this job is eligible for `claim_due` at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable() && self.next_attempt_at <= now
    }

    /// Whether this job sits behind an expired lease.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing
            && self.lease_expires_at.is_some_and(|at| at < now)
    }

    /// Transition to `processing` under a lease. The store must have checked
    /// claimability; this only records the transition.
    pub fn begin_processing(&mut self, lease: Duration, now: DateTime<Utc>) {
        self.status = JobStatus::Processing;
        self.lease_expires_at =
            Some(now + chrono::Duration::from_std(lease).unwrap_or_default());
        self.updated_at = now;
    }

    /// Terminal success.
    pub fn succeed(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Succeeded;
        self.processed_at = Some(now);
        self.lease_expires_at = None;
        self.updated_at = now;
    }

    /// Record a failed attempt and consult the policy with the incremented
    /// attempt count: either rescheduled with backoff or dead-lettered.
    pub fn fail(
        &mut self,
        error: impl Into<String>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> FailureDisposition {
        self.attempt_count += 1;
        self.last_error = Some(error.into());
        self.lease_expires_at = None;
        self.updated_at = now;

        match policy.decide(self.attempt_count) {
            RetryDecision::Retry(delay) => {
                self.status = JobStatus::Failed;
                self.next_attempt_at =
                    now + chrono::Duration::from_std(delay).unwrap_or_default();
                FailureDisposition::Rescheduled(self.next_attempt_at)
            }
            RetryDecision::DeadLetter => {
                self.status = JobStatus::Dead;
                self.dead_lettered_at = Some(now);
                FailureDisposition::DeadLettered
            }
        }
    }

    /// Operator replay: reset a dead job to pending with a fresh attempt
    /// budget. The only externally triggered transition.
    pub fn replay(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != JobStatus::Dead {
            return Err(DomainError::conflict("only dead jobs can be replayed"));
        }
        self.status = JobStatus::Pending;
        self.attempt_count = 0;
        self.next_attempt_at = now;
        self.dead_lettered_at = None;
        self.lease_expires_at = None;
        self.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_job(tenant_id: TenantId) -> NewJob {
        NewJob {
            tenant_id,
            kind: EventKind::FormSubmitted,
            event_key: "evt-1".to_string(),
            occurred_at: Utc::now(),
            payload: json!({"email": "jane@example.com", "form_id": "f-1"}),
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Duration::from_millis(100),
            Duration::from_secs(10),
        )
        .without_jitter()
    }

    #[test]
    fn empty_event_key_is_rejected() {
        let mut new = new_job(TenantId::new());
        new.event_key = "   ".to_string();
        let err = QueueJob::create(new, Utc::now()).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn fresh_job_is_immediately_due() {
        let now = Utc::now();
        let job = QueueJob::create(new_job(TenantId::new()), now).unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt_count, 0);
        assert_eq!(job.next_attempt_at, now);
        assert!(job.is_due(now));
    }

    #[test]
    fn lifecycle_success_sets_processed_at_only() {
        let now = Utc::now();
        let mut job = QueueJob::create(new_job(TenantId::new()), now).unwrap();

        job.begin_processing(Duration::from_secs(30), now);
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.lease_expires_at.is_some());
        assert!(!job.is_due(now));

        job.succeed(now);
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.processed_at, Some(now));
        assert_eq!(job.dead_lettered_at, None);
        assert_eq!(job.lease_expires_at, None);
    }

    #[test]
    fn failure_increments_attempt_and_backs_off() {
        let now = Utc::now();
        let mut job = QueueJob::create(new_job(TenantId::new()), now).unwrap();
        let policy = policy(3);

        job.begin_processing(Duration::from_secs(30), now);
        let disposition = job.fail("boom", &policy, now);

        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.as_deref(), Some("boom"));
        assert!(job.next_attempt_at > now);
        assert!(!job.is_due(now));
        match disposition {
            FailureDisposition::Rescheduled(at) => assert_eq!(at, job.next_attempt_at),
            other => panic!("expected Rescheduled, got {other:?}"),
        }
    }

    #[test]
    fn dead_letter_exactly_at_max_attempts() {
        let now = Utc::now();
        let mut job = QueueJob::create(new_job(TenantId::new()), now).unwrap();
        let policy = policy(3);

        for attempt in 1..3u32 {
            job.begin_processing(Duration::from_secs(30), now);
            let disposition = job.fail("boom", &policy, now);
            assert_eq!(job.attempt_count, attempt);
            assert!(matches!(disposition, FailureDisposition::Rescheduled(_)));
        }

        job.begin_processing(Duration::from_secs(30), now);
        let disposition = job.fail("boom", &policy, now);

        assert_eq!(job.attempt_count, 3);
        assert_eq!(disposition, FailureDisposition::DeadLettered);
        assert_eq!(job.status, JobStatus::Dead);
        assert_eq!(job.dead_lettered_at, Some(now));
        assert_eq!(job.processed_at, None);
    }

    #[test]
    fn lease_expiry_is_detected() {
        let now = Utc::now();
        let mut job = QueueJob::create(new_job(TenantId::new()), now).unwrap();

        job.begin_processing(Duration::from_secs(30), now);
        assert!(!job.lease_expired(now));
        assert!(job.lease_expired(now + chrono::Duration::seconds(31)));
    }

    #[test]
    fn replay_resets_dead_job() {
        let now = Utc::now();
        let mut job = QueueJob::create(new_job(TenantId::new()), now).unwrap();
        let policy = policy(1);

        job.begin_processing(Duration::from_secs(30), now);
        job.fail("boom", &policy, now);
        assert_eq!(job.status, JobStatus::Dead);

        let later = now + chrono::Duration::minutes(5);
        job.replay(later).unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt_count, 0);
        assert_eq!(job.dead_lettered_at, None);
        assert!(job.is_due(later));
        // The last error is kept for audit.
        assert_eq!(job.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn replay_rejects_non_dead_jobs() {
        let now = Utc::now();
        let mut job = QueueJob::create(new_job(TenantId::new()), now).unwrap();

        let err = job.replay(now).unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }
}
