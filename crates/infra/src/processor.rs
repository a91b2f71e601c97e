//! Event processor: interpret one queue job and apply its effect exactly
//! once.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use leadflow_contacts::{ActivityKind, ContactIdentity};
use leadflow_ingest::{EventPayload, QueueJob};

use crate::ledger::{ActivityDraft, AppliedEventLedger, ApplyOutcome, ApplyPlan, ApplyReport};

/// Result of one processing attempt.
#[derive(Debug)]
pub enum ProcessOutcome {
    /// The event was applied: domain entities written, ledger row inserted.
    Applied(ApplyReport),
    /// The ledger already held the key; nothing to do. This also covers the
    /// crash window where a prior attempt committed but the job was never
    /// marked succeeded — the retry lands here and is harmless.
    Skipped,
    /// The attempt failed; the dispatcher routes this through retry/backoff.
    /// Validation failures take the same path as transient ones — the
    /// attempt budget is the only escalation, which keeps the state machine
    /// small, and exhausted jobs surface in the dead-letter set.
    Failed(String),
}

/// Interprets jobs against the applied-event ledger.
pub struct Processor<L> {
    ledger: Arc<L>,
}

impl<L> Processor<L>
where
    L: AppliedEventLedger,
{
    pub fn new(ledger: Arc<L>) -> Self {
        Self { ledger }
    }

    /// Process one claimed job.
    pub async fn process(&self, job: &QueueJob, now: DateTime<Utc>) -> ProcessOutcome {
        let key = job.idempotency_key();

        // Fast path; the authoritative check is the in-transaction ledger
        // insert inside record_applied.
        match self.ledger.contains(&key).await {
            Ok(true) => {
                debug!(job_id = %job.id, key = %key, "event already applied; skipping");
                return ProcessOutcome::Skipped;
            }
            Ok(false) => {}
            Err(e) => return ProcessOutcome::Failed(e.to_string()),
        }

        let payload = match EventPayload::decode(job.kind, &job.payload) {
            Ok(payload) => payload,
            Err(e) => return ProcessOutcome::Failed(e.to_string()),
        };

        let plan = build_plan(job, payload);
        match self.ledger.record_applied(plan, now).await {
            Ok(ApplyOutcome::Recorded(report)) => ProcessOutcome::Applied(report),
            Ok(ApplyOutcome::AlreadyApplied) => ProcessOutcome::Skipped,
            Err(e) => ProcessOutcome::Failed(e.to_string()),
        }
    }
}

/// Translate a decoded payload into the atomic unit of work for the ledger.
fn build_plan(job: &QueueJob, payload: EventPayload) -> ApplyPlan {
    let source = job.kind.as_str().to_string();
    let (identity, opens_lead, activity) = match payload {
        EventPayload::FormSubmitted(p) => (
            ContactIdentity {
                email: Some(p.email),
                phone: p.phone,
                full_name: p.name,
                source,
            },
            true,
            Some(ActivityDraft {
                kind: ActivityKind::FormSubmission,
                summary: match p.message {
                    Some(message) => format!("form {} submitted: {message}", p.form_id),
                    None => format!("form {} submitted", p.form_id),
                },
            }),
        ),
        EventPayload::ContactImported(p) => {
            let origin = p.source.unwrap_or_else(|| source.clone());
            (
                ContactIdentity {
                    email: p.email,
                    phone: p.phone,
                    full_name: p.name,
                    source,
                },
                false,
                Some(ActivityDraft {
                    kind: ActivityKind::Import,
                    summary: format!("imported from {origin}"),
                }),
            )
        }
        EventPayload::CallLogged(p) => (
            ContactIdentity {
                email: None,
                phone: Some(p.phone),
                full_name: None,
                source,
            },
            false,
            Some(ActivityDraft {
                kind: ActivityKind::Call,
                summary: match p.notes {
                    Some(notes) => format!("call logged ({}s): {notes}", p.duration_secs),
                    None => format!("call logged ({}s)", p.duration_secs),
                },
            }),
        ),
        EventPayload::OrderCreated(p) => (
            ContactIdentity {
                email: Some(p.email),
                phone: None,
                full_name: p.name,
                source,
            },
            true,
            Some(ActivityDraft {
                kind: ActivityKind::Order,
                summary: format!("order placed: {} {}", p.amount_cents, p.currency),
            }),
        ),
    };

    ApplyPlan {
        tenant_id: job.tenant_id,
        kind: job.kind,
        event_key: job.event_key.clone(),
        occurred_at: job.occurred_at,
        payload: job.payload.clone(),
        identity,
        opens_lead,
        activity,
    }
}
