//! The unit of work handed to `record_applied`.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use leadflow_contacts::{ActivityKind, ContactIdentity};
use leadflow_core::{ActivityId, AppliedEventId, ContactId, IdempotencyKey, LeadId, TenantId};
use leadflow_ingest::EventKind;

/// Activity to append for an applied event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityDraft {
    pub kind: ActivityKind,
    pub summary: String,
}

/// Everything needed to apply one event atomically: the contact identity to
/// resolve, the domain writes to perform, and the ledger row to insert.
///
/// Built by the processor from a decoded payload; executed by a ledger
/// backend inside one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyPlan {
    pub tenant_id: TenantId,
    pub kind: EventKind,
    pub event_key: String,
    pub occurred_at: DateTime<Utc>,
    /// Raw payload, retained verbatim on the ledger row for replay/audit.
    pub payload: JsonValue,
    pub identity: ContactIdentity,
    /// Whether this event opens (or touches) a lead for the contact.
    pub opens_lead: bool,
    pub activity: Option<ActivityDraft>,
}

impl ApplyPlan {
    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey::new(self.tenant_id, self.event_key.clone())
    }
}

/// What one `record_applied` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied_event_id: AppliedEventId,
    pub contact_id: ContactId,
    pub contact_created: bool,
    pub lead_id: Option<LeadId>,
    pub lead_created: bool,
    pub activity_id: Option<ActivityId>,
    /// Set when email and phone matched two different contacts; the email
    /// match won and this is the contact left shadowed.
    pub conflict_with: Option<ContactId>,
}

/// Result of `record_applied`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The event was applied in this call.
    Recorded(ApplyReport),
    /// A ledger row for the key already existed; nothing was written.
    AlreadyApplied,
}
