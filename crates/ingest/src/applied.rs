//! Applied-event ledger record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use leadflow_core::{AppliedEventId, IdempotencyKey, TenantId};

/// Durable proof that an idempotency key has been fully applied.
///
/// Write-once: created atomically with the processor's domain-entity writes,
/// never updated or deleted by normal operation. The payload is retained for
/// replay/audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedEvent {
    pub id: AppliedEventId,
    pub tenant_id: TenantId,
    pub kind: crate::event::EventKind,
    pub event_key: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: JsonValue,
    pub processed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl AppliedEvent {
    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey::new(self.tenant_id, self.event_key.clone())
    }
}
