//! Idempotency key value type.

use serde::{Deserialize, Serialize};

use crate::id::TenantId;

/// The `(tenant, event key)` pair identifying one external event within a
/// tenant.
///
/// This is the dedup identity for both the queue and the applied-event
/// ledger. The two uniqueness domains are independent: a job can still sit in
/// the queue (retrying) while no ledger row exists for its key yet.
///
/// The `event_key` is caller-supplied (webhook delivery id, import row id,
/// ...) and must be non-empty; that constraint is enforced where keys enter
/// the system, at enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub tenant_id: TenantId,
    pub event_key: String,
}

impl IdempotencyKey {
    pub fn new(tenant_id: TenantId, event_key: impl Into<String>) -> Self {
        Self {
            tenant_id,
            event_key: event_key.into(),
        }
    }
}

impl core::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.event_key)
    }
}
