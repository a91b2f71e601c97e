//! Ledger and CRM read-side abstractions.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use leadflow_contacts::{Activity, Contact, Lead};
use leadflow_core::{ContactId, IdempotencyKey, TenantId};
use leadflow_ingest::AppliedEvent;

use super::plan::{ApplyOutcome, ApplyPlan};

/// Ledger/domain-store error.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    Validation(String),

    /// Contact resolution kept colliding with concurrent writers after
    /// retries; surfaced for the normal retry path.
    #[error("contact resolution contention: {0}")]
    Contention(String),

    /// The backing store is unreachable or misbehaving; transient.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable proof-of-completion store plus the atomic apply operation.
///
/// `record_applied` never creates ledger rows speculatively: the row is
/// inserted in the same transaction as the domain writes, and the insert
/// doubles as the authoritative at-most-once check (`AlreadyApplied` when the
/// key is taken).
#[async_trait]
pub trait AppliedEventLedger: Send + Sync {
    /// Fast-path check for an applied key.
    async fn contains(&self, key: &IdempotencyKey) -> Result<bool, LedgerError>;

    /// Fetch the ledger row for a key.
    async fn get(&self, key: &IdempotencyKey) -> Result<Option<AppliedEvent>, LedgerError>;

    /// Apply one event atomically: resolve/create the contact, perform the
    /// lead/activity writes, insert the ledger row — all in one transaction.
    async fn record_applied(
        &self,
        plan: ApplyPlan,
        now: DateTime<Utc>,
    ) -> Result<ApplyOutcome, LedgerError>;
}

#[async_trait]
impl<L> AppliedEventLedger for Arc<L>
where
    L: AppliedEventLedger + ?Sized,
{
    async fn contains(&self, key: &IdempotencyKey) -> Result<bool, LedgerError> {
        (**self).contains(key).await
    }

    async fn get(&self, key: &IdempotencyKey) -> Result<Option<AppliedEvent>, LedgerError> {
        (**self).get(key).await
    }

    async fn record_applied(
        &self,
        plan: ApplyPlan,
        now: DateTime<Utc>,
    ) -> Result<ApplyOutcome, LedgerError> {
        (**self).record_applied(plan, now).await
    }
}

/// Read access to the entity graph the pipeline writes (operational tooling
/// and tests).
#[async_trait]
pub trait ContactRepository: Send + Sync {
    async fn contact(
        &self,
        tenant_id: TenantId,
        contact_id: ContactId,
    ) -> Result<Option<Contact>, LedgerError>;

    /// Lookup by raw email; normalization happens here.
    async fn contact_by_email(
        &self,
        tenant_id: TenantId,
        email: &str,
    ) -> Result<Option<Contact>, LedgerError>;

    /// Lookup by raw phone; normalization happens here.
    async fn contact_by_phone(
        &self,
        tenant_id: TenantId,
        phone: &str,
    ) -> Result<Option<Contact>, LedgerError>;

    async fn list_contacts(&self, tenant_id: TenantId) -> Result<Vec<Contact>, LedgerError>;

    async fn leads_for_contact(
        &self,
        tenant_id: TenantId,
        contact_id: ContactId,
    ) -> Result<Vec<Lead>, LedgerError>;

    async fn activities_for_contact(
        &self,
        tenant_id: TenantId,
        contact_id: ContactId,
    ) -> Result<Vec<Activity>, LedgerError>;
}
