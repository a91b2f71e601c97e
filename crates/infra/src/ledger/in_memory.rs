//! In-memory domain store for tests/dev.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use leadflow_contacts::{
    Activity, Contact, ContactResolver, Lead, Resolution, normalize_email, normalize_phone,
};
use leadflow_core::{AppliedEventId, ContactId, DomainError, IdempotencyKey, LeadId, TenantId};
use leadflow_ingest::AppliedEvent;

use super::plan::{ApplyOutcome, ApplyPlan, ApplyReport};
use super::store::{AppliedEventLedger, ContactRepository, LedgerError};

#[derive(Debug, Default)]
struct DomainState {
    contacts: HashMap<ContactId, Contact>,
    email_index: HashMap<(TenantId, String), ContactId>,
    phone_index: HashMap<(TenantId, String), ContactId>,
    leads: HashMap<LeadId, Lead>,
    activities: Vec<Activity>,
    applied: HashMap<(TenantId, String), AppliedEvent>,
}

impl DomainState {
    fn contact_by_email_norm(&self, tenant_id: TenantId, normalized: &str) -> Option<Contact> {
        self.email_index
            .get(&(tenant_id, normalized.to_string()))
            .and_then(|id| self.contacts.get(id))
            .cloned()
    }

    fn contact_by_phone_norm(&self, tenant_id: TenantId, normalized: &str) -> Option<Contact> {
        self.phone_index
            .get(&(tenant_id, normalized.to_string()))
            .and_then(|id| self.contacts.get(id))
            .cloned()
    }

    /// Insert/update a contact and keep both dedup indexes in step.
    fn upsert_contact(&mut self, contact: Contact) {
        if let Some(normalized) = &contact.email_normalized {
            self.email_index
                .insert((contact.tenant_id, normalized.clone()), contact.id);
        }
        if let Some(normalized) = &contact.phone_normalized {
            self.phone_index
                .insert((contact.tenant_id, normalized.clone()), contact.id);
        }
        self.contacts.insert(contact.id, contact);
    }

    fn open_lead_id(&self, tenant_id: TenantId, contact_id: ContactId) -> Option<LeadId> {
        self.leads
            .values()
            .find(|l| l.tenant_id == tenant_id && l.contact_id == contact_id && l.is_open())
            .map(|l| l.id)
    }
}

/// In-memory implementation of the ledger and the CRM read side.
///
/// One write lock around the whole state gives `record_applied` the same
/// all-or-nothing behavior the Postgres backend gets from a transaction.
#[derive(Debug, Default)]
pub struct InMemoryDomainStore {
    state: RwLock<DomainState>,
}

impl InMemoryDomainStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AppliedEventLedger for InMemoryDomainStore {
    async fn contains(&self, key: &IdempotencyKey) -> Result<bool, LedgerError> {
        let state = self.state.read().unwrap();
        Ok(state
            .applied
            .contains_key(&(key.tenant_id, key.event_key.clone())))
    }

    async fn get(&self, key: &IdempotencyKey) -> Result<Option<AppliedEvent>, LedgerError> {
        let state = self.state.read().unwrap();
        Ok(state
            .applied
            .get(&(key.tenant_id, key.event_key.clone()))
            .cloned())
    }

    async fn record_applied(
        &self,
        plan: ApplyPlan,
        now: DateTime<Utc>,
    ) -> Result<ApplyOutcome, LedgerError> {
        let mut state = self.state.write().unwrap();

        let ledger_key = (plan.tenant_id, plan.event_key.clone());
        if state.applied.contains_key(&ledger_key) {
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        // Contact resolution against the current indexes. Everything below
        // happens under the single write lock, so no retry loop is needed.
        let by_email = plan
            .identity
            .email_normalized()
            .and_then(|n| state.contact_by_email_norm(plan.tenant_id, &n));
        let by_phone = plan
            .identity
            .phone_normalized()
            .and_then(|n| state.contact_by_phone_norm(plan.tenant_id, &n));

        let resolution =
            ContactResolver::resolve(plan.tenant_id, by_email, by_phone, &plan.identity, now)
                .map_err(|e| match e {
                    DomainError::Validation(msg) => LedgerError::Validation(msg),
                    other => LedgerError::Validation(other.to_string()),
                })?;

        let contact_created = resolution.was_created();
        let conflict_with = resolution.shadowed();
        let contact = resolution.contact().clone();
        let contact_id = contact.id;

        let write_contact = match &resolution {
            Resolution::Created(_) => true,
            Resolution::Matched { changed, .. } | Resolution::Conflict { changed, .. } => *changed,
        };
        if write_contact {
            state.upsert_contact(contact);
        }

        let (lead_id, lead_created) = if plan.opens_lead {
            match state.open_lead_id(plan.tenant_id, contact_id) {
                Some(id) => {
                    if let Some(lead) = state.leads.get_mut(&id) {
                        lead.touch(now);
                    }
                    (Some(id), false)
                }
                None => {
                    let lead = Lead::open(plan.tenant_id, contact_id, plan.kind.as_str(), now);
                    let id = lead.id;
                    state.leads.insert(id, lead);
                    (Some(id), true)
                }
            }
        } else {
            (None, false)
        };

        let activity_id = plan.activity.as_ref().map(|draft| {
            let activity = Activity::record(
                plan.tenant_id,
                contact_id,
                draft.kind,
                draft.summary.clone(),
                plan.occurred_at,
                now,
            );
            let id = activity.id;
            state.activities.push(activity);
            id
        });

        let applied_event_id = AppliedEventId::new();
        state.applied.insert(
            ledger_key,
            AppliedEvent {
                id: applied_event_id,
                tenant_id: plan.tenant_id,
                kind: plan.kind,
                event_key: plan.event_key.clone(),
                occurred_at: plan.occurred_at,
                payload: plan.payload.clone(),
                processed_at: now,
                created_at: now,
            },
        );

        Ok(ApplyOutcome::Recorded(ApplyReport {
            applied_event_id,
            contact_id,
            contact_created,
            lead_id,
            lead_created,
            activity_id,
            conflict_with,
        }))
    }
}

#[async_trait]
impl ContactRepository for InMemoryDomainStore {
    async fn contact(
        &self,
        tenant_id: TenantId,
        contact_id: ContactId,
    ) -> Result<Option<Contact>, LedgerError> {
        let state = self.state.read().unwrap();
        Ok(state
            .contacts
            .get(&contact_id)
            .filter(|c| c.tenant_id == tenant_id)
            .cloned())
    }

    async fn contact_by_email(
        &self,
        tenant_id: TenantId,
        email: &str,
    ) -> Result<Option<Contact>, LedgerError> {
        let state = self.state.read().unwrap();
        Ok(normalize_email(email)
            .and_then(|normalized| state.contact_by_email_norm(tenant_id, &normalized)))
    }

    async fn contact_by_phone(
        &self,
        tenant_id: TenantId,
        phone: &str,
    ) -> Result<Option<Contact>, LedgerError> {
        let state = self.state.read().unwrap();
        Ok(normalize_phone(phone)
            .and_then(|normalized| state.contact_by_phone_norm(tenant_id, &normalized)))
    }

    async fn list_contacts(&self, tenant_id: TenantId) -> Result<Vec<Contact>, LedgerError> {
        let state = self.state.read().unwrap();
        let mut contacts: Vec<Contact> = state
            .contacts
            .values()
            .filter(|c| c.tenant_id == tenant_id)
            .cloned()
            .collect();
        contacts.sort_by_key(|c| c.id);
        Ok(contacts)
    }

    async fn leads_for_contact(
        &self,
        tenant_id: TenantId,
        contact_id: ContactId,
    ) -> Result<Vec<Lead>, LedgerError> {
        let state = self.state.read().unwrap();
        let mut leads: Vec<Lead> = state
            .leads
            .values()
            .filter(|l| l.tenant_id == tenant_id && l.contact_id == contact_id)
            .cloned()
            .collect();
        leads.sort_by_key(|l| l.id);
        Ok(leads)
    }

    async fn activities_for_contact(
        &self,
        tenant_id: TenantId,
        contact_id: ContactId,
    ) -> Result<Vec<Activity>, LedgerError> {
        let state = self.state.read().unwrap();
        Ok(state
            .activities
            .iter()
            .filter(|a| a.tenant_id == tenant_id && a.contact_id == contact_id)
            .cloned()
            .collect())
    }
}
