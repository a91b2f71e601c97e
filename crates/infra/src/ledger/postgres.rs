//! Postgres-backed domain store.
//!
//! `record_applied` runs one transaction per event: the `ON CONFLICT DO
//! NOTHING` ledger insert is the authoritative at-most-once check, contact
//! resolution reads lock the matched rows, and a unique violation on the
//! contacts table (two jobs racing to create the same identity) aborts the
//! transaction and re-runs it with fresh lookups — the compare-and-swap
//! pattern, bounded to a few rounds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use tracing::instrument;
use uuid::Uuid;

use leadflow_contacts::{
    Activity, ActivityKind, Contact, ContactResolver, Lead, LeadStatus, Resolution,
    normalize_email, normalize_phone,
};
use leadflow_core::{
    ActivityId, AppliedEventId, ContactId, DomainError, IdempotencyKey, LeadId, TenantId,
};
use leadflow_ingest::{AppliedEvent, EventKind};

use super::plan::{ApplyOutcome, ApplyPlan, ApplyReport};
use super::store::{AppliedEventLedger, ContactRepository, LedgerError};
use crate::postgres::{is_unique_violation, unavailable};

/// Rounds of the whole-transaction retry when contact creation loses a race.
const RESOLUTION_RETRIES: u32 = 3;

/// Postgres-backed implementation of the ledger and the CRM read side.
#[derive(Debug, Clone)]
pub struct PostgresDomainStore {
    pool: PgPool,
}

impl PostgresDomainStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct ContactRow {
    id: Uuid,
    tenant_id: Uuid,
    full_name: Option<String>,
    email: Option<String>,
    email_normalized: Option<String>,
    phone: Option<String>,
    phone_normalized: Option<String>,
    source: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ContactRow> for Contact {
    fn from(row: ContactRow) -> Self {
        Contact {
            id: ContactId::from_uuid(row.id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            full_name: row.full_name,
            email: row.email,
            email_normalized: row.email_normalized,
            phone: row.phone,
            phone_normalized: row.phone_normalized,
            source: row.source,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct LeadRow {
    id: Uuid,
    tenant_id: Uuid,
    contact_id: Uuid,
    source: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<LeadRow> for Lead {
    type Error = LedgerError;

    fn try_from(row: LeadRow) -> Result<Self, Self::Error> {
        let status: LeadStatus = row
            .status
            .parse()
            .map_err(|e: DomainError| LedgerError::Unavailable(format!("lead row decode: {e}")))?;
        Ok(Lead {
            id: LeadId::from_uuid(row.id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            contact_id: ContactId::from_uuid(row.contact_id),
            source: row.source,
            status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ActivityRow {
    id: Uuid,
    tenant_id: Uuid,
    contact_id: Uuid,
    kind: String,
    summary: String,
    occurred_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl TryFrom<ActivityRow> for Activity {
    type Error = LedgerError;

    fn try_from(row: ActivityRow) -> Result<Self, Self::Error> {
        let kind: ActivityKind = row.kind.parse().map_err(|e: DomainError| {
            LedgerError::Unavailable(format!("activity row decode: {e}"))
        })?;
        Ok(Activity {
            id: ActivityId::from_uuid(row.id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            contact_id: ContactId::from_uuid(row.contact_id),
            kind,
            summary: row.summary,
            occurred_at: row.occurred_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct AppliedEventRow {
    id: Uuid,
    tenant_id: Uuid,
    kind: String,
    event_key: String,
    occurred_at: DateTime<Utc>,
    payload: serde_json::Value,
    processed_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl TryFrom<AppliedEventRow> for AppliedEvent {
    type Error = LedgerError;

    fn try_from(row: AppliedEventRow) -> Result<Self, Self::Error> {
        let kind: EventKind = row.kind.parse().map_err(|e: DomainError| {
            LedgerError::Unavailable(format!("applied event row decode: {e}"))
        })?;
        Ok(AppliedEvent {
            id: AppliedEventId::from_uuid(row.id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            kind,
            event_key: row.event_key,
            occurred_at: row.occurred_at,
            payload: row.payload,
            processed_at: row.processed_at,
            created_at: row.created_at,
        })
    }
}

const CONTACT_COLUMNS: &str =
    "id, tenant_id, full_name, email, email_normalized, phone, phone_normalized, source, \
     created_at, updated_at";

/// Error shape internal to the apply transaction.
enum TryRecordError {
    /// A contacts unique index fired: another transaction created the same
    /// identity concurrently. Re-run the whole apply with fresh lookups.
    ContactRace,
    Ledger(LedgerError),
}

impl From<LedgerError> for TryRecordError {
    fn from(err: LedgerError) -> Self {
        TryRecordError::Ledger(err)
    }
}

#[async_trait]
impl AppliedEventLedger for PostgresDomainStore {
    async fn contains(&self, key: &IdempotencyKey) -> Result<bool, LedgerError> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM applied_events WHERE tenant_id = $1 AND event_key = $2",
        )
        .bind(key.tenant_id.as_uuid())
        .bind(&key.event_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LedgerError::Unavailable(unavailable("ledger contains", e)))?;
        Ok(row.is_some())
    }

    async fn get(&self, key: &IdempotencyKey) -> Result<Option<AppliedEvent>, LedgerError> {
        let row: Option<AppliedEventRow> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, kind, event_key, occurred_at, payload, processed_at, created_at
            FROM applied_events
            WHERE tenant_id = $1 AND event_key = $2
            "#,
        )
        .bind(key.tenant_id.as_uuid())
        .bind(&key.event_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LedgerError::Unavailable(unavailable("ledger get", e)))?;

        row.map(AppliedEvent::try_from).transpose()
    }

    #[instrument(
        skip(self, plan),
        fields(tenant_id = %plan.tenant_id, kind = %plan.kind, event_key = %plan.event_key),
        err
    )]
    async fn record_applied(
        &self,
        plan: ApplyPlan,
        now: DateTime<Utc>,
    ) -> Result<ApplyOutcome, LedgerError> {
        let mut rounds = 0;
        loop {
            match self.try_record(&plan, now).await {
                Ok(outcome) => return Ok(outcome),
                Err(TryRecordError::ContactRace) if rounds < RESOLUTION_RETRIES => {
                    rounds += 1;
                    tracing::debug!(
                        tenant_id = %plan.tenant_id,
                        event_key = %plan.event_key,
                        round = rounds,
                        "contact creation lost a race; re-resolving"
                    );
                }
                Err(TryRecordError::ContactRace) => {
                    return Err(LedgerError::Contention(format!(
                        "contact resolution for {} kept colliding after {RESOLUTION_RETRIES} rounds",
                        plan.idempotency_key()
                    )));
                }
                Err(TryRecordError::Ledger(err)) => return Err(err),
            }
        }
    }
}

impl PostgresDomainStore {
    async fn try_record(
        &self,
        plan: &ApplyPlan,
        now: DateTime<Utc>,
    ) -> Result<ApplyOutcome, TryRecordError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| LedgerError::Unavailable(unavailable("apply begin", e)))?;

        // Authoritative at-most-once check: the ledger insert either claims
        // the key or tells us a prior attempt already committed.
        let applied_event_id = AppliedEventId::new();
        let inserted = sqlx::query(
            r#"
            INSERT INTO applied_events
                (id, tenant_id, kind, event_key, occurred_at, payload, processed_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            ON CONFLICT (tenant_id, event_key) DO NOTHING
            "#,
        )
        .bind(applied_event_id.as_uuid())
        .bind(plan.tenant_id.as_uuid())
        .bind(plan.kind.as_str())
        .bind(&plan.event_key)
        .bind(plan.occurred_at)
        .bind(&plan.payload)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| LedgerError::Unavailable(unavailable("ledger insert", e)))?;

        if inserted.rows_affected() == 0 {
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        // Contact resolution inside the transaction; the matched rows are
        // locked so concurrent updates serialize behind us.
        let by_email = match plan.identity.email_normalized() {
            Some(normalized) => {
                self.contact_for_update(&mut tx, plan.tenant_id, "email_normalized", &normalized)
                    .await?
            }
            None => None,
        };
        let by_phone = match plan.identity.phone_normalized() {
            Some(normalized) => {
                self.contact_for_update(&mut tx, plan.tenant_id, "phone_normalized", &normalized)
                    .await?
            }
            None => None,
        };

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

        match &resolution {
            Resolution::Created(contact) => {
                let result = sqlx::query(&format!(
                    r#"
                    INSERT INTO contacts ({CONTACT_COLUMNS})
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                    "#
                ))
                .bind(contact.id.as_uuid())
                .bind(contact.tenant_id.as_uuid())
                .bind(&contact.full_name)
                .bind(&contact.email)
                .bind(&contact.email_normalized)
                .bind(&contact.phone)
                .bind(&contact.phone_normalized)
                .bind(&contact.source)
                .bind(contact.created_at)
                .bind(contact.updated_at)
                .execute(&mut *tx)
                .await;

                if let Err(e) = result {
                    if is_unique_violation(&e, Some("contacts")) {
                        return Err(TryRecordError::ContactRace);
                    }
                    return Err(LedgerError::Unavailable(unavailable("contact insert", e)).into());
                }
            }
            Resolution::Matched { changed, .. } | Resolution::Conflict { changed, .. } => {
                if *changed {
                    let result = sqlx::query(
                        r#"
                        UPDATE contacts
                        SET full_name = $2, email = $3, email_normalized = $4,
                            phone = $5, phone_normalized = $6, updated_at = $7
                        WHERE id = $1
                        "#,
                    )
                    .bind(contact.id.as_uuid())
                    .bind(&contact.full_name)
                    .bind(&contact.email)
                    .bind(&contact.email_normalized)
                    .bind(&contact.phone)
                    .bind(&contact.phone_normalized)
                    .bind(contact.updated_at)
                    .execute(&mut *tx)
                    .await;

                    if let Err(e) = result {
                        if is_unique_violation(&e, Some("contacts")) {
                            return Err(TryRecordError::ContactRace);
                        }
                        return Err(
                            LedgerError::Unavailable(unavailable("contact update", e)).into()
                        );
                    }
                }
            }
        }

        let (lead_id, lead_created) = if plan.opens_lead {
            self.upsert_open_lead(&mut tx, plan, contact_id, now).await?
        } else {
            (None, false)
        };

        let activity_id = match &plan.activity {
            Some(draft) => {
                let activity = Activity::record(
                    plan.tenant_id,
                    contact_id,
                    draft.kind,
                    draft.summary.clone(),
                    plan.occurred_at,
                    now,
                );
                sqlx::query(
                    r#"
                    INSERT INTO activities
                        (id, tenant_id, contact_id, kind, summary, occurred_at, created_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    "#,
                )
                .bind(activity.id.as_uuid())
                .bind(activity.tenant_id.as_uuid())
                .bind(activity.contact_id.as_uuid())
                .bind(activity.kind.as_str())
                .bind(&activity.summary)
                .bind(activity.occurred_at)
                .bind(activity.created_at)
                .execute(&mut *tx)
                .await
                .map_err(|e| LedgerError::Unavailable(unavailable("activity insert", e)))?;
                Some(activity.id)
            }
            None => None,
        };

        tx.commit()
            .await
            .map_err(|e| LedgerError::Unavailable(unavailable("apply commit", e)))?;

        if let Some(shadowed) = conflict_with {
            tracing::warn!(
                tenant_id = %plan.tenant_id,
                contact_id = %contact_id,
                shadowed_contact_id = %shadowed,
                event_key = %plan.event_key,
                "contact identity conflict recorded"
            );
        }

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

    /// Locked lookup of one contact by a normalized dedup column.
    async fn contact_for_update(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: TenantId,
        column: &str,
        normalized: &str,
    ) -> Result<Option<Contact>, LedgerError> {
        let row: Option<ContactRow> = sqlx::query_as(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts \
             WHERE tenant_id = $1 AND {column} = $2 FOR UPDATE"
        ))
        .bind(tenant_id.as_uuid())
        .bind(normalized)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| LedgerError::Unavailable(unavailable("contact lookup", e)))?;

        Ok(row.map(Contact::from))
    }

    /// Touch the contact's open lead or open a new one.
    async fn upsert_open_lead(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        plan: &ApplyPlan,
        contact_id: ContactId,
        now: DateTime<Utc>,
    ) -> Result<(Option<LeadId>, bool), TryRecordError> {
        let existing: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM leads
            WHERE tenant_id = $1 AND contact_id = $2 AND status = 'open'
            FOR UPDATE
            "#,
        )
        .bind(plan.tenant_id.as_uuid())
        .bind(contact_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| LedgerError::Unavailable(unavailable("lead lookup", e)))?;

        if let Some((id,)) = existing {
            sqlx::query("UPDATE leads SET updated_at = $2 WHERE id = $1")
                .bind(id)
                .bind(now)
                .execute(&mut **tx)
                .await
                .map_err(|e| LedgerError::Unavailable(unavailable("lead touch", e)))?;
            return Ok((Some(LeadId::from_uuid(id)), false));
        }

        let lead = Lead::open(plan.tenant_id, contact_id, plan.kind.as_str(), now);
        let result = sqlx::query(
            r#"
            INSERT INTO leads (id, tenant_id, contact_id, source, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(lead.id.as_uuid())
        .bind(lead.tenant_id.as_uuid())
        .bind(lead.contact_id.as_uuid())
        .bind(&lead.source)
        .bind(lead.status.as_str())
        .bind(lead.created_at)
        .bind(lead.updated_at)
        .execute(&mut **tx)
        .await;

        match result {
            Ok(_) => Ok((Some(lead.id), true)),
            // One open lead per contact: losing this race means another
            // transaction just opened one. Re-run the apply.
            Err(e) if is_unique_violation(&e, Some("leads")) => Err(TryRecordError::ContactRace),
            Err(e) => Err(LedgerError::Unavailable(unavailable("lead insert", e)).into()),
        }
    }
}

#[async_trait]
impl ContactRepository for PostgresDomainStore {
    async fn contact(
        &self,
        tenant_id: TenantId,
        contact_id: ContactId,
    ) -> Result<Option<Contact>, LedgerError> {
        let row: Option<ContactRow> = sqlx::query_as(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant_id.as_uuid())
        .bind(contact_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LedgerError::Unavailable(unavailable("contact get", e)))?;
        Ok(row.map(Contact::from))
    }

    async fn contact_by_email(
        &self,
        tenant_id: TenantId,
        email: &str,
    ) -> Result<Option<Contact>, LedgerError> {
        let Some(normalized) = normalize_email(email) else {
            return Ok(None);
        };
        let row: Option<ContactRow> = sqlx::query_as(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts \
             WHERE tenant_id = $1 AND email_normalized = $2"
        ))
        .bind(tenant_id.as_uuid())
        .bind(&normalized)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LedgerError::Unavailable(unavailable("contact by email", e)))?;
        Ok(row.map(Contact::from))
    }

    async fn contact_by_phone(
        &self,
        tenant_id: TenantId,
        phone: &str,
    ) -> Result<Option<Contact>, LedgerError> {
        let Some(normalized) = normalize_phone(phone) else {
            return Ok(None);
        };
        let row: Option<ContactRow> = sqlx::query_as(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts \
             WHERE tenant_id = $1 AND phone_normalized = $2"
        ))
        .bind(tenant_id.as_uuid())
        .bind(&normalized)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LedgerError::Unavailable(unavailable("contact by phone", e)))?;
        Ok(row.map(Contact::from))
    }

    async fn list_contacts(&self, tenant_id: TenantId) -> Result<Vec<Contact>, LedgerError> {
        let rows: Vec<ContactRow> = sqlx::query_as(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts WHERE tenant_id = $1 ORDER BY created_at ASC"
        ))
        .bind(tenant_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LedgerError::Unavailable(unavailable("contact list", e)))?;
        Ok(rows.into_iter().map(Contact::from).collect())
    }

    async fn leads_for_contact(
        &self,
        tenant_id: TenantId,
        contact_id: ContactId,
    ) -> Result<Vec<Lead>, LedgerError> {
        let rows: Vec<LeadRow> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, contact_id, source, status, created_at, updated_at
            FROM leads
            WHERE tenant_id = $1 AND contact_id = $2
            ORDER BY created_at ASC
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(contact_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LedgerError::Unavailable(unavailable("lead list", e)))?;
        rows.into_iter().map(Lead::try_from).collect()
    }

    async fn activities_for_contact(
        &self,
        tenant_id: TenantId,
        contact_id: ContactId,
    ) -> Result<Vec<Activity>, LedgerError> {
        let rows: Vec<ActivityRow> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, contact_id, kind, summary, occurred_at, created_at
            FROM activities
            WHERE tenant_id = $1 AND contact_id = $2
            ORDER BY created_at ASC
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(contact_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LedgerError::Unavailable(unavailable("activity list", e)))?;
        rows.into_iter().map(Activity::try_from).collect()
    }
}
