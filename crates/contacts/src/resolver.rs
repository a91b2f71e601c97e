//! Contact resolution: map an event's identity fields to exactly one contact.
//!
//! The resolver itself is pure. A storage backend performs the two indexed
//! lookups (by normalized email, by normalized phone), hands the results in,
//! and executes the returned [`Resolution`] inside the same transaction as
//! the rest of the event's writes. Races between concurrent jobs carrying the
//! same identity surface as unique-constraint violations in the backend,
//! which re-queries and resolves again (compare-and-swap).

use chrono::{DateTime, Utc};

use leadflow_core::{ContactId, DomainError, DomainResult, TenantId};

use crate::contact::Contact;
use crate::normalize::{normalize_email, normalize_phone};

/// Identity fields extracted from an event payload, pre-normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactIdentity {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub full_name: Option<String>,
    /// Wire name of the event kind supplying the identity.
    pub source: String,
}

impl ContactIdentity {
    pub fn email_normalized(&self) -> Option<String> {
        self.email.as_deref().and_then(normalize_email)
    }

    pub fn phone_normalized(&self) -> Option<String> {
        self.phone.as_deref().and_then(normalize_phone)
    }

    /// An identity must carry at least one usable dedup key.
    pub fn has_dedup_key(&self) -> bool {
        self.email_normalized().is_some() || self.phone_normalized().is_some()
    }
}

/// What the backend should write for a resolved identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// No existing contact matched; insert this one.
    Created(Contact),
    /// An existing contact matched; update it iff `changed`.
    Matched { contact: Contact, changed: bool },
    /// Email and phone matched two *different* contacts. The email match is
    /// canonical; the phone-matched contact is left untouched and reported so
    /// the conflict is visible instead of silently merged away.
    Conflict {
        contact: Contact,
        changed: bool,
        shadowed: ContactId,
    },
}

impl Resolution {
    pub fn contact(&self) -> &Contact {
        match self {
            Resolution::Created(contact) => contact,
            Resolution::Matched { contact, .. } => contact,
            Resolution::Conflict { contact, .. } => contact,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, Resolution::Created(_))
    }

    pub fn shadowed(&self) -> Option<ContactId> {
        match self {
            Resolution::Conflict { shadowed, .. } => Some(*shadowed),
            _ => None,
        }
    }
}

/// Pure dedup/merge policy.
pub struct ContactResolver;

impl ContactResolver {
    /// Resolve an identity against the two indexed lookups.
    ///
    /// Precedence: email match wins, then phone match, then create. When both
    /// keys match different contacts the email match is canonical and the
    /// phone field is NOT copied onto it — the phone still belongs to the
    /// shadowed contact and copying it would break the phone uniqueness
    /// invariant.
    pub fn resolve(
        tenant_id: TenantId,
        by_email: Option<Contact>,
        by_phone: Option<Contact>,
        identity: &ContactIdentity,
        now: DateTime<Utc>,
    ) -> DomainResult<Resolution> {
        let email_normalized = identity.email_normalized();
        let phone_normalized = identity.phone_normalized();

        if email_normalized.is_none() && phone_normalized.is_none() {
            return Err(DomainError::validation(
                "event carries no usable contact identity (email or phone)",
            ));
        }

        match (by_email, by_phone) {
            (Some(canonical), Some(other)) if canonical.id != other.id => {
                let shadowed = other.id;
                let (contact, changed) = merge_into(canonical, identity, MergePhone::Skip, now);
                tracing::warn!(
                    tenant_id = %tenant_id,
                    contact_id = %contact.id,
                    shadowed_contact_id = %shadowed,
                    "contact identity conflict: email and phone match different contacts; email wins"
                );
                Ok(Resolution::Conflict {
                    contact,
                    changed,
                    shadowed,
                })
            }
            (Some(matched), _) => {
                let (contact, changed) = merge_into(matched, identity, MergePhone::FillIfAbsent, now);
                Ok(Resolution::Matched { contact, changed })
            }
            (None, Some(matched)) => {
                let (contact, changed) = merge_into(matched, identity, MergePhone::FillIfAbsent, now);
                Ok(Resolution::Matched { contact, changed })
            }
            (None, None) => {
                let contact = Contact {
                    id: ContactId::new(),
                    tenant_id,
                    full_name: identity.full_name.clone(),
                    email: email_normalized.is_some().then(|| identity.email.clone()).flatten(),
                    email_normalized,
                    phone: phone_normalized.is_some().then(|| identity.phone.clone()).flatten(),
                    phone_normalized,
                    source: identity.source.clone(),
                    created_at: now,
                    updated_at: now,
                };
                Ok(Resolution::Created(contact))
            }
        }
    }
}

enum MergePhone {
    FillIfAbsent,
    Skip,
}

/// Fold newer identity data into an existing contact. Missing fields are
/// filled; a supplied name replaces a stale one; existing dedup keys are
/// never overwritten.
fn merge_into(
    mut contact: Contact,
    identity: &ContactIdentity,
    phone: MergePhone,
    now: DateTime<Utc>,
) -> (Contact, bool) {
    let mut changed = false;

    if let Some(name) = &identity.full_name {
        if contact.full_name.as_deref() != Some(name.as_str()) {
            contact.full_name = Some(name.clone());
            changed = true;
        }
    }

    if contact.email_normalized.is_none() {
        if let Some(normalized) = identity.email_normalized() {
            contact.email = identity.email.clone();
            contact.email_normalized = Some(normalized);
            changed = true;
        }
    }

    if matches!(phone, MergePhone::FillIfAbsent) && contact.phone_normalized.is_none() {
        if let Some(normalized) = identity.phone_normalized() {
            contact.phone = identity.phone.clone();
            contact.phone_normalized = Some(normalized);
            changed = true;
        }
    }

    if changed {
        contact.updated_at = now;
    }

    (contact, changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn test_tenant_id() -> TenantId {
        TenantId::new()
    }

    fn identity(email: Option<&str>, phone: Option<&str>, name: Option<&str>) -> ContactIdentity {
        ContactIdentity {
            email: email.map(str::to_string),
            phone: phone.map(str::to_string),
            full_name: name.map(str::to_string),
            source: "form.submitted".to_string(),
        }
    }

    fn existing_contact(
        tenant_id: TenantId,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Contact {
        let now = Utc::now();
        Contact {
            id: ContactId::new(),
            tenant_id,
            full_name: None,
            email: email.map(str::to_string),
            email_normalized: email.and_then(normalize_email),
            phone: phone.map(str::to_string),
            phone_normalized: phone.and_then(normalize_phone),
            source: "contact.imported".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn creates_when_nothing_matches() {
        let tenant_id = test_tenant_id();
        let identity = identity(Some("Jane@Example.com"), None, Some("Jane Doe"));

        let resolution =
            ContactResolver::resolve(tenant_id, None, None, &identity, Utc::now()).unwrap();

        assert!(resolution.was_created());
        let contact = resolution.contact();
        assert_eq!(contact.email_normalized.as_deref(), Some("jane@example.com"));
        assert_eq!(contact.email.as_deref(), Some("Jane@Example.com"));
        assert_eq!(contact.full_name.as_deref(), Some("Jane Doe"));
        assert_eq!(contact.phone_normalized, None);
    }

    #[test]
    fn email_match_fills_missing_phone_and_name() {
        let tenant_id = test_tenant_id();
        let existing = existing_contact(tenant_id, Some("jane@example.com"), None);
        let existing_id = existing.id;
        let identity = identity(
            Some("JANE@example.com"),
            Some("+1 555 123 4567"),
            Some("Jane Doe"),
        );

        let resolution =
            ContactResolver::resolve(tenant_id, Some(existing), None, &identity, Utc::now())
                .unwrap();

        match resolution {
            Resolution::Matched { contact, changed } => {
                assert!(changed);
                assert_eq!(contact.id, existing_id);
                assert_eq!(contact.phone_normalized.as_deref(), Some("+15551234567"));
                assert_eq!(contact.full_name.as_deref(), Some("Jane Doe"));
            }
            other => panic!("expected Matched, got {other:?}"),
        }
    }

    #[test]
    fn phone_match_fills_missing_email() {
        let tenant_id = test_tenant_id();
        let existing = existing_contact(tenant_id, None, Some("+15551234567"));
        let existing_id = existing.id;
        let identity = identity(Some("jane@example.com"), Some("+1 (555) 123-4567"), None);

        let resolution =
            ContactResolver::resolve(tenant_id, None, Some(existing), &identity, Utc::now())
                .unwrap();

        match resolution {
            Resolution::Matched { contact, changed } => {
                assert!(changed);
                assert_eq!(contact.id, existing_id);
                assert_eq!(contact.email_normalized.as_deref(), Some("jane@example.com"));
            }
            other => panic!("expected Matched, got {other:?}"),
        }
    }

    #[test]
    fn unchanged_match_reports_no_write() {
        let tenant_id = test_tenant_id();
        let existing = existing_contact(tenant_id, Some("jane@example.com"), Some("+15551234567"));
        let identity = identity(Some("jane@example.com"), None, None);

        let resolution =
            ContactResolver::resolve(tenant_id, Some(existing.clone()), None, &identity, Utc::now())
                .unwrap();

        match resolution {
            Resolution::Matched { contact, changed } => {
                assert!(!changed);
                assert_eq!(contact, existing);
            }
            other => panic!("expected Matched, got {other:?}"),
        }
    }

    #[test]
    fn conflicting_matches_keep_email_contact_canonical() {
        let tenant_id = test_tenant_id();
        let by_email = existing_contact(tenant_id, Some("jane@example.com"), None);
        let by_phone = existing_contact(tenant_id, None, Some("+15551234567"));
        let canonical_id = by_email.id;
        let shadowed_id = by_phone.id;
        let identity = identity(Some("jane@example.com"), Some("+15551234567"), None);

        let resolution = ContactResolver::resolve(
            tenant_id,
            Some(by_email),
            Some(by_phone),
            &identity,
            Utc::now(),
        )
        .unwrap();

        match resolution {
            Resolution::Conflict {
                contact, shadowed, ..
            } => {
                assert_eq!(contact.id, canonical_id);
                assert_eq!(shadowed, shadowed_id);
                // The phone stays with the shadowed contact.
                assert_eq!(contact.phone_normalized, None);
            }
            other => panic!("expected Conflict, got {other:?}"),
        }
    }

    #[test]
    fn same_contact_matching_both_keys_is_not_a_conflict() {
        let tenant_id = test_tenant_id();
        let existing = existing_contact(tenant_id, Some("jane@example.com"), Some("+15551234567"));
        let identity = identity(Some("jane@example.com"), Some("+15551234567"), None);

        let resolution = ContactResolver::resolve(
            tenant_id,
            Some(existing.clone()),
            Some(existing),
            &identity,
            Utc::now(),
        )
        .unwrap();

        assert!(matches!(resolution, Resolution::Matched { changed: false, .. }));
    }

    #[test]
    fn identity_without_dedup_key_is_rejected() {
        let tenant_id = test_tenant_id();
        let identity = identity(Some("not-an-email"), Some("12"), Some("Jane"));

        let err =
            ContactResolver::resolve(tenant_id, None, None, &identity, Utc::now()).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }
}
