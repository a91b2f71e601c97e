//! Contact entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use leadflow_core::{ContactId, TenantId};

/// A person record owned by one tenant.
///
/// Dedup invariant: within a tenant there is at most one contact per
/// `email_normalized` and at most one per `phone_normalized` (where those are
/// set). A contact may satisfy neither, either, or both. The raw `email` /
/// `phone` keep whatever formatting the source supplied; only the normalized
/// forms participate in uniqueness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    pub tenant_id: TenantId,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub email_normalized: Option<String>,
    pub phone: Option<String>,
    pub phone_normalized: Option<String>,
    /// Wire name of the event kind that first created this contact.
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Contact {
    /// Whether this contact participates in email-based dedup.
    pub fn has_email_identity(&self) -> bool {
        self.email_normalized.is_some()
    }

    /// Whether this contact participates in phone-based dedup.
    pub fn has_phone_identity(&self) -> bool {
        self.phone_normalized.is_some()
    }
}
