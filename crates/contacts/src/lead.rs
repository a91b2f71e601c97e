//! Lead entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use leadflow_core::{ContactId, LeadId, TenantId};

/// Lead lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeadStatus {
    Open,
    Won,
    Lost,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStatus::Open => "open",
            LeadStatus::Won => "won",
            LeadStatus::Lost => "lost",
        }
    }
}

impl core::str::FromStr for LeadStatus {
    type Err = leadflow_core::DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(LeadStatus::Open),
            "won" => Ok(LeadStatus::Won),
            "lost" => Ok(LeadStatus::Lost),
            other => Err(leadflow_core::DomainError::validation(format!(
                "unknown lead status: {other}"
            ))),
        }
    }
}

/// A sales opportunity attached to a contact.
///
/// Dedup rule: at most one open lead per `(tenant, contact)`. Lead-bearing
/// events touch the existing open lead instead of opening a second one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lead {
    pub id: LeadId,
    pub tenant_id: TenantId,
    pub contact_id: ContactId,
    /// Wire name of the event kind that opened the lead.
    pub source: String,
    pub status: LeadStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    /// Open a new lead for a contact.
    pub fn open(
        tenant_id: TenantId,
        contact_id: ContactId,
        source: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: LeadId::new(),
            tenant_id,
            contact_id,
            source: source.into(),
            status: LeadStatus::Open,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record activity on an existing lead.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    pub fn is_open(&self) -> bool {
        self.status == LeadStatus::Open
    }
}
