//! Activity entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use leadflow_core::{ActivityId, ContactId, TenantId};

/// What kind of touchpoint an activity records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    FormSubmission,
    Call,
    Order,
    Import,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::FormSubmission => "form_submission",
            ActivityKind::Call => "call",
            ActivityKind::Order => "order",
            ActivityKind::Import => "import",
        }
    }
}

impl core::str::FromStr for ActivityKind {
    type Err = leadflow_core::DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "form_submission" => Ok(ActivityKind::FormSubmission),
            "call" => Ok(ActivityKind::Call),
            "order" => Ok(ActivityKind::Order),
            "import" => Ok(ActivityKind::Import),
            other => Err(leadflow_core::DomainError::validation(format!(
                "unknown activity kind: {other}"
            ))),
        }
    }
}

/// One touchpoint on a contact's timeline. Append-only; the at-most-once
/// application guarantee upstream is what prevents duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub id: ActivityId,
    pub tenant_id: TenantId,
    pub contact_id: ContactId,
    pub kind: ActivityKind,
    pub summary: String,
    /// Business time of the source event, not the ingestion time.
    pub occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Activity {
    pub fn record(
        tenant_id: TenantId,
        contact_id: ContactId,
        kind: ActivityKind,
        summary: impl Into<String>,
        occurred_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ActivityId::new(),
            tenant_id,
            contact_id,
            kind,
            summary: summary.into(),
            occurred_at,
            created_at: now,
        }
    }
}
