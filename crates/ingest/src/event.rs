//! Typed ingestion events.
//!
//! External producers submit `(event kind, opaque payload)` pairs; the
//! payload blob travels through the queue untouched and is decoded exactly
//! once, at the processor boundary. Each kind has a typed payload shape here.

use core::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use leadflow_core::DomainError;

/// Discriminates processor logic. Stored on the job and the ledger row as the
/// stable wire name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "form.submitted")]
    FormSubmitted,
    #[serde(rename = "contact.imported")]
    ContactImported,
    #[serde(rename = "call.logged")]
    CallLogged,
    #[serde(rename = "order.created")]
    OrderCreated,
}

impl EventKind {
    /// Stable wire name (e.g. "form.submitted").
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::FormSubmitted => "form.submitted",
            EventKind::ContactImported => "contact.imported",
            EventKind::CallLogged => "call.logged",
            EventKind::OrderCreated => "order.created",
        }
    }
}

impl core::fmt::Display for EventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "form.submitted" => Ok(EventKind::FormSubmitted),
            "contact.imported" => Ok(EventKind::ContactImported),
            "call.logged" => Ok(EventKind::CallLogged),
            "order.created" => Ok(EventKind::OrderCreated),
            other => Err(DomainError::validation(format!(
                "unknown event kind: {other}"
            ))),
        }
    }
}

/// A website form submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormSubmitted {
    pub email: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub form_id: String,
    pub message: Option<String>,
}

/// A contact row from a bulk import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactImported {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub name: Option<String>,
    /// Import origin label (falls back to the event kind's wire name).
    pub source: Option<String>,
}

/// A logged phone call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallLogged {
    pub phone: String,
    pub duration_secs: u32,
    pub notes: Option<String>,
}

/// An order placed in an external shop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub email: String,
    pub name: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
}

/// Decoded payload, one variant per [`EventKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    FormSubmitted(FormSubmitted),
    ContactImported(ContactImported),
    CallLogged(CallLogged),
    OrderCreated(OrderCreated),
}

/// Payload decode/validation failure.
///
/// Both variants follow the same retry path as transient failures — the
/// attempt budget is the only escalation mechanism, and exhausted jobs land
/// in the dead-letter set for manual inspection.
#[derive(Debug, Clone, Error)]
pub enum DecodeError {
    #[error("malformed {kind} payload: {reason}")]
    Malformed { kind: EventKind, reason: String },

    #[error("invalid {kind} payload: {reason}")]
    Invalid { kind: EventKind, reason: String },
}

impl EventPayload {
    /// Decode a raw payload blob against its declared kind and validate it.
    pub fn decode(kind: EventKind, raw: &JsonValue) -> Result<Self, DecodeError> {
        let malformed = |e: serde_json::Error| DecodeError::Malformed {
            kind,
            reason: e.to_string(),
        };

        let payload = match kind {
            EventKind::FormSubmitted => {
                EventPayload::FormSubmitted(serde_json::from_value(raw.clone()).map_err(malformed)?)
            }
            EventKind::ContactImported => {
                EventPayload::ContactImported(serde_json::from_value(raw.clone()).map_err(malformed)?)
            }
            EventKind::CallLogged => {
                EventPayload::CallLogged(serde_json::from_value(raw.clone()).map_err(malformed)?)
            }
            EventKind::OrderCreated => {
                EventPayload::OrderCreated(serde_json::from_value(raw.clone()).map_err(malformed)?)
            }
        };

        payload.validate()?;
        Ok(payload)
    }

    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::FormSubmitted(_) => EventKind::FormSubmitted,
            EventPayload::ContactImported(_) => EventKind::ContactImported,
            EventPayload::CallLogged(_) => EventKind::CallLogged,
            EventPayload::OrderCreated(_) => EventKind::OrderCreated,
        }
    }

    fn validate(&self) -> Result<(), DecodeError> {
        let invalid = |kind: EventKind, reason: &str| DecodeError::Invalid {
            kind,
            reason: reason.to_string(),
        };

        match self {
            EventPayload::FormSubmitted(p) => {
                if p.email.trim().is_empty() {
                    return Err(invalid(EventKind::FormSubmitted, "email cannot be empty"));
                }
                if p.form_id.trim().is_empty() {
                    return Err(invalid(EventKind::FormSubmitted, "form_id cannot be empty"));
                }
            }
            EventPayload::ContactImported(p) => {
                let has_email = p.email.as_deref().is_some_and(|e| !e.trim().is_empty());
                let has_phone = p.phone.as_deref().is_some_and(|e| !e.trim().is_empty());
                if !has_email && !has_phone {
                    return Err(invalid(
                        EventKind::ContactImported,
                        "at least one of email or phone is required",
                    ));
                }
            }
            EventPayload::CallLogged(p) => {
                if p.phone.trim().is_empty() {
                    return Err(invalid(EventKind::CallLogged, "phone cannot be empty"));
                }
            }
            EventPayload::OrderCreated(p) => {
                if p.email.trim().is_empty() {
                    return Err(invalid(EventKind::OrderCreated, "email cannot be empty"));
                }
                if p.amount_cents < 0 {
                    return Err(invalid(EventKind::OrderCreated, "amount cannot be negative"));
                }
                if p.currency.trim().is_empty() {
                    return Err(invalid(EventKind::OrderCreated, "currency cannot be empty"));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_names_round_trip() {
        for kind in [
            EventKind::FormSubmitted,
            EventKind::ContactImported,
            EventKind::CallLogged,
            EventKind::OrderCreated,
        ] {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
    }

    #[test]
    fn decodes_form_submission() {
        let raw = json!({
            "email": "jane@example.com",
            "name": "Jane Doe",
            "phone": null,
            "form_id": "contact-us",
            "message": "hi"
        });

        let payload = EventPayload::decode(EventKind::FormSubmitted, &raw).unwrap();
        match payload {
            EventPayload::FormSubmitted(p) => {
                assert_eq!(p.email, "jane@example.com");
                assert_eq!(p.form_id, "contact-us");
            }
            other => panic!("expected FormSubmitted, got {other:?}"),
        }
    }

    #[test]
    fn missing_fields_are_malformed() {
        let raw = json!({ "name": "no email or form" });
        let err = EventPayload::decode(EventKind::FormSubmitted, &raw).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { .. }));
    }

    #[test]
    fn empty_email_is_invalid() {
        let raw = json!({ "email": "  ", "form_id": "f-1" });
        let err = EventPayload::decode(EventKind::FormSubmitted, &raw).unwrap_err();
        assert!(matches!(err, DecodeError::Invalid { .. }));
    }

    #[test]
    fn import_requires_some_identity() {
        let raw = json!({ "name": "Jane" });
        let err = EventPayload::decode(EventKind::ContactImported, &raw).unwrap_err();
        assert!(matches!(err, DecodeError::Invalid { .. }));

        let raw = json!({ "phone": "+1 555 123 4567" });
        assert!(EventPayload::decode(EventKind::ContactImported, &raw).is_ok());
    }

    #[test]
    fn negative_order_amount_is_invalid() {
        let raw = json!({ "email": "a@b.com", "amount_cents": -5, "currency": "EUR" });
        let err = EventPayload::decode(EventKind::OrderCreated, &raw).unwrap_err();
        assert!(matches!(err, DecodeError::Invalid { .. }));
    }
}
