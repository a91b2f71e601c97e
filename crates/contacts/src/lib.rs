//! `leadflow-contacts` — the CRM-side entity graph the pipeline writes into.
//!
//! Contacts are deduplicated per tenant by normalized email and normalized
//! phone; leads and activities hang off a contact. The resolver in this crate
//! is pure — storage backends feed it their indexed lookups and execute the
//! resolution it returns inside their own transaction.

pub mod activity;
pub mod contact;
pub mod lead;
pub mod normalize;
pub mod resolver;

pub use activity::{Activity, ActivityKind};
pub use contact::Contact;
pub use lead::{Lead, LeadStatus};
pub use normalize::{normalize_email, normalize_phone};
pub use resolver::{ContactIdentity, ContactResolver, Resolution};
