//! Applied-event ledger and the CRM write side.
//!
//! `record_applied` is the pipeline's single commit point: the ledger row,
//! the contact resolution, the lead upsert, and the activity append all land
//! in one transaction, or none of them do.

mod in_memory;
mod plan;
mod postgres;
mod store;

pub use in_memory::InMemoryDomainStore;
pub use plan::{ActivityDraft, ApplyOutcome, ApplyPlan, ApplyReport};
pub use postgres::PostgresDomainStore;
pub use store::{AppliedEventLedger, ContactRepository, LedgerError};
