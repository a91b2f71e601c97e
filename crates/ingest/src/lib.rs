//! `leadflow-ingest` — queue-side domain types.
//!
//! The types here are pure: the job state machine takes `now` explicitly,
//! the retry policy is a function of its inputs, and event payloads are
//! decoded/validated in one place. Storage and scheduling live in
//! `leadflow-infra`.

pub mod applied;
pub mod event;
pub mod job;
pub mod retry;

pub use applied::AppliedEvent;
pub use event::{CallLogged, ContactImported, DecodeError, EventKind, EventPayload, FormSubmitted, OrderCreated};
pub use job::{FailureDisposition, JobStatus, NewJob, QueueJob};
pub use retry::{RetryDecision, RetryPolicy};
