//! `leadflow-infra` — storage backends and the ingestion pipeline runtime.
//!
//! The pipeline is wired from three seams: the [`queue::QueueStore`] holding
//! jobs, the [`ledger::AppliedEventLedger`] holding proof-of-completion plus
//! the domain writes, and the [`dispatcher::Dispatcher`] pulling the two
//! together. Each seam has an in-memory implementation (tests/dev) and a
//! Postgres implementation (production).

pub mod dispatcher;
pub mod ledger;
pub mod postgres;
pub mod processor;
pub mod queue;

#[cfg(test)]
mod integration_tests;

pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherHandle, DispatcherStats};
pub use ledger::{
    ActivityDraft, AppliedEventLedger, ApplyOutcome, ApplyPlan, ApplyReport, ContactRepository,
    InMemoryDomainStore, LedgerError, PostgresDomainStore,
};
pub use processor::{ProcessOutcome, Processor};
pub use queue::{
    EnqueueOutcome, InMemoryQueueStore, PostgresQueueStore, QueueCounts, QueueStore,
    QueueStoreError,
};
