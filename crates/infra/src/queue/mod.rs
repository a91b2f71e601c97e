//! Durable job queue: trait, in-memory backend, Postgres backend.

mod in_memory;
mod postgres;
mod store;

pub use in_memory::InMemoryQueueStore;
pub use postgres::PostgresQueueStore;
pub use store::{EnqueueOutcome, QueueCounts, QueueStore, QueueStoreError};
