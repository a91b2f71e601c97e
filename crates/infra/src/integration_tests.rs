//! Integration tests for the full ingestion pipeline.
//!
//! Enqueue → claim → process → ledger/domain writes → outcome marks, with
//! the dispatcher running where concurrency matters.

#[cfg(test)]
mod tests {
    use std::ops::AsyncFnMut;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;

    use leadflow_core::{Clock, ManualClock, SystemClock, TenantId};
    use leadflow_ingest::{EventKind, JobStatus, NewJob, RetryPolicy};

    use crate::dispatcher::{Dispatcher, DispatcherConfig};
    use crate::ledger::{AppliedEventLedger, ContactRepository, InMemoryDomainStore};
    use crate::processor::{ProcessOutcome, Processor};
    use crate::queue::{InMemoryQueueStore, QueueStore};

    fn test_tenant_id() -> TenantId {
        TenantId::new()
    }

    fn order_created(tenant_id: TenantId, event_key: &str) -> NewJob {
        NewJob {
            tenant_id,
            kind: EventKind::OrderCreated,
            event_key: event_key.to_string(),
            occurred_at: Utc::now(),
            payload: json!({
                "email": "jane@example.com",
                "name": "Jane Doe",
                "amount_cents": 4200,
                "currency": "EUR"
            }),
        }
    }

    fn fast_config(policy: RetryPolicy) -> DispatcherConfig {
        DispatcherConfig::default()
            .with_workers(2)
            .with_batch_size(5)
            .with_retry_policy(policy)
    }

    /// Poll until `check` passes or the deadline expires.
    async fn wait_for<F>(what: &str, mut check: F)
    where
        F: AsyncFnMut() -> bool,
    {
        for _ in 0..500 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicate_enqueue_processes_once_end_to_end() {
        let queue = Arc::new(InMemoryQueueStore::new());
        let domain = Arc::new(InMemoryDomainStore::new());
        let processor = Arc::new(Processor::new(domain.clone()));
        let tenant_id = test_tenant_id();
        let now = Utc::now();

        // Enqueue the same external event twice: one job.
        let first = queue.enqueue(order_created(tenant_id, "ord-42"), now).await.unwrap();
        let second = queue.enqueue(order_created(tenant_id, "ord-42"), now).await.unwrap();
        assert!(second.is_duplicate());
        assert_eq!(first.job_id(), second.job_id());

        let handle = Dispatcher::spawn(
            queue.clone(),
            processor,
            Arc::new(SystemClock),
            fast_config(RetryPolicy::default()),
        );

        wait_for("job to succeed", async || {
            queue.counts(tenant_id).await.unwrap().succeeded == 1
        })
        .await;
        handle.shutdown().await;

        // One applied event, one contact, one lead.
        let job = queue.get(tenant_id, first.job_id()).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert!(job.processed_at.is_some());
        assert!(domain.contains(&job.idempotency_key()).await.unwrap());

        let contacts = domain.list_contacts(tenant_id).await.unwrap();
        assert_eq!(contacts.len(), 1);
        assert_eq!(
            domain
                .leads_for_contact(tenant_id, contacts[0].id)
                .await
                .unwrap()
                .len(),
            1
        );

        // Re-enqueue after success: still a no-op duplicate everywhere.
        let again = queue.enqueue(order_created(tenant_id, "ord-42"), Utc::now()).await.unwrap();
        assert!(again.is_duplicate());
        let counts = queue.counts(tenant_id).await.unwrap();
        assert_eq!(counts.succeeded, 1);
        assert_eq!(counts.pending, 0);
        assert_eq!(domain.list_contacts(tenant_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retry_after_ledger_write_is_idempotent() {
        // The crash window: a prior attempt committed the ledger row but the
        // worker died before mark_succeeded. The lease sweep requeues the
        // job; the retry must skip, not re-apply.
        let queue = Arc::new(InMemoryQueueStore::new());
        let domain = Arc::new(InMemoryDomainStore::new());
        let processor = Processor::new(domain.clone());
        let tenant_id = test_tenant_id();
        let policy = RetryPolicy::default().without_jitter();
        let clock = ManualClock::from_now();

        queue
            .enqueue(order_created(tenant_id, "ord-7"), clock.now())
            .await
            .unwrap();

        // First attempt: claim + process, then crash before mark_succeeded.
        let claimed = queue
            .claim_due(1, Duration::from_secs(30), clock.now())
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert!(matches!(
            processor.process(&claimed[0], clock.now()).await,
            ProcessOutcome::Applied(_)
        ));

        // Lease expires; sweep requeues with one counted attempt.
        clock.advance(chrono::Duration::seconds(31));
        let released = queue.release_expired(&policy, clock.now()).await.unwrap();
        assert_eq!(released.len(), 1);

        let job = queue.get(tenant_id, claimed[0].id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt_count, 1);

        // Retry: the ledger short-circuits to Skipped and the job completes.
        clock.advance(chrono::Duration::seconds(2));
        let reclaimed = queue
            .claim_due(1, Duration::from_secs(30), clock.now())
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].attempt_count, 1);
        assert!(matches!(
            processor.process(&reclaimed[0], clock.now()).await,
            ProcessOutcome::Skipped
        ));
        queue
            .mark_succeeded(reclaimed[0].id, clock.now())
            .await
            .unwrap();

        // Exactly one application happened.
        let contacts = domain.list_contacts(tenant_id).await.unwrap();
        assert_eq!(contacts.len(), 1);
        assert_eq!(
            domain
                .activities_for_contact(tenant_id, contacts[0].id)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_workers_apply_each_event_exactly_once() {
        let queue = Arc::new(InMemoryQueueStore::new());
        let domain = Arc::new(InMemoryDomainStore::new());
        let processor = Arc::new(Processor::new(domain.clone()));
        let tenant_id = test_tenant_id();
        let now = Utc::now();

        let total = 30u64;
        for i in 0..total {
            queue
                .enqueue(
                    NewJob {
                        tenant_id,
                        kind: EventKind::ContactImported,
                        event_key: format!("import-{i}"),
                        occurred_at: now,
                        payload: json!({"email": format!("user{i}@example.com")}),
                    },
                    now,
                )
                .await
                .unwrap();
        }

        let config = fast_config(RetryPolicy::default()).with_workers(4);
        let handle = Dispatcher::spawn(queue.clone(), processor, Arc::new(SystemClock), config);

        wait_for("all imports to succeed", async || {
            queue.counts(tenant_id).await.unwrap().succeeded == total
        })
        .await;
        handle.shutdown().await;

        // Every event applied exactly once: distinct emails, one activity each.
        let contacts = domain.list_contacts(tenant_id).await.unwrap();
        assert_eq!(contacts.len(), total as usize);
        for contact in contacts {
            assert_eq!(
                domain
                    .activities_for_contact(tenant_id, contact.id)
                    .await
                    .unwrap()
                    .len(),
                1
            );
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bad_job_dead_letters_without_touching_good_jobs() {
        let queue = Arc::new(InMemoryQueueStore::new());
        let domain = Arc::new(InMemoryDomainStore::new());
        let processor = Arc::new(Processor::new(domain.clone()));
        let tenant_id = test_tenant_id();
        let now = Utc::now();

        // A payload that fails validation every time.
        queue
            .enqueue(
                NewJob {
                    tenant_id,
                    kind: EventKind::OrderCreated,
                    event_key: "bad-1".to_string(),
                    occurred_at: now,
                    payload: json!({"unexpected": true}),
                },
                now,
            )
            .await
            .unwrap();
        for i in 0..3 {
            queue
                .enqueue(
                    NewJob {
                        tenant_id,
                        kind: EventKind::FormSubmitted,
                        event_key: format!("good-{i}"),
                        occurred_at: now,
                        payload: json!({"email": format!("ok{i}@example.com"), "form_id": "f"}),
                    },
                    now,
                )
                .await
                .unwrap();
        }

        let policy = RetryPolicy::new(
            2,
            Duration::from_millis(1),
            Duration::from_millis(10),
        )
        .without_jitter();
        let handle = Dispatcher::spawn(
            queue.clone(),
            processor,
            Arc::new(SystemClock),
            fast_config(policy),
        );

        wait_for("good jobs to succeed and bad job to die", async || {
            let counts = queue.counts(tenant_id).await.unwrap();
            counts.succeeded == 3 && counts.dead == 1
        })
        .await;
        handle.shutdown().await;

        let dead = queue.list_dead(tenant_id, 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].event_key, "bad-1");
        assert_eq!(dead[0].attempt_count, 2);
        assert!(dead[0].last_error.as_deref().unwrap().contains("payload"));
        assert!(dead[0].dead_lettered_at.is_some());

        // The failure never leaked into the domain.
        assert_eq!(domain.list_contacts(tenant_id).await.unwrap().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn replayed_dead_job_gets_a_fresh_budget() {
        let queue = Arc::new(InMemoryQueueStore::new());
        let domain = Arc::new(InMemoryDomainStore::new());
        let processor = Arc::new(Processor::new(domain.clone()));
        let tenant_id = test_tenant_id();
        let now = Utc::now();
        let policy = RetryPolicy::new(
            1,
            Duration::from_millis(1),
            Duration::from_millis(10),
        )
        .without_jitter();

        let job_id = queue
            .enqueue(
                NewJob {
                    tenant_id,
                    kind: EventKind::CallLogged,
                    event_key: "call-9".to_string(),
                    occurred_at: now,
                    payload: json!({"phone": ""}),
                },
                now,
            )
            .await
            .unwrap()
            .job_id();

        let handle = Dispatcher::spawn(
            queue.clone(),
            processor,
            Arc::new(SystemClock),
            fast_config(policy.clone()),
        );
        wait_for("job to dead-letter", async || {
            queue.counts(tenant_id).await.unwrap().dead == 1
        })
        .await;
        handle.shutdown().await;

        let replayed = queue.replay_dead(tenant_id, job_id, Utc::now()).await.unwrap();
        assert_eq!(replayed.status, JobStatus::Pending);
        assert_eq!(replayed.attempt_count, 0);

        // Still invalid: it runs through the whole budget again and dies.
        let handle = Dispatcher::spawn(
            queue.clone(),
            Arc::new(Processor::new(domain.clone())),
            Arc::new(SystemClock),
            fast_config(policy),
        );
        wait_for("replayed job to dead-letter again", async || {
            queue.counts(tenant_id).await.unwrap().dead == 1
        })
        .await;
        handle.shutdown().await;
    }
}
