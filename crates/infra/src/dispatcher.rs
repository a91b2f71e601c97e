//! Dispatcher: the worker pool and the lease sweeper.
//!
//! Workers share nothing but the queue store; the atomic claim is the only
//! concurrency boundary. One job's failure never touches another job — a
//! processor error becomes `mark_failed` and the loop moves on.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use leadflow_core::Clock;
use leadflow_ingest::{FailureDisposition, RetryPolicy};

use crate::ledger::AppliedEventLedger;
use crate::processor::{ProcessOutcome, Processor};
use crate::queue::QueueStore;

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Worker tasks pulling from the queue.
    pub workers: usize,
    /// Jobs claimed per poll.
    pub batch_size: usize,
    /// Poll interval while work keeps arriving.
    pub poll_interval: Duration,
    /// Ceiling for the idle backoff (doubles from `poll_interval`).
    pub idle_max: Duration,
    /// Claim lease length; must comfortably exceed one job's processing time.
    pub lease: Duration,
    /// How often the sweeper requeues expired leases.
    pub sweep_interval: Duration,
    pub retry_policy: RetryPolicy,
    /// Name for logging.
    pub name: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_size: 10,
            poll_interval: Duration::from_millis(100),
            idle_max: Duration::from_secs(5),
            lease: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            retry_policy: RetryPolicy::default(),
            name: "ingest-dispatcher".to_string(),
        }
    }
}

impl DispatcherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

/// Dispatcher runtime counters.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DispatcherStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_skipped: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    pub leases_recovered: u64,
}

/// Handle to control a running dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl DispatcherHandle {
    /// Request graceful shutdown and wait for workers to drain.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        self.stats.lock().unwrap().clone()
    }
}

/// Worker pool driving claimed jobs through the processor.
pub struct Dispatcher;

impl Dispatcher {
    /// Spawn the worker pool and the lease sweeper.
    pub fn spawn<Q, L, C>(
        queue: Arc<Q>,
        processor: Arc<Processor<L>>,
        clock: Arc<C>,
        config: DispatcherConfig,
    ) -> DispatcherHandle
    where
        Q: QueueStore + 'static,
        L: AppliedEventLedger + 'static,
        C: Clock + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(DispatcherStats::default()));

        info!(
            dispatcher = %config.name,
            workers = config.workers,
            batch_size = config.batch_size,
            "dispatcher starting"
        );

        let mut tasks = Vec::with_capacity(config.workers + 1);
        for worker in 0..config.workers.max(1) {
            tasks.push(tokio::spawn(worker_loop(
                worker,
                queue.clone(),
                processor.clone(),
                clock.clone(),
                config.clone(),
                shutdown_rx.clone(),
                stats.clone(),
            )));
        }
        tasks.push(tokio::spawn(sweeper_loop(
            queue,
            clock,
            config,
            shutdown_rx,
            stats.clone(),
        )));

        DispatcherHandle {
            shutdown: shutdown_tx,
            tasks,
            stats,
        }
    }
}

/// Sleep for `wait` unless shutdown arrives first. Returns true on shutdown.
async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, wait: Duration) -> bool {
    // The only value ever sent is `true`, so any change (or a dropped
    // sender) means shutdown.
    let interrupted = tokio::select! {
        _ = tokio::time::sleep(wait) => false,
        _ = shutdown.changed() => true,
    };
    interrupted || *shutdown.borrow()
}

async fn worker_loop<Q, L, C>(
    worker: usize,
    queue: Arc<Q>,
    processor: Arc<Processor<L>>,
    clock: Arc<C>,
    config: DispatcherConfig,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<DispatcherStats>>,
) where
    Q: QueueStore,
    L: AppliedEventLedger,
    C: Clock,
{
    let mut idle = config.poll_interval;

    loop {
        if *shutdown.borrow() {
            break;
        }

        match queue
            .claim_due(config.batch_size, config.lease, clock.now())
            .await
        {
            Ok(batch) if !batch.is_empty() => {
                idle = config.poll_interval;
                for job in batch {
                    debug!(
                        dispatcher = %config.name,
                        worker,
                        job_id = %job.id,
                        kind = %job.kind,
                        attempt_count = job.attempt_count,
                        "claimed job"
                    );
                    handle_job(&job, &queue, &processor, &clock, &config, &stats).await;
                }
            }
            Ok(_) => {
                // Nothing due; back off up to the ceiling.
                if sleep_or_shutdown(&mut shutdown, idle).await {
                    break;
                }
                idle = (idle * 2).min(config.idle_max);
            }
            Err(e) => {
                error!(
                    dispatcher = %config.name,
                    worker,
                    error = %e,
                    "failed to claim jobs"
                );
                if sleep_or_shutdown(&mut shutdown, idle).await {
                    break;
                }
                idle = (idle * 2).min(config.idle_max);
            }
        }
    }

    debug!(dispatcher = %config.name, worker, "worker stopped");
}

async fn handle_job<Q, L, C>(
    job: &leadflow_ingest::QueueJob,
    queue: &Arc<Q>,
    processor: &Arc<Processor<L>>,
    clock: &Arc<C>,
    config: &DispatcherConfig,
    stats: &Arc<Mutex<DispatcherStats>>,
) where
    Q: QueueStore,
    L: AppliedEventLedger,
    C: Clock,
{
    let outcome = processor.process(job, clock.now()).await;

    match outcome {
        ProcessOutcome::Applied(report) => {
            if let Err(e) = queue.mark_succeeded(job.id, clock.now()).await {
                error!(job_id = %job.id, error = %e, "failed to mark job succeeded");
                return;
            }
            debug!(
                job_id = %job.id,
                contact_id = %report.contact_id,
                contact_created = report.contact_created,
                "event applied"
            );
            let mut stats = stats.lock().unwrap();
            stats.jobs_processed += 1;
            stats.jobs_succeeded += 1;
        }
        ProcessOutcome::Skipped => {
            // Already applied on an earlier attempt; completing the job is
            // all that's left.
            if let Err(e) = queue.mark_succeeded(job.id, clock.now()).await {
                error!(job_id = %job.id, error = %e, "failed to mark skipped job succeeded");
                return;
            }
            let mut stats = stats.lock().unwrap();
            stats.jobs_processed += 1;
            stats.jobs_succeeded += 1;
            stats.jobs_skipped += 1;
        }
        ProcessOutcome::Failed(reason) => {
            match queue
                .mark_failed(job.id, &reason, &config.retry_policy, clock.now())
                .await
            {
                Ok(FailureDisposition::Rescheduled(next_attempt_at)) => {
                    warn!(
                        job_id = %job.id,
                        error = %reason,
                        next_attempt_at = %next_attempt_at,
                        "job failed; rescheduled"
                    );
                    let mut stats = stats.lock().unwrap();
                    stats.jobs_processed += 1;
                    stats.jobs_failed += 1;
                }
                Ok(FailureDisposition::DeadLettered) => {
                    warn!(job_id = %job.id, error = %reason, "job dead-lettered");
                    let mut stats = stats.lock().unwrap();
                    stats.jobs_processed += 1;
                    stats.jobs_failed += 1;
                    stats.jobs_dead_lettered += 1;
                }
                Err(e) => {
                    // The lease will expire and the sweeper recovers the job.
                    error!(job_id = %job.id, error = %e, "failed to record job failure");
                }
            }
        }
    }
}

async fn sweeper_loop<Q, C>(
    queue: Arc<Q>,
    clock: Arc<C>,
    config: DispatcherConfig,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<DispatcherStats>>,
) where
    Q: QueueStore,
    C: Clock,
{
    loop {
        if sleep_or_shutdown(&mut shutdown, config.sweep_interval).await {
            break;
        }

        match queue
            .release_expired(&config.retry_policy, clock.now())
            .await
        {
            Ok(released) if !released.is_empty() => {
                warn!(
                    dispatcher = %config.name,
                    count = released.len(),
                    "recovered jobs with expired leases"
                );
                let mut stats = stats.lock().unwrap();
                stats.leases_recovered += released.len() as u64;
            }
            Ok(_) => {}
            Err(e) => {
                error!(dispatcher = %config.name, error = %e, "lease sweep failed");
            }
        }
    }

    debug!(dispatcher = %config.name, "sweeper stopped");
}
