//! Job processor: the poll loop that drains pending jobs.
//!
//! Each tick:
//! 1. Fetch pending jobs (optionally scoped to one agent)
//! 2. Claim each one (`pending → processing`, `attempts += 1`) in the store
//! 3. Dispatch to the task handler for its kind
//! 4. Persist `completed`, a retry back to `pending`, or `failed`
//!
//! Ticks never overlap: the loop awaits a tick before waiting on the timer
//! again, and `run_once` shares the same tick lock.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use futures::{FutureExt, StreamExt, stream};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ProcessorConfig;
use crate::error::DatabaseError;
use crate::jobs::handlers::{HandlerRegistry, TaskContext};
use crate::jobs::model::{Job, JobStatus, JobStatusUpdate};
use crate::store::JobStore;

/// Snapshot returned by `status()`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessorStatus {
    pub is_running: bool,
    pub config: ProcessorConfig,
}

/// Counters for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Pending jobs seen at the start of the tick.
    pub fetched: usize,
    pub claimed: usize,
    pub completed: usize,
    /// Failed attempts sent back to `pending`.
    pub retried: usize,
    pub failed: usize,
    /// Lost the claim, already in flight, or abandoned after a store error.
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Retried,
    Failed,
    Skipped,
    /// The store failed mid-attempt; the rest of the tick is abandoned.
    StoreFailed,
}

struct RunningLoop {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// State shared between the processor handle and its loop task.
struct Shared {
    store: Arc<dyn JobStore>,
    handlers: Arc<HandlerRegistry>,
    tick_lock: Mutex<()>,
    in_flight: StdMutex<HashSet<Uuid>>,
    /// Outcomes whose write failed; replayed before the next tick fetches.
    unpersisted: StdMutex<HashMap<Uuid, JobStatusUpdate>>,
}

/// Owned poll-loop scheduler. Several processors may coexist.
pub struct JobProcessor {
    shared: Arc<Shared>,
    config: RwLock<ProcessorConfig>,
    running: Mutex<Option<RunningLoop>>,
}

impl JobProcessor {
    pub fn new(store: Arc<dyn JobStore>, handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                handlers,
                tick_lock: Mutex::new(()),
                in_flight: StdMutex::new(HashSet::new()),
                unpersisted: StdMutex::new(HashMap::new()),
            }),
            config: RwLock::new(ProcessorConfig::default()),
            running: Mutex::new(None),
        }
    }

    /// Set the config used by `run_once` and reported by `status` before the first `start`.
    pub fn with_config(mut self, config: ProcessorConfig) -> Self {
        self.config = RwLock::new(config.normalized());
        self
    }

    /// Start the poll loop. A no-op while already running.
    pub async fn start(&self, config: ProcessorConfig) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!("Job processor already running, ignoring start");
            return;
        }

        let config = config.normalized();
        *self.config.write().await = config.clone();

        if config.recover_orphans {
            match self.shared.recover_orphans(&config).await {
                Ok(0) => {}
                Ok(n) => info!(recovered = n, "Recovered orphaned jobs"),
                Err(e) => warn!(error = %e, "Orphan recovery failed, continuing"),
            }
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let shared = Arc::clone(&self.shared);

        info!(
            poll_interval_ms = config.poll_interval.as_millis() as u64,
            max_retries = config.max_retries,
            max_concurrent = config.max_concurrent,
            agent = config.agent.as_deref().unwrap_or("*"),
            "Job processor started"
        );

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(config.poll_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }
                if *shutdown_rx.borrow() {
                    break;
                }

                match shared.tick(&config).await {
                    Ok(report) if report.fetched > 0 => info!(
                        fetched = report.fetched,
                        completed = report.completed,
                        retried = report.retried,
                        failed = report.failed,
                        skipped = report.skipped,
                        "Tick finished"
                    ),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Tick aborted, store unavailable"),
                }
            }

            info!("Job processor stopped");
        });

        *running = Some(RunningLoop { shutdown, handle });
    }

    /// Stop the loop after the in-flight tick finishes. Safe to call at any time.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(RunningLoop { shutdown, handle }) = running.take() else {
            return;
        };

        let _ = shutdown.send(true);
        if let Err(e) = handle.await {
            error!(error = %e, "Job processor loop panicked");
        }
    }

    pub async fn status(&self) -> ProcessorStatus {
        let is_running = self
            .running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished());
        ProcessorStatus {
            is_running,
            config: self.config.read().await.clone(),
        }
    }

    /// Run exactly one tick with the current config.
    pub async fn run_once(&self) -> Result<TickReport, DatabaseError> {
        let config = self.config.read().await.clone();
        self.shared.tick(&config).await
    }

    /// Reset jobs stuck in `processing` from an interrupted run.
    pub async fn recover_orphans(&self) -> Result<usize, DatabaseError> {
        let config = self.config.read().await.clone();
        self.shared.recover_orphans(&config).await
    }
}

impl Shared {
    async fn tick(&self, config: &ProcessorConfig) -> Result<TickReport, DatabaseError> {
        let _guard = self.tick_lock.lock().await;

        self.replay_unpersisted().await?;

        let pending = self.store.get_pending_jobs(config.agent.as_deref()).await?;
        let mut report = TickReport {
            fetched: pending.len(),
            ..Default::default()
        };
        if pending.is_empty() {
            return Ok(report);
        }

        let ctx = TaskContext::from(config);
        let aborted = AtomicBool::new(false);

        let outcomes: Vec<Outcome> = stream::iter(pending)
            .map(|job| {
                let ctx = &ctx;
                let aborted = &aborted;
                async move {
                    if aborted.load(Ordering::Relaxed) {
                        return Outcome::Skipped;
                    }
                    let outcome = self.attempt(job, config, ctx).await;
                    if outcome == Outcome::StoreFailed {
                        aborted.store(true, Ordering::Relaxed);
                    }
                    outcome
                }
            })
            .buffer_unordered(config.max_concurrent.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                Outcome::Completed => report.completed += 1,
                Outcome::Retried => report.retried += 1,
                Outcome::Failed => report.failed += 1,
                Outcome::Skipped | Outcome::StoreFailed => report.skipped += 1,
            }
            if matches!(
                outcome,
                Outcome::Completed | Outcome::Retried | Outcome::Failed
            ) {
                report.claimed += 1;
            }
        }

        if aborted.into_inner() {
            return Err(DatabaseError::Unavailable(format!(
                "tick abandoned after {} of {} jobs",
                report.claimed, report.fetched
            )));
        }
        Ok(report)
    }

    /// Claim, execute, and persist the outcome of one job.
    async fn attempt(&self, job: Job, config: &ProcessorConfig, ctx: &TaskContext) -> Outcome {
        if !self.mark_in_flight(job.id) {
            debug!(job_id = %job.id, "Job already in flight, skipping");
            return Outcome::Skipped;
        }
        let outcome = self.claim_and_run(job.id, config, ctx).await;
        self.clear_in_flight(job.id);
        outcome
    }

    async fn claim_and_run(&self, id: Uuid, config: &ProcessorConfig, ctx: &TaskContext) -> Outcome {
        let job = match self.store.claim_job(id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!(job_id = %id, "Lost claim race, skipping");
                return Outcome::Skipped;
            }
            Err(e) => {
                error!(job_id = %id, error = %e, "Failed to claim job");
                return Outcome::StoreFailed;
            }
        };

        let kind = job.task_kind();
        debug!(
            job_id = %job.id,
            agent = %job.target_agent,
            kind = %kind,
            attempt = job.attempts,
            "Processing job"
        );

        let result = AssertUnwindSafe(self.handlers.dispatch(&job, ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(crate::error::HandlerError::Execution {
                    kind: kind.to_string(),
                    reason: "handler panicked".to_string(),
                })
            });

        let (update, outcome) = match result {
            Ok(value) => {
                info!(job_id = %job.id, agent = %job.target_agent, attempts = job.attempts, "Job completed");
                (JobStatusUpdate::completed(job.attempts, value), Outcome::Completed)
            }
            Err(e) if e.is_retryable() && job.attempts < config.max_retries => {
                warn!(
                    job_id = %job.id,
                    attempts = job.attempts,
                    max_retries = config.max_retries,
                    error = %e,
                    "Job attempt failed, will retry"
                );
                (JobStatusUpdate::retry(job.attempts, e.to_string()), Outcome::Retried)
            }
            Err(e) => {
                warn!(
                    job_id = %job.id,
                    attempts = job.attempts,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Job failed"
                );
                (JobStatusUpdate::failed(job.attempts, e.to_string()), Outcome::Failed)
            }
        };

        match self.store.update_job_status(job.id, update.clone()).await {
            Ok(_) => outcome,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to persist job outcome, will replay");
                self.unpersisted
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(job.id, update);
                Outcome::StoreFailed
            }
        }
    }

    /// Re-apply outcome writes that failed on an earlier tick.
    ///
    /// Entries whose job has left `processing` (or vanished) are dropped.
    /// Any other failure keeps the rest queued and aborts the tick.
    async fn replay_unpersisted(&self) -> Result<(), DatabaseError> {
        let queued: Vec<(Uuid, JobStatusUpdate)> = self
            .unpersisted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();

        let mut remaining = queued.into_iter();
        while let Some((id, update)) = remaining.next() {
            let err = match self.store.update_job_status(id, update.clone()).await {
                Ok(job) => {
                    info!(job_id = %id, status = %job.status, "Replayed job outcome");
                    continue;
                }
                Err(e) => e,
            };

            let resolved = match self.store.get_job(id).await {
                Ok(None) => true,
                Ok(Some(job)) => job.status != JobStatus::Processing,
                Err(_) => false,
            };
            if resolved {
                warn!(job_id = %id, error = %err, "Dropping stale job outcome");
                continue;
            }

            let mut pending = self
                .unpersisted
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            pending.insert(id, update);
            pending.extend(remaining);
            return Err(err);
        }
        Ok(())
    }

    fn mark_in_flight(&self, id: Uuid) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id)
    }

    fn clear_in_flight(&self, id: Uuid) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    async fn recover_orphans(&self, config: &ProcessorConfig) -> Result<usize, DatabaseError> {
        let _guard = self.tick_lock.lock().await;
        let orphans = self.store.get_jobs_by_status(JobStatus::Processing).await?;

        let mut recovered = 0;
        for job in orphans {
            if config.agent.as_deref().is_some_and(|a| a != job.target_agent) {
                continue;
            }
            let reason = "attempt interrupted before completion";
            let update = if job.attempts < config.max_retries {
                JobStatusUpdate::retry(job.attempts, reason)
            } else {
                JobStatusUpdate::failed(job.attempts, reason)
            };
            let job = self.store.update_job_status(job.id, update).await?;
            debug!(job_id = %job.id, status = %job.status, "Recovered orphaned job");
            recovered += 1;
        }
        Ok(recovered)
    }
}
