//! Worker pool driver: batch dispatch until no pending task remains.
//!
//! Each cycle takes a fresh snapshot of the pending set, starts at most
//! `max_concurrency` executions, and waits for every one of them before the
//! next cycle. Tasks beyond the bound are not queued in memory; the next
//! snapshot picks them up. The driver holds no state that matters for
//! resumption, so it can be stopped and restarted between any two cycles.
//!
//! While it has claims out, a run holds a [`RunLease`]. Each snapshot moves
//! in-progress rows back to needs-retry when the run that claimed them no
//! longer holds its lease, so a run killed mid-execution loses no task.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::execution::{Disposition, ExecutionContext, ExecutionReport, run_execution};
use crate::allocator::Allocator;
use crate::config::{Config, ExhaustionPolicy};
use crate::error::{Error, Result};
use crate::executor::TaskExecutor;
use crate::lock::{LockManager, RunLease};
use crate::model::{Outcome, PoolId, Status, TaskKey, TaskRecord};
use crate::queue::TaskQueue;
use crate::storage::{Row, Storage};
use crate::telemetry::metrics;

/// Configuration for the driver loop.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Executions started per cycle.
    pub max_concurrency: usize,
    /// Pause after each batch (and after a failed cycle-start read).
    pub poll_interval: Duration,
    /// Reclaim in-progress rows older than this at the top of each cycle.
    pub stale_claim_after: Option<Duration>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            poll_interval: Duration::from_secs(2),
            stale_claim_after: None,
        }
    }
}

impl From<&Config> for DriverConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_concurrency: config.max_concurrency.max(1),
            poll_interval: config.poll_interval(),
            stale_claim_after: config.stale_claim_after(),
        }
    }
}

/// Where the driver is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Dispatching,
    Draining,
    /// A cycle began with nothing pending. Terminal.
    Converged,
}

/// Summary of one `run`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverReport {
    /// Cycles that dispatched at least one execution.
    pub cycles: usize,
    /// Executions started per cycle, in order.
    pub batch_sizes: Vec<usize>,
    pub done: usize,
    pub failed: usize,
    pub needs_retry: usize,
    /// Left pending because their pool was exhausted.
    pub deferred: usize,
    /// Claimed by another worker between snapshot and claim.
    pub skipped: usize,
    /// Outcomes that could not be written to the task store.
    pub unrecorded: usize,
    /// The task source did not exist; nothing was done.
    pub input_missing: bool,
    /// Stopped by [`Driver::shutdown`] before converging.
    pub interrupted: bool,
}

impl DriverReport {
    pub fn executions(&self) -> usize {
        self.batch_sizes.iter().sum()
    }

    fn absorb(&mut self, disposition: &Disposition) {
        match disposition {
            Disposition::Recorded { status, .. } | Disposition::Exhausted { status } => {
                match status {
                    Status::Done => self.done += 1,
                    Status::NeedsRetry => self.needs_retry += 1,
                    _ => self.failed += 1,
                }
            }
            Disposition::Deferred => self.deferred += 1,
            Disposition::Skipped => self.skipped += 1,
            Disposition::Unrecorded { .. } => self.unrecorded += 1,
        }
    }
}

/// Runs batches of executions until the queue converges.
pub struct Driver<E> {
    ctx: Arc<ExecutionContext<E>>,
    config: DriverConfig,
    shutdown: Arc<Notify>,
    stopping: Arc<AtomicBool>,
    state: Arc<watch::Sender<DriverState>>,
}

impl<E> Clone for Driver<E> {
    fn clone(&self) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
            config: self.config.clone(),
            shutdown: Arc::clone(&self.shutdown),
            stopping: Arc::clone(&self.stopping),
            state: Arc::clone(&self.state),
        }
    }
}

impl<E: TaskExecutor> Driver<E> {
    pub fn new(
        queue: TaskQueue,
        allocator: Allocator,
        executor: Arc<E>,
        on_exhausted: ExhaustionPolicy,
        config: DriverConfig,
    ) -> Self {
        let (state, _) = watch::channel(DriverState::Idle);
        Self {
            ctx: Arc::new(
                ExecutionContext::new(queue, allocator, executor, on_exhausted)
                    .with_max_record_backoff(config.poll_interval),
            ),
            config,
            shutdown: Arc::new(Notify::new()),
            stopping: Arc::new(AtomicBool::new(false)),
            state: Arc::new(state),
        }
    }

    /// Wire up queue, allocator and locks from a [`Config`].
    pub fn from_config(config: &Config, executor: E) -> Self {
        let locks = LockManager::new().with_timeout(config.lock_timeout());
        let queue = TaskQueue::new(
            Storage::new(&config.input_path, locks.clone()),
            config.columns.clone(),
            config.max_attempts,
        );
        let allocator = Allocator::new(config.clone(), locks);
        Self::new(
            queue,
            allocator,
            Arc::new(executor),
            config.on_exhausted,
            DriverConfig::from(config),
        )
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.ctx.queue
    }

    /// Current state; observers can await changes.
    pub fn subscribe(&self) -> watch::Receiver<DriverState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> DriverState {
        *self.state.borrow()
    }

    /// Stop starting new batches. A batch in flight still drains.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    /// Run cycles until nothing is pending, the task source is missing, or
    /// shutdown is requested.
    ///
    /// # Errors
    ///
    /// Returns an error only for non-transient cycle-start failures such as
    /// duplicate task keys or an unknown status value. Transient read
    /// failures are logged and the cycle is retried after the poll interval.
    pub async fn run(&self) -> Result<DriverReport> {
        let mut report = DriverReport::default();
        let mut lease: Option<RunLease> = None;
        info!(
            max_concurrency = self.config.max_concurrency,
            input = %self.ctx.queue.store().path().display(),
            "driver started"
        );

        loop {
            if self.stopping.load(Ordering::SeqCst) {
                info!("driver shutting down");
                report.interrupted = true;
                break;
            }
            self.set_state(DriverState::Idle);

            let pending = match self.snapshot().await {
                Ok(pending) => pending,
                Err(Error::MissingInput(path)) => {
                    error!(path = %path.display(), "task source not found, nothing to do");
                    report.input_missing = true;
                    break;
                }
                Err(e) if e.is_transient() => {
                    warn!("cycle start failed: {e}, retrying after poll interval");
                    if self.pause().await {
                        report.interrupted = true;
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    error!("cycle start failed: {e}");
                    return Err(e);
                }
            };

            if pending.is_empty() {
                self.set_state(DriverState::Converged);
                info!(
                    cycles = report.cycles,
                    done = report.done,
                    failed = report.failed,
                    "no pending tasks, converged"
                );
                break;
            }

            if lease.is_none() {
                lease = Some(RunLease::acquire(
                    self.ctx.queue.store().path(),
                    &self.ctx.run_id,
                )?);
            }

            self.set_state(DriverState::Dispatching);
            let batch_size = self.dispatch(pending, &mut report).await;
            report.cycles += 1;
            report.batch_sizes.push(batch_size);
            metrics::cycles().add(1, &[]);
            info!(cycle = report.cycles, batch_size, "batch finished");

            if self.pause().await {
                report.interrupted = true;
                break;
            }
        }

        Ok(report)
    }

    /// Start up to `max_concurrency` executions and wait for all of them.
    async fn dispatch(&self, pending: Vec<TaskRecord>, report: &mut DriverReport) -> usize {
        let total = pending.len();
        let max = self.config.max_concurrency;
        let mut executions = JoinSet::new();
        let mut keys: HashMap<tokio::task::Id, TaskKey> = HashMap::new();

        for (slot, task) in pending.into_iter().take(max).enumerate() {
            let pool = PoolId::for_slot(slot, max);
            let handle = executions.spawn(run_execution(
                Arc::clone(&self.ctx),
                task.key.clone(),
                pool,
            ));
            keys.insert(handle.id(), task.key);
        }
        let batch_size = keys.len();
        info!(
            pending = total,
            batch_size,
            deferred = total - batch_size,
            "batch dispatched"
        );

        self.set_state(DriverState::Draining);
        while let Some(joined) = executions.join_next_with_id().await {
            match joined {
                Ok((_, ExecutionReport { key, disposition, .. })) => {
                    debug!(key = %key, ?disposition, "execution finished");
                    report.absorb(&disposition);
                }
                Err(join_err) => {
                    let key = keys.get(&join_err.id()).cloned();
                    error!(key = ?key, "execution aborted: {join_err}");
                    let disposition = match key {
                        Some(key) => self.record_abort(key, join_err.to_string()).await,
                        None => Disposition::Unrecorded {
                            error: join_err.to_string(),
                        },
                    };
                    report.absorb(&disposition);
                }
            }
        }
        batch_size
    }

    /// Best-effort failure record for an execution that died outside the
    /// executor.
    async fn record_abort(&self, key: TaskKey, detail: String) -> Disposition {
        let ctx = Arc::clone(&self.ctx);
        let outcome = Outcome::Failure(format!("execution aborted: {detail}"));
        let recorded = {
            let outcome = outcome.clone();
            tokio::task::spawn_blocking(move || ctx.record(&key, &outcome, &Row::new())).await
        };
        match recorded {
            Ok(Ok(status)) => Disposition::Recorded { outcome, status },
            Ok(Err(e)) => Disposition::Unrecorded {
                error: e.to_string(),
            },
            Err(e) => Disposition::Unrecorded {
                error: e.to_string(),
            },
        }
    }

    /// Fresh pending set, after reclaiming orphaned claims (and stale ones
    /// if configured).
    ///
    /// Only called between batches, so none of this run's own claims are in
    /// flight and any it left in progress are orphaned too.
    async fn snapshot(&self) -> Result<Vec<TaskRecord>> {
        let ctx = Arc::clone(&self.ctx);
        let stale_after = self.config.stale_claim_after;
        tokio::task::spawn_blocking(move || {
            let input = ctx.queue.store().path();
            let orphaned = ctx.queue.recover_orphaned(|run| {
                Ok(run != ctx.run_id && RunLease::is_live(input, run)?)
            })?;
            if !orphaned.is_empty() {
                warn!(count = orphaned.len(), "orphaned claims recovered");
            }
            if let Some(threshold) = stale_after {
                let recovered = ctx.queue.recover_stale(threshold)?;
                if !recovered.is_empty() {
                    warn!(count = recovered.len(), "stale claims recovered");
                }
            }
            ctx.queue.pending_tasks()
        })
        .await
        .map_err(|e| Error::Other(format!("snapshot aborted: {e}")))?
    }

    /// Sleep for the poll interval. Returns `true` if shutdown was requested.
    async fn pause(&self) -> bool {
        if self.stopping.load(Ordering::SeqCst) {
            return true;
        }
        tokio::select! {
            _ = self.shutdown.notified() => true,
            _ = tokio::time::sleep(self.config.poll_interval) => {
                self.stopping.load(Ordering::SeqCst)
            }
        }
    }

    fn set_state(&self, state: DriverState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "driver state");
        }
    }
}
