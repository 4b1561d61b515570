//! One execution: claim the task and a unit, run the executor, record.
//!
//! Every failure inside an execution, including an executor panic, ends as
//! a recorded status on the task row. Nothing propagates to the batch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use opentelemetry::KeyValue;
use tracing::{Instrument, error, info, warn};
use uuid::Uuid;

use crate::allocator::Allocator;
use crate::config::ExhaustionPolicy;
use crate::error::{Error, Result};
use crate::executor::{ExecutionRequest, RawOutcome, TaskExecutor};
use crate::model::{ClaimedUnit, Outcome, PoolId, Status, TaskKey, TaskRecord};
use crate::queue::TaskQueue;
use crate::storage::Row;
use crate::telemetry::metrics;
use crate::telemetry::work::{record_state_transition, start_task_span};

/// Attempts at persisting an outcome while the store fails transiently.
pub const RECORD_ATTEMPTS: u32 = 20;

const RECORD_BACKOFF_START: Duration = Duration::from_millis(50);

/// Shared, immutable state every execution of a run needs.
pub struct ExecutionContext<E> {
    pub(crate) queue: TaskQueue,
    pub(crate) allocator: Allocator,
    pub(crate) executor: Arc<E>,
    pub(crate) on_exhausted: ExhaustionPolicy,
    /// Written into `claimed_by` ahead of the execution id.
    pub(crate) run_id: String,
    /// Upper bound on the pause between outcome write attempts.
    pub(crate) max_record_backoff: Duration,
}

/// How an execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// The executor ran (or failed to) and its outcome was persisted.
    Recorded { outcome: Outcome, status: Status },
    /// The pool was exhausted; the task was failed without running.
    Exhausted { status: Status },
    /// The pool was exhausted; the task was left pending for a later cycle.
    Deferred,
    /// Another worker claimed the task first.
    Skipped,
    /// The store could not be updated; the row keeps its previous status.
    Unrecorded { error: String },
}

#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub key: TaskKey,
    pub pool: PoolId,
    pub disposition: Disposition,
}

enum Begin {
    Claimed { task: TaskRecord, unit: ClaimedUnit },
    Exhausted(Status),
    Deferred,
    Skipped,
}

impl<E: TaskExecutor> ExecutionContext<E> {
    pub fn new(
        queue: TaskQueue,
        allocator: Allocator,
        executor: Arc<E>,
        on_exhausted: ExhaustionPolicy,
    ) -> Self {
        Self {
            queue,
            allocator,
            executor,
            on_exhausted,
            run_id: Uuid::new_v4().to_string(),
            max_record_backoff: Duration::from_secs(2),
        }
    }

    pub fn with_max_record_backoff(mut self, max: Duration) -> Self {
        self.max_record_backoff = max;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Persist an outcome, retrying while the store fails transiently.
    pub(crate) fn record(&self, key: &TaskKey, outcome: &Outcome, result: &Row) -> Result<Status> {
        let mut backoff = RECORD_BACKOFF_START.min(self.max_record_backoff);
        let mut attempt = 1;
        loop {
            match self.queue.record_outcome(key, outcome, result) {
                Err(e) if e.is_transient() && attempt < RECORD_ATTEMPTS => {
                    warn!(key = %key, attempt, ?backoff, "outcome write failed, retrying: {e}");
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(self.max_record_backoff);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Claim the task row and one unit from `pool` in one locked section.
    ///
    /// Takes the task store lock, then the pool lock. The unit is persisted
    /// as consumed before the task row is marked in-progress.
    fn begin(&self, key: &TaskKey, pool: &PoolId, claimant: &str) -> Result<Begin> {
        let store = self.queue.store();
        let _queue_lock = store.lock()?;
        let mut loaded = store.load()?;
        let table = self.queue.require_mut(&mut loaded)?;

        if !self.queue.find_in(table, key)?.status.is_pending() {
            return Ok(Begin::Skipped);
        }

        let claimed_unit = {
            let pool_store = self.allocator.pool_store(pool);
            let _pool_lock = pool_store.lock()?;
            let mut pool_table = pool_store.load()?;
            match self.allocator.claim_in(&pool_store, pool, &mut pool_table) {
                Ok(unit) => {
                    if let Some(ref pool_table) = pool_table {
                        pool_store.save(pool_table)?;
                    }
                    Some(unit)
                }
                Err(Error::ResourceExhausted { .. }) => None,
                Err(e) => return Err(e),
            }
        };

        let Some(unit) = claimed_unit else {
            return match self.on_exhausted {
                ExhaustionPolicy::Requeue => Ok(Begin::Deferred),
                ExhaustionPolicy::Fail => {
                    self.queue.claim_in(table, key, claimant, Utc::now())?;
                    let outcome = Outcome::Failure(format!("resource exhausted: pool {pool}"));
                    let status = self
                        .queue
                        .record_outcome_in(table, key, &outcome, &Row::new())?;
                    store.save(table)?;
                    Ok(Begin::Exhausted(status))
                }
            };
        };

        let Some(task) = self.queue.claim_in(table, key, claimant, Utc::now())? else {
            return Ok(Begin::Skipped);
        };
        self.queue.merge_existing_in(table, key, &unit.payload)?;
        store.save(table)?;
        Ok(Begin::Claimed { task, unit })
    }
}

/// Run one task end to end. Never panics outward and never returns an error:
/// whatever happens is in the returned report and, where possible, on disk.
pub async fn run_execution<E: TaskExecutor>(
    ctx: Arc<ExecutionContext<E>>,
    key: TaskKey,
    pool: PoolId,
) -> ExecutionReport {
    let execution_id = Uuid::new_v4();
    let span = start_task_span(key.as_str(), pool.as_str(), &execution_id);
    let disposition = execute(ctx, &key, &pool, execution_id, &span)
        .instrument(span.clone())
        .await;
    ExecutionReport {
        key,
        pool,
        disposition,
    }
}

async fn execute<E: TaskExecutor>(
    ctx: Arc<ExecutionContext<E>>,
    key: &TaskKey,
    pool: &PoolId,
    execution_id: Uuid,
    span: &tracing::Span,
) -> Disposition {
    let start = Instant::now();

    let begin = {
        let ctx = Arc::clone(&ctx);
        let key = key.clone();
        let pool = pool.clone();
        let claimant = format!("{}/{execution_id}", ctx.run_id);
        tokio::task::spawn_blocking(move || ctx.begin(&key, &pool, &claimant)).await
    };

    let (task, unit) = match begin {
        Ok(Ok(Begin::Claimed { task, unit })) => (task, unit),
        Ok(Ok(Begin::Skipped)) => {
            info!(key = %key, "task already claimed elsewhere, skipping");
            return Disposition::Skipped;
        }
        Ok(Ok(Begin::Deferred)) => {
            warn!(key = %key, pool = %pool, "pool exhausted, task left pending");
            return Disposition::Deferred;
        }
        Ok(Ok(Begin::Exhausted(status))) => {
            record_state_transition(span, "pending", status.as_str());
            error!(key = %key, pool = %pool, "pool exhausted, task failed");
            count_outcome("exhausted");
            return Disposition::Exhausted { status };
        }
        Ok(Err(e)) => {
            error!(key = %key, pool = %pool, "claim failed: {e}");
            return Disposition::Unrecorded {
                error: e.to_string(),
            };
        }
        Err(join_err) => {
            error!(key = %key, "claim aborted: {join_err}");
            return Disposition::Unrecorded {
                error: join_err.to_string(),
            };
        }
    };
    record_state_transition(span, "pending", Status::InProgress.as_str());
    metrics::tasks_dispatched().add(1, &[]);
    info!(key = %key, pool = %pool, attempt = task.attempts, unit = unit.row, "task claimed");

    let request = ExecutionRequest {
        execution_id,
        key: task.key.clone(),
        params: task.params.clone(),
        unit,
        attempt: task.attempts,
    };

    // Run on its own task so a panic inside the executor is contained here.
    let executor = Arc::clone(&ctx.executor);
    let raw = tokio::spawn(async move { executor.execute(request).await }).await;
    let (outcome, result) = match raw {
        Ok(Ok(RawOutcome { outcome, result })) => (Outcome::from_code(&outcome), result),
        Ok(Err(e)) => (Outcome::Failure(e.to_string()), Row::new()),
        Err(join_err) => (
            Outcome::Failure(format!("executor panicked: {join_err}")),
            Row::new(),
        ),
    };

    let recorded = {
        let ctx = Arc::clone(&ctx);
        let key = key.clone();
        let outcome = outcome.clone();
        tokio::task::spawn_blocking(move || ctx.record(&key, &outcome, &result)).await
    };
    let duration_ms = start.elapsed().as_millis() as u64;

    match recorded {
        Ok(Ok(status)) => {
            record_state_transition(span, Status::InProgress.as_str(), status.as_str());
            count_outcome(outcome.label());
            match status {
                Status::Done => info!(key = %key, duration_ms, "task done"),
                Status::NeedsRetry => warn!(key = %key, duration_ms, %outcome, "task needs retry"),
                _ => error!(key = %key, duration_ms, %outcome, "task failed"),
            }
            Disposition::Recorded { outcome, status }
        }
        Ok(Err(e)) => {
            error!(key = %key, %outcome, "outcome could not be recorded: {e}");
            Disposition::Unrecorded {
                error: e.to_string(),
            }
        }
        Err(join_err) => {
            error!(key = %key, %outcome, "outcome recording aborted: {join_err}");
            Disposition::Unrecorded {
                error: join_err.to_string(),
            }
        }
    }
}

fn count_outcome(label: &'static str) {
    metrics::task_outcomes().add(1, &[KeyValue::new("outcome", label)]);
}
