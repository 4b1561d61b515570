//! Task queue over the task source file.
//!
//! The pending set is never cached: every call re-reads the file under its
//! lock, because other workers (threads or processes) may have changed rows
//! since the last look. All state needed to resume after a crash lives in
//! the file.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};

use crate::config::Columns;
use crate::error::{Error, Result};
use crate::model::{Outcome, Status, TaskKey, TaskRecord};
use crate::storage::{Commit, Row, Storage, Table};

/// Hands out pending tasks and records what happened to them.
#[derive(Debug, Clone)]
pub struct TaskQueue {
    store: Storage,
    columns: Columns,
    max_attempts: u32,
}

impl TaskQueue {
    pub fn new(store: Storage, columns: Columns, max_attempts: u32) -> Self {
        Self {
            store,
            columns,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn store(&self) -> &Storage {
        &self.store
    }

    pub fn columns(&self) -> &Columns {
        &self.columns
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Every task in store order.
    ///
    /// Fails with [`Error::MissingInput`] if the task source does not exist
    /// and with [`Error::DuplicateKey`] if two rows share a key.
    pub fn tasks(&self) -> Result<Vec<TaskRecord>> {
        self.store.transaction(|table| {
            let table = self.require(table)?;
            Ok((Commit::Discard, self.parse_all(table)?))
        })
    }

    /// Tasks whose status is pending or needs-retry, in store order.
    pub fn pending_tasks(&self) -> Result<Vec<TaskRecord>> {
        let pending: Vec<TaskRecord> = self
            .tasks()?
            .into_iter()
            .filter(|task| task.status.is_pending())
            .collect();
        debug!(count = pending.len(), "pending tasks loaded");
        Ok(pending)
    }

    /// Number of tasks per status.
    pub fn counts(&self) -> Result<Vec<(Status, usize)>> {
        let tasks = self.tasks()?;
        Ok(Status::ALL
            .iter()
            .map(|&status| (status, tasks.iter().filter(|t| t.status == status).count()))
            .collect())
    }

    /// Claim `key` for `claimant`: pending/needs-retry → in-progress.
    ///
    /// Returns `None` if the task is no longer pending (another worker got
    /// there first).
    pub fn claim(&self, key: &TaskKey, claimant: &str) -> Result<Option<TaskRecord>> {
        self.store.transaction(|table| {
            let table = self.require_mut(table)?;
            let claimed = self.claim_in(table, key, claimant, Utc::now())?;
            let commit = if claimed.is_some() {
                Commit::Save
            } else {
                Commit::Discard
            };
            Ok((commit, claimed))
        })
    }

    /// Persist the outcome of one attempt. Returns the status written.
    ///
    /// `result` fields are merged into the row; new columns are added.
    pub fn record_outcome(&self, key: &TaskKey, outcome: &Outcome, result: &Row) -> Result<Status> {
        self.store.transaction(|table| {
            let table = self.require_mut(table)?;
            let status = self.record_outcome_in(table, key, outcome, result)?;
            Ok((Commit::Save, status))
        })
    }

    /// Write `status` (and `detail`) to `key`, validating the transition.
    pub fn set_status(&self, key: &TaskKey, status: Status, detail: Option<&str>) -> Result<()> {
        self.store.transaction(|table| {
            let table = self.require_mut(table)?;
            self.transition_in(table, key, status, detail)?;
            Ok((Commit::Save, ()))
        })
    }

    /// Move in-progress rows claimed before `now - older_than` to needs-retry.
    ///
    /// Recovers tasks whose execution died without recording an outcome.
    pub fn recover_stale(&self, older_than: std::time::Duration) -> Result<Vec<TaskKey>> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(older_than)
                .map_err(|e| Error::Config(format!("stale claim threshold: {e}")))?;

        self.store.transaction(|table| {
            let table = self.require_mut(table)?;
            let stale: Vec<TaskKey> = self
                .parse_all(table)?
                .into_iter()
                .filter(|t| t.status == Status::InProgress)
                .filter(|t| t.claimed_at.is_none_or(|at| at < cutoff))
                .map(|t| t.key)
                .collect();
            for key in &stale {
                self.transition_in(table, key, Status::NeedsRetry, Some("stale claim recovered"))?;
                warn!(key = %key, "recovered stale in-progress task");
            }
            let commit = if stale.is_empty() {
                Commit::Discard
            } else {
                Commit::Save
            };
            Ok((commit, stale))
        })
    }

    /// Move in-progress rows whose claiming run is gone to needs-retry.
    ///
    /// `claimed_by` is `<run id>/<execution id>`; `is_live` is asked about
    /// the run id. Rows with no claimant are always orphaned.
    pub fn recover_orphaned<F>(&self, is_live: F) -> Result<Vec<TaskKey>>
    where
        F: Fn(&str) -> Result<bool>,
    {
        self.store.transaction(|table| {
            let table = self.require_mut(table)?;
            let mut orphaned = Vec::new();
            for task in self.parse_all(table)? {
                if task.status != Status::InProgress {
                    continue;
                }
                let live = match task.claimed_by.as_deref() {
                    Some(claimant) => is_live(claim_run_id(claimant))?,
                    None => false,
                };
                if !live {
                    orphaned.push(task.key);
                }
            }
            for key in &orphaned {
                let detail = Some("orphaned claim recovered");
                self.transition_in(table, key, Status::NeedsRetry, detail)?;
                warn!(key = %key, "recovered in-progress task of a dead run");
            }
            let commit = if orphaned.is_empty() {
                Commit::Discard
            } else {
                Commit::Save
            };
            Ok((commit, orphaned))
        })
    }

    /// Operator reset: put the given failed/needs-retry tasks back to pending.
    ///
    /// With an empty `keys`, resets every failed task.
    pub fn reset(&self, keys: &[TaskKey]) -> Result<Vec<TaskKey>> {
        self.store.transaction(|table| {
            let table = self.require_mut(table)?;
            let targets: Vec<TaskKey> = if keys.is_empty() {
                self.parse_all(table)?
                    .into_iter()
                    .filter(|t| t.status == Status::Failed)
                    .map(|t| t.key)
                    .collect()
            } else {
                keys.to_vec()
            };
            for key in &targets {
                self.transition_in(table, key, Status::Pending, None)?;
                info!(key = %key, "task reset to pending");
            }
            Ok((Commit::Save, targets))
        })
    }

    // -----------------------------------------------------------------------
    // Operations on an already-locked table
    // -----------------------------------------------------------------------

    pub(crate) fn require<'a>(&self, table: &'a Option<Table>) -> Result<&'a Table> {
        table
            .as_ref()
            .ok_or_else(|| Error::MissingInput(self.store.path().to_path_buf()))
    }

    pub(crate) fn require_mut<'a>(&self, table: &'a mut Option<Table>) -> Result<&'a mut Table> {
        table
            .as_mut()
            .ok_or_else(|| Error::MissingInput(self.store.path().to_path_buf()))
    }

    pub(crate) fn claim_in(
        &self,
        table: &mut Table,
        key: &TaskKey,
        claimant: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>> {
        let mut task = self.find_in(table, key)?;
        if !task.status.is_pending() {
            debug!(key = %key, status = %task.status, "task no longer pending");
            return Ok(None);
        }

        task.attempts += 1;
        task.claimed_by = Some(claimant.to_string());
        task.claimed_at = Some(now);

        let c = &self.columns;
        let mut fields = Row::new();
        fields.insert(c.attempts.clone(), task.attempts.to_string());
        fields.insert(c.claimed_by.clone(), claimant.to_string());
        fields.insert(c.claimed_at.clone(), now.to_rfc3339());
        self.transition_in(table, key, Status::InProgress, None)?;
        table.merge(&c.key, key.as_str(), &fields)?;

        task.status = Status::InProgress;
        task.detail = None;
        Ok(Some(task))
    }

    pub(crate) fn record_outcome_in(
        &self,
        table: &mut Table,
        key: &TaskKey,
        outcome: &Outcome,
        result: &Row,
    ) -> Result<Status> {
        let task = self.find_in(table, key)?;
        let (status, detail) = outcome.resolve(task.attempts, self.max_attempts);
        self.transition_in(table, key, status, detail.as_deref())?;

        let c = &self.columns;
        let result: Row = result
            .iter()
            .filter(|(column, _)| !c.is_reserved(column))
            .map(|(column, value)| (column.clone(), value.clone()))
            .collect();
        if !result.is_empty() {
            table.merge(&c.key, key.as_str(), &result)?;
        }
        Ok(status)
    }

    /// Copy `fields` into the row for `key`, only for columns the task file
    /// already has.
    pub(crate) fn merge_existing_in(
        &self,
        table: &mut Table,
        key: &TaskKey,
        fields: &Row,
    ) -> Result<()> {
        let c = &self.columns;
        let known: Row = fields
            .iter()
            .filter(|(column, _)| table.has_column(column) && !c.is_reserved(column))
            .map(|(column, value)| (column.clone(), value.clone()))
            .collect();
        if known.is_empty() {
            return Ok(());
        }
        table.merge(&c.key, key.as_str(), &known)
    }

    pub(crate) fn transition_in(
        &self,
        table: &mut Table,
        key: &TaskKey,
        to: Status,
        detail: Option<&str>,
    ) -> Result<()> {
        let from = self.find_in(table, key)?.status;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        let c = &self.columns;
        let mut fields = Row::new();
        fields.insert(c.status.clone(), to.as_str().to_string());
        fields.insert(c.detail.clone(), detail.unwrap_or("").to_string());
        table.merge(&c.key, key.as_str(), &fields)
    }

    pub(crate) fn find_in(&self, table: &Table, key: &TaskKey) -> Result<TaskRecord> {
        let pos = table
            .position(&self.columns.key, key.as_str())
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        self.parse_row(&table.rows()[pos])?
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    fn parse_all(&self, table: &Table) -> Result<Vec<TaskRecord>> {
        // Fails fast on duplicate keys before anything is handed out.
        table.index_by(&self.columns.key, self.store.path())?;
        let mut tasks = Vec::with_capacity(table.len());
        for row in table.rows() {
            if let Some(task) = self.parse_row(row)? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    fn parse_row(&self, row: &Row) -> Result<Option<TaskRecord>> {
        let c = &self.columns;
        let cell = |column: &str| row.get(column).map(|v| v.trim()).unwrap_or("");

        let key = TaskKey::new(cell(&c.key));
        if key.as_str().is_empty() {
            return Ok(None);
        }
        let status = Status::parse(cell(&c.status)).ok_or_else(|| Error::InvalidStatus {
            key: key.to_string(),
            value: cell(&c.status).to_string(),
        })?;
        let non_empty = |v: &str| (!v.is_empty()).then(|| v.to_string());

        let params = row
            .iter()
            .filter(|(column, _)| !c.is_reserved(column))
            .map(|(column, value)| (column.clone(), value.clone()))
            .collect();

        Ok(Some(TaskRecord {
            status,
            detail: non_empty(cell(&c.detail)),
            attempts: cell(&c.attempts).parse().unwrap_or(0),
            claimed_by: non_empty(cell(&c.claimed_by)),
            claimed_at: DateTime::parse_from_rfc3339(cell(&c.claimed_at))
                .ok()
                .map(|at| at.with_timezone(&Utc)),
            params,
            key,
        }))
    }
}

/// Run id part of a `claimed_by` value.
pub fn claim_run_id(claimant: &str) -> &str {
    claimant.split_once('/').map_or(claimant, |(run, _)| run)
}
