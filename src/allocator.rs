//! Exclusive allocation of resource units from pool files.
//!
//! A unit is claimed by marking its consumed column and persisting the whole
//! pool before the payload is returned, all under the pool's lock. A claimed
//! unit is never handed out again, even if the task that took it fails.

use opentelemetry::KeyValue;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::lock::LockManager;
use crate::model::{ClaimedUnit, PoolId};
use crate::storage::{Commit, Row, Storage, Table};
use crate::telemetry::metrics;

/// Value written to the consumed column of a claimed unit.
pub const CONSUMED: &str = "consumed";

/// Whether a consumed-column cell marks its unit as used.
///
/// Empty cells and falsy values (`false`, `0`, `no`) leave the unit free.
pub fn is_consumed_marker(value: &str) -> bool {
    let value = value.trim();
    [CONSUMED, "true", "1", "yes"]
        .iter()
        .any(|marker| value.eq_ignore_ascii_case(marker))
}

/// Claims units from the pool files named by a path template.
#[derive(Debug, Clone)]
pub struct Allocator {
    config: Config,
    locks: LockManager,
}

impl Allocator {
    pub fn new(config: Config, locks: LockManager) -> Self {
        Self { config, locks }
    }

    /// Store backing `pool`.
    pub fn pool_store(&self, pool: &PoolId) -> Storage {
        Storage::new(self.config.pool_path(pool), self.locks.clone())
    }

    /// Claim the first unconsumed unit of `pool`.
    ///
    /// A missing pool file is provisioned with the configured placeholder
    /// unit first. Fails with [`Error::ResourceExhausted`] when every unit
    /// is consumed.
    pub fn claim_one(&self, pool: &PoolId) -> Result<ClaimedUnit> {
        let store = self.pool_store(pool);
        store.transaction(|table| {
            let unit = self.claim_in(&store, pool, table)?;
            Ok((Commit::Save, unit))
        })
    }

    /// Number of unconsumed units, or `None` if the pool file is absent.
    pub fn remaining(&self, pool: &PoolId) -> Result<Option<usize>> {
        let store = self.pool_store(pool);
        store.transaction(|table| {
            let remaining = table.as_ref().map(|t| {
                t.rows()
                    .iter()
                    .filter(|row| !self.is_consumed(row))
                    .count()
            });
            Ok((Commit::Discard, remaining))
        })
    }

    /// Claim inside an already-held pool lock. The caller saves `table`.
    pub(crate) fn claim_in(
        &self,
        store: &Storage,
        pool: &PoolId,
        table: &mut Option<Table>,
    ) -> Result<ClaimedUnit> {
        let consumed = &self.config.columns.consumed;

        if table.is_none() {
            let provisioned = self.placeholder_table();
            store.save(&provisioned)?;
            metrics::units_provisioned().add(1, &[KeyValue::new("pool", pool.to_string())]);
            warn!(
                pool = %pool,
                path = %store.path().display(),
                "pool file missing, provisioned placeholder unit"
            );
            *table = Some(provisioned);
        }
        let Some(table) = table.as_mut() else {
            return Err(Error::Other(format!("pool {pool} could not be provisioned")));
        };
        table.ensure_column(consumed);

        let Some(row) = table.rows().iter().position(|row| !self.is_consumed(row)) else {
            metrics::units_exhausted().add(1, &[KeyValue::new("pool", pool.to_string())]);
            return Err(Error::ResourceExhausted {
                pool: pool.to_string(),
            });
        };

        let unit = &mut table.rows_mut()[row];
        unit.insert(consumed.clone(), CONSUMED.to_string());
        let payload = unit
            .iter()
            .filter(|(column, _)| *column != consumed)
            .map(|(column, value)| (column.clone(), value.clone()))
            .collect();

        metrics::units_claimed().add(1, &[KeyValue::new("pool", pool.to_string())]);
        debug!(pool = %pool, row, "unit claimed");
        Ok(ClaimedUnit {
            pool: pool.clone(),
            row,
            payload,
        })
    }

    fn is_consumed(&self, row: &Row) -> bool {
        row.get(&self.config.columns.consumed)
            .is_some_and(|v| is_consumed_marker(v))
    }

    fn placeholder_table(&self) -> Table {
        let consumed = &self.config.columns.consumed;
        let mut table = Table::new(
            self.config
                .placeholder_unit
                .keys()
                .filter(|k| *k != consumed)
                .cloned()
                .chain(std::iter::once(consumed.clone())),
        );
        let mut row: Row = self.config.placeholder_unit.clone();
        row.insert(consumed.clone(), String::new());
        table.push(row);
        info!(units = table.len(), "placeholder pool built");
        table
    }
}
