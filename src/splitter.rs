//! Split a master pool file into one pool file per worker slot.
//!
//! Consumed rows are dropped. The remaining rows are dealt out in order:
//! every part gets `total / parts` rows and the first `total % parts` parts
//! get one more. Part `i` is written to the pool file of pool id `i`.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::allocator::is_consumed_marker;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::lock::LockManager;
use crate::model::PoolId;
use crate::storage::{Commit, Row, Storage, Table};

/// Rows generated when the source file does not exist.
pub const PLACEHOLDER_ROWS: usize = 25;

/// What a split produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitSummary {
    /// Unconsumed rows that were distributed.
    pub total: usize,
    /// Rows skipped because they were already consumed.
    pub dropped: usize,
    /// The source was missing and was generated from the placeholder unit.
    pub provisioned: bool,
    /// Pool file and row count per part. Empty when there was nothing to split.
    pub parts: Vec<(PathBuf, usize)>,
}

/// Split `source` into `parts` pool files named by the config's template.
pub fn split_pool(
    source: &Path,
    parts: usize,
    config: &Config,
    locks: &LockManager,
) -> Result<SplitSummary> {
    if parts == 0 {
        return Err(Error::Config("parts must be at least 1".to_string()));
    }
    if parts > 1 && !config.has_pool_placeholder() {
        return Err(Error::Config(format!(
            "pool_path_template {:?} has no pool placeholder, parts would overwrite each other",
            config.pool_path_template
        )));
    }

    let consumed = &config.columns.consumed;
    let source_store = Storage::new(source, locks.clone());
    let mut summary = SplitSummary::default();

    let table = source_store.transaction(|table| {
        if table.is_none() {
            warn!(path = %source.display(), "split source missing, generating placeholder rows");
            *table = Some(placeholder_source(config));
            summary.provisioned = true;
            return Ok((Commit::Save, table.clone()));
        }
        Ok((Commit::Discard, table.clone()))
    })?;
    let Some(mut table) = table else {
        return Err(Error::MissingInput(source.to_path_buf()));
    };

    let before = table.len();
    let headers = table.headers().to_vec();
    let rows: Vec<Row> = table
        .rows_mut()
        .iter_mut()
        .map(std::mem::take)
        .filter(|row| !row.get(consumed).is_some_and(|v| is_consumed_marker(v)))
        .collect();
    summary.total = rows.len();
    summary.dropped = before - rows.len();

    if rows.is_empty() {
        info!(path = %source.display(), "nothing to split");
        return Ok(summary);
    }

    let base = rows.len() / parts;
    let remainder = rows.len() % parts;
    let mut rows = rows.into_iter();
    for i in 0..parts {
        let size = base + usize::from(i < remainder);
        let mut chunk = Table::new(headers.iter().cloned());
        for row in rows.by_ref().take(size) {
            chunk.push(row);
        }

        let store = Storage::new(config.pool_path(&PoolId::new(i.to_string())), locks.clone());
        {
            let _lock = store.lock()?;
            store.save(&chunk)?;
        }
        info!(path = %store.path().display(), rows = size, "pool part written");
        summary.parts.push((store.path().to_path_buf(), size));
    }

    info!(
        total = summary.total,
        dropped = summary.dropped,
        parts,
        "pool split finished"
    );
    Ok(summary)
}

fn placeholder_source(config: &Config) -> Table {
    let consumed = &config.columns.consumed;
    let mut table = Table::new(
        config
            .placeholder_unit
            .keys()
            .filter(|k| *k != consumed)
            .cloned()
            .chain(std::iter::once(consumed.clone())),
    );
    for n in 1..=PLACEHOLDER_ROWS {
        let mut row: Row = config
            .placeholder_unit
            .iter()
            .map(|(column, value)| (column.clone(), format!("{value}{n}")))
            .collect();
        row.insert(consumed.clone(), String::new());
        table.push(row);
    }
    table
}
