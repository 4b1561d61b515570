//! Error types for claimq.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("cannot open lock file {}: {source}", path.display())]
    LockFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {waited:?} waiting for lock {}", path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("lock {} is already held by this thread", path.display())]
    LockReentry { path: PathBuf },

    #[error("no unconsumed unit left in pool {pool}")]
    ResourceExhausted { pool: String },

    #[error("executor failure: {0}")]
    Executor(String),

    #[error("task source {} not found", .0.display())]
    MissingInput(PathBuf),

    #[error("duplicate key {key:?} in {}", path.display())]
    DuplicateKey { path: PathBuf, key: String },

    #[error("{} has no {column:?} column", path.display())]
    MissingColumn { path: PathBuf, column: String },

    #[error("{} line {line}: {width} cells but only {columns} columns", path.display())]
    ExtraCells {
        path: PathBuf,
        line: u64,
        width: usize,
        columns: usize,
    },

    #[error("task {key:?} has unknown status {value:?}")]
    InvalidStatus { key: String, value: String },

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether retrying the whole operation later can succeed.
    ///
    /// Store and lock failures are transient; malformed input is not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Csv(_) | Error::LockFile { .. } | Error::LockTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
