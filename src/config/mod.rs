//! Typed configuration: TOML file and/or environment variables.
//!
//! Loads once at startup and fails fast on malformed values. Environment
//! variables override the file; CLI flags (in the binary) override both.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::model::PoolId;

/// Placeholder in `pool_path_template` replaced by the pool id.
pub const POOL_PLACEHOLDER: &str = "{pool}";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Task source file.
    pub input_path: PathBuf,
    /// Pool file naming pattern, e.g. `pool_{pool}.csv`.
    pub pool_path_template: String,
    /// Upper bound on executions per batch.
    pub max_concurrency: usize,
    /// Delay between dispatch cycles.
    pub poll_interval_ms: u64,
    /// Bounded lock wait. `None` blocks until the lock is free.
    pub lock_timeout_ms: Option<u64>,
    /// Reclaim in-progress rows older than this at the top of each cycle.
    pub stale_claim_secs: Option<u64>,
    /// Attempts before a blocked task is failed for good.
    pub max_attempts: u32,
    pub on_exhausted: ExhaustionPolicy,
    pub columns: Columns,
    /// Row written when a pool file has to be auto-provisioned.
    pub placeholder_unit: BTreeMap<String, String>,
    pub executor: Option<ExecutorConfig>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Append-only log file in addition to stderr.
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input_path: PathBuf::from("tasks.csv"),
            pool_path_template: format!("pool_{POOL_PLACEHOLDER}.csv"),
            max_concurrency: 5,
            poll_interval_ms: 2000,
            lock_timeout_ms: None,
            stale_claim_secs: None,
            max_attempts: 3,
            on_exhausted: ExhaustionPolicy::Fail,
            columns: Columns::default(),
            placeholder_unit: BTreeMap::from([("name".to_string(), "placeholder".to_string())]),
            executor: None,
            otel_endpoint: None,
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

/// What to do with a task whose pool has no unit left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExhaustionPolicy {
    /// Record the task as failed.
    #[default]
    Fail,
    /// Leave the task untouched; the next cycle tries again.
    Requeue,
}

impl std::str::FromStr for ExhaustionPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "fail" => Ok(Self::Fail),
            "requeue" => Ok(Self::Requeue),
            other => Err(format!("unknown exhaustion policy {other:?}")),
        }
    }
}

/// Column names in the task and pool files.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Columns {
    pub key: String,
    pub status: String,
    pub detail: String,
    pub attempts: String,
    pub claimed_by: String,
    pub claimed_at: String,
    /// Pool files only.
    pub consumed: String,
}

impl Default for Columns {
    fn default() -> Self {
        Self {
            key: "key".to_string(),
            status: "status".to_string(),
            detail: "detail".to_string(),
            attempts: "attempts".to_string(),
            claimed_by: "claimed_by".to_string(),
            claimed_at: "claimed_at".to_string(),
            consumed: "consumed".to_string(),
        }
    }
}

impl Columns {
    /// Bookkeeping columns of the task file that executors never see or set.
    pub fn is_reserved(&self, column: &str) -> bool {
        [
            &self.key,
            &self.status,
            &self.detail,
            &self.attempts,
            &self.claimed_by,
            &self.claimed_at,
        ]
        .iter()
        .any(|c| c.as_str() == column)
    }
}

/// External program run once per task.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    pub timeout_secs: Option<u64>,
}

impl Config {
    /// Defaults overridden by environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// TOML file, then environment overrides.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let mut config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("bad config {}: {e}", path.display())))?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(Error::Config("max_concurrency must be at least 1".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".to_string()));
        }
        if self.pool_path_template.trim().is_empty() {
            return Err(Error::Config("pool_path_template is empty".to_string()));
        }
        if self.columns.is_reserved(&self.columns.consumed) {
            return Err(Error::Config(format!(
                "consumed column {:?} collides with a task column",
                self.columns.consumed
            )));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }

    pub fn stale_claim_after(&self) -> Option<Duration> {
        self.stale_claim_secs.map(Duration::from_secs)
    }

    /// Pool file for `pool`.
    pub fn pool_path(&self, pool: &PoolId) -> PathBuf {
        PathBuf::from(self.pool_path_template.replace(POOL_PLACEHOLDER, pool.as_str()))
    }

    /// Whether the template names one file per pool id.
    pub fn has_pool_placeholder(&self) -> bool {
        self.pool_path_template.contains(POOL_PLACEHOLDER)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = var("CLAIMQ_INPUT") {
            self.input_path = PathBuf::from(v);
        }
        if let Some(v) = var("CLAIMQ_POOL_TEMPLATE") {
            self.pool_path_template = v;
        }
        if let Some(v) = parsed_var("CLAIMQ_MAX_CONCURRENCY")? {
            self.max_concurrency = v;
        }
        if let Some(v) = parsed_var("CLAIMQ_POLL_INTERVAL_MS")? {
            self.poll_interval_ms = v;
        }
        if let Some(v) = parsed_var("CLAIMQ_LOCK_TIMEOUT_MS")? {
            self.lock_timeout_ms = Some(v);
        }
        if let Some(v) = parsed_var("CLAIMQ_STALE_CLAIM_SECS")? {
            self.stale_claim_secs = Some(v);
        }
        if let Some(v) = parsed_var("CLAIMQ_MAX_ATTEMPTS")? {
            self.max_attempts = v;
        }
        if let Some(v) = parsed_var("CLAIMQ_ON_EXHAUSTED")? {
            self.on_exhausted = v;
        }
        if let Some(v) = var("CLAIMQ_EXECUTOR") {
            match self.executor.as_mut() {
                Some(executor) => executor.command = PathBuf::from(v),
                None => {
                    self.executor = Some(ExecutorConfig {
                        command: PathBuf::from(v),
                        args: Vec::new(),
                        timeout_secs: None,
                    })
                }
            }
        }
        if let Some(v) = var("OTEL_ENDPOINT") {
            self.otel_endpoint = Some(v);
        }
        if let Some(v) = var("LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = var("CLAIMQ_LOG_FILE") {
            self.log_file = Some(PathBuf::from(v));
        }
        Ok(())
    }
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed_var<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    var(name)
        .map(|v| {
            v.trim()
                .parse()
                .map_err(|e| Error::Config(format!("environment variable {name}={v:?}: {e}")))
        })
        .transpose()
}
