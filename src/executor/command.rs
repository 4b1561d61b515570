//! Executor that runs an external program per task.
//!
//! The program gets the [`ExecutionRequest`] as JSON on stdin and
//! `CLAIMQ_TASK_KEY`, `CLAIMQ_POOL`, `CLAIMQ_ATTEMPT`, `CLAIMQ_EXECUTION_ID`
//! in its environment. It reports either a JSON object
//! `{"outcome": "...", "result": {...}}` or a bare outcome word on the last
//! line of stdout. A non-zero exit status is a failure.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{ExecutionRequest, RawOutcome, TaskExecutor};
use crate::config::ExecutorConfig;
use crate::error::{Error, Result};

/// Longest stderr excerpt kept in a failure detail.
const STDERR_TAIL: usize = 400;

#[derive(Debug, Clone)]
pub struct CommandExecutor {
    command: PathBuf,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandExecutor {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            timeout: None,
        }
    }

    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self::new(&config.command)
            .args(config.args.clone())
            .timeout(config.timeout_secs.map(Duration::from_secs))
    }

    pub fn args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Kill the program and report a failure after `timeout`.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Resolve relative command paths containing a separator against the
    /// process CWD; bare names go through `PATH`.
    fn resolve(&self) -> Result<PathBuf> {
        let is_bare = self.command.components().count() == 1 && self.command.is_relative();
        if is_bare || self.command.is_absolute() {
            return Ok(self.command.clone());
        }
        Ok(std::env::current_dir()?.join(&self.command))
    }

    async fn run(&self, request: &ExecutionRequest) -> Result<RawOutcome> {
        let command = self.resolve()?;
        let input = serde_json::to_vec(request)
            .map_err(|e| Error::Executor(format!("serialize request: {e}")))?;

        debug!(
            command = %command.display(),
            key = %request.key,
            attempt = request.attempt,
            "running executor command"
        );

        let mut child = Command::new(&command)
            .args(&self.args)
            .env("CLAIMQ_TASK_KEY", request.key.as_str())
            .env("CLAIMQ_POOL", request.unit.pool.as_str())
            .env("CLAIMQ_ATTEMPT", request.attempt.to_string())
            .env("CLAIMQ_EXECUTION_ID", request.execution_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Executor(format!("cannot spawn {}: {e}", command.display())))?;

        // Fed from its own task so a program that never reads stdin cannot
        // stall the wait below or outlive the timeout.
        let feeder = child.stdin.take().map(|mut stdin| {
            let command = command.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&input).await {
                    debug!(command = %command.display(), "request not delivered on stdin: {e}");
                }
            })
        });

        let start = Instant::now();
        let waited = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| {
                    Error::Executor(format!("{} timed out after {limit:?}", display_name(&command)))
                }),
            None => Ok(child.wait_with_output().await),
        };
        if let Some(feeder) = feeder {
            feeder.abort();
        }
        let output = waited??;
        let duration_ms = start.elapsed().as_millis() as u64;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output
                .status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            warn!(
                command = %command.display(),
                code = %code,
                duration_ms,
                "executor command failed"
            );
            return Err(Error::Executor(format!(
                "{} exited with status {code}: {}",
                display_name(&command),
                tail(stderr.trim(), STDERR_TAIL)
            )));
        }

        let report = parse_report(&String::from_utf8_lossy(&output.stdout));
        debug!(outcome = %report.outcome, duration_ms, "executor command finished");
        Ok(report)
    }
}

impl TaskExecutor for CommandExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<RawOutcome> {
        self.run(&request).await
    }
}

/// Parse an executor's stdout.
///
/// Accepts a JSON object with an `outcome` string (and optional `result`
/// map, non-string values are stringified) or falls back to the last
/// non-empty line as the outcome word. Empty output is a failure.
pub fn parse_report(stdout: &str) -> RawOutcome {
    let trimmed = stdout.trim();
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(trimmed)
        && let Some(outcome) = map.get("outcome").and_then(|v| v.as_str())
    {
        let result: BTreeMap<String, String> = map
            .get("result")
            .and_then(|v| v.as_object())
            .map(|fields| {
                fields
                    .iter()
                    .map(|(k, v)| {
                        let value = match v {
                            serde_json::Value::String(s) => s.clone(),
                            serde_json::Value::Null => String::new(),
                            other => other.to_string(),
                        };
                        (k.clone(), value)
                    })
                    .collect()
            })
            .unwrap_or_default();
        return RawOutcome {
            outcome: outcome.to_string(),
            result,
        };
    }

    match trimmed.lines().rev().map(str::trim).find(|l| !l.is_empty()) {
        Some(line) => RawOutcome::new(line),
        None => RawOutcome::new("executor reported no outcome"),
    }
}

fn display_name(command: &Path) -> String {
    command
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| command.display().to_string())
}

fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
