//! The pluggable unit of work run once per claimed task.
//!
//! The queue and allocator do not care how a task is performed. An executor
//! receives the task's parameters and its claimed resource unit and reports
//! one outcome code: `success`, `invalid-credentials`, `blocked`, or any
//! other string, which is recorded verbatim as a failure detail.

pub mod command;

pub use command::CommandExecutor;

use std::collections::BTreeMap;
use std::future::Future;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{ClaimedUnit, TaskKey};

/// Everything an executor gets for one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub execution_id: Uuid,
    pub key: TaskKey,
    /// Non-bookkeeping columns of the task row.
    pub params: BTreeMap<String, String>,
    pub unit: ClaimedUnit,
    /// 1 for the first attempt.
    pub attempt: u32,
}

/// What an executor reports, before mapping onto [`crate::model::Outcome`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawOutcome {
    pub outcome: String,
    /// Fields merged into the task row.
    #[serde(default)]
    pub result: BTreeMap<String, String>,
}

impl RawOutcome {
    pub fn new(outcome: impl Into<String>) -> Self {
        Self {
            outcome: outcome.into(),
            result: BTreeMap::new(),
        }
    }

    pub fn success() -> Self {
        Self::new("success")
    }

    pub fn with_result(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.result.insert(column.into(), value.into());
        self
    }
}

/// Performs one task. An `Err` is recorded as a failure with its message.
pub trait TaskExecutor: Send + Sync + 'static {
    fn execute(&self, request: ExecutionRequest) -> impl Future<Output = Result<RawOutcome>> + Send;
}

/// Executor backed by an async closure.
pub struct FnExecutor<F>(F);

/// Wrap `f` as a [`TaskExecutor`].
pub fn from_fn<F, Fut>(f: F) -> FnExecutor<F>
where
    F: Fn(ExecutionRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RawOutcome>> + Send + 'static,
{
    FnExecutor(f)
}

impl<F, Fut> TaskExecutor for FnExecutor<F>
where
    F: Fn(ExecutionRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RawOutcome>> + Send + 'static,
{
    fn execute(
        &self,
        request: ExecutionRequest,
    ) -> impl Future<Output = Result<RawOutcome>> + Send {
        (self.0)(request)
    }
}
