//! Driver engine: batch dispatch, per-task execution, outcome recording.

pub mod driver;
pub mod execution;

pub use driver::{Driver, DriverConfig, DriverReport, DriverState};
pub use execution::{Disposition, ExecutionContext, ExecutionReport, run_execution};
