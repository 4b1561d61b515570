//! Core data model.
//!
//! A task is a row in the task source file: an identity key, a lifecycle
//! status, and an opaque bag of parameters the executor interprets. A
//! resource unit is a row in a pool file that can be consumed exactly once.

pub mod resource;
pub mod task;

pub use resource::{ClaimedUnit, PoolId};
pub use task::{Outcome, Status, TaskKey, TaskRecord};
