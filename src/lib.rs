//! # claimq
//!
//! Crash-resumable task queue and exclusive resource allocator over plain
//! CSV files, coordinated by advisory file locks.
//!
//! Provides the task queue (`queue`), pool allocator (`allocator`), a batch
//! retry driver (`engine`), pluggable executors, and OpenTelemetry
//! observability. Every piece of state lives in the files, so any number of
//! worker processes can share them and a killed run resumes where it stopped.

pub mod allocator;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod lock;
pub mod model;
pub mod queue;
pub mod splitter;
pub mod storage;
pub mod telemetry;
