//! Metric instrument factories.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an OTLP endpoint the global provider is a no-op.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("claimq")
}

/// Counter: dispatch cycles that started at least one execution.
pub fn cycles() -> Counter<u64> {
    meter()
        .u64_counter("claimq.cycles")
        .with_description("Dispatch cycles run")
        .build()
}

/// Counter: executions started.
pub fn tasks_dispatched() -> Counter<u64> {
    meter()
        .u64_counter("claimq.tasks.dispatched")
        .with_description("Task executions started")
        .build()
}

/// Counter: recorded outcomes.
/// Labels: `outcome`.
pub fn task_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("claimq.tasks.outcomes")
        .with_description("Task outcomes recorded")
        .build()
}

/// Counter: resource units claimed.
/// Labels: `pool`.
pub fn units_claimed() -> Counter<u64> {
    meter()
        .u64_counter("claimq.units.claimed")
        .with_description("Resource units claimed")
        .build()
}

/// Counter: pool files auto-provisioned with a placeholder unit.
/// Labels: `pool`.
pub fn units_provisioned() -> Counter<u64> {
    meter()
        .u64_counter("claimq.units.provisioned")
        .with_description("Placeholder pools provisioned")
        .build()
}

/// Counter: claims that found no unconsumed unit.
/// Labels: `pool`.
pub fn units_exhausted() -> Counter<u64> {
    meter()
        .u64_counter("claimq.units.exhausted")
        .with_description("Claims against an exhausted pool")
        .build()
}

/// Histogram: time spent waiting for a named lock.
/// Labels: `lock`.
pub fn lock_wait_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("claimq.lock.wait_ms")
        .with_description("Lock wait in milliseconds")
        .with_unit("ms")
        .build()
}
