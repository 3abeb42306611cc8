//! Metric instrument factories.
//!
//! Instruments come from the globally-registered `MeterProvider` under the
//! `"commons-refresh"` meter; without an OTLP endpoint they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("commons-refresh")
}

/// Counter: records stamped by the dispatcher.
/// Labels: `operation`, `kind`, `trigger` ("periodic" | "manual").
pub fn records_claimed() -> Counter<u64> {
    meter()
        .u64_counter("refresh.records.claimed")
        .with_description("Records stamped with a fresh queued-at token")
        .build()
}

/// Counter: work items enqueued.
/// Labels: `operation`, `kind`.
pub fn work_items_emitted() -> Counter<u64> {
    meter()
        .u64_counter("refresh.work_items.emitted")
        .with_description("Refresh work items enqueued")
        .build()
}

/// Counter: fenced writes skipped because the token moved on.
/// Labels: `operation`, `kind`.
pub fn stale_dispatches() -> Counter<u64> {
    meter()
        .u64_counter("refresh.stale_dispatch")
        .with_description("Refresh results discarded by the fencing check")
        .build()
}

/// Counter: dispatcher failures isolated to one collection.
/// Labels: `operation`, `kind`.
pub fn dispatch_failures() -> Counter<u64> {
    meter()
        .u64_counter("refresh.dispatch.failures")
        .with_description("Collections whose dispatch failed")
        .build()
}

/// Counter: upstream requests.
/// Labels: `query`, `outcome` ("ok" | "throttled" | "error").
pub fn upstream_requests() -> Counter<u64> {
    meter()
        .u64_counter("upstream.requests")
        .with_description("Requests sent to the query service")
        .build()
}

/// Counter: lane suspend/resume transitions.
/// Labels: `lane`, `action`.
pub fn lane_transitions() -> Counter<u64> {
    meter()
        .u64_counter("lane.transitions")
        .with_description("Lane suspend and resume transitions")
        .build()
}

/// Counter: queue-level operations (create, send, read, archive, delete).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: finished tasks.
/// Labels: `task`, `result` ("ok" | "error" | "dead").
pub fn tasks_finished() -> Counter<u64> {
    meter()
        .u64_counter("tasks.finished")
        .with_description("Tasks finished by the runner")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
