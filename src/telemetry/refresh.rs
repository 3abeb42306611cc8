//! Span helpers for task execution and upstream queries.

use tracing::Span;
use uuid::Uuid;

/// Start a span for one task run by the runner.
///
/// `task.result` is declared empty; fill it with [`record_task_result`].
pub fn start_task_span(task: &str, task_id: &Uuid, lane: &str) -> Span {
    tracing::info_span!(
        "task.execute",
        "task.name" = task,
        "task.id" = %task_id,
        "task.lane" = lane,
        "task.result" = tracing::field::Empty,
    )
}

pub fn record_task_result(span: &Span, result: &str) {
    span.record("task.result", result);
}

/// Start a span around one rate-limited upstream query (all attempts).
pub fn start_query_span(query: &str, lane: &str) -> Span {
    tracing::info_span!("upstream.query", "query.name" = query, "query.lane" = lane)
}
