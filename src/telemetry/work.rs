//! Task execution span helpers.

use tracing::Span;
use uuid::Uuid;

/// Start a span covering one execution of one task.
///
/// The `task.state` field is declared empty and can be updated via
/// [`record_state_transition`].
pub fn start_task_span(key: &str, pool: &str, execution_id: &Uuid) -> Span {
    tracing::info_span!(
        "task.execute",
        "task.key" = key,
        "task.pool" = pool,
        "execution.id" = %execution_id,
        "task.state" = tracing::field::Empty,
    )
}

/// Record a status transition on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("task.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
