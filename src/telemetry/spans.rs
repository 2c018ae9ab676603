//! Queue operation span helpers.

use tracing::Span;

/// Start a span covering one pop, from the call to delivery.
///
/// The `pop.path` field is declared empty and filled in by
/// [`record_pop_path`] once the item source is known.
pub fn start_pop_span(bucket: &str) -> Span {
    tracing::info_span!(
        "queue.pop",
        "queue.bucket" = bucket,
        "pop.path" = tracing::field::Empty,
    )
}

/// Record where the delivered item came from ("range" or "watch").
pub fn record_pop_path(span: &Span, path: &str) {
    span.record("pop.path", path);
}

/// Start a span for one add.
pub fn start_add_span(bucket: &str, key: &str) -> Span {
    tracing::info_span!("queue.add", "queue.bucket" = bucket, "queue.key" = key)
}
