//! Metric instrument factories for etcdq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"etcdq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for etcdq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter(super::SERVICE_NAME)
}

/// Counter: items written to the queue.
/// Labels: `bucket`, `result` ("ok" | "error").
pub fn items_added() -> Counter<u64> {
    meter()
        .u64_counter("etcdq.queue.added")
        .with_description("Number of items added to the queue")
        .build()
}

/// Counter: pop deliveries.
/// Labels: `bucket`, `path` ("range" | "watch"), `result` ("ok" | "error").
pub fn items_popped() -> Counter<u64> {
    meter()
        .u64_counter("etcdq.queue.popped")
        .with_description("Number of pop deliveries")
        .build()
}

/// Histogram: time from pop call to delivery, in milliseconds.
/// Labels: `bucket`.
pub fn pop_wait_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("etcdq.queue.pop_wait_ms")
        .with_description("Time a pop waited before delivery")
        .with_unit("ms")
        .build()
}

/// Counter: claims lost to a concurrent popper.
/// Labels: `bucket`.
pub fn claim_conflicts() -> Counter<u64> {
    meter()
        .u64_counter("etcdq.queue.claim_conflicts")
        .with_description("Pop claims that lost a race and retried")
        .build()
}
