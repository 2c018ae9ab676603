//! Priority key encoding.
//!
//! Every item is stored under a key whose lexicographic order is the
//! queue order: heavier items first, then oldest first within one weight.
//!
//! ```text
//! <bucket>/<priority:5 decimal digits>/<created_at nanos:35 hex digits>
//! ```
//!
//! `priority` is `MAX_WEIGHT - weight`, so weight 99999 encodes as
//! `00000` and sorts before everything else in the bucket.

use chrono::{DateTime, Utc};

use crate::model::MAX_WEIGHT;

/// Reserved top-level namespace holding every queued item.
pub const QUEUE_PREFIX: &str = "_queue";

/// Namespace path separator.
pub const SEPARATOR: char = '/';

/// Width of the zero-padded priority segment.
pub const PRIORITY_WIDTH: usize = 5;

/// Width of the zero-padded hex timestamp segment. 35 hex digits hold
/// 140 bits, far beyond any nanosecond count an `i64` second can reach.
pub const TIMESTAMP_WIDTH: usize = 35;

/// Derive the storage key for an item.
///
/// Weights above [`MAX_WEIGHT`] are clamped rather than rejected.
pub fn encode(bucket: &str, weight: u64, created_at: DateTime<Utc>) -> String {
    let priority = MAX_WEIGHT - weight.min(MAX_WEIGHT);
    format!(
        "{bucket}{SEPARATOR}{priority:0pw$}{SEPARATOR}{nanos:0tw$X}",
        bucket = normalize_bucket(bucket),
        nanos = epoch_nanos(created_at),
        pw = PRIORITY_WIDTH,
        tw = TIMESTAMP_WIDTH,
    )
}

/// Nanoseconds since the Unix epoch, widened so no instant chrono can
/// represent overflows. Instants before the epoch saturate to zero.
pub fn epoch_nanos(at: DateTime<Utc>) -> u128 {
    let secs = i128::from(at.timestamp());
    let nanos = secs * 1_000_000_000 + i128::from(at.timestamp_subsec_nanos());
    u128::try_from(nanos).unwrap_or(0)
}

/// Storage key for an already-encoded item key.
pub fn queue_key(item_key: &str) -> String {
    format!("{QUEUE_PREFIX}{SEPARATOR}{item_key}")
}

/// Prefix covering every item of one bucket.
///
/// Ends with the separator so bucket `cats` never matches `cats-request`.
pub fn bucket_prefix(bucket: &str) -> String {
    format!(
        "{QUEUE_PREFIX}{SEPARATOR}{}{SEPARATOR}",
        normalize_bucket(bucket)
    )
}

/// Bucket name with leading/trailing separators removed.
pub fn normalize_bucket(bucket: &str) -> &str {
    bucket.trim_matches(SEPARATOR)
}
