//! Core data model.
//!
//! An item is one unit of work. It is stored in etcd as JSON under a key
//! derived from its bucket, weight and creation time.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::key;

/// Maximum item weight (priority). Larger weights are clamped.
pub const MAX_WEIGHT: u64 = 99999;

/// Progress value of a finished job.
pub const MAX_PROGRESS: u32 = 100;

// ---------------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------------

/// A job item in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Job category. Every key is prefixed with it.
    pub bucket: String,

    /// When the item was created. Only used to derive the key and for display.
    pub created_at: DateTime<Utc>,

    /// Storage key, derived from bucket, weight and `created_at`.
    pub key: String,

    /// Opaque payload (e.g. encoded computation results).
    pub value: String,

    /// Progress from 0 to [`MAX_PROGRESS`].
    pub progress: u32,

    /// Set by the caller when the job is abandoned. The queue does not act on it.
    pub canceled: bool,

    /// Non-empty when the item represents a failure.
    pub error: String,

    /// Correlation token generated by an external service.
    pub request_id: String,
}

impl Item {
    /// Create an item stamped with the current time.
    ///
    /// Weights above [`MAX_WEIGHT`] are clamped to [`MAX_WEIGHT`].
    pub fn new(bucket: impl Into<String>, weight: u64, value: impl Into<String>) -> Self {
        Self::new_at(bucket, weight, value, Utc::now())
    }

    /// Create an item with an explicit creation time.
    pub fn new_at(
        bucket: impl Into<String>,
        weight: u64,
        value: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let bucket = bucket.into();
        let key = key::encode(&bucket, weight, created_at);
        Self {
            bucket,
            created_at,
            key,
            value: value.into(),
            progress: 0,
            canceled: false,
            error: String::new(),
            request_id: String::new(),
        }
    }

    /// An item carrying nothing but an error message.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            bucket: String::new(),
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            key: String::new(),
            value: String::new(),
            progress: 0,
            canceled: false,
            error: error.into(),
            request_id: String::new(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Does this item report a failure?
    pub fn is_err(&self) -> bool {
        !self.error.is_empty()
    }

    /// Has the job reached a terminal state (finished, failed or canceled)?
    pub fn is_done(&self) -> bool {
        self.progress >= MAX_PROGRESS || self.is_err() || self.canceled
    }

    /// Split an error-carrying item off as `Err(message)`.
    pub fn into_result(self) -> std::result::Result<Item, String> {
        if self.is_err() {
            Err(self.error)
        } else {
            Ok(self)
        }
    }

    /// Compare two items field by field, tolerating `created_at`
    /// differences below one microsecond.
    pub fn matches(&self, other: &Item) -> std::result::Result<(), ItemMismatch> {
        let (a, b) = (
            self.created_at.trunc_subsecs(6),
            other.created_at.trunc_subsecs(6),
        );
        if a != b {
            return Err(ItemMismatch::new("created_at", a, b));
        }
        if self.bucket != other.bucket {
            return Err(ItemMismatch::new("bucket", &self.bucket, &other.bucket));
        }
        if self.key != other.key {
            return Err(ItemMismatch::new("key", &self.key, &other.key));
        }
        if self.value != other.value {
            return Err(ItemMismatch::new("value", &self.value, &other.value));
        }
        if self.progress != other.progress {
            return Err(ItemMismatch::new("progress", self.progress, other.progress));
        }
        if self.canceled != other.canceled {
            return Err(ItemMismatch::new("canceled", self.canceled, other.canceled));
        }
        if self.error != other.error {
            return Err(ItemMismatch::new("error", &self.error, &other.error));
        }
        if self.request_id != other.request_id {
            return Err(ItemMismatch::new(
                "request_id",
                &self.request_id,
                &other.request_id,
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mismatch
// ---------------------------------------------------------------------------

/// First field on which two items disagree.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("expected {field} {expected:?}, got {actual:?}")]
pub struct ItemMismatch {
    pub field: &'static str,
    pub expected: String,
    pub actual: String,
}

impl ItemMismatch {
    fn new(field: &'static str, expected: impl ToString, actual: impl ToString) -> Self {
        Self {
            field,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}
