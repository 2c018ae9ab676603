//! Key-value store adapter.
//!
//! The queue engine only needs a handful of primitives from its store:
//! linearized get, first-key-in-range, put with an optional lease,
//! delete (plain and compare-and-delete on creation revision) and a
//! watch on key creations. [`KvStore`] captures exactly those; the etcd
//! backend lives in [`etcd`], an in-process backend in [`memory`].

pub mod etcd;
pub mod memory;

use async_trait::async_trait;

use crate::error::Result;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

/// Lease identifier returned by [`KvStore::grant_lease`].
pub type LeaseId = i64;

/// One stored key-value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub value: Vec<u8>,
    /// Store revision at which this incarnation of the key was created.
    pub create_revision: i64,
}

/// Result of a first-in-range read.
#[derive(Debug, Clone, Default)]
pub struct Range {
    /// At most one entry from a conforming backend.
    pub entries: Vec<Entry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Created(Entry),
    Deleted(String),
}

/// One response from a creation watch.
#[derive(Debug, Clone, Default)]
pub struct WatchBatch {
    pub events: Vec<WatchEvent>,
    /// The store canceled the watch.
    pub canceled: bool,
    /// Error reported by the store alongside the batch.
    pub error: Option<String>,
}

/// An established subscription to key creations under a prefix.
#[async_trait]
pub trait CreateWatch: Send {
    /// Next batch of events, or `None` once the stream has ended.
    async fn next_batch(&mut self) -> Result<Option<WatchBatch>>;
}

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Linearized read of one key.
    async fn linearized_get(&self, key: &str) -> Result<Option<Entry>>;

    /// Lexicographically smallest key under `prefix`, if any.
    async fn first_in_range(&self, prefix: &str) -> Result<Range>;

    /// Grant a lease that expires after `ttl_secs` seconds.
    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId>;

    /// Write `value` under `key`, attached to `lease` when given.
    async fn put(&self, key: &str, value: &[u8], lease: Option<LeaseId>) -> Result<()>;

    /// Unconditional delete. Returns how many keys were removed.
    async fn delete(&self, key: &str) -> Result<u64>;

    /// Delete `key` only if it still exists with the given creation
    /// revision. Returns `false` when the key is gone or was recreated.
    async fn delete_if_created(&self, key: &str, create_revision: i64) -> Result<bool>;

    /// Subscribe to key creations under `prefix`. Returns once the store
    /// has acknowledged the subscription; only creations after that point
    /// are delivered.
    async fn watch_creates(&self, prefix: &str) -> Result<Box<dyn CreateWatch>>;

    fn endpoints(&self) -> Vec<String>;

    /// Release the connection. Later calls fail.
    async fn close(&self);

    /// The underlying etcd client, for backends that have one and are
    /// not closed.
    fn etcd_client(&self) -> Option<etcd_client::Client> {
        None
    }
}
