//! Queue engine. The public API for adding and popping items.
//!
//! Items live under `_queue/<bucket>/...` in the store. `add` serializes
//! writers behind one lock; `pop` claims the first key of a bucket, or
//! waits on a creation watch when the bucket is empty. Claims are
//! compare-and-delete on the key's creation revision, so each stored
//! item is delivered to at most one popper.

pub mod watcher;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::time::Instant;
use tracing::{Instrument, Span, debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::key;
use crate::model::Item;
use crate::store::{CreateWatch, EtcdStore, Entry, KvStore, WatchEvent};
use crate::telemetry::metrics;
use crate::telemetry::spans::{record_pop_path, start_add_span, start_pop_span};

pub use watcher::ItemWatcher;

/// TTLs at or below this many seconds are ignored: the item is written
/// without a lease.
pub const MIN_LEASE_TTL_SECS: i64 = 5;

/// Error carried by items popped after (or during) [`Queue::stop`].
pub const STOPPED: &str = "queue stopped";
/// Error carried when [`PopOptions::timeout`] elapses first.
pub const DEADLINE_EXCEEDED: &str = "deadline exceeded";
/// Error carried when [`ItemWatcher::cancel`] is called first.
pub const CANCELED: &str = "pop canceled";

const PROBE_KEY: &str = "foo";
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Per-call settings for [`Queue::add`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddOptions {
    /// Remove the item from the store if nobody pops it within this long.
    /// Applied in whole seconds, and only above [`MIN_LEASE_TTL_SECS`].
    /// Default: no expiry.
    pub ttl: Option<Duration>,
}

impl AddOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { ttl: Some(ttl) }
    }

    fn ttl_secs(&self) -> i64 {
        self.ttl
            .map(|ttl| i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }
}

/// Per-call settings for [`Queue::pop`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PopOptions {
    /// Give up after this long. Default: wait until an item arrives.
    pub timeout: Option<Duration>,
}

impl PopOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Priority queue backed by a [`KvStore`]. Cheap to clone.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn KvStore>,
    /// Serializes `add` and `stop`. Pops never take it.
    write_lock: Mutex<()>,
    stopped: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Queue {
    /// Connect to etcd as described by `config`.
    pub async fn connect(config: &Config) -> Result<Self> {
        let store = EtcdStore::connect(config).await?;
        Self::new(Arc::new(store)).await
    }

    /// Build a queue over `store`.
    ///
    /// Issues one linearized read first, so an unreachable or leaderless
    /// cluster fails here rather than on first use.
    pub async fn new(store: Arc<dyn KvStore>) -> Result<Self> {
        let endpoints = store.endpoints();
        info!(?endpoints, "probing store with linearized read");
        match tokio::time::timeout(PROBE_TIMEOUT, store.linearized_get(PROBE_KEY)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(Error::Other(format!(
                    "linearized read on {endpoints:?} timed out after {PROBE_TIMEOUT:?}"
                )));
            }
        }
        info!(?endpoints, "store probe succeeded");

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                write_lock: Mutex::new(()),
                stopped: AtomicBool::new(false),
                shutdown,
            }),
        })
    }

    /// Add an item to the queue.
    pub async fn add(&self, item: &Item, opts: AddOptions) -> Result<()> {
        validate(item)?;

        let queue_key = key::queue_key(&item.key);
        let data = serde_json::to_vec(item)?;
        let ttl_secs = opts.ttl_secs();

        let span = start_add_span(&item.bucket, &item.key);
        async {
            let _write = self.inner.write_lock.lock().await;
            if self.is_stopped() {
                return Err(Error::Stopped);
            }

            let result = self.put(&queue_key, &data, ttl_secs).await;
            metrics::items_added().add(
                1,
                &[
                    KeyValue::new("bucket", item.bucket.clone()),
                    KeyValue::new("result", if result.is_ok() { "ok" } else { "error" }),
                ],
            );
            result?;

            info!(key = %item.key, ttl_secs, "queue: wrote item");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Pop the first item of `bucket`.
    ///
    /// Returns once the item is claimed, or once a creation watch on the
    /// empty bucket is established; the watcher then resolves when an item
    /// arrives. Every failure is delivered as an item with `error` set.
    pub async fn pop(&self, bucket: &str, opts: PopOptions) -> ItemWatcher {
        let (tx, rx) = oneshot::channel();
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        let watcher = ItemWatcher::new(rx, cancel_tx);

        let started = Instant::now();
        let deadline = opts.timeout.map(|timeout| started + timeout);
        let span = start_pop_span(bucket);
        let popper = Popper {
            store: Arc::clone(&self.inner.store),
            bucket: bucket.to_string(),
            prefix: key::bucket_prefix(bucket),
        };

        if self.is_stopped() {
            popper.deliver(tx, Item::failed(STOPPED), "none", started, &span);
            return watcher;
        }

        let mut shutdown = self.inner.shutdown.subscribe();
        let prepared = tokio::select! {
            biased;
            _ = stopped(&mut shutdown) => Prepared::Done(Item::failed(STOPPED), "none"),
            _ = until(deadline) => Prepared::Done(Item::failed(DEADLINE_EXCEEDED), "none"),
            prepared = popper.prepare().instrument(span.clone()) => prepared,
        };

        let watch = match prepared {
            Prepared::Done(item, path) => {
                popper.deliver(tx, item, path, started, &span);
                return watcher;
            }
            Prepared::Waiting(watch) => watch,
        };

        debug!(bucket, "bucket empty, waiting on watch");
        let task_span = span.clone();
        tokio::spawn(
            async move {
                // Termination wins over a batch that is ready in the same poll.
                let (item, path) = tokio::select! {
                    biased;
                    _ = stopped(&mut shutdown) => (Item::failed(STOPPED), "none"),
                    _ = &mut cancel_rx => (Item::failed(CANCELED), "none"),
                    _ = until(deadline) => (Item::failed(DEADLINE_EXCEEDED), "none"),
                    item = popper.wait(watch) => item,
                };
                popper.deliver(tx, item, path, started, &span);
            }
            .instrument(task_span),
        );
        watcher
    }

    /// Stop the queue and close the store connection. Idempotent.
    ///
    /// Waits for an in-flight `add` to finish. Pending pops resolve with a
    /// [`STOPPED`] error item; later calls fail with [`Error::Stopped`].
    pub async fn stop(&self) {
        let _write = self.inner.write_lock.lock().await;
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("stopping queue");
        self.inner.shutdown.send_replace(true);
        self.inner.store.close().await;
        info!("stopped queue");
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// The underlying etcd client, when the queue runs on etcd and has
    /// not been stopped.
    pub fn client(&self) -> Option<etcd_client::Client> {
        self.inner.store.etcd_client()
    }

    pub fn client_endpoints(&self) -> Vec<String> {
        self.inner.store.endpoints()
    }

    async fn put(&self, key: &str, value: &[u8], ttl_secs: i64) -> Result<()> {
        let lease = if ttl_secs > MIN_LEASE_TTL_SECS {
            Some(self.inner.store.grant_lease(ttl_secs).await?)
        } else {
            None
        };
        self.inner.store.put(key, value, lease).await
    }
}

fn validate(item: &Item) -> Result<()> {
    if key::normalize_bucket(&item.bucket).is_empty() {
        return Err(Error::InvalidItem("empty bucket".to_string()));
    }
    if item.key.is_empty() {
        return Err(Error::InvalidItem("empty key".to_string()));
    }
    let bucket_segment = format!("{}{}", key::normalize_bucket(&item.bucket), key::SEPARATOR);
    if !item.key.starts_with(&bucket_segment) {
        return Err(Error::InvalidItem(format!(
            "key {:?} is not under bucket {:?}",
            item.key, item.bucket
        )));
    }
    Ok(())
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender means the queue itself is gone.
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Pop protocol
// ---------------------------------------------------------------------------

enum Prepared {
    /// Item (or error item) ready, with the path it came from.
    Done(Item, &'static str),
    /// Bucket empty; the watch is established.
    Waiting(Box<dyn CreateWatch>),
}

enum Attempt {
    Delivered(Item),
    /// Another popper claimed the key first.
    Lost,
    Empty,
}

struct Popper {
    store: Arc<dyn KvStore>,
    bucket: String,
    prefix: String,
}

impl Popper {
    /// Claim from the range read, or establish a watch on the empty bucket.
    async fn prepare(&self) -> Prepared {
        loop {
            match self.from_range().await {
                Attempt::Delivered(item) => return Prepared::Done(item, "range"),
                Attempt::Lost => continue,
                Attempt::Empty => {}
            }

            let watch = match self.store.watch_creates(&self.prefix).await {
                Ok(watch) => watch,
                Err(e) => {
                    return Prepared::Done(
                        Item::failed(format!("watch failed to create {:?} ({e})", self.prefix)),
                        "watch",
                    );
                }
            };

            // Items written between the first read and the watch going live
            // produce no event; read once more now that the watch is up.
            match self.from_range().await {
                Attempt::Delivered(item) => return Prepared::Done(item, "range"),
                Attempt::Lost => continue,
                Attempt::Empty => return Prepared::Waiting(watch),
            }
        }
    }

    /// Wait for the first creation under the bucket and claim it.
    async fn wait(&self, mut watch: Box<dyn CreateWatch>) -> (Item, &'static str) {
        loop {
            let batch = match watch.next_batch().await {
                Ok(Some(batch)) => batch,
                Ok(None) => {
                    return (
                        Item::failed(format!("watch on {:?} closed", self.prefix)),
                        "watch",
                    );
                }
                Err(e) => {
                    return (
                        Item::failed(format!("{:?} returned error {e}", self.prefix)),
                        "watch",
                    );
                }
            };

            if let Some(error) = batch.error {
                return (
                    Item::failed(format!("{:?} returned error {error}", self.prefix)),
                    "watch",
                );
            }
            if batch.canceled {
                return (
                    Item::failed(format!("{:?} watch has been canceled", self.prefix)),
                    "watch",
                );
            }
            let [event] = batch.events.as_slice() else {
                return (
                    Item::failed(format!(
                        "{:?} did not return 1 event via watch (got {})",
                        self.prefix,
                        batch.events.len()
                    )),
                    "watch",
                );
            };
            let entry = match event {
                WatchEvent::Created(entry) => entry,
                WatchEvent::Deleted(key) => {
                    return (
                        Item::failed(format!(
                            "{:?} watch delivered a delete of {key:?}",
                            self.prefix
                        )),
                        "watch",
                    );
                }
            };

            match self.claim(entry).await {
                Attempt::Delivered(item) => return (item, "watch"),
                Attempt::Lost | Attempt::Empty => {}
            }

            // Lost the race for this key: start over from a fresh read.
            match self.prepare().await {
                Prepared::Done(item, path) => return (item, path),
                Prepared::Waiting(next) => watch = next,
            }
        }
    }

    async fn from_range(&self) -> Attempt {
        let range = match self.store.first_in_range(&self.prefix).await {
            Ok(range) => range,
            Err(e) => return Attempt::Delivered(Item::failed(e.to_string())),
        };
        match range.entries.as_slice() {
            [] => Attempt::Empty,
            [entry] => self.claim(entry).await,
            _ => Attempt::Delivered(Item::failed(format!(
                "{:?} returned more than 1 key",
                self.prefix
            ))),
        }
    }

    /// Decode the entry and delete it if it is still the same incarnation.
    async fn claim(&self, entry: &Entry) -> Attempt {
        let item: Item = match serde_json::from_slice(&entry.value) {
            Ok(item) => item,
            Err(e) => {
                // Remove the poisoned entry so it cannot block later pops.
                if let Err(del) = self.store.delete(&entry.key).await {
                    warn!(key = %entry.key, "failed to delete malformed entry: {del}");
                }
                return Attempt::Delivered(Item::failed(format!(
                    "{:?} returned wrong JSON {:?} ({e})",
                    entry.key,
                    String::from_utf8_lossy(&entry.value)
                )));
            }
        };

        match self
            .store
            .delete_if_created(&entry.key, entry.create_revision)
            .await
        {
            Ok(true) => Attempt::Delivered(item),
            Ok(false) => {
                debug!(key = %entry.key, "claim lost to a concurrent pop");
                metrics::claim_conflicts()
                    .add(1, &[KeyValue::new("bucket", self.bucket.clone())]);
                Attempt::Lost
            }
            Err(e) => Attempt::Delivered(Item::failed(format!(
                "failed to delete {:?} ({e})",
                entry.key
            ))),
        }
    }

    fn deliver(
        &self,
        tx: oneshot::Sender<Item>,
        item: Item,
        path: &'static str,
        started: Instant,
        span: &Span,
    ) {
        record_pop_path(span, path);
        let result = if item.is_err() { "error" } else { "ok" };
        metrics::items_popped().add(
            1,
            &[
                KeyValue::new("bucket", self.bucket.clone()),
                KeyValue::new("path", path),
                KeyValue::new("result", result),
            ],
        );
        metrics::pop_wait_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("bucket", self.bucket.clone())],
        );

        span.in_scope(|| {
            if item.is_err() {
                warn!(bucket = %self.bucket, error = %item.error, "pop failed");
            } else {
                info!(bucket = %self.bucket, key = %item.key, path, "popped item");
            }
        });

        // The caller may have dropped the watcher; nothing to do then.
        let _ = tx.send(item);
    }
}
