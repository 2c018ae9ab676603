//! Integration tests for the queue engine, run against the in-process store.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use etcdq::error::{Error, Result};
use etcdq::key;
use etcdq::model::Item;
use etcdq::queue::{AddOptions, CANCELED, DEADLINE_EXCEEDED, PopOptions, Queue, STOPPED};
use etcdq::store::{
    CreateWatch, Entry, KvStore, LeaseId, MemoryStore, Range, WatchBatch, WatchEvent,
};

const WAIT: Duration = Duration::from_secs(5);

async fn test_queue() -> (Queue, MemoryStore) {
    let store = MemoryStore::new();
    let queue = Queue::new(Arc::new(store.clone()))
        .await
        .expect("failed to create queue");
    (queue, store)
}

async fn pop_now(queue: &Queue, bucket: &str) -> Item {
    let watcher = queue.pop(bucket, PopOptions::default()).await;
    tokio::time::timeout(WAIT, watcher)
        .await
        .expect("pop did not deliver in time")
}

// ---------------------------------------------------------------------------
// Add / Pop round trip
// ---------------------------------------------------------------------------

#[tokio::test]
async fn add_then_pop_returns_the_item() {
    let (queue, _store) = test_queue().await;

    let mut item = Item::new("cats-request", 1, "https://example.com/cat.jpeg")
        .with_request_id("req-1");
    item.progress = 42;
    queue.add(&item, AddOptions::default()).await.unwrap();

    let popped = pop_now(&queue, "cats-request").await;
    assert!(!popped.is_err(), "{popped:?}");
    item.matches(&popped).unwrap();
    assert_eq!(popped.progress, 42);
}

#[tokio::test]
async fn pop_removes_the_item() {
    let (queue, store) = test_queue().await;
    let item = Item::new("jobs", 1, "v");
    queue.add(&item, AddOptions::default()).await.unwrap();
    assert_eq!(store.keys(), [key::queue_key(&item.key)]);

    pop_now(&queue, "jobs").await;

    let range = store.first_in_range(&key::bucket_prefix("jobs")).await.unwrap();
    assert!(range.entries.is_empty());
    assert!(store.keys().is_empty());
}

#[tokio::test]
async fn pops_follow_weight_then_age() {
    let (queue, _store) = test_queue().await;
    let t = |secs: i64| Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();

    let light = Item::new_at("jobs", 1, "light", t(0));
    let medium_old = Item::new_at("jobs", 500, "medium-old", t(1));
    let medium_new = Item::new_at("jobs", 500, "medium-new", t(2));
    let heavy = Item::new_at("jobs", 99999, "heavy", t(3));

    for item in [&medium_new, &light, &heavy, &medium_old] {
        queue.add(item, AddOptions::default()).await.unwrap();
    }

    let mut order = Vec::new();
    for _ in 0..4 {
        order.push(pop_now(&queue, "jobs").await.value);
    }
    assert_eq!(order, ["heavy", "medium-old", "medium-new", "light"]);
}

#[tokio::test]
async fn buckets_do_not_share_items() {
    let (queue, _store) = test_queue().await;
    queue
        .add(&Item::new("cats-request", 1, "cat"), AddOptions::default())
        .await
        .unwrap();

    let mut watcher = queue
        .pop("cats", PopOptions::with_timeout(Duration::from_millis(100)))
        .await;
    assert!(watcher.try_take().is_none());
    assert_eq!(watcher.await.error, DEADLINE_EXCEEDED);

    assert_eq!(pop_now(&queue, "cats-request").await.value, "cat");
}

// ---------------------------------------------------------------------------
// Blocking pop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pop_blocks_until_an_item_is_added() {
    let (queue, _store) = test_queue().await;

    let mut watcher = queue.pop("jobs", PopOptions::default()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(watcher.try_take().is_none(), "pop delivered from an empty bucket");

    let item = Item::new("jobs", 3, "late").with_request_id("r");
    queue.add(&item, AddOptions::default()).await.unwrap();

    let popped = tokio::time::timeout(WAIT, watcher).await.unwrap();
    item.matches(&popped).unwrap();
}

#[tokio::test]
async fn waiting_pop_removes_the_item() {
    let (queue, store) = test_queue().await;

    let watcher = queue.pop("jobs", PopOptions::default()).await;
    queue
        .add(&Item::new("jobs", 1, "v"), AddOptions::default())
        .await
        .unwrap();
    let popped = tokio::time::timeout(WAIT, watcher).await.unwrap();

    assert!(!popped.is_err(), "{popped:?}");
    assert!(store.keys().is_empty());
}

#[tokio::test]
async fn waiting_pop_ignores_other_buckets() {
    let (queue, store) = test_queue().await;

    let mut watcher = queue.pop("dogs", PopOptions::default()).await;
    queue
        .add(&Item::new("cats", 1, "cat"), AddOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(watcher.try_take().is_none());

    queue
        .add(&Item::new("dogs", 1, "dog"), AddOptions::default())
        .await
        .unwrap();
    assert_eq!(tokio::time::timeout(WAIT, watcher).await.unwrap().value, "dog");
    assert_eq!(store.keys().len(), 1);
}

#[tokio::test]
async fn pop_deadline_delivers_error_item() {
    let (queue, _store) = test_queue().await;
    let watcher = queue
        .pop("jobs", PopOptions::with_timeout(Duration::from_millis(50)))
        .await;
    let item = tokio::time::timeout(WAIT, watcher).await.unwrap();
    assert_eq!(item.error, DEADLINE_EXCEEDED);
    assert!(item.key.is_empty());
}

#[tokio::test]
async fn canceled_pop_delivers_error_item() {
    let (queue, store) = test_queue().await;
    let mut watcher = queue.pop("jobs", PopOptions::default()).await;
    watcher.cancel();
    let item = tokio::time::timeout(WAIT, watcher).await.unwrap();
    assert_eq!(item.error, CANCELED);

    // The canceled pop must not swallow a later item.
    queue
        .add(&Item::new("jobs", 1, "kept"), AddOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.keys().len(), 1);
}

#[tokio::test]
async fn dropped_watcher_leaves_items_in_place() {
    let (queue, store) = test_queue().await;
    drop(queue.pop("jobs", PopOptions::default()).await);

    queue
        .add(&Item::new("jobs", 1, "kept"), AddOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.keys().len(), 1);
    assert_eq!(pop_now(&queue, "jobs").await.value, "kept");
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_pops_never_share_an_item() {
    let (queue, store) = test_queue().await;
    const N: usize = 32;

    for i in 0..N {
        queue
            .add(&Item::new("jobs", 1, format!("item-{i}")), AddOptions::default())
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..N {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move { pop_now(&queue, "jobs").await }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        let item = handle.await.unwrap();
        assert!(!item.is_err(), "{item:?}");
        assert!(seen.insert(item.key.clone()), "duplicate delivery of {}", item.key);
    }
    assert_eq!(seen.len(), N);
    assert!(store.keys().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn waiting_pops_split_new_items() {
    let (queue, _store) = test_queue().await;

    let mut watchers = Vec::new();
    for _ in 0..3 {
        watchers.push(queue.pop("jobs", PopOptions::default()).await);
    }
    for i in 0..3 {
        queue
            .add(&Item::new("jobs", 1, format!("v{i}")), AddOptions::default())
            .await
            .unwrap();
    }

    let mut values = HashSet::new();
    for watcher in watchers {
        let item = tokio::time::timeout(WAIT, watcher).await.unwrap();
        assert!(!item.is_err(), "{item:?}");
        values.insert(item.value);
    }
    assert_eq!(values.len(), 3);
}

// ---------------------------------------------------------------------------
// TTL
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn ttl_item_expires_when_not_popped() {
    let (queue, store) = test_queue().await;
    let item = Item::new("jobs", 1, "short-lived");
    queue
        .add(&item, AddOptions::with_ttl(Duration::from_secs(6)))
        .await
        .unwrap();
    assert_eq!(store.keys().len(), 1);

    tokio::time::sleep(Duration::from_secs(7)).await;
    assert!(store.keys().is_empty());
}

#[tokio::test(start_paused = true)]
async fn ttl_at_threshold_is_ignored() {
    let (queue, store) = test_queue().await;
    queue
        .add(
            &Item::new("jobs", 1, "kept"),
            AddOptions::with_ttl(Duration::from_secs(5)),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(store.keys().len(), 1);
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn add_rejects_items_without_bucket_or_key() {
    let (queue, store) = test_queue().await;

    let mut no_bucket = Item::new("jobs", 1, "v");
    no_bucket.bucket.clear();
    assert!(matches!(
        queue.add(&no_bucket, AddOptions::default()).await,
        Err(Error::InvalidItem(_))
    ));

    let mut no_key = Item::new("jobs", 1, "v");
    no_key.key.clear();
    assert!(matches!(
        queue.add(&no_key, AddOptions::default()).await,
        Err(Error::InvalidItem(_))
    ));

    let mut wrong_bucket = Item::new("jobs", 1, "v");
    wrong_bucket.bucket = "other".to_string();
    assert!(matches!(
        queue.add(&wrong_bucket, AddOptions::default()).await,
        Err(Error::InvalidItem(_))
    ));

    assert!(store.keys().is_empty());
}

#[tokio::test]
async fn malformed_value_is_reported_and_removed() {
    let (queue, store) = test_queue().await;
    let poisoned = key::queue_key(&key::encode("jobs", 99999, Utc::now()));
    store.put(&poisoned, b"{not json", None).await.unwrap();

    let item = pop_now(&queue, "jobs").await;
    assert!(item.is_err());
    assert!(item.error.contains("wrong JSON"), "{}", item.error);
    assert!(item.key.is_empty());
    assert!(item.bucket.is_empty());
    assert!(item.request_id.is_empty());
    assert!(store.keys().is_empty());

    // The next pop is not blocked by the poisoned entry.
    let good = Item::new("jobs", 1, "good");
    queue.add(&good, AddOptions::default()).await.unwrap();
    assert_eq!(pop_now(&queue, "jobs").await.value, "good");
}

#[tokio::test]
async fn malformed_value_arriving_on_watch_is_reported() {
    let (queue, store) = test_queue().await;
    let watcher = queue.pop("jobs", PopOptions::default()).await;

    let poisoned = key::queue_key(&key::encode("jobs", 1, Utc::now()));
    store.put(&poisoned, b"[]", None).await.unwrap();

    let item = tokio::time::timeout(WAIT, watcher).await.unwrap();
    assert!(item.error.contains("wrong JSON"), "{}", item.error);
    assert!(store.keys().is_empty());
}

// ---------------------------------------------------------------------------
// Stop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stop_is_idempotent_and_rejects_later_calls() {
    let (queue, _store) = test_queue().await;
    queue.stop().await;
    queue.stop().await;
    assert!(queue.is_stopped());

    assert!(matches!(
        queue
            .add(&Item::new("jobs", 1, "v"), AddOptions::default())
            .await,
        Err(Error::Stopped)
    ));
    assert_eq!(pop_now(&queue, "jobs").await.error, STOPPED);
}

#[tokio::test]
async fn stop_releases_waiting_pops() {
    let (queue, _store) = test_queue().await;
    let watcher = queue.pop("jobs", PopOptions::default()).await;

    queue.stop().await;

    let item = tokio::time::timeout(WAIT, watcher).await.unwrap();
    assert_eq!(item.error, STOPPED);
}

#[tokio::test]
async fn accessors_expose_the_store() {
    let (queue, _store) = test_queue().await;
    assert_eq!(
        queue.client_endpoints(),
        [etcdq::store::memory::MEMORY_ENDPOINT]
    );
    assert!(queue.client().is_none());
}

// ---------------------------------------------------------------------------
// Protocol anomalies (scripted store)
// ---------------------------------------------------------------------------

/// Store whose range reads and watch batches are fixed in advance.
#[derive(Default)]
struct ScriptedStore {
    range: Vec<Entry>,
    batches: Mutex<Vec<WatchBatch>>,
    probe_fails: bool,
}

struct ScriptedWatch {
    batches: Vec<WatchBatch>,
}

#[async_trait]
impl CreateWatch for ScriptedWatch {
    async fn next_batch(&mut self) -> Result<Option<WatchBatch>> {
        if self.batches.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.batches.remove(0)))
    }
}

#[async_trait]
impl KvStore for ScriptedStore {
    async fn linearized_get(&self, _key: &str) -> Result<Option<Entry>> {
        if self.probe_fails {
            return Err(Error::Other("cluster unreachable".to_string()));
        }
        Ok(None)
    }

    async fn first_in_range(&self, _prefix: &str) -> Result<Range> {
        Ok(Range {
            entries: self.range.clone(),
        })
    }

    async fn grant_lease(&self, _ttl_secs: i64) -> Result<LeaseId> {
        Ok(1)
    }

    async fn put(&self, _key: &str, _value: &[u8], _lease: Option<LeaseId>) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<u64> {
        Ok(1)
    }

    async fn delete_if_created(&self, _key: &str, _create_revision: i64) -> Result<bool> {
        Ok(true)
    }

    async fn watch_creates(&self, _prefix: &str) -> Result<Box<dyn CreateWatch>> {
        let batches = std::mem::take(&mut *self.batches.lock().unwrap());
        Ok(Box::new(ScriptedWatch { batches }))
    }

    fn endpoints(&self) -> Vec<String> {
        vec!["scripted://".to_string()]
    }

    async fn close(&self) {}
}

fn entry_for(item: &Item, revision: i64) -> Entry {
    Entry {
        key: key::queue_key(&item.key),
        value: serde_json::to_vec(item).unwrap(),
        create_revision: revision,
    }
}

async fn scripted_pop(store: ScriptedStore) -> Item {
    let queue = Queue::new(Arc::new(store)).await.unwrap();
    pop_now(&queue, "jobs").await
}

#[tokio::test]
async fn construction_fails_when_probe_fails() {
    let store = ScriptedStore {
        probe_fails: true,
        ..ScriptedStore::default()
    };
    assert!(Queue::new(Arc::new(store)).await.is_err());
}

#[tokio::test]
async fn range_with_two_keys_is_an_anomaly() {
    let a = Item::new("jobs", 1, "a");
    let b = Item::new("jobs", 1, "b");
    let item = scripted_pop(ScriptedStore {
        range: vec![entry_for(&a, 2), entry_for(&b, 3)],
        ..ScriptedStore::default()
    })
    .await;
    assert!(item.error.contains("more than 1 key"), "{}", item.error);
    assert!(item.key.is_empty());
}

#[tokio::test]
async fn watch_batch_with_two_events_is_an_anomaly() {
    let a = Item::new("jobs", 1, "a");
    let b = Item::new("jobs", 1, "b");
    let item = scripted_pop(ScriptedStore {
        batches: Mutex::new(vec![WatchBatch {
            events: vec![
                WatchEvent::Created(entry_for(&a, 2)),
                WatchEvent::Created(entry_for(&b, 3)),
            ],
            ..WatchBatch::default()
        }]),
        ..ScriptedStore::default()
    })
    .await;
    assert!(item.error.contains("did not return 1 event"), "{}", item.error);
}

#[tokio::test]
async fn watch_delete_event_is_an_anomaly() {
    let item = scripted_pop(ScriptedStore {
        batches: Mutex::new(vec![WatchBatch {
            events: vec![WatchEvent::Deleted("_queue/jobs/x".to_string())],
            ..WatchBatch::default()
        }]),
        ..ScriptedStore::default()
    })
    .await;
    assert!(item.error.contains("delete"), "{}", item.error);
}

#[tokio::test]
async fn canceled_watch_is_an_anomaly() {
    let item = scripted_pop(ScriptedStore {
        batches: Mutex::new(vec![WatchBatch {
            canceled: true,
            ..WatchBatch::default()
        }]),
        ..ScriptedStore::default()
    })
    .await;
    assert!(item.error.contains("canceled"), "{}", item.error);
}

#[tokio::test]
async fn watch_error_is_reported() {
    let item = scripted_pop(ScriptedStore {
        batches: Mutex::new(vec![WatchBatch {
            error: Some("compacted".to_string()),
            ..WatchBatch::default()
        }]),
        ..ScriptedStore::default()
    })
    .await;
    assert!(item.error.contains("compacted"), "{}", item.error);
}

#[tokio::test]
async fn watch_delivers_single_creation() {
    let a = Item::new("jobs", 1, "from-watch").with_request_id("w");
    let item = scripted_pop(ScriptedStore {
        batches: Mutex::new(vec![WatchBatch {
            events: vec![WatchEvent::Created(entry_for(&a, 7))],
            ..WatchBatch::default()
        }]),
        ..ScriptedStore::default()
    })
    .await;
    a.matches(&item).unwrap();
}

// ---------------------------------------------------------------------------
// Writes between the first read and the watch
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
enum Gap {
    /// Another producer adds an item right after the first read.
    Added,
    /// The item is added and then claimed by another popper once the
    /// watch is up.
    AddedThenClaimed,
}

/// Memory store that slips a write into the window between a pop's first
/// range read and its watch.
struct GapStore {
    inner: MemoryStore,
    gap: Gap,
    item: Item,
    first_read_done: AtomicBool,
}

impl GapStore {
    fn new(inner: MemoryStore, gap: Gap) -> Self {
        Self {
            inner,
            gap,
            item: Item::new("jobs", 1, "in-the-gap"),
            first_read_done: AtomicBool::new(false),
        }
    }

    fn gap_key(&self) -> String {
        key::queue_key(&self.item.key)
    }
}

#[async_trait]
impl KvStore for GapStore {
    async fn linearized_get(&self, key: &str) -> Result<Option<Entry>> {
        self.inner.linearized_get(key).await
    }

    async fn first_in_range(&self, prefix: &str) -> Result<Range> {
        let range = self.inner.first_in_range(prefix).await?;
        if !self.first_read_done.swap(true, Ordering::SeqCst) {
            let value = serde_json::to_vec(&self.item).unwrap();
            self.inner.put(&self.gap_key(), &value, None).await?;
        }
        Ok(range)
    }

    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId> {
        self.inner.grant_lease(ttl_secs).await
    }

    async fn put(&self, key: &str, value: &[u8], lease: Option<LeaseId>) -> Result<()> {
        self.inner.put(key, value, lease).await
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        self.inner.delete(key).await
    }

    async fn delete_if_created(&self, key: &str, create_revision: i64) -> Result<bool> {
        self.inner.delete_if_created(key, create_revision).await
    }

    async fn watch_creates(&self, prefix: &str) -> Result<Box<dyn CreateWatch>> {
        let watch = self.inner.watch_creates(prefix).await?;
        if self.gap == Gap::AddedThenClaimed {
            self.inner.delete(&self.gap_key()).await?;
        }
        Ok(watch)
    }

    fn endpoints(&self) -> Vec<String> {
        self.inner.endpoints()
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

#[tokio::test]
async fn item_added_before_watch_is_found_by_second_read() {
    let store = MemoryStore::new();
    let gap_store = GapStore::new(store.clone(), Gap::Added);
    let expected = gap_store.item.clone();
    let queue = Queue::new(Arc::new(gap_store)).await.unwrap();

    let popped = pop_now(&queue, "jobs").await;
    expected.matches(&popped).unwrap();
    assert!(store.keys().is_empty());
}

#[tokio::test]
async fn item_claimed_elsewhere_before_second_read_keeps_pop_waiting() {
    let store = MemoryStore::new();
    let queue = Queue::new(Arc::new(GapStore::new(store.clone(), Gap::AddedThenClaimed)))
        .await
        .unwrap();

    let mut watcher = queue.pop("jobs", PopOptions::default()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(watcher.try_take().is_none(), "pop ended early");

    let next = Item::new("jobs", 1, "next");
    queue.add(&next, AddOptions::default()).await.unwrap();

    let popped = tokio::time::timeout(WAIT, watcher).await.unwrap();
    assert!(!popped.is_err(), "{popped:?}");
    assert_eq!(popped.value, "next");
}
