//! In-process [`KvStore`] with etcd-like revisions, leases and watches.
//!
//! Backs the test suite and `etcdq serve --memory`. Nothing is persisted.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use super::{CreateWatch, Entry, KvStore, LeaseId, Range, WatchBatch, WatchEvent};
use crate::error::{Error, Result};

const WATCH_CAPACITY: usize = 1024;

/// Endpoint reported by [`MemoryStore::endpoints`].
pub const MEMORY_ENDPOINT: &str = "memory://local";

#[derive(Debug)]
struct Stored {
    value: Vec<u8>,
    create_revision: i64,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct State {
    revision: i64,
    next_lease: LeaseId,
    data: BTreeMap<String, Stored>,
    leases: HashMap<LeaseId, HashSet<String>>,
    /// Creation feed. `None` once the store is closed; dropping it ends
    /// every watch.
    events: Option<broadcast::Sender<Entry>>,
}

impl State {
    fn open_events(&self) -> Result<&broadcast::Sender<Entry>> {
        self.events.as_ref().ok_or(Error::Stopped)
    }

    fn entry(&self, key: &str) -> Option<Entry> {
        self.data.get(key).map(|stored| Entry {
            key: key.to_string(),
            value: stored.value.clone(),
            create_revision: stored.create_revision,
        })
    }

    fn remove(&mut self, key: &str) -> bool {
        let Some(stored) = self.data.remove(key) else {
            return false;
        };
        self.revision += 1;
        if let Some(keys) = stored.lease.and_then(|lease| self.leases.get_mut(&lease)) {
            keys.remove(key);
        }
        true
    }
}

/// In-memory key-value store.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(State {
                revision: 1,
                next_lease: 1,
                data: BTreeMap::new(),
                leases: HashMap::new(),
                events: Some(events),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every stored key, in order.
    pub fn keys(&self) -> Vec<String> {
        self.lock().data.keys().cloned().collect()
    }

    /// Current store revision.
    pub fn revision(&self) -> i64 {
        self.lock().revision
    }

    fn expire_lease(state: &Weak<Mutex<State>>, lease: LeaseId) {
        let Some(shared) = state.upgrade() else {
            return;
        };
        let mut state = shared.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(keys) = state.leases.remove(&lease) else {
            return;
        };
        let mut expired = keys.into_iter().collect::<Vec<_>>();
        expired.sort();
        for key in &expired {
            state.remove(key);
        }
        debug!(lease, keys = expired.len(), "lease expired");
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn linearized_get(&self, key: &str) -> Result<Option<Entry>> {
        let state = self.lock();
        state.open_events()?;
        Ok(state.entry(key))
    }

    async fn first_in_range(&self, prefix: &str) -> Result<Range> {
        let state = self.lock();
        state.open_events()?;
        let entries = state
            .data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .take(1)
            .filter_map(|(key, _)| state.entry(key))
            .collect();
        Ok(Range { entries })
    }

    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId> {
        let ttl = u64::try_from(ttl_secs)
            .ok()
            .filter(|&secs| secs > 0)
            .ok_or_else(|| Error::Lease(format!("invalid lease TTL {ttl_secs}")))?;

        let lease = {
            let mut state = self.lock();
            state.open_events()?;
            let lease = state.next_lease;
            state.next_lease += 1;
            state.leases.insert(lease, HashSet::new());
            lease
        };

        let weak = Arc::downgrade(&self.state);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(ttl)).await;
            MemoryStore::expire_lease(&weak, lease);
        });
        Ok(lease)
    }

    async fn put(&self, key: &str, value: &[u8], lease: Option<LeaseId>) -> Result<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.open_events()?;
        if let Some(id) = lease {
            let keys = state
                .leases
                .get_mut(&id)
                .ok_or_else(|| Error::Lease(format!("lease {id} not found")))?;
            keys.insert(key.to_string());
        }

        state.revision += 1;
        let revision = state.revision;
        let previous_lease = match state.data.get_mut(key) {
            Some(stored) => {
                stored.value = value.to_vec();
                std::mem::replace(&mut stored.lease, lease)
            }
            None => {
                state.data.insert(
                    key.to_string(),
                    Stored {
                        value: value.to_vec(),
                        create_revision: revision,
                        lease,
                    },
                );
                let created = state.entry(key);
                if let (Some(entry), Ok(events)) = (created, state.open_events()) {
                    let _ = events.send(entry);
                }
                None
            }
        };

        let stale = previous_lease.filter(|old| Some(*old) != lease);
        if let Some(keys) = stale.and_then(|old| state.leases.get_mut(&old)) {
            keys.remove(key);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        let mut state = self.lock();
        state.open_events()?;
        Ok(u64::from(state.remove(key)))
    }

    async fn delete_if_created(&self, key: &str, create_revision: i64) -> Result<bool> {
        let mut state = self.lock();
        state.open_events()?;
        let current = state.data.get(key).map(|stored| stored.create_revision);
        if current == Some(create_revision) {
            Ok(state.remove(key))
        } else {
            Ok(false)
        }
    }

    async fn watch_creates(&self, prefix: &str) -> Result<Box<dyn CreateWatch>> {
        // Subscribing under the lock orders the subscription against writes.
        let state = self.lock();
        let rx = state.open_events()?.subscribe();
        Ok(Box::new(MemoryCreateWatch {
            prefix: prefix.to_string(),
            rx,
        }))
    }

    fn endpoints(&self) -> Vec<String> {
        vec![MEMORY_ENDPOINT.to_string()]
    }

    async fn close(&self) {
        self.lock().events = None;
    }
}

struct MemoryCreateWatch {
    prefix: String,
    rx: broadcast::Receiver<Entry>,
}

#[async_trait]
impl CreateWatch for MemoryCreateWatch {
    async fn next_batch(&mut self) -> Result<Option<WatchBatch>> {
        loop {
            let entry = match self.rx.recv().await {
                Ok(entry) => entry,
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    return Ok(Some(WatchBatch {
                        events: Vec::new(),
                        canceled: true,
                        error: Some(format!("watch fell behind by {missed} events")),
                    }));
                }
            };

            if entry.key.starts_with(&self.prefix) {
                return Ok(Some(WatchBatch {
                    events: vec![WatchEvent::Created(entry)],
                    ..WatchBatch::default()
                }));
            }
        }
    }
}
