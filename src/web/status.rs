//! Request status board.
//!
//! Tracks the latest known state of every request submitted through the
//! front door, keyed by request id, so a client can long-poll until the
//! worker reports a terminal state. Entries leave the board when a client
//! collects the finished item, or once they are older than the board's
//! retention.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::model::Item;

/// How long a request is tracked when no queue TTL says otherwise.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60 * 60);

/// Outcome of [`StatusBoard::wait_done`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wait {
    /// The request finished; its entry has been removed.
    Done(Item),
    /// Still in flight when the timeout elapsed.
    Pending(Item),
    Unknown,
}

#[derive(Debug)]
struct Tracked {
    state: watch::Sender<Item>,
    inserted: Instant,
}

#[derive(Debug)]
pub struct StatusBoard {
    entries: Mutex<HashMap<String, Tracked>>,
    retention: Duration,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

impl StatusBoard {
    /// Board that forgets requests `retention` after they were inserted.
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            retention,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Tracked>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking a newly submitted request.
    pub fn insert(&self, item: Item) {
        self.evict_expired();
        let (state, _) = watch::channel(item.clone());
        self.lock().insert(
            item.request_id,
            Tracked {
                state,
                inserted: Instant::now(),
            },
        );
    }

    /// Replace the state of a tracked request.
    ///
    /// Returns `false`, and records nothing, if the id is not tracked.
    pub fn update(&self, item: Item) -> bool {
        match self.lock().get(&item.request_id) {
            Some(tracked) => {
                tracked.state.send_replace(item);
                true
            }
            None => false,
        }
    }

    /// Mark a request canceled and return its new state.
    pub fn cancel(&self, request_id: &str) -> Option<Item> {
        let entries = self.lock();
        let tracked = entries.get(request_id)?;
        tracked.state.send_modify(|item| item.canceled = true);
        Some(tracked.state.borrow().clone())
    }

    /// Drop every request older than the retention. Returns how many went.
    pub fn evict_expired(&self) -> usize {
        let retention = self.retention;
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, tracked| tracked.inserted.elapsed() < retention);
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(evicted, remaining = entries.len(), "evicted stale requests");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Wait up to `timeout` for the request to reach a terminal state.
    pub async fn wait_done(&self, request_id: &str, timeout: Duration) -> Wait {
        let Some(mut rx) = self
            .lock()
            .get(request_id)
            .map(|tracked| tracked.state.subscribe())
        else {
            return Wait::Unknown;
        };

        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(Item::is_done).await.map(|item| Item::clone(&item))
        })
        .await;

        match waited {
            Ok(Ok(item)) => {
                self.lock().remove(request_id);
                Wait::Done(item)
            }
            // The entry was removed (collected or evicted) meanwhile.
            Ok(Err(_)) => {
                let last = rx.borrow().clone();
                if last.is_done() {
                    Wait::Done(last)
                } else {
                    Wait::Unknown
                }
            }
            Err(_) => Wait::Pending(rx.borrow().clone()),
        }
    }
}
