//! Single-shot delivery handle returned by [`Queue::pop`](super::Queue::pop).

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::model::Item;

/// Error carried by the item when the popping task vanished without
/// delivering (e.g. the runtime shut down).
pub const ABANDONED: &str = "pop abandoned before delivery";

/// Resolves to exactly one [`Item`]: the popped item, or an item whose
/// `error` field explains why nothing was popped.
///
/// Dropping the watcher cancels the pending wait.
#[derive(Debug)]
#[must_use = "a pop is canceled when its watcher is dropped"]
pub struct ItemWatcher {
    rx: oneshot::Receiver<Item>,
    cancel: Option<oneshot::Sender<()>>,
}

impl ItemWatcher {
    pub(crate) fn new(rx: oneshot::Receiver<Item>, cancel: oneshot::Sender<()>) -> Self {
        Self {
            rx,
            cancel: Some(cancel),
        }
    }

    /// Stop waiting. The watcher then resolves to an error item, unless an
    /// item was already delivered.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }

    /// The delivered item, if it is already available.
    pub fn try_take(&mut self) -> Option<Item> {
        match self.rx.try_recv() {
            Ok(item) => Some(item),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Item::failed(ABANDONED)),
        }
    }
}

impl Future for ItemWatcher {
    type Output = Item;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Item> {
        let this = self.get_mut();
        Pin::new(&mut this.rx)
            .poll(cx)
            .map(|delivered| delivered.unwrap_or_else(|_| Item::failed(ABANDONED)))
    }
}
