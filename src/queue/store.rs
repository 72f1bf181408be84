//! Queue store port and an in-memory implementation

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, trace};

use super::{
    QueueError,
    models::{ItemId, ItemUpdate, QueueItem},
    snapshot::QueueSnapshot,
};

/// The externally owned, ordered collection of downloadable items.
///
/// The downloader queries it for snapshots, observes it for changes and writes
/// back the file size and duration of items it fetched.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Current queue contents in queue order
    async fn query(&self) -> Result<Vec<QueueItem>, QueueError>;

    /// Observe queue mutations.
    ///
    /// The returned receiver sees a new version on every insert, delete or
    /// reorder. Writing back file sizes or durations through
    /// [`QueueStore::update`] is not a queue mutation and does not notify.
    fn subscribe(&self) -> watch::Receiver<u64>;

    async fn update(&self, id: ItemId, update: ItemUpdate) -> Result<(), QueueError>;

    /// Query the store and capture the result as a snapshot
    async fn snapshot(&self) -> Result<QueueSnapshot, QueueError> {
        Ok(QueueSnapshot::new(self.query().await?))
    }
}

/// Queue store that keeps its items in memory.
///
/// Useful for embedding the downloader in a process that already owns the
/// queue, and for tests.
#[derive(Debug)]
pub struct MemoryQueueStore {
    items: Mutex<Vec<QueueItem>>,
    version: watch::Sender<u64>,
}

impl Default for MemoryQueueStore {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl MemoryQueueStore {
    pub fn new(items: Vec<QueueItem>) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            items: Mutex::new(items),
            version,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<QueueItem>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self) {
        self.version.send_modify(|version| *version += 1);
        trace!(version = *self.version.borrow(), "Queue changed");
    }

    /// Append an item to the end of the queue
    pub fn push(&self, item: QueueItem) {
        debug!(id = %item.id, title = %item.title, "Adding item to queue");
        self.lock().push(item);
        self.notify();
    }

    /// Remove an item from the queue, returning whether it was present
    pub fn remove(&self, id: ItemId) -> bool {
        let removed = {
            let mut items = self.lock();
            let before = items.len();
            items.retain(|item| item.id != id);
            items.len() != before
        };
        if removed {
            debug!(id = %id, "Removed item from queue");
            self.notify();
        }
        removed
    }

    /// Reorder the queue to follow `order`.
    ///
    /// Items not named in `order` keep their relative order after the named ones.
    pub fn reorder(&self, order: &[ItemId]) {
        {
            let mut items = self.lock();
            items.sort_by_key(|item| {
                order
                    .iter()
                    .position(|id| *id == item.id)
                    .unwrap_or(order.len())
            });
        }
        self.notify();
    }

    pub fn item(&self, id: ItemId) -> Option<QueueItem> {
        self.lock().iter().find(|item| item.id == id).cloned()
    }

    pub fn items(&self) -> Vec<QueueItem> {
        self.lock().clone()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn query(&self) -> Result<Vec<QueueItem>, QueueError> {
        Ok(self.items())
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    async fn update(&self, id: ItemId, update: ItemUpdate) -> Result<(), QueueError> {
        let mut items = self.lock();
        let item = items
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or(QueueError::UnknownItem(id))?;
        update.apply(item);
        trace!(id = %id, ?update, "Updated queue item");
        Ok(())
    }
}
