//! Point-in-time views of the queue

use std::collections::HashSet;

use super::models::{ItemId, QueueItem};

/// Immutable, ordered copy of the queue taken at query time.
///
/// Snapshots are shared between the download worker and the change-handling
/// path behind an [`Arc`](std::sync::Arc), so they are never mutated once captured.
#[derive(Debug, Clone, Default)]
pub struct QueueSnapshot {
    items: Vec<QueueItem>,
    ids: HashSet<ItemId>,
}

impl QueueSnapshot {
    pub fn new(items: Vec<QueueItem>) -> Self {
        let ids = items.iter().map(|item| item.id).collect();
        Self { items, ids }
    }

    pub fn contains(&self, id: ItemId) -> bool {
        self.ids.contains(&id)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, QueueItem> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Filenames every item of this snapshot may occupy in storage,
    /// regardless of whether it has been downloaded yet
    pub fn filenames(&self) -> HashSet<String> {
        self.items.iter().map(QueueItem::filename).collect()
    }
}

impl<'a> IntoIterator for &'a QueueSnapshot {
    type Item = &'a QueueItem;
    type IntoIter = std::slice::Iter<'a, QueueItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
