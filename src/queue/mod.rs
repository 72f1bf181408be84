//! The download queue
//!
//! The queue itself is owned by a [`QueueStore`]; this module defines the items
//! it holds, immutable snapshots of it, and two stores: one in memory and one
//! backed by a JSON file.

mod json;
mod models;
mod snapshot;
mod store;

use thiserror::Error;

pub use json::JsonQueueStore;
pub use models::{DEFAULT_MEDIA_EXTENSION, ItemId, ItemUpdate, QueueItem, media_extension};
pub use snapshot::QueueSnapshot;
pub use store::{MemoryQueueStore, QueueStore};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid queue file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Item {0} is not in the queue")]
    UnknownItem(ItemId),

    #[error("Queue watcher error: {0}")]
    Watch(#[from] notify::Error),
}
