//! Queue store backed by a JSON file on disk
//!
//! The file holds a JSON array of queue items in queue order. Other programs
//! may edit it at any time; [`JsonQueueStore::watch`] picks those edits up and
//! notifies subscribers when the queue's order or membership changed.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use super::{
    QueueError,
    models::{ItemId, ItemUpdate, QueueItem},
    store::QueueStore,
};

#[derive(Debug)]
pub struct JsonQueueStore {
    path: PathBuf,
    items: Mutex<Vec<QueueItem>>,
    version: watch::Sender<u64>,
}

/// Ordered (id, url) pairs: the part of the queue whose change is a queue mutation
fn fingerprint(items: &[QueueItem]) -> Vec<(ItemId, String)> {
    items
        .iter()
        .map(|item| (item.id, item.media_url.clone()))
        .collect()
}

impl JsonQueueStore {
    /// Open the queue file at `path`, starting with an empty queue if it does not exist
    #[instrument(level = "debug")]
    pub async fn open(path: impl AsRef<Path> + std::fmt::Debug) -> Result<Self, QueueError> {
        let path = path.as_ref().to_path_buf();
        let items = read_items(&path).await?;
        info!(path = ?path, items = items.len(), "Loaded queue file");
        let (version, _) = watch::channel(0);
        Ok(Self {
            path,
            items: Mutex::new(items),
            version,
        })
    }

    /// Re-read the queue file, notifying subscribers if the queue changed.
    ///
    /// Returns whether a change was observed.
    pub async fn reload(&self) -> Result<bool, QueueError> {
        let fresh = read_items(&self.path).await?;
        let mut items = self.items.lock().await;
        let changed = fingerprint(&items) != fingerprint(&fresh);
        *items = fresh;
        drop(items);

        if changed {
            self.version.send_modify(|version| *version += 1);
            debug!(path = ?self.path, "Queue file changed");
        } else {
            trace!(path = ?self.path, "Queue file touched without a queue change");
        }
        Ok(changed)
    }

    /// Start watching the queue file for edits made by other programs.
    ///
    /// The watcher lives until `cancel` is cancelled.
    pub fn watch(self: &Arc<Self>, cancel: CancellationToken) -> Result<(), QueueError> {
        // Editors usually replace the file, so watch the directory and filter by name
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = self.path.file_name().map(|name| name.to_os_string());

        let (tx, mut rx) = mpsc::channel::<()>(16);
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let ours = event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                    if ours && (event.kind.is_create() || event.kind.is_modify() || event.kind.is_remove()) {
                        // a full channel already has a reload pending
                        let _ = tx.try_send(());
                    }
                }
                Err(e) => warn!(error = %e, "Queue file watcher error"),
            },
            notify::Config::default(),
        )?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        info!(path = ?self.path, "Watching queue file for changes");

        let store = Arc::clone(self);
        tokio::spawn(async move {
            // keep the watcher alive for as long as this task runs
            let _watcher = watcher;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = rx.recv() => {
                        if event.is_none() {
                            break;
                        }
                        if let Err(e) = store.reload().await {
                            warn!(error = %e, path = ?store.path, "Failed to reload queue file");
                        }
                    }
                }
            }
            debug!(path = ?store.path, "Stopped watching queue file");
        });

        Ok(())
    }

    async fn persist(&self, items: &[QueueItem]) -> Result<(), QueueError> {
        let json = serde_json::to_vec_pretty(items)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

async fn read_items(path: &Path) -> Result<Vec<QueueItem>, QueueError> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Vec::new()),
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl QueueStore for JsonQueueStore {
    async fn query(&self) -> Result<Vec<QueueItem>, QueueError> {
        Ok(self.items.lock().await.clone())
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    async fn update(&self, id: ItemId, update: ItemUpdate) -> Result<(), QueueError> {
        let mut items = self.items.lock().await;
        let item = items
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or(QueueError::UnknownItem(id))?;
        update.apply(item);
        self.persist(&items).await?;
        trace!(id = %id, ?update, "Persisted queue item update");
        Ok(())
    }
}
