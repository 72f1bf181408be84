//! Storage reconciliation
//!
//! Deletes media files from the storage directory that no queue item refers to
//! any more, so stale downloads stop taking up space.

use std::{
    io,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::queue::QueueSnapshot;

/// Extensions treated as media when none are configured
pub const DEFAULT_MEDIA_EXTENSIONS: &[&str] = &["mp3", "ogg", "wma"];

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Failed to list storage directory {path}: {source}")]
    ListDir { path: PathBuf, source: io::Error },
}

#[derive(Debug, Clone)]
pub struct StorageReconciler {
    storage_dir: PathBuf,
    media_extensions: Vec<String>,
}

impl StorageReconciler {
    pub fn new<S: AsRef<str>>(storage_dir: impl Into<PathBuf>, media_extensions: &[S]) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            media_extensions: media_extensions
                .iter()
                .map(|ext| ext.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|ext| !ext.is_empty())
                .collect(),
        }
    }

    fn is_media(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                let ext = ext.to_ascii_lowercase();
                self.media_extensions.iter().any(|known| *known == ext)
            })
    }

    /// Delete every media file in storage that `snapshot` has no item for.
    ///
    /// Files that aren't media (by extension) are never touched. Returns the
    /// paths that were deleted. Failing to delete a single file is logged and
    /// does not stop the rest of the pass.
    #[instrument(level = "debug", skip(self, snapshot), fields(dir = ?self.storage_dir, items = snapshot.len()))]
    pub async fn reconcile(&self, snapshot: &QueueSnapshot) -> Result<Vec<PathBuf>, ReconcileError> {
        let list_err = |source| ReconcileError::ListDir {
            path: self.storage_dir.clone(),
            source,
        };

        let mut entries = match tokio::fs::read_dir(&self.storage_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Storage directory does not exist yet, creating it");
                tokio::fs::create_dir_all(&self.storage_dir)
                    .await
                    .map_err(list_err)?;
                return Ok(Vec::new());
            }
            Err(e) => return Err(list_err(e)),
        };

        let valid = snapshot.filenames();
        let mut deleted = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(list_err)? {
            let path = entry.path();
            if !self.is_media(&path) {
                continue;
            }
            match entry.file_type().await {
                Ok(file_type) if file_type.is_file() => {}
                _ => continue,
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            if valid.contains(&name) {
                continue;
            }

            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    warn!(file = %name, "Deleted media file no longer in the queue");
                    deleted.push(path);
                }
                Err(e) => warn!(file = %name, error = %e, "Failed to delete orphaned media file"),
            }
        }

        if !deleted.is_empty() {
            info!(count = deleted.len(), "Storage reconciled");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueItem;

    fn reconciler(dir: &Path) -> StorageReconciler {
        StorageReconciler::new(dir, DEFAULT_MEDIA_EXTENSIONS)
    }

    #[tokio::test]
    async fn test_deletes_only_orphaned_media() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = QueueSnapshot::new(vec![QueueItem::new(
            1,
            "Valid",
            "https://example.com/a.mp3",
        )]);
        // item 1 lives at 1.mp3
        std::fs::write(dir.path().join("1.mp3"), b"valid").unwrap();
        std::fs::write(dir.path().join("2.mp3"), b"orphan").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"not media").unwrap();

        let deleted = reconciler(dir.path()).reconcile(&snapshot).await.unwrap();

        assert_eq!(deleted, vec![dir.path().join("2.mp3")]);
        assert!(dir.path().join("1.mp3").exists());
        assert!(!dir.path().join("2.mp3").exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_not_downloaded_items_still_protect_their_files() {
        let dir = tempfile::tempdir().unwrap();
        // a partial download of an item whose size is unknown
        let snapshot = QueueSnapshot::new(vec![QueueItem::new(
            5,
            "Partial",
            "https://example.com/show.ogg",
        )]);
        std::fs::write(dir.path().join("5.ogg"), b"part").unwrap();

        let deleted = reconciler(dir.path()).reconcile(&snapshot).await.unwrap();
        assert!(deleted.is_empty());
        assert!(dir.path().join("5.ogg").exists());
    }

    #[tokio::test]
    async fn test_extension_matching_ignores_case_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("9.WMA"), b"orphan").unwrap();
        std::fs::create_dir(dir.path().join("nested.mp3")).unwrap();

        let deleted = reconciler(dir.path())
            .reconcile(&QueueSnapshot::default())
            .await
            .unwrap();

        assert_eq!(deleted, vec![dir.path().join("9.WMA")]);
        assert!(dir.path().join("nested.mp3").is_dir());
    }

    #[tokio::test]
    async fn test_missing_directory_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let storage = dir.path().join("media");

        let deleted = reconciler(&storage)
            .reconcile(&QueueSnapshot::default())
            .await
            .unwrap();

        assert!(deleted.is_empty());
        assert!(storage.is_dir());
    }

    #[tokio::test]
    async fn test_unlistable_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let not_a_dir = dir.path().join("file.mp3");
        std::fs::write(&not_a_dir, b"x").unwrap();

        let result = reconciler(&not_a_dir).reconcile(&QueueSnapshot::default()).await;
        assert!(matches!(result, Err(ReconcileError::ListDir { .. })));
    }

    #[test]
    fn test_configured_extensions_are_normalized() {
        let reconciler = StorageReconciler::new("/media", &[" .MP3", "m4a", ""]);
        assert!(reconciler.is_media(Path::new("/media/1.mp3")));
        assert!(reconciler.is_media(Path::new("/media/1.M4A")));
        assert!(!reconciler.is_media(Path::new("/media/1.ogg")));
        assert!(!reconciler.is_media(Path::new("/media/noext")));
    }
}
