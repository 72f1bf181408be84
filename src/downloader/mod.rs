//! Module for downloading queued media
//!
//! This module provides resumable HTTP fetching of single items, storage
//! reconciliation against the queue, and the coordinator that walks the queue
//! on a background task and reacts to queue changes.

mod coordinator;
mod http;
mod models;
mod reconcile;
mod watcher;

// Re-export the public API
pub use coordinator::{Collaborators, CoordinatorSettings, DownloadCoordinator};
pub use http::{Connection, DEFAULT_CHUNK_SIZE, DownloadSession, FetchSettings, RangeFetcher};
pub use models::{CoordinatorState, FailurePolicy, FetchError, FetchOutcome, WalkEnd};
pub use reconcile::{DEFAULT_MEDIA_EXTENSIONS, ReconcileError, StorageReconciler};
pub use watcher::ChangeWatcher;
