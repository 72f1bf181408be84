//! Collaborators the downloader depends on but does not own
//!
//! - [`NetworkGate`]: whether the current network is suitable for downloading
//! - [`ProgressSink`]: presentation of the item currently being downloaded
//! - [`DurationProbe`]: reads the playback duration of a finished media file

use std::{
    path::Path,
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytesize::ByteSize;
use tracing::{info, trace};

use crate::probe::ProbeError;

/// Decides whether downloads may use the network right now
/// (for example: only on an unmetered connection).
pub trait NetworkGate: Send + Sync {
    fn is_suitable(&self) -> bool;
}

/// Network gate backed by a flag that can be flipped at runtime
#[derive(Debug)]
pub struct ToggleGate(AtomicBool);

impl ToggleGate {
    pub fn new(suitable: bool) -> Self {
        Self(AtomicBool::new(suitable))
    }

    pub fn set(&self, suitable: bool) {
        self.0.store(suitable, Ordering::SeqCst);
    }
}

impl Default for ToggleGate {
    fn default() -> Self {
        Self::new(true)
    }
}

impl NetworkGate for ToggleGate {
    fn is_suitable(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Presentation-layer progress indicator.
///
/// Calls happen on the download worker and must not block.
pub trait ProgressSink: Send + Sync {
    /// Show that `title` is downloading, with `downloaded` bytes on disk so far
    fn show_progress(&self, title: &str, downloaded: u64, total: Option<u64>);

    /// Remove the progress indicator
    fn clear(&self);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn show_progress(&self, _title: &str, _downloaded: u64, _total: Option<u64>) {}

    fn clear(&self) {}
}

/// Progress sink that reports through `tracing`.
///
/// Every update is logged at trace level; item starts and 25% milestones are
/// logged at info level.
#[derive(Debug, Default)]
pub struct TracingProgressSink {
    // (title, last milestone logged)
    current: Mutex<Option<(String, u64)>>,
}

impl TracingProgressSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressSink for TracingProgressSink {
    fn show_progress(&self, title: &str, downloaded: u64, total: Option<u64>) {
        let mut current = self.current.lock().unwrap_or_else(|p| p.into_inner());

        let is_new = current.as_ref().is_none_or(|(t, _)| t != title);
        if is_new {
            info!(title = %title, on_disk = %ByteSize::b(downloaded), "Downloading");
            *current = Some((title.to_string(), 0));
        }

        trace!(title = %title, bytes = downloaded, total = ?total, "Download progress");

        if let (Some(total), Some((_, milestone))) = (total, current.as_mut()) {
            if total > 0 {
                let quarter = (downloaded.min(total) * 4 / total).min(4);
                if quarter > *milestone {
                    *milestone = quarter;
                    info!(
                        title = %title,
                        percentage = format_args!("{}%", quarter * 25),
                        downloaded = %ByteSize::b(downloaded),
                        total = %ByteSize::b(total),
                        "Download milestone"
                    );
                }
            }
        }
    }

    fn clear(&self) {
        let mut current = self.current.lock().unwrap_or_else(|p| p.into_inner());
        if let Some((title, _)) = current.take() {
            trace!(title = %title, "Progress cleared");
        }
    }
}

/// Reads the playback duration of a fully downloaded media file
#[async_trait]
pub trait DurationProbe: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<Duration, ProbeError>;
}
