//! Download coordinator
//!
//! Walks queue snapshots in order on a single background task, fetching one
//! item at a time. Queue changes arriving while a walk is in flight are parked
//! as a *pending* snapshot which replaces the active one at the next safe
//! checkpoint.
//!
//! # Concurrency Model
//!
//! - One worker task per run; [`DownloadCoordinator::start`] never spawns a second
//! - The only state shared with the signal-handling path is the [`Slot`]:
//!   coordinator state, pending snapshot and the run's stop token, all behind
//!   one mutex that is never held across an await
//! - The worker reads the pending slot before each item, after each connect and
//!   at every chunk boundary; the signal path only ever writes it
//! - A stop request also cancels a connect that is still waiting for headers

use std::{
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, instrument, trace, warn};

use super::{
    http::{Connection, RangeFetcher},
    models::{CoordinatorState, FailurePolicy, FetchError, FetchOutcome, WalkEnd},
    reconcile::{DEFAULT_MEDIA_EXTENSIONS, StorageReconciler},
};
use crate::{
    ports::{DurationProbe, NetworkGate, ProgressSink},
    queue::{ItemId, ItemUpdate, QueueItem, QueueSnapshot, QueueStore},
};

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub storage_dir: std::path::PathBuf,
    pub media_extensions: Vec<String>,
    pub failure_policy: FailurePolicy,
}

impl CoordinatorSettings {
    pub fn new(storage_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            media_extensions: DEFAULT_MEDIA_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            failure_policy: FailurePolicy::default(),
        }
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }
}

/// External collaborators of the coordinator
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn QueueStore>,
    pub gate: Arc<dyn NetworkGate>,
    pub progress: Arc<dyn ProgressSink>,
    pub probe: Arc<dyn DurationProbe>,
}

/// State shared between the worker and the signal-handling path
struct Slot {
    state: CoordinatorState,
    pending: Option<Arc<QueueSnapshot>>,
    stop: CancellationToken,
}

struct Shared {
    deps: Collaborators,
    fetcher: RangeFetcher,
    reconciler: StorageReconciler,
    settings: CoordinatorSettings,
    slot: Mutex<Slot>,
    state_tx: watch::Sender<CoordinatorState>,
}

/// How a single item ended, as far as the walk is concerned
enum ItemEnd {
    /// Move on to the next item
    Next,
    /// A pending snapshot or a stop request cut this item short
    Interrupted,
}

#[derive(Clone)]
pub struct DownloadCoordinator {
    shared: Arc<Shared>,
}

impl DownloadCoordinator {
    pub fn new(settings: CoordinatorSettings, fetcher: RangeFetcher, deps: Collaborators) -> Self {
        let reconciler = StorageReconciler::new(&settings.storage_dir, &settings.media_extensions);
        let (state_tx, _) = watch::channel(CoordinatorState::Idle);
        Self {
            shared: Arc::new(Shared {
                deps,
                fetcher,
                reconciler,
                settings,
                slot: Mutex::new(Slot {
                    state: CoordinatorState::Idle,
                    pending: None,
                    stop: CancellationToken::new(),
                }),
                state_tx,
            }),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        *self.shared.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CoordinatorState> {
        self.shared.state_tx.subscribe()
    }

    pub(crate) fn store(&self) -> &Arc<dyn QueueStore> {
        &self.shared.deps.store
    }

    /// Wait until the coordinator is idle
    pub async fn wait_idle(&self) {
        let mut rx = self.subscribe_state();
        let _ = rx.wait_for(|state| *state == CoordinatorState::Idle).await;
    }

    /// Start a download run if the coordinator is idle and the network is suitable.
    ///
    /// Must be called from within a Tokio runtime. Returns whether a run was started.
    pub fn start(&self) -> bool {
        if !self.shared.deps.gate.is_suitable() {
            debug!("Network not suitable for downloading, staying idle");
            return false;
        }

        let stop = {
            let mut slot = self.shared.slot();
            if slot.state != CoordinatorState::Idle {
                trace!(state = %slot.state, "Download run already active");
                return false;
            }
            slot.state = CoordinatorState::Running;
            slot.pending = None;
            slot.stop = CancellationToken::new();
            self.shared.state_tx.send_replace(CoordinatorState::Running);
            slot.stop.clone()
        };

        let shared = Arc::clone(&self.shared);
        tokio::spawn(
            async move {
                let _guard = IdleOnPanic(&shared);
                shared.run(&stop).await;
            }
            .instrument(info_span!("download_worker")),
        );
        true
    }

    /// React to a queue mutation.
    ///
    /// Starts a run when idle; otherwise re-queries the queue and parks the
    /// result as the pending snapshot, without touching the transfer in flight.
    pub async fn on_queue_changed(&self) {
        debug!("Queue change noticed");
        if !self.shared.deps.gate.is_suitable() {
            debug!("Network not suitable for downloading, ignoring queue change");
            return;
        }

        if self.state() == CoordinatorState::Idle {
            self.start();
            return;
        }

        let snapshot = match self.shared.deps.store.snapshot().await {
            Ok(snapshot) => Arc::new(snapshot),
            Err(e) => {
                warn!(error = %e, "Failed to load the changed queue");
                return;
            }
        };

        let mut slot = self.shared.slot();
        match slot.state {
            CoordinatorState::Running => {
                debug!(items = snapshot.len(), "Pending queue snapshot installed");
                slot.pending = Some(snapshot);
            }
            CoordinatorState::Idle => {
                // the run ended while the queue was being loaded
                drop(slot);
                self.start();
            }
            CoordinatorState::Stopping => trace!("Ignoring queue change while stopping"),
        }
    }

    /// Ask the current run to stop.
    ///
    /// The transfer in flight ends at its next chunk boundary, keeping its
    /// partial file for a later resume. Use [`Self::wait_idle`] to wait for it.
    pub fn stop(&self) {
        let mut slot = self.shared.slot();
        if slot.state == CoordinatorState::Running {
            info!("Stopping downloads");
            slot.state = CoordinatorState::Stopping;
            slot.stop.cancel();
            self.shared.state_tx.send_replace(CoordinatorState::Stopping);
        }
    }
}

/// Puts the coordinator back to idle if the worker panics
struct IdleOnPanic<'a>(&'a Shared);

impl Drop for IdleOnPanic<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!("Download worker panicked");
            self.0.go_idle(&mut self.0.slot());
        }
    }
}

impl Shared {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn go_idle(&self, slot: &mut Slot) {
        slot.pending = None;
        slot.state = CoordinatorState::Idle;
        self.deps.progress.clear();
        self.state_tx.send_replace(CoordinatorState::Idle);
    }

    fn has_pending(&self) -> bool {
        self.slot().pending.is_some()
    }

    /// Whether the transfer of `id` should end at this chunk boundary
    fn should_stop(&self, id: ItemId, stop: &CancellationToken) -> bool {
        if stop.is_cancelled() {
            return true;
        }
        self.slot()
            .pending
            .as_ref()
            .is_some_and(|pending| !pending.contains(id))
    }

    /// Swap the pending snapshot in, or go idle if there is none
    fn next_snapshot(&self, stop: &CancellationToken) -> Option<Arc<QueueSnapshot>> {
        let mut slot = self.slot();
        if !stop.is_cancelled() {
            if let Some(next) = slot.pending.take() {
                return Some(next);
            }
        }
        self.go_idle(&mut slot);
        None
    }

    fn storage_dir(&self) -> &Path {
        &self.settings.storage_dir
    }

    async fn run(&self, stop: &CancellationToken) {
        info!("Download run starting");

        let mut active = match self.deps.store.snapshot().await {
            Ok(snapshot) => Arc::new(snapshot),
            Err(e) => {
                error!(error = %e, "Failed to load the queue");
                self.go_idle(&mut self.slot());
                return;
            }
        };

        if let Err(e) = self.reconciler.reconcile(&active).await {
            error!(error = %e, "Failed to reconcile storage with the queue");
        }

        loop {
            let end = self.walk(&active, stop).await;
            debug!(?end, "Walk ended");
            match self.next_snapshot(stop) {
                Some(next) => {
                    info!(items = next.len(), "Queue changed, starting over with the new queue");
                    active = next;
                }
                None => break,
            }
        }

        info!("Download run finished");
    }

    #[instrument(level = "debug", skip_all, fields(items = snapshot.len()))]
    async fn walk(&self, snapshot: &QueueSnapshot, stop: &CancellationToken) -> WalkEnd {
        for item in snapshot {
            if stop.is_cancelled() {
                return WalkEnd::Stopped;
            }
            if item.is_downloaded(self.storage_dir()).await {
                trace!(id = %item.id, "Already downloaded");
                continue;
            }
            if self.has_pending() {
                return WalkEnd::Preempted;
            }

            match self.download_item(item, stop).await {
                Ok(ItemEnd::Next) => {}
                Ok(ItemEnd::Interrupted) if stop.is_cancelled() => return WalkEnd::Stopped,
                Ok(ItemEnd::Interrupted) => return WalkEnd::Preempted,
                Err(e) => {
                    error!(id = %item.id, title = %item.title, error = %e, "Exception while downloading");
                    self.deps.progress.clear();
                    match self.settings.failure_policy {
                        FailurePolicy::AbortWalk => return WalkEnd::Aborted,
                        FailurePolicy::SkipItem => continue,
                    }
                }
            }
        }

        if stop.is_cancelled() {
            WalkEnd::Stopped
        } else {
            WalkEnd::Finished
        }
    }

    #[instrument(name = "download_item", level = "info", skip_all, fields(id = %item.id, title = %item.title))]
    async fn download_item(&self, item: &QueueItem, stop: &CancellationToken) -> Result<ItemEnd, FetchError> {
        let path = item.local_path(self.storage_dir());
        let progress = &self.deps.progress;

        info!(url = %item.media_url, "Downloading");
        progress.show_progress(&item.title, 0, item.file_size);

        let connection = tokio::select! {
            connection = self.fetcher.connect(&item.media_url, &path) => connection?,
            () = stop.cancelled() => {
                debug!("Stopped while waiting for the server");
                return Ok(ItemEnd::Interrupted);
            }
        };
        if self.has_pending() || stop.is_cancelled() {
            debug!("Queue changed while connecting, abandoning item");
            return Ok(ItemEnd::Interrupted);
        }

        let session = match connection {
            Connection::Rejected(status) => {
                info!(status = %status, "Item unavailable, skipping");
                return Ok(ItemEnd::Next);
            }
            Connection::AlreadyComplete { size } => {
                self.record(item.id, ItemUpdate::file_size(size)).await;
                return Ok(ItemEnd::Next);
            }
            Connection::Ready(session) => session,
        };

        let expected = session.expected_len();
        if let Some(size) = expected.filter(|size| item.file_size != Some(*size)) {
            self.record(item.id, ItemUpdate::file_size(size)).await;
        }

        let outcome = session
            .stream(
                || self.should_stop(item.id, stop),
                |downloaded| progress.show_progress(&item.title, downloaded, expected),
            )
            .await?;

        match outcome {
            FetchOutcome::Complete { size } => {
                info!(bytes = size, "Finished downloading");
                self.record_duration(item, &path).await;
                Ok(ItemEnd::Next)
            }
            FetchOutcome::Incomplete {
                preempted: true, ..
            } => Ok(ItemEnd::Interrupted),
            other => {
                warn!(outcome = %other, "Did not finish downloading file");
                Ok(ItemEnd::Next)
            }
        }
    }

    async fn record_duration(&self, item: &QueueItem, path: &Path) {
        match self.deps.probe.probe(path).await {
            Ok(duration) => self.record(item.id, ItemUpdate::duration(duration)).await,
            Err(e) => warn!(error = %e, path = ?path, "Failed to read media duration"),
        }
    }

    async fn record(&self, id: ItemId, update: ItemUpdate) {
        if let Err(e) = self.deps.store.update(id, update).await {
            warn!(id = %id, error = %e, "Failed to update queue item");
        }
    }
}
