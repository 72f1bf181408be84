use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span};

use super::coordinator::DownloadCoordinator;

/// Forwards queue-store change notifications to a coordinator.
///
/// Bursts of changes that arrive while one is being handled collapse into a
/// single follow-up notification.
pub struct ChangeWatcher {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ChangeWatcher {
    pub fn spawn(coordinator: DownloadCoordinator) -> Self {
        let mut changes = coordinator.store().subscribe();
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        () = token.cancelled() => break,
                        changed = changes.changed() => {
                            if changed.is_err() {
                                debug!("Queue store closed, no more changes");
                                break;
                            }
                            coordinator.on_queue_changed().await;
                        }
                    }
                }
            }
            .instrument(info_span!("queue_watcher")),
        );

        Self { cancel, handle }
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}
