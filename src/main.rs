use std::sync::Arc;

use podqueue::{
    config::{self, Config},
    downloader::{ChangeWatcher, Collaborators, CoordinatorSettings, DownloadCoordinator, RangeFetcher},
    ports::{ToggleGate, TracingProgressSink},
    probe::FfprobeDurationProbe,
    queue::{JsonQueueStore, QueueStore},
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    let config = config::config();
    init_tracing(&config);
    color_eyre::install()?;

    tracing::info!(
        storage_dir = ?config.storage.storage_dir,
        queue_file = ?config.storage.queue_file,
        "Starting podqueue"
    );

    let shutdown = CancellationToken::new();
    let store = Arc::new(JsonQueueStore::open(&config.storage.queue_file).await?);
    store.watch(shutdown.clone())?;
    tracing::info!(items = store.query().await?.len(), "Queue loaded");

    let fetcher = RangeFetcher::new(&config.fetch.settings())?;
    let coordinator = DownloadCoordinator::new(
        CoordinatorSettings::from(&config),
        fetcher,
        Collaborators {
            store,
            gate: Arc::new(ToggleGate::new(config.network_allowed)),
            progress: Arc::new(TracingProgressSink::new()),
            probe: Arc::new(FfprobeDurationProbe::new(config.ffprobe.clone())),
        },
    );

    let watcher = ChangeWatcher::spawn(coordinator.clone());
    if !coordinator.start() {
        tracing::info!("Not downloading until the network is allowed");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    watcher.shutdown().await;
    shutdown.cancel();
    coordinator.stop();
    coordinator.wait_idle().await;

    tracing::info!("Downloads stopped, partial files kept for resume");
    Ok(())
}
