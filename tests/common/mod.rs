#![allow(dead_code)]

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use podqueue::{
    downloader::{
        Collaborators, CoordinatorSettings, DownloadCoordinator, FailurePolicy, FetchSettings,
        RangeFetcher,
    },
    ports::{DurationProbe, ProgressSink, ToggleGate},
    probe::ProbeError,
    queue::MemoryQueueStore,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    sync::{oneshot, watch},
};

pub const TIMEOUT: Duration = Duration::from_secs(10);
pub const PROBED: Duration = Duration::from_secs(42);

/// Progress sink that remembers the last update
pub struct RecordingProgress {
    downloaded: watch::Sender<u64>,
    titles: Mutex<Vec<String>>,
    clears: AtomicUsize,
}

impl RecordingProgress {
    pub fn new() -> Self {
        let (downloaded, _) = watch::channel(0);
        Self {
            downloaded,
            titles: Mutex::new(Vec::new()),
            clears: AtomicUsize::new(0),
        }
    }

    /// Wait until at least `bytes` have been reported for the current item
    pub async fn reached(&self, bytes: u64) {
        let mut rx = self.downloaded.subscribe();
        tokio::time::timeout(TIMEOUT, rx.wait_for(|n| *n >= bytes))
            .await
            .expect("progress never reached the expected byte count")
            .unwrap();
    }

    pub fn titles(&self) -> Vec<String> {
        self.titles.lock().unwrap().clone()
    }

    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

impl ProgressSink for RecordingProgress {
    fn show_progress(&self, title: &str, downloaded: u64, _total: Option<u64>) {
        let mut titles = self.titles.lock().unwrap();
        if titles.last().map(String::as_str) != Some(title) {
            titles.push(title.to_string());
        }
        self.downloaded.send_replace(downloaded);
    }

    fn clear(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
    }
}

/// Duration probe that reports a fixed duration and remembers what it probed
#[derive(Default)]
pub struct RecordingProbe {
    probed: Mutex<Vec<PathBuf>>,
}

impl RecordingProbe {
    pub fn probed(&self) -> Vec<PathBuf> {
        self.probed.lock().unwrap().clone()
    }
}

#[async_trait]
impl DurationProbe for RecordingProbe {
    async fn probe(&self, path: &Path) -> Result<Duration, ProbeError> {
        self.probed.lock().unwrap().push(path.to_path_buf());
        Ok(PROBED)
    }
}

/// A coordinator over an in-memory queue with every collaborator exposed
pub struct Harness {
    pub storage: tempfile::TempDir,
    pub store: Arc<MemoryQueueStore>,
    pub gate: Arc<ToggleGate>,
    pub progress: Arc<RecordingProgress>,
    pub probe: Arc<RecordingProbe>,
    pub coordinator: DownloadCoordinator,
}

impl Harness {
    pub fn new(store: MemoryQueueStore) -> Self {
        Self::with_policy(store, FailurePolicy::AbortWalk)
    }

    pub fn with_policy(store: MemoryQueueStore, policy: FailurePolicy) -> Self {
        let storage = tempfile::tempdir().unwrap();
        let store = Arc::new(store);
        let gate = Arc::new(ToggleGate::default());
        let progress = Arc::new(RecordingProgress::new());
        let probe = Arc::new(RecordingProbe::default());

        let fetcher = RangeFetcher::new(&FetchSettings {
            chunk_size: 1024,
            ..FetchSettings::default()
        })
        .unwrap();
        let coordinator = DownloadCoordinator::new(
            CoordinatorSettings::new(storage.path()).with_failure_policy(policy),
            fetcher,
            Collaborators {
                store: store.clone(),
                gate: gate.clone(),
                progress: progress.clone(),
                probe: probe.clone(),
            },
        );

        Self {
            storage,
            store,
            gate,
            progress,
            probe,
            coordinator,
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.storage.path().join(name)
    }

    pub fn file_len(&self, name: &str) -> Option<u64> {
        std::fs::metadata(self.path(name)).ok().map(|m| m.len())
    }

    /// Start a run and wait for it to end
    pub async fn run(&self) {
        assert!(self.coordinator.start(), "coordinator did not start");
        self.wait_idle().await;
    }

    pub async fn wait_idle(&self) {
        tokio::time::timeout(TIMEOUT, self.coordinator.wait_idle())
            .await
            .expect("coordinator never went idle");
    }
}

/// Poll `condition` until it holds
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

pub fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Single-connection HTTP server that sends a 200 response in two parts.
///
/// The headers and the first `split` bytes go out as soon as a request
/// arrives; the rest only after [`StallServer::release`], or never after
/// [`StallServer::cut`]. Without a Content-Length the body ends when the
/// connection closes.
pub struct StallServer {
    pub url: String,
    release: Option<oneshot::Sender<bool>>,
    requests: Arc<AtomicUsize>,
}

impl StallServer {
    pub async fn start(body: Vec<u8>, split: usize, content_length: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (release, released) = oneshot::channel::<bool>();
        let requests = Arc::new(AtomicUsize::new(0));
        let seen = requests.clone();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            seen.fetch_add(1, Ordering::SeqCst);

            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                request.extend_from_slice(&buf[..n]);
            }

            let mut head = String::from(
                "HTTP/1.1 200 OK\r\nContent-Type: audio/mpeg\r\nConnection: close\r\n",
            );
            if content_length {
                head.push_str(&format!("Content-Length: {}\r\n", body.len()));
            }
            head.push_str("\r\n");

            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(&body[..split]).await.unwrap();
            socket.flush().await.unwrap();

            if let Ok(true) = released.await {
                let _ = socket.write_all(&body[split..]).await;
            }
            let _ = socket.shutdown().await;
        });

        Self {
            url: format!("http://{addr}/episode.mp3"),
            release: Some(release),
            requests,
        }
    }

    /// Send the rest of the body
    pub fn release(&mut self) {
        if let Some(release) = self.release.take() {
            let _ = release.send(true);
        }
    }

    /// Close the connection without sending the rest of the body
    pub fn cut(&mut self) {
        if let Some(release) = self.release.take() {
            let _ = release.send(false);
        }
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

/// HTTP server that accepts connections but never answers them
pub struct SilentServer {
    pub url: String,
    accepted: Arc<AtomicUsize>,
}

impl SilentServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let seen = accepted.clone();

        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                seen.fetch_add(1, Ordering::SeqCst);
                held.push(socket);
            }
        });

        Self {
            url: format!("http://{addr}/silent.mp3"),
            accepted,
        }
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}
