//! HTTP download implementation
//!
//! Fetches a single media file, resuming from whatever is already on disk with
//! a `Range` request and streaming the rest of the body onto the end of the file.

use futures_util::StreamExt;
use reqwest::{
    Client, Response, StatusCode,
    header::{self, HeaderMap, HeaderValue},
};
use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{
    fs::OpenOptions,
    io::{AsyncReadExt, AsyncWriteExt},
};
use tokio_util::io::StreamReader;
use tracing::{debug, info, instrument, trace, warn};

use super::models::{FetchError, FetchOutcome};

/// Size of each read from the response body
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub chunk_size: usize,
    pub max_redirects: usize,
    pub connect_timeout: Duration,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_redirects: 10,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Result of opening a connection for one item, before any body is read
#[derive(Debug)]
pub enum Connection {
    /// The server refused the item with a status other than 200 or 206
    Rejected(StatusCode),
    /// The server answered a resume request with nothing left to send
    AlreadyComplete { size: u64 },
    /// Headers are in; the body is ready to be streamed
    Ready(DownloadSession),
}

/// An open transfer for one item.
///
/// Owns the response; the file handle is opened when streaming starts. Both
/// are closed when the session is dropped, whether the stream finished,
/// failed or was abandoned.
#[derive(Debug)]
pub struct DownloadSession {
    path: PathBuf,
    response: Response,
    offset: u64,
    expected: Option<u64>,
    restart: bool,
    chunk_size: usize,
}

#[derive(Debug, Clone)]
pub struct RangeFetcher {
    client: Client,
    chunk_size: usize,
}

impl RangeFetcher {
    pub fn new(settings: &FetchSettings) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));

        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::limited(settings.max_redirects))
            .connect_timeout(settings.connect_timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            chunk_size: settings.chunk_size.max(1),
        })
    }

    /// Send the request for `url`, asking only for the bytes `path` is missing.
    ///
    /// Nothing is written to disk here.
    #[instrument(name = "connect", level = "debug", skip(self, path), fields(url = %url))]
    pub async fn connect(&self, url: &str, path: &Path) -> Result<Connection, FetchError> {
        let offset = local_len(path).await?;

        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(header::RANGE, format!("bytes={}-", offset));
            info!(resume_from = offset, "Attempting to resume download");
        }

        let response = request.send().await?;
        let status = response.status();
        trace!(status = %status, content_length = ?response.content_length(), "Got response");

        match status {
            StatusCode::PARTIAL_CONTENT => {
                // no Content-Length counts as nothing left
                let remaining = response.content_length().unwrap_or(0);
                if remaining == 0 {
                    debug!(size = offset, "Nothing left to download");
                    return Ok(Connection::AlreadyComplete { size: offset });
                }
                let expected =
                    content_range_total(response.headers()).unwrap_or(offset + remaining);
                Ok(Connection::Ready(DownloadSession {
                    path: path.to_path_buf(),
                    response,
                    offset,
                    expected: Some(expected),
                    restart: false,
                    chunk_size: self.chunk_size,
                }))
            }
            StatusCode::OK => {
                if offset > 0 {
                    debug!(offset, "Server ignored the range request, restarting");
                }
                let expected = response.content_length();
                Ok(Connection::Ready(DownloadSession {
                    path: path.to_path_buf(),
                    response,
                    offset: 0,
                    expected,
                    restart: true,
                    chunk_size: self.chunk_size,
                }))
            }
            other => {
                warn!(status = %other, "Server refused download");
                Ok(Connection::Rejected(other))
            }
        }
    }

    /// Connect and stream in one go.
    ///
    /// `should_stop` is consulted at every chunk boundary; `on_progress`
    /// receives the number of bytes on disk after each chunk.
    pub async fn fetch(
        &self,
        url: &str,
        path: &Path,
        should_stop: impl FnMut() -> bool,
        on_progress: impl FnMut(u64),
    ) -> Result<FetchOutcome, FetchError> {
        match self.connect(url, path).await? {
            Connection::Rejected(status) => Ok(FetchOutcome::Skipped { status }),
            Connection::AlreadyComplete { size } => Ok(FetchOutcome::AlreadyComplete { size }),
            Connection::Ready(session) => session.stream(should_stop, on_progress).await,
        }
    }
}

impl DownloadSession {
    /// Final length the file will have once the body is fully written, if known
    pub fn expected_len(&self) -> Option<u64> {
        self.expected
    }

    /// Stream the body onto the end of the file.
    ///
    /// `should_stop` is checked before every read and again before every
    /// write. Once it returns true the stream ends, leaving the bytes written
    /// so far on disk. A network error while reading the body also ends the
    /// stream with a [`FetchOutcome::Incomplete`]; only local file errors
    /// are returned as [`FetchError`].
    #[instrument(name = "stream", level = "debug", skip_all, fields(path = ?self.path))]
    pub async fn stream(
        self,
        mut should_stop: impl FnMut() -> bool,
        mut on_progress: impl FnMut(u64),
    ) -> Result<FetchOutcome, FetchError> {
        let Self {
            path,
            response,
            offset,
            expected,
            restart,
            chunk_size,
        } = self;

        if restart {
            // A partial file is not a valid prefix of a full response
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("Deleted partial file before restarting"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let body = response.bytes_stream().map(|chunk| chunk.map_err(io::Error::other));
        let reader = StreamReader::new(body);
        tokio::pin!(reader);

        let mut buf = vec![0u8; chunk_size];
        let mut downloaded = offset;
        let mut preempted = false;

        loop {
            if should_stop() {
                preempted = true;
                break;
            }
            let read = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(read) => read,
                Err(e) => {
                    // a body cut short is retried on a later pass like any short body
                    warn!(error = %e, bytes = downloaded, "Response body ended early");
                    break;
                }
            };
            if should_stop() {
                preempted = true;
                break;
            }
            file.write_all(&buf[..read]).await?;
            downloaded += read as u64;
            trace!(bytes = downloaded, chunk_size = read, "Received chunk");
            on_progress(downloaded);
        }

        file.flush().await?;
        drop(file);

        let size = local_len(&path).await?;
        let outcome = match expected {
            Some(expected) if !preempted && size == expected => FetchOutcome::Complete { size },
            _ => FetchOutcome::Incomplete {
                size,
                expected,
                preempted,
            },
        };
        if preempted {
            info!(bytes = size, "Download preempted");
        } else {
            debug!(%outcome, "Stream finished");
        }
        Ok(outcome)
    }
}

async fn local_len(path: &Path) -> io::Result<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

/// Total length from a `Content-Range: bytes a-b/total` header
fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    let range = headers.get(header::CONTENT_RANGE)?.to_str().ok()?;
    let (_, total) = range.split_once('/')?;
    total.trim().parse().ok()
}
