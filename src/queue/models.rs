//! Data structures for the download queue
//!
//! Queue items are owned by the queue store. The downloader only reads them and
//! writes back the file size and duration it learns while fetching.

use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

/// Extension used when the media URL does not carry one.
pub const DEFAULT_MEDIA_EXTENSION: &str = "mp3";

/// Stable identifier of a queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub u64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ItemId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: ItemId,
    pub title: String,
    pub media_url: String,
    /// Final size of the media file in bytes, once a server has reported it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "duration_millis"
    )]
    pub duration: Option<Duration>,
}

impl QueueItem {
    pub fn new(id: impl Into<ItemId>, title: impl Into<String>, media_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            media_url: media_url.into(),
            file_size: None,
            duration: None,
        }
    }

    pub fn with_file_size(mut self, file_size: u64) -> Self {
        self.file_size = Some(file_size);
        self
    }

    /// Local filename for this item: `<id>.<extension of the media URL>`
    pub fn filename(&self) -> String {
        format!("{}.{}", self.id, media_extension(&self.media_url))
    }

    pub fn local_path(&self, storage_dir: &Path) -> PathBuf {
        storage_dir.join(self.filename())
    }

    /// An item is downloaded when its file exists and is at least as large as
    /// the recorded file size. Items without a recorded size never are.
    pub async fn is_downloaded(&self, storage_dir: &Path) -> bool {
        let Some(expected) = self.file_size else {
            return false;
        };
        match tokio::fs::metadata(self.local_path(storage_dir)).await {
            Ok(meta) => meta.is_file() && meta.len() >= expected,
            Err(_) => false,
        }
    }
}

/// Fields the downloader may write back onto a queue item
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItemUpdate {
    pub file_size: Option<u64>,
    pub duration: Option<Duration>,
}

impl ItemUpdate {
    pub fn file_size(size: u64) -> Self {
        Self {
            file_size: Some(size),
            ..Default::default()
        }
    }

    pub fn duration(duration: Duration) -> Self {
        Self {
            duration: Some(duration),
            ..Default::default()
        }
    }

    pub fn apply(&self, item: &mut QueueItem) {
        if let Some(size) = self.file_size {
            item.file_size = Some(size);
        }
        if let Some(duration) = self.duration {
            item.duration = Some(duration);
        }
    }
}

/// Lowercase extension of the last path segment of `media_url`
///
/// Falls back to [`DEFAULT_MEDIA_EXTENSION`] when the URL cannot be parsed or
/// its last segment has no extension.
pub fn media_extension(media_url: &str) -> String {
    url::Url::parse(media_url)
        .ok()
        .and_then(|url| {
            let segment = url.path_segments()?.next_back()?.to_string();
            let (stem, ext) = segment.rsplit_once('.')?;
            if stem.is_empty() || ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
                return None;
            }
            Some(ext.to_ascii_lowercase())
        })
        .unwrap_or_else(|| DEFAULT_MEDIA_EXTENSION.to_string())
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_u64(duration.as_millis() as u64),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
