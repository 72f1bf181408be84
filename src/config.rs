//! Config module for podqueue

use std::{path::PathBuf, time::Duration};

use clap::Parser;

use crate::downloader::{
    CoordinatorSettings, DEFAULT_CHUNK_SIZE, FailurePolicy, FetchSettings,
};

#[derive(Parser, Debug, Clone)]
pub struct StorageConfig {
    /// Directory downloaded episodes are stored in
    #[clap(long, env = "PODQ_STORAGE_DIR", default_value = "media/")]
    pub storage_dir: PathBuf,

    /// JSON file holding the ordered episode queue
    #[clap(long, env = "PODQ_QUEUE_FILE", default_value = "queue.json")]
    pub queue_file: PathBuf,

    /// File extensions treated as media when cleaning up storage
    #[clap(
        long,
        env = "PODQ_MEDIA_EXTENSIONS",
        value_delimiter = ',',
        default_value = "mp3,ogg,wma"
    )]
    pub media_extensions: Vec<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct FetchConfig {
    /// Bytes read from the network per chunk
    #[clap(long, env = "PODQ_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    #[clap(long, env = "PODQ_MAX_REDIRECTS", default_value = "10")]
    pub max_redirects: usize,

    /// Connect timeout, in seconds
    #[clap(long, env = "PODQ_CONNECT_TIMEOUT", default_value = "30")]
    pub connect_timeout: u64,

    /// What a failed download does to the rest of the queue
    #[clap(long, env = "PODQ_ON_ERROR", value_enum, default_value = "abort-walk")]
    pub on_error: FailurePolicy,
}

#[derive(Parser, Debug, Clone)]
pub struct Config {
    #[clap(flatten)]
    pub storage: StorageConfig,

    #[clap(flatten)]
    pub fetch: FetchConfig,

    /// Whether the network may be used for downloads
    #[clap(long, env = "PODQ_NETWORK_ALLOWED", default_value = "true", action = clap::ArgAction::Set)]
    pub network_allowed: bool,

    /// Path to the ffprobe binary used to read episode durations
    #[clap(long, env = "PODQ_FFPROBE", default_value = "ffprobe")]
    pub ffprobe: String,

    /// Emit logs as JSON lines
    #[clap(long, env = "PODQ_LOG_JSON", default_value = "false", action = clap::ArgAction::Set)]
    pub log_json: bool,
}

impl FetchConfig {
    pub fn settings(&self) -> FetchSettings {
        FetchSettings {
            chunk_size: self.chunk_size.max(1),
            max_redirects: self.max_redirects,
            connect_timeout: Duration::from_secs(self.connect_timeout),
        }
    }
}

impl From<&Config> for CoordinatorSettings {
    fn from(config: &Config) -> Self {
        Self {
            storage_dir: config.storage.storage_dir.clone(),
            media_extensions: config
                .storage
                .media_extensions
                .iter()
                .filter(|ext| !ext.trim().is_empty())
                .cloned()
                .collect(),
            failure_policy: config.fetch.on_error,
        }
    }
}

pub fn config() -> Config {
    Config::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::parse_from(["podqueue"]);
        assert_eq!(config.storage.media_extensions, vec!["mp3", "ogg", "wma"]);
        assert_eq!(config.fetch.on_error, FailurePolicy::AbortWalk);
        assert!(config.network_allowed);

        let settings = config.fetch.settings();
        assert_eq!(settings.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(settings.connect_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_flags() {
        let config = Config::parse_from([
            "podqueue",
            "--storage-dir",
            "/srv/pods",
            "--media-extensions",
            "mp3,m4a,",
            "--on-error",
            "skip-item",
            "--network-allowed",
            "false",
        ]);
        assert!(!config.network_allowed);

        let settings = CoordinatorSettings::from(&config);
        assert_eq!(settings.storage_dir, PathBuf::from("/srv/pods"));
        assert_eq!(settings.media_extensions, vec!["mp3", "m4a"]);
        assert_eq!(settings.failure_policy, FailurePolicy::SkipItem);
    }
}
